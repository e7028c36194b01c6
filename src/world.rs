//! Worlds: a repository, deployed pipelines, a scheduler, and child worlds.
//!
//! World configuration is plain data produced by external loaders; creating
//! a world registers record types through the layout service, instantiates
//! every mutator binding, builds pipeline plans and attaches the configured
//! scheduler. Schedulers observe children only through
//! [`SchedulerInterface`], keeping siblings isolated from each other.

use crate::error::DeployError;
use crate::intern::{intern, IStr};
use crate::jobs::JobSystem;
use crate::query::QuerySlot;
use crate::repository::Repository;
use crate::schedule::{self, DeployedMutator, MutatorEdges, Pipeline, PipelinePlan};
use crate::schedulers::WorldScheduler;
use crate::universe::{MutatorRegistry, SchedulerRegistry};
use std::sync::Arc;
use tracing::{debug, warn};

/// Plain-data description of one world.
#[derive(Clone, Debug)]
pub struct WorldConfig {
    pub name: String,
    pub scheduler: String,
    pub pipelines: Vec<PipelineConfig>,
    pub children: Vec<WorldConfig>,
}

impl WorldConfig {
    pub fn new(name: &str, scheduler: &str) -> WorldConfig {
        WorldConfig {
            name: name.to_string(),
            scheduler: scheduler.to_string(),
            pipelines: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipelines.push(pipeline);
        self
    }

    pub fn child(mut self, child: WorldConfig) -> Self {
        self.children.push(child);
        self
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub name: String,
    pub mutators: Vec<MutatorConfig>,
}

impl PipelineConfig {
    pub fn new(name: &str) -> PipelineConfig {
        PipelineConfig {
            name: name.to_string(),
            mutators: Vec::new(),
        }
    }

    pub fn mutator(mut self, mutator: MutatorConfig) -> Self {
        self.mutators.push(mutator);
        self
    }
}

#[derive(Clone, Debug)]
pub struct MutatorConfig {
    pub name: String,
    pub depends_on: Vec<String>,
    pub dependency_of: Vec<String>,
}

impl MutatorConfig {
    pub fn new(name: &str) -> MutatorConfig {
        MutatorConfig {
            name: name.to_string(),
            depends_on: Vec::new(),
            dependency_of: Vec::new(),
        }
    }

    pub fn depends_on(mut self, other: &str) -> Self {
        self.depends_on.push(other.to_string());
        self
    }

    pub fn dependency_of(mut self, other: &str) -> Self {
        self.dependency_of.push(other.to_string());
        self
    }
}

pub(crate) struct SchedulerSeat {
    pub scheduler: Box<dyn WorldScheduler>,
    pub slots: Vec<QuerySlot>,
}

/// A unit of isolation: repository, pipelines, scheduler, children.
pub struct World {
    pub(crate) name: IStr,
    pub(crate) config: WorldConfig,
    pub(crate) repository: Repository,
    pub(crate) seat: Option<SchedulerSeat>,
    pub(crate) pipelines: Vec<Pipeline>,
    pub(crate) children: Vec<World>,
}

impl World {
    pub(crate) fn build(
        config: &WorldConfig,
        registry: &Arc<crate::reflection::Registry>,
        mutators: &MutatorRegistry,
        schedulers: &SchedulerRegistry,
    ) -> Result<World, DeployError> {
        let name = intern(&config.name);
        debug!(world = %name, scheduler = %config.scheduler, "creating world");

        let repository = Repository::new(registry.clone());
        let seat = deploy_seat(&config.scheduler, &repository, schedulers)?;
        let pipelines = config
            .pipelines
            .iter()
            .map(|pipeline| build_pipeline(pipeline, &repository, mutators))
            .collect::<Result<Vec<_>, _>>()?;
        let children = config
            .children
            .iter()
            .map(|child| World::build(child, registry, mutators, schedulers))
            .collect::<Result<Vec<_>, _>>()?;

        let mut stored = config.clone();
        stored.children.clear();

        Ok(World {
            name,
            config: stored,
            repository,
            seat: Some(seat),
            pipelines,
            children,
        })
    }

    pub fn name(&self) -> IStr {
        self.name
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn children(&self) -> &[World] {
        &self.children
    }

    pub fn child(&self, name: &str) -> Option<&World> {
        let name = intern(name);
        self.children.iter().find(|child| child.name == name)
    }

    /// Downcast view of the attached scheduler, for host inspection.
    pub fn scheduler_as<S: WorldScheduler>(&self) -> Option<&S> {
        self.seat
            .as_ref()
            .and_then(|seat| seat.scheduler.downcast_ref::<S>())
    }
}

impl Drop for World {
    fn drop(&mut self) {
        // children tear down before this world's records
        self.children.clear();
        debug!(world = %self.name, "destroying world");
        self.repository.shutdown_all();
    }
}

pub(crate) fn deploy_seat(
    scheduler_name: &str,
    repository: &Repository,
    schedulers: &SchedulerRegistry,
) -> Result<SchedulerSeat, DeployError> {
    let key = intern(scheduler_name);
    let factory = schedulers
        .get(&key)
        .ok_or(DeployError::UnknownScheduler(key))?;
    let scheduler = factory();
    let slots = scheduler
        .bindings()
        .iter()
        .map(|decl| repository.deploy(key, decl))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SchedulerSeat { scheduler, slots })
}

pub(crate) fn build_pipeline(
    config: &PipelineConfig,
    repository: &Repository,
    mutators: &MutatorRegistry,
) -> Result<Pipeline, DeployError> {
    let name = intern(&config.name);
    let deployed = config
        .mutators
        .iter()
        .map(|entry| {
            let key = intern(&entry.name);
            let def = mutators
                .get(&key)
                .ok_or(DeployError::UnknownMutator(key))?;
            DeployedMutator::deploy(def.clone(), repository)
        })
        .collect::<Result<Vec<_>, _>>()?;
    let edges: Vec<MutatorEdges> = config
        .mutators
        .iter()
        .map(|entry| MutatorEdges {
            depends_on: entry.depends_on.iter().map(|n| intern(n)).collect(),
            dependency_of: entry.dependency_of.iter().map(|n| intern(n)).collect(),
        })
        .collect();
    let plan = PipelinePlan::build(name, &deployed, &edges)?;
    Ok(Pipeline {
        name,
        mutators: deployed,
        plan,
    })
}

/// The one route a scheduler has into its world: running pipelines, reading
/// its own bindings, and descending into children.
pub struct SchedulerInterface<'a> {
    world: &'a mut World,
    jobs: &'a Arc<dyn JobSystem>,
    delta_ns: u64,
    slots: &'a [QuerySlot],
}

impl<'a> SchedulerInterface<'a> {
    /// Wall-clock delta of this update tick, in nanoseconds.
    pub fn delta_ns(&self) -> u64 {
        self.delta_ns
    }

    /// Query context over the scheduler's own bindings. All accesses taken
    /// from it must be closed before running a pipeline.
    pub fn context(&self) -> crate::query::MutatorContext<'_> {
        crate::query::MutatorContext::new(self.slots)
    }

    pub fn run_pipeline(&mut self, name: IStr) {
        let pipeline = match self.world.pipelines.iter().find(|p| p.name == name) {
            Some(pipeline) => pipeline,
            None => {
                warn!(world = %self.world.name, pipeline = %name, "no such pipeline");
                return;
            }
        };
        if let Err(fatal) = schedule::execute(pipeline, &self.world.repository, self.jobs) {
            warn!(
                world = %self.world.name,
                pipeline = %name,
                error = %fatal,
                "pipeline aborted"
            );
        }
    }

    pub fn update_children(&mut self) {
        for child in self.world.children.iter_mut() {
            update_world(child, self.jobs, self.delta_ns);
        }
    }
}

/// Runs one update tick of `world`: hands control to its scheduler, which
/// runs pipelines and recurses into children through the interface.
pub(crate) fn update_world(world: &mut World, jobs: &Arc<dyn JobSystem>, delta_ns: u64) {
    let mut seat = match world.seat.take() {
        Some(seat) => seat,
        None => return,
    };
    {
        let mut interface = SchedulerInterface {
            world: &mut *world,
            jobs,
            delta_ns,
            slots: &seat.slots,
        };
        seat.scheduler.execute(&mut interface);
    }
    world.seat = Some(seat);
}
