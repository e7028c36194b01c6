//! The universe: owns the world tree, the reflection registry handle and the
//! job system handle.
//!
//! Lifecycle: create, register mutators and schedulers, create the root
//! world from configuration, run the update loop, drop (worlds tear down
//! post-order). Publishing a reflection registry with a new version through
//! [`Universe::migrate`] rebuilds every repository before the next update.

use crate::error::DeployError;
use crate::intern::{intern, IStr};
use crate::jobs::JobSystem;
use crate::migrate::{self, MigrationReport};
use crate::mutator::MutatorDef;
use crate::reflection::Registry;
use crate::schedulers::{
    PairPipelineScheduler, TrivialScheduler, WorldScheduler, PAIR_PIPELINE_SCHEDULER,
    TRIVIAL_SCHEDULER,
};
use crate::world::{update_world, World, WorldConfig};
use fxhash::FxHashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

pub(crate) type SchedulerFactory = Arc<dyn Fn() -> Box<dyn WorldScheduler> + Send + Sync>;
pub(crate) type MutatorRegistry = FxHashMap<IStr, Arc<MutatorDef>>;
pub(crate) type SchedulerRegistry = FxHashMap<IStr, SchedulerFactory>;

pub struct Universe {
    pub(crate) registry: Arc<Registry>,
    pub(crate) jobs: Arc<dyn JobSystem>,
    pub(crate) mutators: MutatorRegistry,
    pub(crate) schedulers: SchedulerRegistry,
    pub(crate) root: Option<World>,
    last_update: Option<Instant>,
}

impl Universe {
    pub fn new(registry: Arc<Registry>, jobs: Arc<dyn JobSystem>) -> Universe {
        info!(reflection_version = registry.version(), "starting universe");
        let mut universe = Universe {
            registry,
            jobs,
            mutators: FxHashMap::default(),
            schedulers: FxHashMap::default(),
            root: None,
            last_update: None,
        };
        universe.register_scheduler(TRIVIAL_SCHEDULER, || Box::new(TrivialScheduler::new()));
        universe.register_scheduler(PAIR_PIPELINE_SCHEDULER, || {
            Box::new(PairPipelineScheduler::new())
        });
        universe
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Registers (or replaces) a scheduler factory under `name`.
    pub fn register_scheduler<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn WorldScheduler> + Send + Sync + 'static,
    {
        self.schedulers.insert(intern(name), Arc::new(factory));
    }

    /// Registers (or replaces) a mutator definition under its name.
    pub fn register_mutator(&mut self, def: Arc<MutatorDef>) {
        self.mutators.insert(def.name, def);
    }

    /// Builds the world tree described by `config` and attaches it as root.
    pub fn create_root_world(&mut self, config: WorldConfig) -> Result<(), DeployError> {
        let world = World::build(&config, &self.registry, &self.mutators, &self.schedulers)?;
        self.root = Some(world);
        Ok(())
    }

    pub fn root_world(&self) -> Option<&World> {
        self.root.as_ref()
    }

    /// One update tick with a wall-clock delta. The first update runs with a
    /// zero delta intentionally.
    pub fn update(&mut self) {
        let now = Instant::now();
        let delta_ns = match self.last_update {
            Some(previous) => now.duration_since(previous).as_nanos() as u64,
            None => 0,
        };
        self.last_update = Some(now);
        self.update_with_delta(delta_ns);
    }

    /// One update tick with an explicit delta, for hosts that own time.
    pub fn update_with_delta(&mut self, delta_ns: u64) {
        if let Some(root) = self.root.as_mut() {
            update_world(root, &self.jobs, delta_ns);
        }
    }

    /// Rebuilds every repository against a newly published reflection
    /// registry, preserving record data via field-mapping plans, then re-runs
    /// mutators annotated `on_migration` in a one-shot pipeline per world.
    pub fn migrate(&mut self, registry: Arc<Registry>) -> Result<MigrationReport, DeployError> {
        migrate::run(self, registry)
    }
}
