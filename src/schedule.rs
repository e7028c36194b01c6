//! Mutator scheduling: turns a pipeline's declared dependencies into a
//! parallel execution plan over the job system.
//!
//! Planning happens once, at deployment: mutators are layered by their
//! declared `depends_on` / `dependency_of` edges, and each layer is split
//! into waves of mutators with no conflicting storage accesses (two mutators
//! conflict when they share a storage and at least one binds it writable).
//! Waves run in parallel on the job system; when a layer drains, the
//! repository advances the step boundary and flushes automatic events.

use crate::error::{DeployError, Fatal};
use crate::intern::IStr;
use crate::jobs::{JobHandle, JobSystem};
use crate::mutator::MutatorDef;
use crate::query::MutatorContext;
use crate::repository::Repository;
use bit_set::BitSet;
use fxhash::FxHashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::{debug, span, trace, warn, Level};

/// A mutator instantiated against one world's repository.
pub(crate) struct DeployedMutator {
    pub def: Arc<MutatorDef>,
    pub slots: Vec<crate::query::QuerySlot>,
    pub reads: BitSet,
    pub writes: BitSet,
}

impl DeployedMutator {
    pub(crate) fn deploy(
        def: Arc<MutatorDef>,
        repository: &Repository,
    ) -> Result<Arc<DeployedMutator>, DeployError> {
        let mut slots = Vec::with_capacity(def.bindings.len());
        let mut reads = BitSet::new();
        let mut writes = BitSet::new();

        for decl in &def.bindings {
            slots.push(repository.deploy(def.name, decl)?);
            let storage = repository.storage_id(decl.target);
            if decl.kind.is_writable() {
                writes.insert(storage);
            } else if decl.kind.is_readable() {
                reads.insert(storage);
            }
        }

        // a storage bound both readable and writable by one body would
        // deadlock against itself at the gate
        if !reads.is_disjoint(&writes) {
            return Err(DeployError::AccessConflict {
                scope: def.name,
                reason: "a record type is bound both readable and writable".to_string(),
            });
        }

        Ok(Arc::new(DeployedMutator {
            def,
            slots,
            reads,
            writes,
        }))
    }

    fn conflicts_with(&self, other: &DeployedMutator) -> bool {
        !self.writes.is_disjoint(&other.writes)
            || !self.writes.is_disjoint(&other.reads)
            || !other.writes.is_disjoint(&self.reads)
    }

    pub(crate) fn run(&self) -> crate::error::MutatorResult {
        let context = MutatorContext::new(&self.slots);
        (self.def.body)(&context)
    }
}

/// Declared ordering edges of one pipeline entry.
#[derive(Clone, Debug, Default)]
pub(crate) struct MutatorEdges {
    pub depends_on: Vec<IStr>,
    pub dependency_of: Vec<IStr>,
}

pub(crate) struct Layer {
    pub waves: Vec<SmallVec<[usize; 4]>>,
}

pub(crate) struct PipelinePlan {
    pub layers: Vec<Layer>,
}

impl PipelinePlan {
    /// Builds the execution plan. Fails with an access conflict when the
    /// dependency edges are cyclic or name unknown mutators.
    pub(crate) fn build(
        pipeline: IStr,
        mutators: &[Arc<DeployedMutator>],
        edges: &[MutatorEdges],
    ) -> Result<PipelinePlan, DeployError> {
        let mut index_of = FxHashMap::default();
        for (i, mutator) in mutators.iter().enumerate() {
            index_of.insert(mutator.def.name, i);
        }

        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); mutators.len()];
        let mut indegree: Vec<usize> = vec![0; mutators.len()];
        fn add_edge(
            from: usize,
            to: usize,
            successors: &mut Vec<Vec<usize>>,
            indegree: &mut Vec<usize>,
        ) {
            successors[from].push(to);
            indegree[to] += 1;
        }
        for (i, entry) in edges.iter().enumerate() {
            for name in &entry.depends_on {
                let from = *index_of.get(name).ok_or_else(|| {
                    DeployError::AccessConflict {
                        scope: pipeline,
                        reason: format!("`{}` depends on unknown mutator `{}`", mutators[i].def.name, name),
                    }
                })?;
                add_edge(from, i, &mut successors, &mut indegree);
            }
            for name in &entry.dependency_of {
                let to = *index_of.get(name).ok_or_else(|| {
                    DeployError::AccessConflict {
                        scope: pipeline,
                        reason: format!("`{}` is dependency of unknown mutator `{}`", mutators[i].def.name, name),
                    }
                })?;
                add_edge(i, to, &mut successors, &mut indegree);
            }
        }

        // Kahn layering: each layer takes every currently unblocked mutator,
        // in declaration order
        let mut placed = 0usize;
        let mut ready: Vec<usize> = (0..mutators.len()).filter(|&i| indegree[i] == 0).collect();
        let mut layers = Vec::new();
        while !ready.is_empty() {
            let layer_members = ready;
            let mut next: Vec<usize> = Vec::new();
            for &member in &layer_members {
                placed += 1;
                for &successor in &successors[member] {
                    indegree[successor] -= 1;
                    if indegree[successor] == 0 {
                        next.push(successor);
                    }
                }
            }
            next.sort();
            layers.push(Layer {
                waves: partition_waves(mutators, &layer_members),
            });
            ready = next;
        }

        if placed != mutators.len() {
            return Err(DeployError::AccessConflict {
                scope: pipeline,
                reason: "dependency edges form a cycle".to_string(),
            });
        }

        debug!(
            pipeline = %pipeline,
            mutators = mutators.len(),
            layers = layers.len(),
            "built pipeline plan"
        );
        Ok(PipelinePlan { layers })
    }
}

/// Splits one layer into waves of mutually non-conflicting mutators, keeping
/// declaration order inside each wave. At most one writer to a given storage
/// is live at any instant.
fn partition_waves(
    mutators: &[Arc<DeployedMutator>],
    members: &[usize],
) -> Vec<SmallVec<[usize; 4]>> {
    let mut waves: Vec<SmallVec<[usize; 4]>> = Vec::new();
    for &member in members {
        let mut placed = false;
        for wave in waves.iter_mut() {
            let conflicts = wave
                .iter()
                .any(|&other| mutators[member].conflicts_with(&mutators[other]));
            if !conflicts {
                wave.push(member);
                placed = true;
                break;
            }
        }
        if !placed {
            let mut wave = SmallVec::new();
            wave.push(member);
            waves.push(wave);
        }
    }
    waves
}

/// A deployed pipeline: ordered mutators plus their execution plan.
pub(crate) struct Pipeline {
    pub name: IStr,
    pub mutators: Vec<Arc<DeployedMutator>>,
    pub plan: PipelinePlan,
}

/// Runs the pipeline for one step sequence. On a fatal error the current
/// layer finishes, later layers are skipped, and the boundary still flushes.
pub(crate) fn execute(
    pipeline: &Pipeline,
    repository: &Repository,
    jobs: &Arc<dyn JobSystem>,
) -> Result<(), Fatal> {
    let pipeline_span = span!(Level::DEBUG, "pipeline", name = %pipeline.name);
    let _entered = pipeline_span.enter();

    let failure: Arc<Mutex<Option<Fatal>>> = Arc::new(Mutex::new(None));

    for layer in &pipeline.plan.layers {
        for wave in &layer.waves {
            let mut handles: SmallVec<[JobHandle; 8]> = SmallVec::new();
            for &member in wave.iter() {
                let mutator = pipeline.mutators[member].clone();
                let failure = failure.clone();
                handles.push(jobs.submit(Box::new(move || {
                    trace!(mutator = %mutator.def.name, "running mutator");
                    if let Err(fatal) = mutator.run() {
                        warn!(mutator = %mutator.def.name, error = %fatal, "mutator signalled fatal error");
                        let mut slot = failure.lock();
                        if slot.is_none() {
                            *slot = Some(fatal);
                        }
                    }
                })));
            }
            for handle in handles {
                handle.wait();
            }
        }

        // step boundary: apply journals and flush automatic events
        repository.flush_step();

        if failure.lock().is_some() {
            break;
        }
    }

    let outcome = failure.lock().take();
    match outcome {
        Some(fatal) => Err(fatal),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::intern;
    use crate::mutator::MutatorBuilder;
    use crate::reflection::{FieldInfo, FieldKind, Registry, TypeInfo};

    fn test_repository() -> Repository {
        let registry = Registry::builder(1)
            .with_type(TypeInfo::new("alpha").field(FieldInfo::new("value", FieldKind::U64)))
            .with_type(TypeInfo::new("beta").field(FieldInfo::new("value", FieldKind::U64)))
            .build();
        Repository::new(registry)
    }

    fn deployed(name: &str, writes: &str, repository: &Repository) -> Arc<DeployedMutator> {
        let def = MutatorBuilder::new(name)
            .write_singleton(writes)
            .build(|_| Ok(()));
        DeployedMutator::deploy(def, repository).unwrap()
    }

    #[test]
    fn conflicting_writers_land_in_separate_waves() {
        let repository = test_repository();
        let mutators = vec![
            deployed("first", "alpha", &repository),
            deployed("second", "alpha", &repository),
            deployed("third", "beta", &repository),
        ];
        let edges = vec![MutatorEdges::default(); 3];
        let plan = PipelinePlan::build(intern("update"), &mutators, &edges).unwrap();

        assert_eq!(plan.layers.len(), 1);
        let waves = &plan.layers[0].waves;
        assert_eq!(waves.len(), 2);
        // first and third share wave zero; second conflicts with first
        assert_eq!(waves[0].as_slice(), &[0, 2]);
        assert_eq!(waves[1].as_slice(), &[1]);
    }

    #[test]
    fn depends_on_forms_layers() {
        let repository = test_repository();
        let mutators = vec![
            deployed("first", "alpha", &repository),
            deployed("second", "beta", &repository),
        ];
        let edges = vec![
            MutatorEdges {
                depends_on: vec![intern("second")],
                dependency_of: vec![],
            },
            MutatorEdges::default(),
        ];
        let plan = PipelinePlan::build(intern("update"), &mutators, &edges).unwrap();
        assert_eq!(plan.layers.len(), 2);
        assert_eq!(plan.layers[0].waves[0].as_slice(), &[1]);
        assert_eq!(plan.layers[1].waves[0].as_slice(), &[0]);
    }

    #[test]
    fn cycle_is_an_access_conflict() {
        let repository = test_repository();
        let mutators = vec![
            deployed("first", "alpha", &repository),
            deployed("second", "beta", &repository),
        ];
        let edges = vec![
            MutatorEdges {
                depends_on: vec![intern("second")],
                dependency_of: vec![],
            },
            MutatorEdges {
                depends_on: vec![intern("first")],
                dependency_of: vec![],
            },
        ];
        assert!(matches!(
            PipelinePlan::build(intern("update"), &mutators, &edges),
            Err(DeployError::AccessConflict { .. })
        ));
    }

    #[test]
    fn self_conflicting_bindings_fail_deployment() {
        let repository = test_repository();
        let def = MutatorBuilder::new("greedy")
            .read_singleton("alpha")
            .write_singleton("alpha")
            .build(|_| Ok(()));
        assert!(matches!(
            DeployedMutator::deploy(def, &repository),
            Err(DeployError::AccessConflict { .. })
        ));
    }
}
