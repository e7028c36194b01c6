//! Migration engine.
//!
//! When the reflection registry publishes a new version, every world's
//! repository is rebuilt: record data moves into storages with the new
//! layouts through field-mapping plans (matched by name, honoring
//! renamed-from meta; removed fields are discarded, added fields keep their
//! fresh initialization). Records whose patch touches an incompatible field
//! are dropped with a diagnostic while migration continues. Event queues are
//! recreated empty, indices are rebuilt lazily at redeployment, and mutators
//! annotated `on_migration` run once in a dedicated pipeline.

use crate::error::{DeployError, PatchIncompatible};
use crate::intern::{intern, IStr};
use crate::jobs::JobSystem;
use crate::layout::RecordLayout;
use crate::record::RecordBuf;
use crate::reflection::Registry;
use crate::repository::Repository;
use crate::schedule::{self, DeployedMutator, MutatorEdges, Pipeline, PipelinePlan};
use crate::universe::{MutatorRegistry, SchedulerRegistry, Universe};
use crate::world::{build_pipeline, deploy_seat, World};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome counters of one migration pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct MigrationReport {
    /// Records carried into the new layouts.
    pub migrated_records: usize,
    /// Records dropped with a patch-incompatible diagnostic.
    pub dropped_records: usize,
}

pub(crate) fn run(
    universe: &mut Universe,
    registry: Arc<Registry>,
) -> Result<MigrationReport, DeployError> {
    info!(
        from_version = universe.registry.version(),
        to_version = registry.version(),
        "migrating universe"
    );
    let mut report = MigrationReport::default();
    if let Some(root) = universe.root.as_mut() {
        migrate_world(
            root,
            &registry,
            &universe.mutators,
            &universe.schedulers,
            &universe.jobs,
            &mut report,
        )?;
    }
    universe.registry = registry;
    info!(
        migrated = report.migrated_records,
        dropped = report.dropped_records,
        "migration finished"
    );
    Ok(report)
}

fn migrate_world(
    world: &mut World,
    registry: &Arc<Registry>,
    mutators: &MutatorRegistry,
    schedulers: &SchedulerRegistry,
    jobs: &Arc<dyn JobSystem>,
    report: &mut MigrationReport,
) -> Result<(), DeployError> {
    debug!(world = %world.name, "migrating world");

    // quiesce: dropping the deployed pipelines and scheduler seat closes
    // every binding before storages are replaced
    world.seat = None;
    world.pipelines.clear();
    let old_repository =
        std::mem::replace(&mut world.repository, Repository::new(registry.clone()));

    transfer_singletons(&old_repository, &world.repository, registry, report)?;
    transfer_indexed(&old_repository, &world.repository, registry, report)?;
    // event queues are transient; redeployment recreates them empty
    drop(old_repository);

    world.seat = Some(deploy_seat(
        &world.config.scheduler,
        &world.repository,
        schedulers,
    )?);
    let pipelines = world
        .config
        .pipelines
        .iter()
        .map(|pipeline| build_pipeline(pipeline, &world.repository, mutators))
        .collect::<Result<Vec<_>, _>>()?;
    world.pipelines = pipelines;

    run_migration_pipeline(world, mutators, jobs)?;

    for child in world.children.iter_mut() {
        migrate_world(child, registry, mutators, schedulers, jobs, report)?;
    }
    Ok(())
}

fn transfer_singletons(
    old_repository: &Repository,
    new_repository: &Repository,
    registry: &Arc<Registry>,
    report: &mut MigrationReport,
) -> Result<(), DeployError> {
    for (name, old_storage) in old_repository.singleton_storages() {
        if registry.type_info(name).is_none() {
            debug!(record_type = %name, "record type removed, dropping singleton storage");
            continue;
        }
        let new_storage = new_repository.singleton(name)?;
        let plan = MappingPlan::build(&old_storage.layout, &new_storage.layout);
        let old_record = old_storage.snapshot();
        match plan.apply(&old_record, new_storage.layout.clone()) {
            Ok(record) => {
                new_storage.replace_record(record);
                report.migrated_records += 1;
            }
            Err(incompatible) => {
                warn!(diagnostic = %incompatible, "dropping singleton record during migration");
                report.dropped_records += 1;
            }
        }
    }
    Ok(())
}

fn transfer_indexed(
    old_repository: &Repository,
    new_repository: &Repository,
    registry: &Arc<Registry>,
    report: &mut MigrationReport,
) -> Result<(), DeployError> {
    for (name, old_storage) in old_repository.indexed_storages() {
        if registry.type_info(name).is_none() {
            debug!(record_type = %name, "record type removed, dropping indexed storage");
            continue;
        }
        let new_storage = new_repository.indexed(name)?;
        let plan = MappingPlan::build(&old_storage.layout, &new_storage.layout);
        let mut rows = Vec::new();
        for (handle, old_record) in old_storage.rows_snapshot() {
            match plan.apply(&old_record, new_storage.layout.clone()) {
                Ok(record) => rows.push((handle, record)),
                Err(incompatible) => {
                    warn!(
                        handle = %handle,
                        diagnostic = %incompatible,
                        "dropping record during migration"
                    );
                    report.dropped_records += 1;
                }
            }
        }
        report.migrated_records += rows.len();
        new_storage.adopt_rows(rows);
    }
    Ok(())
}

/// Deploys and runs the one-shot pipeline of `on_migration` mutators
/// referenced by this world's configuration.
fn run_migration_pipeline(
    world: &mut World,
    mutators: &MutatorRegistry,
    jobs: &Arc<dyn JobSystem>,
) -> Result<(), DeployError> {
    let mut seen: Vec<IStr> = Vec::new();
    let mut migrants: Vec<Arc<DeployedMutator>> = Vec::new();
    for pipeline in &world.config.pipelines {
        for entry in &pipeline.mutators {
            let name = intern(&entry.name);
            if seen.contains(&name) {
                continue;
            }
            seen.push(name);
            if let Some(def) = mutators.get(&name) {
                if def.on_migration {
                    migrants.push(DeployedMutator::deploy(def.clone(), &world.repository)?);
                }
            }
        }
    }
    if migrants.is_empty() {
        return Ok(());
    }

    let name = intern("on_migration");
    let edges = vec![MutatorEdges::default(); migrants.len()];
    let plan = PipelinePlan::build(name, &migrants, &edges)?;
    let pipeline = Pipeline {
        name,
        mutators: migrants,
        plan,
    };
    debug!(world = %world.name, "running one-shot migration pipeline");
    if let Err(fatal) = schedule::execute(&pipeline, &world.repository, jobs) {
        warn!(world = %world.name, error = %fatal, "migration pipeline aborted");
    }
    Ok(())
}

enum PlanPair {
    Copy { from: u16, to: u16 },
    Incompatible { from: u16, field: IStr },
}

/// Field-mapping plan between an old and a new layout of one record type.
/// Pairs are ordered by the new layout, so patches apply in section order.
pub(crate) struct MappingPlan {
    record: IStr,
    pairs: Vec<PlanPair>,
}

impl MappingPlan {
    pub(crate) fn build(old: &RecordLayout, new: &RecordLayout) -> MappingPlan {
        let mut pairs = Vec::new();
        for (new_index, new_slot) in new.slots.iter().enumerate() {
            if new_slot.ignored {
                continue;
            }
            let source_name = new_slot.renamed_from.unwrap_or(new_slot.name);
            let from = match old.slot_index(source_name) {
                Some(slot) => slot,
                // no old counterpart: the field keeps its fresh initialization
                None => continue,
            };
            if old.slot(from).ignored {
                continue;
            }
            if old.slot(from).kind == new_slot.kind {
                pairs.push(PlanPair::Copy {
                    from,
                    to: new_index as u16,
                });
            } else {
                pairs.push(PlanPair::Incompatible {
                    from,
                    field: new_slot.name,
                });
            }
        }
        MappingPlan {
            record: new.type_name,
            pairs,
        }
    }

    /// Builds the record's new image. A pair touching an incompatible field
    /// only fails the record when the old field is logically present (active
    /// union arm); inactive arms are skipped.
    pub(crate) fn apply(
        &self,
        old: &RecordBuf,
        new_layout: Arc<RecordLayout>,
    ) -> Result<RecordBuf, PatchIncompatible> {
        let mut record = RecordBuf::new(new_layout);
        for pair in &self.pairs {
            match pair {
                PlanPair::Copy { from, to } => {
                    if old.is_active(*from) {
                        record.set_slot(*to, old.slot(*from).clone());
                    }
                }
                PlanPair::Incompatible { from, field } => {
                    if old.is_active(*from) {
                        return Err(PatchIncompatible {
                            record: self.record,
                            field: *field,
                        });
                    }
                }
            }
        }
        Ok(record)
    }
}
