use cosmos::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn counter_registry() -> Arc<Registry> {
    Registry::builder(1)
        .with_type(TypeInfo::new("update_counter").field(FieldInfo::new("runs", FieldKind::U64)))
        .build()
}

fn counting_mutator() -> Arc<MutatorDef> {
    MutatorBuilder::new("count_updates")
        .write_singleton("update_counter")
        .build(|context| {
            let mut access = context.singleton_write("update_counter");
            let record = access.resolve();
            let next = record.u64("runs").unwrap() + 1;
            record.set_u64("runs", next).unwrap();
            Ok(())
        })
}

fn counting_pipeline() -> PipelineConfig {
    PipelineConfig::new(UPDATE_PIPELINE).mutator(MutatorConfig::new("count_updates"))
}

#[test]
fn trivial_scheduler_updates_the_whole_subtree() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut universe = Universe::new(counter_registry(), Arc::new(ImmediateJobs::default()));
    universe.register_mutator(counting_mutator());
    universe
        .create_root_world(
            WorldConfig::new("root", TRIVIAL_SCHEDULER)
                .pipeline(counting_pipeline())
                .child(
                    WorldConfig::new("middle", TRIVIAL_SCHEDULER)
                        .pipeline(counting_pipeline())
                        .child(
                            WorldConfig::new("leaf", TRIVIAL_SCHEDULER)
                                .pipeline(counting_pipeline()),
                        ),
                ),
        )
        .unwrap();

    for _ in 0..3 {
        universe.update_with_delta(0);
    }

    let root = universe.root_world().unwrap();
    let middle = root.child("middle").unwrap();
    let leaf = middle.child("leaf").unwrap();
    for world in &[root, middle, leaf] {
        let counter = world
            .repository()
            .singleton_snapshot("update_counter")
            .unwrap();
        assert_eq!(counter.u64("runs").unwrap(), 3, "world {}", world.name());
    }
}

#[test]
fn parallel_jobs_drive_a_full_update() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut universe = Universe::new(counter_registry(), Arc::new(RayonJobs::new(4).unwrap()));
    universe.register_mutator(counting_mutator());
    universe
        .create_root_world(WorldConfig::new("root", TRIVIAL_SCHEDULER).pipeline(counting_pipeline()))
        .unwrap();

    for _ in 0..5 {
        universe.update_with_delta(0);
    }

    let counter = universe
        .root_world()
        .unwrap()
        .repository()
        .singleton_snapshot("update_counter")
        .unwrap();
    assert_eq!(counter.u64("runs").unwrap(), 5);
}

#[test]
fn teardown_runs_reflected_finalizers_post_order() {
    let _ = tracing_subscriber::fmt::try_init();

    let finalized = Arc::new(AtomicUsize::new(0));
    let finalized_hook = finalized.clone();
    let registry = Registry::builder(1)
        .with_type(
            TypeInfo::new("tracked")
                .field(FieldInfo::new("value", FieldKind::U64))
                .shutdown_with(move |_record| {
                    finalized_hook.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .build();

    let mut universe = Universe::new(registry, Arc::new(ImmediateJobs::default()));
    universe.register_mutator(
        MutatorBuilder::new("touch")
            .write_singleton("tracked")
            .build(|context| {
                let mut access = context.singleton_write("tracked");
                access.resolve().set_u64("value", 1).unwrap();
                Ok(())
            }),
    );
    universe
        .create_root_world(
            WorldConfig::new("root", TRIVIAL_SCHEDULER)
                .pipeline(PipelineConfig::new(UPDATE_PIPELINE).mutator(MutatorConfig::new("touch")))
                .child(
                    WorldConfig::new("inner", TRIVIAL_SCHEDULER).pipeline(
                        PipelineConfig::new(UPDATE_PIPELINE).mutator(MutatorConfig::new("touch")),
                    ),
                ),
        )
        .unwrap();
    universe.update_with_delta(0);

    drop(universe);
    // one singleton per world, both finalized at teardown
    assert_eq!(finalized.load(Ordering::SeqCst), 2);
}

#[test]
fn deployment_failures_surface_as_errors() {
    let _ = tracing_subscriber::fmt::try_init();

    // unknown mutator
    let mut universe = Universe::new(counter_registry(), Arc::new(ImmediateJobs::default()));
    let result = universe.create_root_world(
        WorldConfig::new("root", TRIVIAL_SCHEDULER)
            .pipeline(PipelineConfig::new(UPDATE_PIPELINE).mutator(MutatorConfig::new("missing"))),
    );
    assert!(matches!(result, Err(DeployError::UnknownMutator(_))));

    // unknown scheduler
    let mut universe = Universe::new(counter_registry(), Arc::new(ImmediateJobs::default()));
    let result = universe.create_root_world(WorldConfig::new("root", "nonexistent"));
    assert!(matches!(result, Err(DeployError::UnknownScheduler(_))));

    // binding on a type the registry does not know
    let mut universe = Universe::new(counter_registry(), Arc::new(ImmediateJobs::default()));
    universe.register_mutator(
        MutatorBuilder::new("stray")
            .write_singleton("nonexistent_type")
            .build(|_| Ok(())),
    );
    let result = universe.create_root_world(
        WorldConfig::new("root", TRIVIAL_SCHEDULER)
            .pipeline(PipelineConfig::new(UPDATE_PIPELINE).mutator(MutatorConfig::new("stray"))),
    );
    assert!(matches!(result, Err(DeployError::UnknownType(_))));

    // cyclic dependency edges
    let mut universe = Universe::new(counter_registry(), Arc::new(ImmediateJobs::default()));
    universe.register_mutator(counting_mutator());
    universe.register_mutator(
        MutatorBuilder::new("other").build(|_| Ok(())),
    );
    let result = universe.create_root_world(
        WorldConfig::new("root", TRIVIAL_SCHEDULER).pipeline(
            PipelineConfig::new(UPDATE_PIPELINE)
                .mutator(MutatorConfig::new("count_updates").depends_on("other"))
                .mutator(MutatorConfig::new("other").depends_on("count_updates")),
        ),
    );
    assert!(matches!(result, Err(DeployError::AccessConflict { .. })));

    // one storage class per type
    let mut universe = Universe::new(counter_registry(), Arc::new(ImmediateJobs::default()));
    universe.register_mutator(
        MutatorBuilder::new("as_singleton")
            .write_singleton("update_counter")
            .build(|_| Ok(())),
    );
    universe.register_mutator(
        MutatorBuilder::new("as_indexed")
            .insert("update_counter")
            .build(|_| Ok(())),
    );
    let result = universe.create_root_world(
        WorldConfig::new("root", TRIVIAL_SCHEDULER).pipeline(
            PipelineConfig::new(UPDATE_PIPELINE)
                .mutator(MutatorConfig::new("as_singleton"))
                .mutator(MutatorConfig::new("as_indexed")),
        ),
    );
    assert!(matches!(
        result,
        Err(DeployError::StorageClassMismatch { .. })
    ));
}

#[test]
fn fatal_error_skips_later_layers_of_the_update() {
    let _ = tracing_subscriber::fmt::try_init();

    let registry = Registry::builder(1)
        .with_type(TypeInfo::new("update_counter").field(FieldInfo::new("runs", FieldKind::U64)))
        .with_type(TypeInfo::new("late_counter").field(FieldInfo::new("runs", FieldKind::U64)))
        .build();

    let mut universe = Universe::new(registry, Arc::new(ImmediateJobs::default()));
    universe.register_mutator(
        MutatorBuilder::new("failing")
            .write_singleton("update_counter")
            .build(|context| {
                let mut access = context.singleton_write("update_counter");
                let record = access.resolve();
                let next = record.u64("runs").unwrap() + 1;
                record.set_u64("runs", next).unwrap();
                access.close();
                Err(Fatal::new("induced failure"))
            }),
    );
    universe.register_mutator(
        MutatorBuilder::new("late")
            .write_singleton("late_counter")
            .build(|context| {
                let mut access = context.singleton_write("late_counter");
                let record = access.resolve();
                let next = record.u64("runs").unwrap() + 1;
                record.set_u64("runs", next).unwrap();
                Ok(())
            }),
    );
    universe
        .create_root_world(
            WorldConfig::new("root", TRIVIAL_SCHEDULER).pipeline(
                PipelineConfig::new(UPDATE_PIPELINE)
                    .mutator(MutatorConfig::new("failing"))
                    .mutator(MutatorConfig::new("late").depends_on("failing")),
            ),
        )
        .unwrap();

    universe.update_with_delta(0);

    let repository = universe.root_world().unwrap().repository();
    // the failing mutator's own writes survive; the dependent layer never ran
    assert_eq!(
        repository
            .singleton_snapshot("update_counter")
            .unwrap()
            .u64("runs")
            .unwrap(),
        1
    );
    assert_eq!(
        repository
            .singleton_snapshot("late_counter")
            .unwrap()
            .u64("runs")
            .unwrap(),
        0
    );
}
