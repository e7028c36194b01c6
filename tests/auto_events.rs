use cosmos::*;
use std::sync::Arc;

fn base_registry() -> RegistryBuilder {
    Registry::builder(1)
        .with_type(TypeInfo::new("seed_state").field(FieldInfo::new("done", FieldKind::Bool)))
        .with_type(
            TypeInfo::new("consumer_state")
                .field(FieldInfo::new("events_seen", FieldKind::U64))
                .field(FieldInfo::new("last_new_x", FieldKind::U64))
                .field(FieldInfo::new("last_old_x", FieldKind::U64)),
        )
        .with_type(
            TypeInfo::new("probe")
                .field(FieldInfo::new("id", FieldKind::U64))
                .field(FieldInfo::new("x", FieldKind::U64)),
        )
}

fn seeder(x: u64) -> Arc<MutatorDef> {
    MutatorBuilder::new("seeder")
        .write_singleton("seed_state")
        .insert("probe")
        .build(move |context| {
            let mut state = context.singleton_write("seed_state");
            if state.resolve().bool("done").unwrap() {
                return Ok(());
            }
            state.resolve().set_bool("done", true).unwrap();
            let mut token = context.insert("probe");
            token.resolve().set_u64("id", 1).unwrap();
            token.resolve().set_u64("x", x).unwrap();
            token.close();
            Ok(())
        })
}

fn consumer(event_type: &'static str) -> Arc<MutatorDef> {
    MutatorBuilder::new("consumer")
        .write_singleton("consumer_state")
        .read_events(event_type)
        .build(move |context| {
            let reader = context.events(event_type);
            while let Some(event) = reader.read() {
                let mut state = context.singleton_write("consumer_state");
                let record = state.resolve();
                let seen = record.u64("events_seen").unwrap() + 1;
                record.set_u64("events_seen", seen).unwrap();
                if let Ok(new_x) = event.u64("new_x") {
                    record.set_u64("last_new_x", new_x).unwrap();
                }
                if let Ok(old_x) = event.u64("old_x") {
                    record.set_u64("last_old_x", old_x).unwrap();
                }
                state.close();
            }
            Ok(())
        })
}

fn consumer_state(universe: &Universe) -> RecordBuf {
    universe
        .root_world()
        .unwrap()
        .repository()
        .singleton_snapshot("consumer_state")
        .unwrap()
}

#[test]
fn on_change_diff_emits_one_event_with_copy_outs() {
    let _ = tracing_subscriber::fmt::try_init();

    let registry = base_registry()
        .with_type(
            TypeInfo::new("probe_changed")
                .field(FieldInfo::new("new_x", FieldKind::U64))
                .field(FieldInfo::new("old_x", FieldKind::U64)),
        )
        .on_change_event(OnChangeEvent {
            trigger_type: intern("probe"),
            event_type: intern("probe_changed"),
            observed_fields: vec![FieldPath::parse("x")],
            unchanged_copy_outs: vec![CopyOut::new("x", "old_x")],
            changed_copy_outs: vec![CopyOut::new("x", "new_x")],
        })
        .build();

    let mut universe = Universe::new(registry, Arc::new(ImmediateJobs::default()));
    universe.register_mutator(seeder(1));
    universe.register_mutator(
        MutatorBuilder::new("changer")
            .write_all("probe")
            .build(|context| {
                let query = context.write("probe");
                let mut cursor = query.sequence();
                while let Some(mut token) = cursor.next() {
                    if token.u64("x").unwrap() == 1 {
                        token.set_u64("x", 2).unwrap();
                    }
                }
                Ok(())
            }),
    );
    universe.register_mutator(consumer("probe_changed"));
    universe
        .create_root_world(
            WorldConfig::new("root", TRIVIAL_SCHEDULER).pipeline(
                PipelineConfig::new("update")
                    .mutator(MutatorConfig::new("seeder"))
                    .mutator(MutatorConfig::new("changer"))
                    .mutator(MutatorConfig::new("consumer")),
            ),
        )
        .unwrap();

    // step 1: insert staged, published at the boundary
    universe.update_with_delta(0);
    assert_eq!(consumer_state(&universe).u64("events_seen").unwrap(), 0);

    // step 2: the changer flips x from 1 to 2; the on-change event is staged
    // and becomes visible no earlier than the next step
    universe.update_with_delta(0);
    assert_eq!(consumer_state(&universe).u64("events_seen").unwrap(), 0);

    // step 3: exactly one event, changed copy-out from the post-image and
    // unchanged copy-out from the pre-image
    universe.update_with_delta(0);
    let state = consumer_state(&universe);
    assert_eq!(state.u64("events_seen").unwrap(), 1);
    assert_eq!(state.u64("last_new_x").unwrap(), 2);
    assert_eq!(state.u64("last_old_x").unwrap(), 1);

    // no further diffs, no further events
    universe.update_with_delta(0);
    assert_eq!(consumer_state(&universe).u64("events_seen").unwrap(), 1);
}

#[test]
fn unobserved_field_changes_do_not_emit() {
    let _ = tracing_subscriber::fmt::try_init();

    let registry = base_registry()
        .with_type(TypeInfo::new("probe_changed").field(FieldInfo::new("new_x", FieldKind::U64)))
        .on_change_event(OnChangeEvent {
            trigger_type: intern("probe"),
            event_type: intern("probe_changed"),
            observed_fields: vec![FieldPath::parse("x")],
            unchanged_copy_outs: vec![],
            changed_copy_outs: vec![CopyOut::new("x", "new_x")],
        })
        .build();

    let mut universe = Universe::new(registry, Arc::new(ImmediateJobs::default()));
    universe.register_mutator(seeder(1));
    universe.register_mutator(
        MutatorBuilder::new("changer")
            .write_all("probe")
            .build(|context| {
                let query = context.write("probe");
                let mut cursor = query.sequence();
                while let Some(mut token) = cursor.next() {
                    // id is not observed; rewriting it must stay silent
                    token.set_u64("id", 99).unwrap();
                }
                Ok(())
            }),
    );
    universe.register_mutator(consumer("probe_changed"));
    universe
        .create_root_world(
            WorldConfig::new("root", TRIVIAL_SCHEDULER).pipeline(
                PipelineConfig::new("update")
                    .mutator(MutatorConfig::new("seeder"))
                    .mutator(MutatorConfig::new("changer"))
                    .mutator(MutatorConfig::new("consumer")),
            ),
        )
        .unwrap();

    for _ in 0..4 {
        universe.update_with_delta(0);
    }
    assert_eq!(consumer_state(&universe).u64("events_seen").unwrap(), 0);
}

#[test]
fn explicit_event_submission_reaches_consumers() {
    let _ = tracing_subscriber::fmt::try_init();

    let registry = base_registry()
        .with_type(TypeInfo::new("ping").field(FieldInfo::new("new_x", FieldKind::U64)))
        .build();

    let mut universe = Universe::new(registry, Arc::new(ImmediateJobs::default()));
    universe.register_mutator(
        MutatorBuilder::new("producer")
            .submit_events("ping")
            .build(|context| {
                let mut token = context.event_insert("ping");
                token.resolve().set_u64("new_x", 41).unwrap();
                token.close();
                Ok(())
            }),
    );
    universe.register_mutator(consumer("ping"));
    universe
        .create_root_world(
            WorldConfig::new("root", TRIVIAL_SCHEDULER).pipeline(
                PipelineConfig::new("update")
                    .mutator(MutatorConfig::new("producer"))
                    .mutator(MutatorConfig::new("consumer")),
            ),
        )
        .unwrap();

    universe.update_with_delta(0);
    universe.update_with_delta(0);

    let state = consumer_state(&universe);
    assert_eq!(state.u64("events_seen").unwrap(), 2);
    assert_eq!(state.u64("last_new_x").unwrap(), 41);
}

#[test]
fn on_add_fires_after_publication() {
    let _ = tracing_subscriber::fmt::try_init();

    let registry = base_registry()
        .with_type(TypeInfo::new("probe_added").field(FieldInfo::new("id", FieldKind::U64)))
        .on_add_event(OnAddEvent {
            trigger_type: intern("probe"),
            event_type: intern("probe_added"),
            copy_outs: vec![CopyOut::new("id", "id")],
        })
        .build();

    let mut universe = Universe::new(registry, Arc::new(ImmediateJobs::default()));
    universe.register_mutator(seeder(7));
    universe.register_mutator(consumer("probe_added"));
    universe
        .create_root_world(
            WorldConfig::new("root", TRIVIAL_SCHEDULER).pipeline(
                PipelineConfig::new("update")
                    .mutator(MutatorConfig::new("seeder"))
                    .mutator(MutatorConfig::new("consumer")),
            ),
        )
        .unwrap();

    universe.update_with_delta(0);
    assert_eq!(consumer_state(&universe).u64("events_seen").unwrap(), 0);

    universe.update_with_delta(0);
    let state = consumer_state(&universe);
    assert_eq!(state.u64("events_seen").unwrap(), 1);

    universe.update_with_delta(0);
    assert_eq!(consumer_state(&universe).u64("events_seen").unwrap(), 1);
}

#[test]
fn on_remove_sees_the_final_state() {
    let _ = tracing_subscriber::fmt::try_init();

    let registry = base_registry()
        .with_type(TypeInfo::new("probe_removed").field(FieldInfo::new("last_x", FieldKind::U64)))
        .on_remove_event(OnRemoveEvent {
            trigger_type: intern("probe"),
            event_type: intern("probe_removed"),
            copy_outs: vec![CopyOut::new("x", "last_x")],
        })
        .build();

    let mut universe = Universe::new(registry, Arc::new(ImmediateJobs::default()));
    universe.register_mutator(seeder(5));
    universe.register_mutator(
        MutatorBuilder::new("reaper")
            .write_all("probe")
            .build(|context| {
                let query = context.write("probe");
                let mut cursor = query.sequence();
                while let Some(mut token) = cursor.next() {
                    token.set_u64("x", 6).unwrap();
                    token.delete();
                }
                Ok(())
            }),
    );
    universe.register_mutator(consumer("probe_removed"));
    universe
        .create_root_world(
            WorldConfig::new("root", TRIVIAL_SCHEDULER).pipeline(
                PipelineConfig::new("update")
                    .mutator(MutatorConfig::new("seeder"))
                    .mutator(MutatorConfig::new("reaper"))
                    .mutator(MutatorConfig::new("consumer")),
            ),
        )
        .unwrap();

    // step 1 publishes, step 2 deletes, step 3 observes
    universe.update_with_delta(0);
    universe.update_with_delta(0);
    universe.update_with_delta(0);

    let state = consumer_state(&universe);
    assert_eq!(state.u64("events_seen").unwrap(), 1);

    let survivors = universe
        .root_world()
        .unwrap()
        .repository()
        .indexed_snapshot("probe")
        .unwrap();
    assert!(survivors.is_empty());
}
