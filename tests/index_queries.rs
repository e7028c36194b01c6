use cosmos::*;
use std::sync::Arc;

fn registry() -> Arc<Registry> {
    Registry::builder(1)
        .with_type(TypeInfo::new("seed_state").field(FieldInfo::new("done", FieldKind::Bool)))
        .with_type(
            TypeInfo::new("query_results")
                .field(FieldInfo::new("eq_count", FieldKind::U64))
                .field(FieldInfo::new("eq_id", FieldKind::U64))
                .field(FieldInfo::new("range_count", FieldKind::U64))
                .field(FieldInfo::new("bad_count", FieldKind::U64)),
        )
        .with_type(
            TypeInfo::new("asset")
                .field(FieldInfo::new("id", FieldKind::U64))
                .field(FieldInfo::new("name", FieldKind::Str)),
        )
        .build()
}

fn seeder() -> Arc<MutatorDef> {
    MutatorBuilder::new("seeder")
        .write_singleton("seed_state")
        .insert("asset")
        .build(|context| {
            let mut state = context.singleton_write("seed_state");
            if state.resolve().bool("done").unwrap() {
                return Ok(());
            }
            state.resolve().set_bool("done", true).unwrap();
            for (id, name) in &[(5u64, "foo"), (15, "bar"), (25, "baz")] {
                let mut token = context.insert("asset");
                token.resolve().set_u64("id", *id).unwrap();
                token.resolve().set_str("name", intern(name)).unwrap();
                token.close();
            }
            Ok(())
        })
}

fn querier() -> Arc<MutatorDef> {
    MutatorBuilder::new("querier")
        .write_singleton("query_results")
        .read_eq("asset", "name")
        .read_range("asset", "id")
        .build(|context| {
            let mut eq_count = 0u64;
            let mut eq_id = 0u64;
            {
                let query = context.read("asset");
                let mut cursor = query.eq(Value::Str(intern("bar")));
                while let Some(token) = cursor.next() {
                    eq_count += 1;
                    eq_id = token.u64("id").unwrap();
                }
            }

            let mut range_count = 0u64;
            {
                // both eq and range bindings were declared; take the range one
                let query = context.read("asset");
                let mut cursor = query.range(Value::U64(10), Value::U64(20));
                while let Some(_token) = cursor.next() {
                    range_count += 1;
                }
            }

            // malformed parameters: a u64 key against a string field yields
            // an empty cursor
            let mut bad_count = 0u64;
            {
                let query = context.read("asset");
                let mut cursor = query.eq(Value::U64(42));
                while let Some(_token) = cursor.next() {
                    bad_count += 1;
                }
            }

            let mut results = context.singleton_write("query_results");
            let record = results.resolve();
            record.set_u64("eq_count", eq_count).unwrap();
            record.set_u64("eq_id", eq_id).unwrap();
            record.set_u64("range_count", range_count).unwrap();
            record.set_u64("bad_count", bad_count).unwrap();
            Ok(())
        })
}

fn build_universe() -> Universe {
    let mut universe = Universe::new(registry(), Arc::new(ImmediateJobs::default()));
    universe.register_mutator(seeder());
    universe.register_mutator(querier());
    universe
        .create_root_world(
            WorldConfig::new("root", TRIVIAL_SCHEDULER).pipeline(
                PipelineConfig::new("update")
                    .mutator(MutatorConfig::new("seeder"))
                    .mutator(MutatorConfig::new("querier")),
            ),
        )
        .unwrap();
    universe
}

#[test]
fn round_trip_through_indices() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut universe = build_universe();

    universe.update_with_delta(0);
    universe.update_with_delta(0);

    let results = universe
        .root_world()
        .unwrap()
        .repository()
        .singleton_snapshot("query_results")
        .unwrap();
    // the inserted record comes back exactly once through the hash index
    assert_eq!(results.u64("eq_count").unwrap(), 1);
    assert_eq!(results.u64("eq_id").unwrap(), 15);
    // id in [10, 20] matches exactly the middle record
    assert_eq!(results.u64("range_count").unwrap(), 1);
    // bad parameters resolve to an empty cursor
    assert_eq!(results.u64("bad_count").unwrap(), 0);
}

#[test]
fn eq_resolves_to_hash_and_range_to_ordered_index() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut universe = build_universe();

    universe.update_with_delta(0);
    universe.update_with_delta(0);

    let stats = universe
        .root_world()
        .unwrap()
        .repository()
        .index_stats("asset")
        .unwrap();
    assert_eq!(stats.len(), 2, "one hash and one ordered index expected");

    let hash_hits = stats
        .iter()
        .find(|(kind, _)| *kind == "hash")
        .map(|(_, hits)| *hits)
        .unwrap();
    let value_hits = stats
        .iter()
        .find(|(kind, _)| *kind == "value")
        .map(|(_, hits)| *hits)
        .unwrap();

    // the name equality query hit the hash index twice (good and bad params
    // never reached it twice: the malformed key was rejected before lookup),
    // the id range query hit the ordered index twice
    assert_eq!(hash_hits, 2);
    assert_eq!(value_hits, 2);
}

#[test]
fn space_box_and_handle_lookups() {
    let _ = tracing_subscriber::fmt::try_init();

    let registry = Registry::builder(1)
        .with_type(TypeInfo::new("seed_state").field(FieldInfo::new("done", FieldKind::Bool)))
        .with_type(
            TypeInfo::new("space_results")
                .field(FieldInfo::new("box_count", FieldKind::U64))
                .field(FieldInfo::new("tracked", FieldKind::Handle))
                .field(FieldInfo::new("tracked_id", FieldKind::U64)),
        )
        .with_type(
            TypeInfo::new("body")
                .field(FieldInfo::new("id", FieldKind::U64))
                .field(FieldInfo::new("min_x", FieldKind::F64))
                .field(FieldInfo::new("max_x", FieldKind::F64)),
        )
        .build();

    let mut universe = Universe::new(registry, Arc::new(ImmediateJobs::default()));
    universe.register_mutator(
        MutatorBuilder::new("seeder")
            .write_singleton("seed_state")
            .write_singleton("space_results")
            .insert("body")
            .build(|context| {
                let mut state = context.singleton_write("seed_state");
                if state.resolve().bool("done").unwrap() {
                    return Ok(());
                }
                state.resolve().set_bool("done", true).unwrap();

                let mut kept = RecordHandle::null();
                for (id, min, max) in &[(1u64, 0.0f64, 4.0f64), (2, 10.0, 12.0)] {
                    let mut token = context.insert("body");
                    token.resolve().set_u64("id", *id).unwrap();
                    token.resolve().set_f64("min_x", *min).unwrap();
                    token.resolve().set_f64("max_x", *max).unwrap();
                    if *id == 2 {
                        kept = token.handle();
                    }
                    token.close();
                }

                // handles are first-class values records can hold
                let mut results = context.singleton_write("space_results");
                results.resolve().set_handle("tracked", kept).unwrap();
                Ok(())
            }),
    );
    universe.register_mutator(
        MutatorBuilder::new("prober")
            .write_singleton("space_results")
            .read(
                "body",
                QueryShape::SpaceBox(vec![(FieldPath::parse("min_x"), FieldPath::parse("max_x"))]),
            )
            .build(|context| {
                let query = context.read("body");
                let mut box_count = 0u64;
                {
                    let mut cursor = query.space(&[3.0], &[11.0]);
                    while let Some(_token) = cursor.next() {
                        box_count += 1;
                    }
                }

                let mut results = context.singleton_write("space_results");
                let tracked = results.resolve().handle("tracked").unwrap();
                results.resolve().set_u64("box_count", box_count).unwrap();
                results.close();

                if !tracked.is_null() {
                    let mut cursor = query.by_handle(tracked);
                    if let Some(token) = cursor.next() {
                        let id = token.u64("id").unwrap();
                        let mut results = context.singleton_write("space_results");
                        results.resolve().set_u64("tracked_id", id).unwrap();
                    }
                }
                Ok(())
            }),
    );
    universe
        .create_root_world(
            WorldConfig::new("root", TRIVIAL_SCHEDULER).pipeline(
                PipelineConfig::new("update")
                    .mutator(MutatorConfig::new("seeder"))
                    .mutator(MutatorConfig::new("prober")),
            ),
        )
        .unwrap();

    universe.update_with_delta(0);
    universe.update_with_delta(0);

    let results = universe
        .root_world()
        .unwrap()
        .repository()
        .singleton_snapshot("space_results")
        .unwrap();
    // both bodies overlap the [3, 11] box
    assert_eq!(results.u64("box_count").unwrap(), 2);
    // the stored handle resolves back to the second body
    assert_eq!(results.u64("tracked_id").unwrap(), 2);
}

#[test]
fn same_step_inserts_stay_invisible_to_open_cursors() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut universe = Universe::new(registry(), Arc::new(ImmediateJobs::default()));
    universe.register_mutator(seeder());
    universe.register_mutator(
        MutatorBuilder::new("counting_inserter")
            .write_singleton("query_results")
            .insert("asset")
            .build(|context| {
                // a fresh insert in this very step...
                let mut token = context.insert("asset");
                token.resolve().set_u64("id", 1000).unwrap();
                token.close();
                Ok(())
            }),
    );
    universe.register_mutator(
        MutatorBuilder::new("counter")
            .write_singleton("seed_state")
            .read_all("asset")
            .build(|context| {
                let query = context.read("asset");
                let mut seen = 0u64;
                let mut cursor = query.sequence();
                while let Some(_token) = cursor.next() {
                    seen += 1;
                }
                drop(cursor);
                let mut state = context.singleton_write("seed_state");
                // reuse the done flag as scratch: records visible this step
                state
                    .resolve()
                    .set_bool("done", seen > 0)
                    .unwrap();
                Ok(())
            }),
    );
    universe
        .create_root_world(
            WorldConfig::new("root", TRIVIAL_SCHEDULER).pipeline(
                PipelineConfig::new("update")
                    .mutator(MutatorConfig::new("counting_inserter"))
                    .mutator(MutatorConfig::new("counter")),
            ),
        )
        .unwrap();

    universe.update_with_delta(0);
    // the first step's cursor saw nothing: the insert was staged, not visible
    let state = universe
        .root_world()
        .unwrap()
        .repository()
        .singleton_snapshot("seed_state")
        .unwrap();
    assert!(!state.bool("done").unwrap());

    universe.update_with_delta(0);
    let state = universe
        .root_world()
        .unwrap()
        .repository()
        .singleton_snapshot("seed_state")
        .unwrap();
    assert!(state.bool("done").unwrap());

    // two steps, two published inserts
    assert_eq!(
        universe
            .root_world()
            .unwrap()
            .repository()
            .indexed_snapshot("asset")
            .unwrap()
            .len(),
        2
    );
}
