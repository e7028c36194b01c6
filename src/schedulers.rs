//! Standard world schedulers.
//!
//! The trivial scheduler runs one named pipeline and recurses into children.
//! The pair pipeline scheduler keeps a (logical, visual) time pair: the
//! logical pipeline runs on a fixed step consuming accumulated wall time,
//! the visual pipeline runs once per tick. Both reach child worlds only
//! through the scheduler interface.

use crate::intern::{intern, IStr};
use crate::query::BindingDecl;
use crate::record::RecordBuf;
use crate::reflection::{FieldInfo, FieldKind, TypeInfo};
use crate::world::SchedulerInterface;
use downcast_rs::{impl_downcast, Downcast};
use tracing::warn;

/// Per-world policy deciding which pipelines run and when children update.
pub trait WorldScheduler: Downcast + Send {
    /// Query bindings deployed for the scheduler's own state access.
    fn bindings(&self) -> Vec<BindingDecl> {
        Vec::new()
    }

    fn execute(&mut self, interface: &mut SchedulerInterface<'_>);
}

impl_downcast!(WorldScheduler);

pub const TRIVIAL_SCHEDULER: &str = "trivial";
pub const PAIR_PIPELINE_SCHEDULER: &str = "pair_pipeline";

pub const UPDATE_PIPELINE: &str = "update";
pub const LOGICAL_PIPELINE: &str = "logical_update";
pub const VISUAL_PIPELINE: &str = "visual_update";

pub const TIME_SINGLETON: &str = "time";
pub const PAIR_PIPELINE_SETTINGS_SINGLETON: &str = "pair_pipeline_settings";

pub const DEFAULT_LOGICAL_TIME_STEP_NS: u64 = 8_000_000;
pub const DEFAULT_MAX_LOGICAL_ADVANCE_TIME_NS: u64 = 25_000_000;

/// Runs the `update` pipeline, then updates all children.
pub struct TrivialScheduler {
    pipeline: IStr,
}

impl TrivialScheduler {
    pub fn new() -> TrivialScheduler {
        TrivialScheduler {
            pipeline: intern(UPDATE_PIPELINE),
        }
    }
}

impl Default for TrivialScheduler {
    fn default() -> TrivialScheduler {
        TrivialScheduler::new()
    }
}

impl WorldScheduler for TrivialScheduler {
    fn execute(&mut self, interface: &mut SchedulerInterface<'_>) {
        interface.run_pipeline(self.pipeline);
        interface.update_children();
    }
}

/// Fixed-step logical pipeline paired with a per-tick visual pipeline.
///
/// Wall time accumulates across ticks; every full `logical_time_step_ns`
/// runs the logical pipeline once, the remainder carries over. When the
/// backlog would exceed `max_logical_advance_time_ns` (counted in whole
/// steps; the final partial step is excluded), the advance is clamped and
/// the excess discarded, slowing simulation instead of death-spiralling.
pub struct PairPipelineScheduler {
    logical: IStr,
    visual: IStr,
    accumulator_ns: u64,
    logical_time_ns: u64,
    visual_time_ns: u64,
}

impl PairPipelineScheduler {
    pub fn new() -> PairPipelineScheduler {
        PairPipelineScheduler {
            logical: intern(LOGICAL_PIPELINE),
            visual: intern(VISUAL_PIPELINE),
            accumulator_ns: 0,
            logical_time_ns: 0,
            visual_time_ns: 0,
        }
    }

    pub fn logical_time_ns(&self) -> u64 {
        self.logical_time_ns
    }

    pub fn visual_time_ns(&self) -> u64 {
        self.visual_time_ns
    }

    pub fn carried_ns(&self) -> u64 {
        self.accumulator_ns
    }
}

impl Default for PairPipelineScheduler {
    fn default() -> PairPipelineScheduler {
        PairPipelineScheduler::new()
    }
}

impl WorldScheduler for PairPipelineScheduler {
    fn bindings(&self) -> Vec<BindingDecl> {
        vec![
            BindingDecl::singleton_read(PAIR_PIPELINE_SETTINGS_SINGLETON),
            BindingDecl::singleton_write(TIME_SINGLETON),
        ]
    }

    fn execute(&mut self, interface: &mut SchedulerInterface<'_>) {
        let delta_ns = interface.delta_ns();

        let (step_ns, max_advance_ns) = {
            let settings = interface
                .context()
                .singleton_read(PAIR_PIPELINE_SETTINGS_SINGLETON);
            let record = settings.resolve();
            (
                record
                    .u64("logical_time_step_ns")
                    .unwrap_or(DEFAULT_LOGICAL_TIME_STEP_NS),
                record
                    .u64("max_logical_advance_time_ns")
                    .unwrap_or(DEFAULT_MAX_LOGICAL_ADVANCE_TIME_NS),
            )
        };
        let step_ns = step_ns.max(1);

        self.accumulator_ns += delta_ns;
        let max_steps = max_advance_ns / step_ns;
        let mut steps = self.accumulator_ns / step_ns;
        if steps > max_steps {
            warn!(
                backlog_ns = self.accumulator_ns,
                max_advance_ns, "logical pipeline fell behind, clamping advance"
            );
            steps = max_steps;
            self.accumulator_ns = 0;
        } else {
            self.accumulator_ns -= steps * step_ns;
        }

        for _ in 0..steps {
            self.logical_time_ns += step_ns;
            {
                let mut time = interface.context().singleton_write(TIME_SINGLETON);
                let record = time.resolve();
                write_time(record, "logical_time_ns", self.logical_time_ns);
                write_time(record, "logical_delta_ns", step_ns);
                time.close();
            }
            interface.run_pipeline(self.logical);
        }

        self.visual_time_ns += delta_ns;
        {
            let mut time = interface.context().singleton_write(TIME_SINGLETON);
            let record = time.resolve();
            write_time(record, "visual_time_ns", self.visual_time_ns);
            write_time(record, "visual_delta_ns", delta_ns);
            time.close();
        }
        interface.run_pipeline(self.visual);
        interface.update_children();
    }
}

fn write_time(record: &mut RecordBuf, field: &str, value: u64) {
    if record.set_u64(field, value).is_err() {
        warn!(field, "time singleton is missing a standard field");
    }
}

/// Reflection description of the `time` singleton the pair scheduler keeps.
pub fn time_singleton_type() -> TypeInfo {
    TypeInfo::new(TIME_SINGLETON)
        .field(FieldInfo::new("logical_time_ns", FieldKind::U64))
        .field(FieldInfo::new("logical_delta_ns", FieldKind::U64))
        .field(FieldInfo::new("visual_time_ns", FieldKind::U64))
        .field(FieldInfo::new("visual_delta_ns", FieldKind::U64))
}

/// Reflection description of the pair scheduler's settings singleton; the
/// explicit init hook seeds the defaults.
pub fn pair_pipeline_settings_type() -> TypeInfo {
    TypeInfo::new(PAIR_PIPELINE_SETTINGS_SINGLETON)
        .field(FieldInfo::new("logical_time_step_ns", FieldKind::U64))
        .field(FieldInfo::new("max_logical_advance_time_ns", FieldKind::U64))
        .init_with(|record| {
            let _ = record.set_u64("logical_time_step_ns", DEFAULT_LOGICAL_TIME_STEP_NS);
            let _ = record.set_u64(
                "max_logical_advance_time_ns",
                DEFAULT_MAX_LOGICAL_ADVANCE_TIME_NS,
            );
        })
}
