//! Cosmos is a data-oriented simulation runtime organized around a universe
//! of worlds. Each world owns a typed repository of records (singletons,
//! indexed tables and event queues) and runs pipelines of mutators under an
//! explicit, statically declared access model; a per-world scheduler decides
//! which pipelines run and when child worlds update. Record shapes come from
//! a read-only reflection registry, and publishing a new registry version
//! migrates every repository in place.

mod error;
mod event;
mod gate;
mod index;
mod intern;
mod jobs;
mod layout;
mod migrate;
mod mutator;
mod query;
mod record;
mod reflection;
mod repository;
mod router;
mod schedule;
mod schedulers;
mod storage;
mod universe;
mod world;

pub use crate::error::{
    DeployError, Fatal, FieldError, LayoutError, MutatorResult, PatchIncompatible,
};
pub use crate::event::EventCursor;
pub use crate::gate::AccessGate;
pub use crate::intern::{intern, IStr};
pub use crate::jobs::{ImmediateJobs, JobHandle, JobSystem, RayonJobs};
pub use crate::layout::{RecordLayout, ResolvedKind, ScalarKind, SlotCondition, SlotLayout};
pub use crate::migrate::MigrationReport;
pub use crate::mutator::{MutatorBuilder, MutatorDef};
pub use crate::query::{
    BindingDecl, BindingKind, EventInsertAccess, EventReader, IndexedReadQuery,
    IndexedWriteQuery, InsertAccess, MutatorContext, QueryShape, ReadCursor, ReadToken,
    SingletonReadAccess, SingletonWriteAccess, WriteCursor, WriteToken,
};
pub use crate::record::{RecordBuf, RecordHandle, Value};
pub use crate::reflection::{
    CopyOut, FieldInfo, FieldKind, FieldPath, OnAddEvent, OnChangeEvent, OnRemoveEvent,
    RecordHook, Registry, RegistryBuilder, TypeInfo,
};
pub use crate::repository::Repository;
pub use crate::schedulers::{
    pair_pipeline_settings_type, time_singleton_type, PairPipelineScheduler, TrivialScheduler,
    WorldScheduler, DEFAULT_LOGICAL_TIME_STEP_NS, DEFAULT_MAX_LOGICAL_ADVANCE_TIME_NS,
    LOGICAL_PIPELINE, PAIR_PIPELINE_SCHEDULER, PAIR_PIPELINE_SETTINGS_SINGLETON,
    TIME_SINGLETON, TRIVIAL_SCHEDULER, UPDATE_PIPELINE, VISUAL_PIPELINE,
};
pub use crate::storage::{EventStorage, IndexedStorage, SingletonStorage};
pub use crate::universe::Universe;
pub use crate::world::{MutatorConfig, PipelineConfig, SchedulerInterface, World, WorldConfig};
