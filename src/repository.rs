//! The per-world repository: one typed storage per record type.
//!
//! Storages are created lazily when the first binding (or automatic event
//! route) names the type; the binding kind fixes the storage class, and a
//! later binding of a conflicting class is a deployment error. The
//! repository also owns the step boundary: when a scheduler layer drains,
//! every storage's journal is applied and staged automatic events are
//! submitted, in storage identity order.

use crate::error::{DeployError, LayoutError};
use crate::event::EventCursor;
use crate::intern::IStr;
use crate::layout::{RecordLayout, ResolvedKind};
use crate::query::{BindingDecl, BindingKind, CompiledShape, QueryShape, QuerySlot};
use crate::record::RecordBuf;
use crate::reflection::{FieldPath, Registry};
use crate::router::{CopyOutPlan, OnAddRoute, OnChangeRoute, OnRemoveRoute, RouteSet};
use crate::storage::{EventStorage, IndexedStorage, SingletonStorage};
use fxhash::FxHashMap;
use itertools::Itertools;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::debug;

pub struct Repository {
    registry: Arc<Registry>,
    layouts: Mutex<FxHashMap<IStr, Arc<RecordLayout>>>,
    singletons: Mutex<FxHashMap<IStr, Arc<SingletonStorage>>>,
    indexed: Mutex<FxHashMap<IStr, Arc<IndexedStorage>>>,
    events: Mutex<FxHashMap<IStr, Arc<EventStorage>>>,
    storage_ids: Mutex<FxHashMap<IStr, usize>>,
}

impl Repository {
    pub(crate) fn new(registry: Arc<Registry>) -> Repository {
        Repository {
            registry,
            layouts: Mutex::new(FxHashMap::default()),
            singletons: Mutex::new(FxHashMap::default()),
            indexed: Mutex::new(FxHashMap::default()),
            events: Mutex::new(FxHashMap::default()),
            storage_ids: Mutex::new(FxHashMap::default()),
        }
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Layout of `name`, computed on first use.
    pub(crate) fn layout(&self, name: IStr) -> Result<Arc<RecordLayout>, LayoutError> {
        if let Some(layout) = self.layouts.lock().get(&name) {
            return Ok(layout.clone());
        }
        let info = self
            .registry
            .type_info(name)
            .ok_or(LayoutError::UnknownType(name))?;
        let layout = Arc::new(RecordLayout::build(info, &self.registry)?);
        Ok(self
            .layouts
            .lock()
            .entry(name)
            .or_insert(layout)
            .clone())
    }

    /// Stable per-world identity used for conflict masks and flush ordering.
    pub(crate) fn storage_id(&self, name: IStr) -> usize {
        let mut ids = self.storage_ids.lock();
        let next = ids.len();
        *ids.entry(name).or_insert(next)
    }

    fn class_of(&self, name: IStr) -> Option<&'static str> {
        if self.singletons.lock().contains_key(&name) {
            Some("singleton")
        } else if self.indexed.lock().contains_key(&name) {
            Some("indexed")
        } else if self.events.lock().contains_key(&name) {
            Some("event")
        } else {
            None
        }
    }

    fn class_check(&self, name: IStr, requested: &'static str) -> Result<(), DeployError> {
        match self.class_of(name) {
            Some(existing) if existing != requested => Err(DeployError::StorageClassMismatch {
                record: name,
                existing,
                requested,
            }),
            _ => Ok(()),
        }
    }

    /// Routes triggered by records of `trigger`, compiled against the event
    /// storages they submit into.
    fn routes_for(&self, trigger: IStr) -> Result<RouteSet, DeployError> {
        let trigger_layout = self.layout(trigger)?;
        let mut routes = RouteSet::default();

        for meta in self.registry.on_add_for(trigger) {
            let target = self.event_storage(meta.event_type)?;
            let plan =
                CopyOutPlan::compile(&trigger_layout, &target.layout, &meta.copy_outs)?;
            routes.on_add.push(OnAddRoute { target, plan });
        }

        for meta in self.registry.on_change_for(trigger) {
            let target = self.event_storage(meta.event_type)?;
            let mut observed: SmallVec<[u16; 8]> = SmallVec::new();
            for path in &meta.observed_fields {
                let slot = trigger_layout.resolve_path(path).ok_or_else(|| {
                    LayoutError::UnresolvedObservedField {
                        record: trigger,
                        path: format!("{}", path),
                    }
                })?;
                observed.push(slot);
            }
            let unchanged = CopyOutPlan::compile(
                &trigger_layout,
                &target.layout,
                &meta.unchanged_copy_outs,
            )?;
            for source in unchanged.sources() {
                if !trigger_layout.observed.contains(&source) {
                    return Err(DeployError::Layout(LayoutError::UnobservedCopyOutSource {
                        record: trigger,
                        path: trigger_layout.slot(source).name.as_str().to_string(),
                    }));
                }
            }
            let changed =
                CopyOutPlan::compile(&trigger_layout, &target.layout, &meta.changed_copy_outs)?;
            routes.on_change.push(OnChangeRoute {
                target,
                observed,
                unchanged,
                changed,
            });
        }

        for meta in self.registry.on_remove_for(trigger) {
            let target = self.event_storage(meta.event_type)?;
            let plan =
                CopyOutPlan::compile(&trigger_layout, &target.layout, &meta.copy_outs)?;
            routes.on_remove.push(OnRemoveRoute { target, plan });
        }

        Ok(routes)
    }

    pub(crate) fn singleton(&self, name: IStr) -> Result<Arc<SingletonStorage>, DeployError> {
        if let Some(storage) = self.singletons.lock().get(&name) {
            return Ok(storage.clone());
        }
        self.class_check(name, "singleton")?;
        let layout = self.layout(name)?;
        let routes = self.routes_for(name)?;
        let storage = Arc::new(SingletonStorage::new(layout, routes));
        self.storage_id(name);
        debug!(record_type = %name, "created singleton storage");
        Ok(self
            .singletons
            .lock()
            .entry(name)
            .or_insert(storage)
            .clone())
    }

    pub(crate) fn indexed(&self, name: IStr) -> Result<Arc<IndexedStorage>, DeployError> {
        if let Some(storage) = self.indexed.lock().get(&name) {
            return Ok(storage.clone());
        }
        self.class_check(name, "indexed")?;
        let layout = self.layout(name)?;
        let routes = self.routes_for(name)?;
        let storage = Arc::new(IndexedStorage::new(layout, routes));
        self.storage_id(name);
        debug!(record_type = %name, "created indexed storage");
        Ok(self.indexed.lock().entry(name).or_insert(storage).clone())
    }

    pub(crate) fn event_storage(&self, name: IStr) -> Result<Arc<EventStorage>, DeployError> {
        if let Some(storage) = self.events.lock().get(&name) {
            return Ok(storage.clone());
        }
        self.class_check(name, "event")?;
        let layout = self.layout(name)?;
        let storage = Arc::new(EventStorage::new(layout));
        self.storage_id(name);
        debug!(record_type = %name, "created event storage");
        Ok(self.events.lock().entry(name).or_insert(storage).clone())
    }

    /// Instantiates a declared binding for `owner`.
    pub(crate) fn deploy(&self, owner: IStr, decl: &BindingDecl) -> Result<QuerySlot, DeployError> {
        if self.registry.type_info(decl.target).is_none() {
            return Err(DeployError::UnknownType(decl.target));
        }
        match &decl.kind {
            BindingKind::SingletonRead => {
                Ok(QuerySlot::SingletonRead(self.singleton(decl.target)?))
            }
            BindingKind::SingletonWrite => {
                Ok(QuerySlot::SingletonWrite(self.singleton(decl.target)?))
            }
            BindingKind::Insert => Ok(QuerySlot::Insert(self.indexed(decl.target)?)),
            BindingKind::Read(shape) => {
                let storage = self.indexed(decl.target)?;
                let shape = compile_shape(owner, &storage, shape)?;
                Ok(QuerySlot::IndexedRead { storage, shape })
            }
            BindingKind::Write(shape) => {
                let storage = self.indexed(decl.target)?;
                let shape = compile_shape(owner, &storage, shape)?;
                Ok(QuerySlot::IndexedWrite { storage, shape })
            }
            BindingKind::EventInsert => {
                Ok(QuerySlot::EventInsert(self.event_storage(decl.target)?))
            }
            BindingKind::EventRead => {
                let storage = self.event_storage(decl.target)?;
                let cursor: EventCursor = storage.open_cursor();
                Ok(QuerySlot::EventRead {
                    storage,
                    cursor: Arc::new(Mutex::new(cursor)),
                })
            }
        }
    }

    /// Step boundary: applies every indexed journal and submits staged
    /// automatic events, in storage identity order.
    pub(crate) fn flush_step(&self) {
        let singletons: Vec<Arc<SingletonStorage>> = {
            let map = self.singletons.lock();
            map.iter()
                .sorted_by_key(|(name, _)| *name)
                .map(|(_, storage)| storage.clone())
                .collect()
        };
        for storage in singletons {
            storage.flush_pending();
        }

        let indexed: Vec<Arc<IndexedStorage>> = {
            let map = self.indexed.lock();
            map.iter()
                .sorted_by_key(|(name, _)| *name)
                .map(|(_, storage)| storage.clone())
                .collect()
        };
        for storage in indexed {
            storage.flush_step();
        }
    }

    /// Runs reflected finalizers on every live record. Used at world
    /// teardown.
    pub(crate) fn shutdown_all(&self) {
        for (_, storage) in self.singletons.lock().iter() {
            storage.shutdown_record();
        }
        for (_, storage) in self.indexed.lock().iter() {
            storage.shutdown_records();
        }
    }

    // -- host / test inspection surface --

    /// Copy of the singleton record of `name`, if such a storage exists.
    pub fn singleton_snapshot(&self, name: &str) -> Option<RecordBuf> {
        let name = crate::intern::intern(name);
        let storage = self.singletons.lock().get(&name).cloned();
        storage.map(|s| s.snapshot())
    }

    /// Copies of all live records of `name`, if such a storage exists.
    pub fn indexed_snapshot(&self, name: &str) -> Option<Vec<RecordBuf>> {
        let name = crate::intern::intern(name);
        let storage = self.indexed.lock().get(&name).cloned();
        storage.map(|s| s.snapshot_all())
    }

    /// (index kind, hit count) pairs of an indexed storage's indices.
    pub fn index_stats(&self, name: &str) -> Option<Vec<(&'static str, u64)>> {
        let name = crate::intern::intern(name);
        let storage = self.indexed.lock().get(&name).cloned();
        storage.map(|s| s.index_stats())
    }

    // -- migration transfer surface --

    pub(crate) fn singleton_storages(&self) -> Vec<(IStr, Arc<SingletonStorage>)> {
        self.singletons
            .lock()
            .iter()
            .map(|(name, storage)| (*name, storage.clone()))
            .collect()
    }

    pub(crate) fn indexed_storages(&self) -> Vec<(IStr, Arc<IndexedStorage>)> {
        self.indexed
            .lock()
            .iter()
            .map(|(name, storage)| (*name, storage.clone()))
            .collect()
    }
}

fn resolve_scalar_slot(
    owner: IStr,
    storage: &IndexedStorage,
    path: &FieldPath,
) -> Result<u16, DeployError> {
    let slot = storage.layout.resolve_path(path).ok_or_else(|| {
        DeployError::UnknownBinding {
            owner,
            target: storage.layout.type_name,
            reason: format!("unknown field path `{}`", path),
        }
    })?;
    match storage.layout.slot(slot).kind {
        ResolvedKind::Scalar(_) => Ok(slot),
        ResolvedKind::Array(_) => Err(DeployError::UnknownBinding {
            owner,
            target: storage.layout.type_name,
            reason: format!("field `{}` is an array and cannot be indexed", path),
        }),
    }
}

/// Resolves the declared (field path, operator) pair to the single best
/// existing index, creating one when none matches. Equality prefers hash
/// over ordered value indices.
fn compile_shape(
    owner: IStr,
    storage: &Arc<IndexedStorage>,
    shape: &QueryShape,
) -> Result<CompiledShape, DeployError> {
    match shape {
        QueryShape::Sequence => Ok(CompiledShape::Sequence),
        QueryShape::Eq(path) => {
            let slot = resolve_scalar_slot(owner, storage, path)?;
            let index = match storage.find_eq_index(slot) {
                Some(existing) => existing,
                None => storage.ensure_hash_index(slot),
            };
            Ok(CompiledShape::Eq { slot, index })
        }
        QueryShape::Range(path) => {
            let slot = resolve_scalar_slot(owner, storage, path)?;
            let index = storage.ensure_value_index(slot);
            Ok(CompiledShape::Range { slot, index })
        }
        QueryShape::SpaceBox(dim_paths) => {
            let mut dims: SmallVec<[(u16, u16); 3]> = SmallVec::new();
            for (min_path, max_path) in dim_paths {
                let min = resolve_scalar_slot(owner, storage, min_path)?;
                let max = resolve_scalar_slot(owner, storage, max_path)?;
                dims.push((min, max));
            }
            let dimensions = dims.len();
            let index = match storage.find_space_index(&dims) {
                Some(existing) => existing,
                None => storage.ensure_space_index(dims),
            };
            Ok(CompiledShape::SpaceBox { index, dimensions })
        }
    }
}
