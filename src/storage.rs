//! Typed per-record-type storages.
//!
//! A repository owns one storage per record type: a singleton cell, an
//! indexed table, or an event queue. Singleton and indexed storages are
//! gated by an [`AccessGate`]; record memory is reached only through tokens
//! that hold a matching access. Structural changes on indexed storages
//! (insert publish, delete compaction, index maintenance) are staged in a
//! per-step journal and applied at the step boundary, when no accesses
//! remain open.

use crate::event::{EventCursor, EventQueue};
use crate::gate::AccessGate;
use crate::index::{HashIndex, SpaceIndex, StorageIndex, ValueIndex};
use crate::layout::RecordLayout;
use crate::record::{ObservedImage, RecordBuf, RecordHandle};
use crate::router::{self, PendingEvents, RouteSet};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::cell::UnsafeCell;
use std::sync::Arc;
use tracing::{debug, trace};

/// Singleton storage: one record cell behind a read/write gate.
pub struct SingletonStorage {
    pub(crate) layout: Arc<RecordLayout>,
    pub(crate) gate: AccessGate,
    cell: UnsafeCell<RecordBuf>,
    pub(crate) routes: RouteSet,
    pending: Mutex<PendingEvents>,
}

// record memory is only reached while the gate grants a matching access
unsafe impl Sync for SingletonStorage {}

impl SingletonStorage {
    pub(crate) fn new(layout: Arc<RecordLayout>, routes: RouteSet) -> SingletonStorage {
        let cell = UnsafeCell::new(RecordBuf::new(layout.clone()));
        SingletonStorage {
            layout,
            gate: AccessGate::new(),
            cell,
            routes,
            pending: Mutex::new(PendingEvents::default()),
        }
    }

    /// Callers must hold a read or write access on the gate.
    pub(crate) unsafe fn record(&self) -> &RecordBuf {
        &*self.cell.get()
    }

    /// Callers must hold the write access on the gate.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn record_mut(&self) -> &mut RecordBuf {
        &mut *self.cell.get()
    }

    pub(crate) fn stage_change(&self, pre: &ObservedImage) {
        let record = unsafe { self.record() };
        router::stage_on_change(&self.routes, pre, record, &mut self.pending.lock());
    }

    pub(crate) fn flush_pending(&self) {
        let mut pending = self.pending.lock();
        if !pending.is_empty() {
            pending.submit_all();
        }
    }

    /// Copies the current record out under a short read access.
    pub fn snapshot(&self) -> RecordBuf {
        self.gate.acquire_read();
        let copy = unsafe { self.record() }.clone();
        self.gate.release_read();
        copy
    }

    pub(crate) fn replace_record(&self, record: RecordBuf) {
        self.gate.structural_begin();
        unsafe {
            *self.cell.get() = record;
        }
        self.gate.structural_end();
    }

    pub(crate) fn shutdown_record(&self) {
        self.gate.structural_begin();
        unsafe { self.record_mut() }.run_shutdown();
        self.gate.structural_end();
    }
}

struct IdSlot {
    generation: u32,
    position: Option<u32>,
}

struct IndexedInner {
    dense: Vec<RecordBuf>,
    dense_ids: Vec<u32>,
    ids: Vec<IdSlot>,
    free: Vec<u32>,
    indices: Vec<StorageIndex>,
}

#[derive(Default)]
struct Journal {
    inserts: Vec<(RecordHandle, RecordBuf)>,
    deletes: Vec<u32>,
    dirty: Vec<u32>,
}

impl Journal {
    fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.deletes.is_empty() && self.dirty.is_empty()
    }
}

/// Indexed storage: a dense record table plus lazily created secondary
/// indices and a per-step structural journal.
pub struct IndexedStorage {
    pub(crate) layout: Arc<RecordLayout>,
    pub(crate) gate: AccessGate,
    inner: UnsafeCell<IndexedInner>,
    journal: Mutex<Journal>,
    pub(crate) routes: RouteSet,
    pending: Mutex<PendingEvents>,
}

// the gate serializes writers against readers and structural sections
unsafe impl Sync for IndexedStorage {}

impl IndexedStorage {
    pub(crate) fn new(layout: Arc<RecordLayout>, routes: RouteSet) -> IndexedStorage {
        IndexedStorage {
            layout,
            gate: AccessGate::new(),
            inner: UnsafeCell::new(IndexedInner {
                dense: Vec::new(),
                dense_ids: Vec::new(),
                ids: Vec::new(),
                free: Vec::new(),
                indices: Vec::new(),
            }),
            journal: Mutex::new(Journal::default()),
            routes,
            pending: Mutex::new(PendingEvents::default()),
        }
    }

    /// Callers must hold any access on the gate.
    unsafe fn inner(&self) -> &IndexedInner {
        &*self.inner.get()
    }

    /// Callers must hold a structural section, or the single write access for
    /// the id-table mutations done by insert staging.
    #[allow(clippy::mut_from_ref)]
    unsafe fn inner_mut(&self) -> &mut IndexedInner {
        &mut *self.inner.get()
    }

    /// Reserves an id for a staged insert. Requires the write access.
    pub(crate) fn allocate_handle(&self) -> RecordHandle {
        let inner = unsafe { self.inner_mut() };
        match inner.free.pop() {
            Some(id) => RecordHandle::new(id, inner.ids[id as usize].generation),
            None => {
                let id = inner.ids.len() as u32;
                inner.ids.push(IdSlot {
                    generation: 1,
                    position: None,
                });
                RecordHandle::new(id, 1)
            }
        }
    }

    pub(crate) fn stage_insert(&self, handle: RecordHandle, record: RecordBuf) {
        self.journal.lock().inserts.push((handle, record));
    }

    pub(crate) fn stage_delete(&self, id: u32) {
        self.journal.lock().deletes.push(id);
    }

    pub(crate) fn mark_dirty(&self, id: u32) {
        self.journal.lock().dirty.push(id);
    }

    pub(crate) fn stage_change(&self, pre: &ObservedImage, id: u32) {
        if !self.routes.observes_changes() {
            return;
        }
        if let Some(pointer) = self.record_ptr(id) {
            let record = unsafe { &*pointer };
            router::stage_on_change(&self.routes, pre, record, &mut self.pending.lock());
        }
    }

    /// Resolves a live id to its record. Requires an access on the gate;
    /// callers only form a mutable reference while holding the write access.
    pub(crate) fn record_ptr(&self, id: u32) -> Option<*mut RecordBuf> {
        let inner = unsafe { self.inner() };
        let position = inner.ids.get(id as usize)?.position?;
        let record: *const RecordBuf = &inner.dense[position as usize];
        Some(record as *mut RecordBuf)
    }

    /// Current handle of a live id. Requires an access on the gate.
    pub(crate) fn handle_of(&self, id: u32) -> RecordHandle {
        let inner = unsafe { self.inner() };
        RecordHandle::new(id, inner.ids[id as usize].generation)
    }

    pub(crate) fn lookup(&self, handle: RecordHandle) -> Option<u32> {
        let inner = unsafe { self.inner() };
        let slot = inner.ids.get(handle.index() as usize)?;
        if slot.generation == handle.generation() && slot.position.is_some() {
            Some(handle.index())
        } else {
            None
        }
    }

    pub(crate) fn sequence_ids(&self) -> Vec<u32> {
        unsafe { self.inner() }.dense_ids.clone()
    }

    pub(crate) fn index(&self, position: usize) -> &StorageIndex {
        &unsafe { self.inner() }.indices[position]
    }

    /// Best existing index for an equality query on `slot`:
    /// hash beats ordered value.
    pub(crate) fn find_eq_index(&self, slot: u16) -> Option<usize> {
        let inner = unsafe { self.inner() };
        let mut value_index = None;
        for (position, index) in inner.indices.iter().enumerate() {
            match index {
                StorageIndex::Hash(hash) if hash.slot == slot => return Some(position),
                StorageIndex::Value(value) if value.slot == slot => {
                    value_index = Some(position);
                }
                _ => {}
            }
        }
        value_index
    }

    pub(crate) fn find_value_index(&self, slot: u16) -> Option<usize> {
        let inner = unsafe { self.inner() };
        inner.indices.iter().position(|index| match index {
            StorageIndex::Value(value) => value.slot == slot,
            _ => false,
        })
    }

    pub(crate) fn find_space_index(&self, dims: &[(u16, u16)]) -> Option<usize> {
        let inner = unsafe { self.inner() };
        inner.indices.iter().position(|index| match index {
            StorageIndex::Space(space) => space.dims.as_slice() == dims,
            _ => false,
        })
    }

    pub(crate) fn ensure_hash_index(&self, slot: u16) -> usize {
        self.ensure_index(
            |storage| {
                let inner = unsafe { storage.inner() };
                inner.indices.iter().position(|index| match index {
                    StorageIndex::Hash(hash) => hash.slot == slot,
                    _ => false,
                })
            },
            || StorageIndex::Hash(HashIndex::new(slot)),
        )
    }

    pub(crate) fn ensure_value_index(&self, slot: u16) -> usize {
        self.ensure_index(
            |storage| storage.find_value_index(slot),
            || StorageIndex::Value(ValueIndex::new(slot)),
        )
    }

    pub(crate) fn ensure_space_index(&self, dims: SmallVec<[(u16, u16); 3]>) -> usize {
        self.ensure_index(
            |storage| storage.find_space_index(&dims),
            || StorageIndex::Space(SpaceIndex::new(dims.clone())),
        )
    }

    fn ensure_index<F, B>(&self, find: F, build: B) -> usize
    where
        F: Fn(&IndexedStorage) -> Option<usize>,
        B: Fn() -> StorageIndex,
    {
        self.gate.structural_begin();
        let position = match find(self) {
            Some(existing) => existing,
            None => {
                let mut index = build();
                let inner = unsafe { self.inner_mut() };
                for (position, record) in inner.dense.iter().enumerate() {
                    index.update(inner.dense_ids[position], record);
                }
                debug!(
                    record_type = %self.layout.type_name,
                    kind = index.kind_name(),
                    build_cost = index.build_cost(),
                    records = inner.dense.len(),
                    "created index"
                );
                inner.indices.push(index);
                inner.indices.len() - 1
            }
        };
        self.gate.structural_end();
        position
    }

    /// Applies the step journal: re-keys dirty records, compacts deletes
    /// (emitting on-remove first), publishes staged inserts (emitting on-add
    /// after), then submits staged on-change events. Runs only when no
    /// accesses remain open on the storage.
    pub(crate) fn flush_step(&self) {
        let journal = {
            let mut journal = self.journal.lock();
            std::mem::take(&mut *journal)
        };
        {
            let mut pending = self.pending.lock();
            if !pending.is_empty() {
                pending.submit_all();
            }
        }
        if journal.is_empty() {
            return;
        }

        self.gate.structural_begin();
        let inner = unsafe { self.inner_mut() };

        let mut dirty = journal.dirty;
        dirty.sort();
        dirty.dedup();
        for id in dirty {
            if let Some(position) = inner.ids[id as usize].position {
                let record = &inner.dense[position as usize];
                for index in inner.indices.iter_mut() {
                    index.update(id, record);
                }
            }
        }

        let mut deletes = journal.deletes;
        deletes.sort();
        deletes.dedup();
        for id in deletes {
            let position = match inner.ids[id as usize].position {
                Some(position) => position as usize,
                None => continue,
            };
            router::emit_on_remove(&self.routes, &inner.dense[position]);
            for index in inner.indices.iter_mut() {
                index.remove(id);
            }
            let mut removed = inner.dense.swap_remove(position);
            removed.run_shutdown();
            inner.dense_ids.swap_remove(position);
            if position < inner.dense.len() {
                let moved = inner.dense_ids[position];
                inner.ids[moved as usize].position = Some(position as u32);
            }
            let slot = &mut inner.ids[id as usize];
            slot.position = None;
            slot.generation = slot.generation.wrapping_add(1);
            inner.free.push(id);
        }

        for (handle, record) in journal.inserts {
            let position = inner.dense.len() as u32;
            inner.dense.push(record);
            inner.dense_ids.push(handle.index());
            inner.ids[handle.index() as usize].position = Some(position);
            let published = &inner.dense[position as usize];
            for index in inner.indices.iter_mut() {
                index.update(handle.index(), published);
            }
            router::emit_on_add(&self.routes, published);
        }

        trace!(record_type = %self.layout.type_name, records = inner.dense.len(), "applied step journal");
        self.gate.structural_end();
    }

    /// Live record count.
    pub fn len(&self) -> usize {
        self.gate.acquire_read();
        let count = unsafe { self.inner() }.dense.len();
        self.gate.release_read();
        count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies all live records out under a short read access.
    pub fn snapshot_all(&self) -> Vec<RecordBuf> {
        self.gate.acquire_read();
        let copies = unsafe { self.inner() }.dense.clone();
        self.gate.release_read();
        copies
    }

    /// (handle, record) pairs of all live records, for migration transfer.
    pub(crate) fn rows_snapshot(&self) -> Vec<(RecordHandle, RecordBuf)> {
        self.gate.acquire_read();
        let inner = unsafe { self.inner() };
        let rows = inner
            .dense
            .iter()
            .zip(inner.dense_ids.iter())
            .map(|(record, &id)| {
                (
                    RecordHandle::new(id, inner.ids[id as usize].generation),
                    record.clone(),
                )
            })
            .collect();
        self.gate.release_read();
        rows
    }

    /// Installs migrated rows wholesale, preserving handle identity.
    pub(crate) fn adopt_rows(&self, rows: Vec<(RecordHandle, RecordBuf)>) {
        self.gate.structural_begin();
        let inner = unsafe { self.inner_mut() };
        let highest = rows
            .iter()
            .map(|(handle, _)| handle.index() + 1)
            .max()
            .unwrap_or(0);
        inner.ids = (0..highest)
            .map(|_| IdSlot {
                generation: 1,
                position: None,
            })
            .collect();
        inner.dense.clear();
        inner.dense_ids.clear();
        for (handle, record) in rows {
            let position = inner.dense.len() as u32;
            inner.dense.push(record);
            inner.dense_ids.push(handle.index());
            let slot = &mut inner.ids[handle.index() as usize];
            slot.generation = handle.generation();
            slot.position = Some(position);
        }
        inner.free = (0..highest)
            .filter(|&id| inner.ids[id as usize].position.is_none())
            .collect();
        self.gate.structural_end();
    }

    /// Hit counters of all indices, for instrumentation-driven tests.
    pub fn index_stats(&self) -> Vec<(&'static str, u64)> {
        self.gate.acquire_read();
        let stats = unsafe { self.inner() }
            .indices
            .iter()
            .map(|index| (index.kind_name(), index.hit_count()))
            .collect();
        self.gate.release_read();
        stats
    }

    pub(crate) fn shutdown_records(&self) {
        self.gate.structural_begin();
        let inner = unsafe { self.inner_mut() };
        for record in inner.dense.iter_mut() {
            record.run_shutdown();
        }
        self.gate.structural_end();
    }
}

/// Event storage: a queue of short-lived records.
pub struct EventStorage {
    pub(crate) layout: Arc<RecordLayout>,
    queue: Arc<EventQueue>,
}

impl EventStorage {
    pub(crate) fn new(layout: Arc<RecordLayout>) -> EventStorage {
        EventStorage {
            layout,
            queue: Arc::new(EventQueue::new()),
        }
    }

    pub(crate) fn submit(&self, event: RecordBuf) -> bool {
        self.queue.submit(event)
    }

    pub(crate) fn open_cursor(&self) -> EventCursor {
        EventCursor::new(self.queue.clone())
    }
}
