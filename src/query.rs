//! Query bindings, their deployed instances, and access tokens.
//!
//! A binding declares (record type, access mode, optional index selector) on
//! a mutator or scheduler; the repository instantiates it into a
//! [`QuerySlot`] at deployment. Executing a deployed query yields a token or
//! cursor; tokens are scoped capabilities released on drop, and writes taken
//! through a write token are durably applied (and their derived events
//! staged) before the release returns.

use crate::event::EventCursor;
use crate::index::{IndexKey, StorageIndex};
use crate::intern::{intern, IStr};
use crate::record::{ObservedImage, RecordBuf, RecordHandle, Value};
use crate::reflection::FieldPath;
use crate::storage::{EventStorage, IndexedStorage, SingletonStorage};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::warn;

/// Operator shape of an indexed query binding.
#[derive(Clone, Debug)]
pub enum QueryShape {
    /// Iterate every record, no index.
    Sequence,
    /// Equality on one field.
    Eq(FieldPath),
    /// Inclusive ordered range on one field.
    Range(FieldPath),
    /// Bounding-box overlap on (min, max) field pairs per dimension.
    SpaceBox(Vec<(FieldPath, FieldPath)>),
}

#[derive(Clone, Debug)]
pub enum BindingKind {
    SingletonRead,
    SingletonWrite,
    Insert,
    Read(QueryShape),
    Write(QueryShape),
    EventInsert,
    EventRead,
}

impl BindingKind {
    pub(crate) fn is_writable(&self) -> bool {
        matches!(
            self,
            BindingKind::SingletonWrite | BindingKind::Insert | BindingKind::Write(_)
        )
    }

    pub(crate) fn is_readable(&self) -> bool {
        matches!(self, BindingKind::SingletonRead | BindingKind::Read(_))
    }
}

/// A declared query intent: record type plus access kind.
#[derive(Clone, Debug)]
pub struct BindingDecl {
    pub target: IStr,
    pub kind: BindingKind,
}

impl BindingDecl {
    pub fn singleton_read(target: &str) -> BindingDecl {
        BindingDecl {
            target: intern(target),
            kind: BindingKind::SingletonRead,
        }
    }

    pub fn singleton_write(target: &str) -> BindingDecl {
        BindingDecl {
            target: intern(target),
            kind: BindingKind::SingletonWrite,
        }
    }

    pub fn insert(target: &str) -> BindingDecl {
        BindingDecl {
            target: intern(target),
            kind: BindingKind::Insert,
        }
    }

    pub fn read(target: &str, shape: QueryShape) -> BindingDecl {
        BindingDecl {
            target: intern(target),
            kind: BindingKind::Read(shape),
        }
    }

    pub fn write(target: &str, shape: QueryShape) -> BindingDecl {
        BindingDecl {
            target: intern(target),
            kind: BindingKind::Write(shape),
        }
    }

    pub fn event_insert(target: &str) -> BindingDecl {
        BindingDecl {
            target: intern(target),
            kind: BindingKind::EventInsert,
        }
    }

    pub fn event_read(target: &str) -> BindingDecl {
        BindingDecl {
            target: intern(target),
            kind: BindingKind::EventRead,
        }
    }
}

/// Resolved index selector of a deployed indexed binding.
#[derive(Clone, Debug)]
pub(crate) enum CompiledShape {
    Sequence,
    Eq { slot: u16, index: usize },
    Range { slot: u16, index: usize },
    SpaceBox { index: usize, dimensions: usize },
}

/// A binding instantiated against a world's repository.
pub(crate) enum QuerySlot {
    SingletonRead(Arc<SingletonStorage>),
    SingletonWrite(Arc<SingletonStorage>),
    Insert(Arc<IndexedStorage>),
    IndexedRead {
        storage: Arc<IndexedStorage>,
        shape: CompiledShape,
    },
    IndexedWrite {
        storage: Arc<IndexedStorage>,
        shape: CompiledShape,
    },
    EventInsert(Arc<EventStorage>),
    EventRead {
        storage: Arc<EventStorage>,
        cursor: Arc<Mutex<EventCursor>>,
    },
}

impl QuerySlot {
    fn target(&self) -> IStr {
        match self {
            QuerySlot::SingletonRead(storage) | QuerySlot::SingletonWrite(storage) => {
                storage.layout.type_name
            }
            QuerySlot::Insert(storage)
            | QuerySlot::IndexedRead { storage, .. }
            | QuerySlot::IndexedWrite { storage, .. } => storage.layout.type_name,
            QuerySlot::EventInsert(storage) | QuerySlot::EventRead { storage, .. } => {
                storage.layout.type_name
            }
        }
    }
}

/// Execution context handed to mutator and scheduler bodies. Accessors
/// resolve the body's declared bindings; requesting an undeclared binding is
/// an assertion violation.
pub struct MutatorContext<'a> {
    slots: &'a [QuerySlot],
}

impl<'a> MutatorContext<'a> {
    pub(crate) fn new(slots: &'a [QuerySlot]) -> MutatorContext<'a> {
        MutatorContext { slots }
    }

    fn slot<F>(&self, target: &str, kind: &str, matches: F) -> &'a QuerySlot
    where
        F: Fn(&QuerySlot) -> bool,
    {
        let name = intern(target);
        match self
            .slots
            .iter()
            .find(|slot| slot.target() == name && matches(slot))
        {
            Some(slot) => slot,
            None => panic!("no {} binding on `{}` was declared", kind, target),
        }
    }

    pub fn singleton_read(&self, target: &str) -> SingletonReadAccess {
        match self.slot(target, "singleton read", |s| {
            matches!(s, QuerySlot::SingletonRead(_))
        }) {
            QuerySlot::SingletonRead(storage) => SingletonReadAccess::open(storage.clone()),
            _ => unreachable!(),
        }
    }

    pub fn singleton_write(&self, target: &str) -> SingletonWriteAccess {
        match self.slot(target, "singleton write", |s| {
            matches!(s, QuerySlot::SingletonWrite(_))
        }) {
            QuerySlot::SingletonWrite(storage) => SingletonWriteAccess::open(storage.clone()),
            _ => unreachable!(),
        }
    }

    pub fn insert(&self, target: &str) -> InsertAccess {
        match self.slot(target, "insert", |s| matches!(s, QuerySlot::Insert(_))) {
            QuerySlot::Insert(storage) => InsertAccess::open(storage.clone()),
            _ => unreachable!(),
        }
    }

    /// All read bindings on `target` fold into one query; each operation
    /// picks the binding whose declared shape matches its parameter flavor.
    pub fn read(&self, target: &str) -> IndexedReadQuery {
        let name = intern(target);
        let mut storage = None;
        let mut shapes: SmallVec<[CompiledShape; 2]> = SmallVec::new();
        for slot in self.slots {
            if let QuerySlot::IndexedRead {
                storage: candidate,
                shape,
            } = slot
            {
                if candidate.layout.type_name == name {
                    if storage.is_none() {
                        storage = Some(candidate.clone());
                    }
                    shapes.push(shape.clone());
                }
            }
        }
        match storage {
            Some(storage) => IndexedReadQuery { storage, shapes },
            None => panic!("no indexed read binding on `{}` was declared", target),
        }
    }

    /// All write bindings on `target` fold into one query; each operation
    /// picks the binding whose declared shape matches its parameter flavor.
    pub fn write(&self, target: &str) -> IndexedWriteQuery {
        let name = intern(target);
        let mut storage = None;
        let mut shapes: SmallVec<[CompiledShape; 2]> = SmallVec::new();
        for slot in self.slots {
            if let QuerySlot::IndexedWrite {
                storage: candidate,
                shape,
            } = slot
            {
                if candidate.layout.type_name == name {
                    if storage.is_none() {
                        storage = Some(candidate.clone());
                    }
                    shapes.push(shape.clone());
                }
            }
        }
        match storage {
            Some(storage) => IndexedWriteQuery { storage, shapes },
            None => panic!("no indexed write binding on `{}` was declared", target),
        }
    }

    pub fn event_insert(&self, target: &str) -> EventInsertAccess {
        match self.slot(target, "event insert", |s| {
            matches!(s, QuerySlot::EventInsert(_))
        }) {
            QuerySlot::EventInsert(storage) => EventInsertAccess::open(storage.clone()),
            _ => unreachable!(),
        }
    }

    pub fn events(&self, target: &str) -> EventReader {
        match self.slot(target, "event read", |s| {
            matches!(s, QuerySlot::EventRead { .. })
        }) {
            QuerySlot::EventRead { cursor, .. } => EventReader {
                cursor: cursor.clone(),
            },
            _ => unreachable!(),
        }
    }
}

// ---------------------------------------------------------------------------
// singleton tokens

pub struct SingletonReadAccess {
    storage: Arc<SingletonStorage>,
    open: bool,
}

impl SingletonReadAccess {
    fn open(storage: Arc<SingletonStorage>) -> SingletonReadAccess {
        storage.gate.acquire_read();
        SingletonReadAccess {
            storage,
            open: true,
        }
    }

    pub fn resolve(&self) -> &RecordBuf {
        unsafe { self.storage.record() }
    }

    pub fn close(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.open {
            self.open = false;
            self.storage.gate.release_read();
        }
    }
}

impl Drop for SingletonReadAccess {
    fn drop(&mut self) {
        self.finish();
    }
}

pub struct SingletonWriteAccess {
    storage: Arc<SingletonStorage>,
    pre: Option<ObservedImage>,
    open: bool,
}

impl SingletonWriteAccess {
    fn open(storage: Arc<SingletonStorage>) -> SingletonWriteAccess {
        storage.gate.acquire_write();
        SingletonWriteAccess {
            storage,
            pre: None,
            open: true,
        }
    }

    /// Resolves the record. The pre-image used for on-change diffing is
    /// captured on first resolve.
    pub fn resolve(&mut self) -> &mut RecordBuf {
        let record = unsafe { self.storage.record_mut() };
        if self.pre.is_none() {
            self.pre = Some(record.snapshot_observed());
        }
        record
    }

    pub fn close(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Some(pre) = self.pre.take() {
            if pre.differs(unsafe { self.storage.record() }) {
                self.storage.stage_change(&pre);
            }
        }
        self.storage.gate.release_write();
    }
}

impl Drop for SingletonWriteAccess {
    fn drop(&mut self) {
        self.finish();
    }
}

// ---------------------------------------------------------------------------
// indexed insert

pub struct InsertAccess {
    storage: Arc<IndexedStorage>,
    handle: RecordHandle,
    record: Option<RecordBuf>,
}

impl InsertAccess {
    fn open(storage: Arc<IndexedStorage>) -> InsertAccess {
        storage.gate.acquire_write();
        let handle = storage.allocate_handle();
        let record = RecordBuf::new(storage.layout.clone());
        InsertAccess {
            storage,
            handle,
            record: Some(record),
        }
    }

    /// Handle the record will be reachable under once published.
    pub fn handle(&self) -> RecordHandle {
        self.handle
    }

    pub fn resolve(&mut self) -> &mut RecordBuf {
        self.record
            .as_mut()
            .expect("insert token resolved after close")
    }

    /// Stages the record; it becomes visible to new queries only after the
    /// step boundary publishes it.
    pub fn close(self) {}
}

impl Drop for InsertAccess {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            self.storage.stage_insert(self.handle, record);
            self.storage.gate.release_write();
        }
    }
}

// ---------------------------------------------------------------------------
// indexed read

pub struct IndexedReadQuery {
    storage: Arc<IndexedStorage>,
    shapes: SmallVec<[CompiledShape; 2]>,
}

impl IndexedReadQuery {
    pub fn eq(&self, key: Value) -> ReadCursor {
        self.storage.gate.acquire_read();
        let ids = resolve_eq(&self.storage, &self.shapes, key);
        ReadCursor::new(self.storage.clone(), ids)
    }

    pub fn range(&self, low: Value, high: Value) -> ReadCursor {
        self.storage.gate.acquire_read();
        let ids = resolve_range(&self.storage, &self.shapes, low, high);
        ReadCursor::new(self.storage.clone(), ids)
    }

    pub fn space(&self, min: &[f64], max: &[f64]) -> ReadCursor {
        self.storage.gate.acquire_read();
        let ids = resolve_space(&self.storage, &self.shapes, min, max);
        ReadCursor::new(self.storage.clone(), ids)
    }

    pub fn sequence(&self) -> ReadCursor {
        self.storage.gate.acquire_read();
        let ids = resolve_sequence(&self.storage, &self.shapes);
        ReadCursor::new(self.storage.clone(), ids)
    }

    /// Direct handle lookup through the id table; usable with any shape.
    pub fn by_handle(&self, handle: RecordHandle) -> ReadCursor {
        self.storage.gate.acquire_read();
        let ids = self.storage.lookup(handle).into_iter().collect();
        ReadCursor::new(self.storage.clone(), ids)
    }
}

/// Iterates tokens over the records matched at execute time. Records staged
/// by same-step inserts are not visible; the id list is stable for the
/// cursor's lifetime.
pub struct ReadCursor {
    storage: Arc<IndexedStorage>,
    ids: Vec<u32>,
    at: usize,
}

impl ReadCursor {
    fn new(storage: Arc<IndexedStorage>, ids: Vec<u32>) -> ReadCursor {
        ReadCursor {
            storage,
            ids,
            at: 0,
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<ReadToken<'_>> {
        while self.at < self.ids.len() {
            let id = self.ids[self.at];
            self.at += 1;
            if let Some(pointer) = self.storage.record_ptr(id) {
                let handle = self.storage.handle_of(id);
                return Some(ReadToken {
                    record: unsafe { &*pointer },
                    handle,
                });
            }
        }
        None
    }
}

impl Drop for ReadCursor {
    fn drop(&mut self) {
        self.storage.gate.release_read();
    }
}

pub struct ReadToken<'a> {
    record: &'a RecordBuf,
    handle: RecordHandle,
}

impl ReadToken<'_> {
    pub fn handle(&self) -> RecordHandle {
        self.handle
    }
}

impl Deref for ReadToken<'_> {
    type Target = RecordBuf;

    fn deref(&self) -> &RecordBuf {
        self.record
    }
}

// ---------------------------------------------------------------------------
// indexed write

pub struct IndexedWriteQuery {
    storage: Arc<IndexedStorage>,
    shapes: SmallVec<[CompiledShape; 2]>,
}

impl IndexedWriteQuery {
    pub fn eq(&self, key: Value) -> WriteCursor {
        self.storage.gate.acquire_write();
        let ids = resolve_eq(&self.storage, &self.shapes, key);
        WriteCursor::new(self.storage.clone(), ids)
    }

    pub fn range(&self, low: Value, high: Value) -> WriteCursor {
        self.storage.gate.acquire_write();
        let ids = resolve_range(&self.storage, &self.shapes, low, high);
        WriteCursor::new(self.storage.clone(), ids)
    }

    pub fn space(&self, min: &[f64], max: &[f64]) -> WriteCursor {
        self.storage.gate.acquire_write();
        let ids = resolve_space(&self.storage, &self.shapes, min, max);
        WriteCursor::new(self.storage.clone(), ids)
    }

    pub fn sequence(&self) -> WriteCursor {
        self.storage.gate.acquire_write();
        let ids = resolve_sequence(&self.storage, &self.shapes);
        WriteCursor::new(self.storage.clone(), ids)
    }

    pub fn by_handle(&self, handle: RecordHandle) -> WriteCursor {
        self.storage.gate.acquire_write();
        let ids = self.storage.lookup(handle).into_iter().collect();
        WriteCursor::new(self.storage.clone(), ids)
    }
}

pub struct WriteCursor {
    storage: Arc<IndexedStorage>,
    ids: Vec<u32>,
    at: usize,
}

impl WriteCursor {
    fn new(storage: Arc<IndexedStorage>, ids: Vec<u32>) -> WriteCursor {
        WriteCursor {
            storage,
            ids,
            at: 0,
        }
    }

    /// Produces the next write token. At most one token is live at a time;
    /// the previous token's writes are applied when it drops.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<WriteToken<'_>> {
        while self.at < self.ids.len() {
            let id = self.ids[self.at];
            self.at += 1;
            if let Some(pointer) = self.storage.record_ptr(id) {
                let record = unsafe { &mut *pointer };
                let pre = record.snapshot_observed();
                let handle = self.storage.handle_of(id);
                return Some(WriteToken {
                    storage: &self.storage,
                    record,
                    pre: Some(pre),
                    handle,
                    delete: false,
                });
            }
        }
        None
    }
}

impl Drop for WriteCursor {
    fn drop(&mut self) {
        self.storage.gate.release_write();
    }
}

pub struct WriteToken<'a> {
    storage: &'a Arc<IndexedStorage>,
    record: &'a mut RecordBuf,
    pre: Option<ObservedImage>,
    handle: RecordHandle,
    delete: bool,
}

impl WriteToken<'_> {
    pub fn handle(&self) -> RecordHandle {
        self.handle
    }

    /// Marks the record for removal. Physical removal happens at the step
    /// boundary, after on-remove routing saw the final state.
    pub fn delete(mut self) {
        self.delete = true;
    }
}

impl Deref for WriteToken<'_> {
    type Target = RecordBuf;

    fn deref(&self) -> &RecordBuf {
        self.record
    }
}

impl DerefMut for WriteToken<'_> {
    fn deref_mut(&mut self) -> &mut RecordBuf {
        self.record
    }
}

impl Drop for WriteToken<'_> {
    fn drop(&mut self) {
        if self.delete {
            self.storage.stage_delete(self.handle.index());
            return;
        }
        if let Some(pre) = self.pre.take() {
            if pre.differs(self.record) {
                self.storage.stage_change(&pre, self.handle.index());
            }
        }
        self.storage.mark_dirty(self.handle.index());
    }
}

// ---------------------------------------------------------------------------
// event tokens

pub struct EventInsertAccess {
    storage: Arc<EventStorage>,
    record: Option<RecordBuf>,
}

impl EventInsertAccess {
    fn open(storage: Arc<EventStorage>) -> EventInsertAccess {
        let record = RecordBuf::new(storage.layout.clone());
        EventInsertAccess {
            storage,
            record: Some(record),
        }
    }

    pub fn resolve(&mut self) -> &mut RecordBuf {
        self.record
            .as_mut()
            .expect("event insert token resolved after close")
    }

    pub fn close(self) {}
}

impl Drop for EventInsertAccess {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            self.storage.submit(record);
        }
    }
}

/// Consumer view over a deployed event-read binding. The underlying cursor
/// was created at deployment time, so it sees exactly the events submitted
/// since then, in submit order.
pub struct EventReader {
    cursor: Arc<Mutex<EventCursor>>,
}

impl EventReader {
    pub fn read(&self) -> Option<RecordBuf> {
        self.cursor.lock().read()
    }
}

// ---------------------------------------------------------------------------
// id resolution

fn bad_params(storage: &IndexedStorage, reason: &str) -> Vec<u32> {
    warn!(
        record_type = %storage.layout.type_name,
        reason = reason,
        "query executed with malformed parameters, returning empty cursor"
    );
    Vec::new()
}

fn resolve_eq(storage: &IndexedStorage, shapes: &[CompiledShape], key: Value) -> Vec<u32> {
    let (slot, index) = match shapes.iter().find_map(|shape| match shape {
        CompiledShape::Eq { slot, index } => Some((*slot, *index)),
        _ => None,
    }) {
        Some(found) => found,
        None => return bad_params(storage, "equality parameters without an equality binding"),
    };
    if !key.matches(&storage.layout.slot(slot).kind) {
        return bad_params(storage, "equality key kind does not match the indexed field");
    }
    let key = match IndexKey::new(&key) {
        Some(key) => key,
        None => return bad_params(storage, "equality key is not indexable"),
    };
    match storage.index(index) {
        StorageIndex::Hash(hash) => hash.get_eq(&key),
        StorageIndex::Value(value) => value.get_eq(&key),
        StorageIndex::Space(_) => bad_params(storage, "equality resolved to a space index"),
    }
}

fn resolve_range(
    storage: &IndexedStorage,
    shapes: &[CompiledShape],
    low: Value,
    high: Value,
) -> Vec<u32> {
    let (slot, index) = match shapes.iter().find_map(|shape| match shape {
        CompiledShape::Range { slot, index } => Some((*slot, *index)),
        _ => None,
    }) {
        Some(found) => found,
        None => return bad_params(storage, "range parameters without a range binding"),
    };
    let kind = &storage.layout.slot(slot).kind;
    if !low.matches(kind) || !high.matches(kind) {
        return bad_params(storage, "range bound kind does not match the indexed field");
    }
    let low = match IndexKey::new(&low) {
        Some(key) => key,
        None => return bad_params(storage, "range bound is not indexable"),
    };
    let high = match IndexKey::new(&high) {
        Some(key) => key,
        None => return bad_params(storage, "range bound is not indexable"),
    };
    if low > high {
        return bad_params(storage, "range lower bound exceeds upper bound");
    }
    match storage.index(index) {
        StorageIndex::Value(value) => value.get_range(&low, &high),
        _ => bad_params(storage, "range resolved to a non-ordered index"),
    }
}

fn resolve_space(
    storage: &IndexedStorage,
    shapes: &[CompiledShape],
    min: &[f64],
    max: &[f64],
) -> Vec<u32> {
    let (index, dimensions) = match shapes.iter().find_map(|shape| match shape {
        CompiledShape::SpaceBox { index, dimensions } => Some((*index, *dimensions)),
        _ => None,
    }) {
        Some(found) => found,
        None => return bad_params(storage, "box parameters without a space binding"),
    };
    if min.len() != dimensions || max.len() != dimensions {
        return bad_params(storage, "box dimensionality does not match the binding");
    }
    match storage.index(index) {
        StorageIndex::Space(space) => space.query_box(min, max),
        _ => bad_params(storage, "box resolved to a non-space index"),
    }
}

fn resolve_sequence(storage: &IndexedStorage, shapes: &[CompiledShape]) -> Vec<u32> {
    if shapes
        .iter()
        .any(|shape| matches!(shape, CompiledShape::Sequence))
    {
        storage.sequence_ids()
    } else {
        bad_params(storage, "sequence iteration without a sequence binding")
    }
}
