//! Secondary indices attached to indexed storages.
//!
//! Three kinds are supported: ordered value indices (equality and range),
//! hash indices (equality only) and space indices (bounding-box overlap over
//! per-dimension min/max fields). Indices are created lazily when a matching
//! query binding is deployed and are maintained only at step boundaries, so
//! they are consistent whenever all write accesses on the storage are closed.

use crate::record::{RecordBuf, Value};
use fxhash::FxHashMap;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// A scalar value wrapped for total ordering and hashing.
#[derive(Clone, Debug)]
pub(crate) struct IndexKey(Value);

impl IndexKey {
    /// Arrays are not indexable.
    pub(crate) fn new(value: &Value) -> Option<IndexKey> {
        match value {
            Value::Array(_) => None,
            other => Some(IndexKey(other.clone())),
        }
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        }
    }
}

impl Eq for IndexKey {}

impl Hash for IndexKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.0 {
            Value::U64(v) => (0u8, v).hash(state),
            Value::I64(v) => (1u8, v).hash(state),
            Value::F64(v) => (2u8, v.to_bits()).hash(state),
            Value::Bool(v) => (3u8, v).hash(state),
            Value::Str(v) => (4u8, v).hash(state),
            Value::Handle(v) => (5u8, v.index(), v.generation()).hash(state),
            Value::Array(_) => unreachable!("arrays are rejected by IndexKey::new"),
        }
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering as O;
        fn rank(value: &Value) -> u8 {
            match value {
                Value::U64(_) => 0,
                Value::I64(_) => 1,
                Value::F64(_) => 2,
                Value::Bool(_) => 3,
                Value::Str(_) => 4,
                Value::Handle(_) => 5,
                Value::Array(_) => 6,
            }
        }
        match (&self.0, &other.0) {
            (Value::U64(a), Value::U64(b)) => a.cmp(b),
            (Value::I64(a), Value::I64(b)) => a.cmp(b),
            (Value::F64(a), Value::F64(b)) => a.total_cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Handle(a), Value::Handle(b)) => (a.index(), a.generation())
                .cmp(&(b.index(), b.generation())),
            (a, b) => match rank(a).cmp(&rank(b)) {
                O::Equal => O::Equal,
                unequal => unequal,
            },
        }
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub(crate) type Postings = SmallVec<[u32; 4]>;

/// Ordered index over one scalar field; serves equality and range queries.
pub(crate) struct ValueIndex {
    pub slot: u16,
    map: BTreeMap<IndexKey, Postings>,
    keys: FxHashMap<u32, IndexKey>,
    pub hits: AtomicU64,
}

impl ValueIndex {
    pub fn new(slot: u16) -> ValueIndex {
        ValueIndex {
            slot,
            map: BTreeMap::new(),
            keys: FxHashMap::default(),
            hits: AtomicU64::new(0),
        }
    }

    fn insert(&mut self, id: u32, key: IndexKey) {
        self.map.entry(key.clone()).or_insert_with(Postings::new).push(id);
        self.keys.insert(id, key);
    }

    fn remove(&mut self, id: u32) {
        if let Some(key) = self.keys.remove(&id) {
            if let Some(postings) = self.map.get_mut(&key) {
                postings.retain(|candidate| *candidate != id);
                if postings.is_empty() {
                    self.map.remove(&key);
                }
            }
        }
    }

    pub fn get_eq(&self, key: &IndexKey) -> Vec<u32> {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.map.get(key).map(|p| p.to_vec()).unwrap_or_default()
    }

    pub fn get_range(&self, low: &IndexKey, high: &IndexKey) -> Vec<u32> {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.map
            .range(low.clone()..=high.clone())
            .flat_map(|(_, postings)| postings.iter().cloned())
            .collect()
    }
}

/// Hash index over one scalar field; equality only.
pub(crate) struct HashIndex {
    pub slot: u16,
    map: FxHashMap<IndexKey, Postings>,
    keys: FxHashMap<u32, IndexKey>,
    pub hits: AtomicU64,
}

impl HashIndex {
    pub fn new(slot: u16) -> HashIndex {
        HashIndex {
            slot,
            map: FxHashMap::default(),
            keys: FxHashMap::default(),
            hits: AtomicU64::new(0),
        }
    }

    fn insert(&mut self, id: u32, key: IndexKey) {
        self.map.entry(key.clone()).or_insert_with(Postings::new).push(id);
        self.keys.insert(id, key);
    }

    fn remove(&mut self, id: u32) {
        if let Some(key) = self.keys.remove(&id) {
            if let Some(postings) = self.map.get_mut(&key) {
                postings.retain(|candidate| *candidate != id);
                if postings.is_empty() {
                    self.map.remove(&key);
                }
            }
        }
    }

    pub fn get_eq(&self, key: &IndexKey) -> Vec<u32> {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.map.get(key).map(|p| p.to_vec()).unwrap_or_default()
    }
}

pub(crate) type Bounds = SmallVec<[(f64, f64); 3]>;

/// Space index over (min, max) field pairs per dimension.
pub(crate) struct SpaceIndex {
    pub dims: SmallVec<[(u16, u16); 3]>,
    bounds: FxHashMap<u32, Bounds>,
    pub hits: AtomicU64,
}

impl SpaceIndex {
    pub fn new(dims: SmallVec<[(u16, u16); 3]>) -> SpaceIndex {
        SpaceIndex {
            dims,
            bounds: FxHashMap::default(),
            hits: AtomicU64::new(0),
        }
    }

    fn update(&mut self, id: u32, record: &RecordBuf) {
        let mut bounds = Bounds::new();
        for &(min_slot, max_slot) in &self.dims {
            let min = record.slot(min_slot).as_dimension();
            let max = record.slot(max_slot).as_dimension();
            match (min, max) {
                (Some(min), Some(max)) => bounds.push((min, max)),
                _ => {
                    self.bounds.remove(&id);
                    return;
                }
            }
        }
        self.bounds.insert(id, bounds);
    }

    fn remove(&mut self, id: u32) {
        self.bounds.remove(&id);
    }

    pub fn query_box(&self, min: &[f64], max: &[f64]) -> Vec<u32> {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.bounds
            .iter()
            .filter(|(_, bounds)| {
                bounds
                    .iter()
                    .enumerate()
                    .all(|(dim, (lo, hi))| *hi >= min[dim] && *lo <= max[dim])
            })
            .map(|(id, _)| *id)
            .collect()
    }
}

pub(crate) enum StorageIndex {
    Value(ValueIndex),
    Hash(HashIndex),
    Space(SpaceIndex),
}

impl StorageIndex {
    pub fn kind_name(&self) -> &'static str {
        match self {
            StorageIndex::Value(_) => "value",
            StorageIndex::Hash(_) => "hash",
            StorageIndex::Space(_) => "space",
        }
    }

    /// Relative cost figure of building the index over existing records.
    pub fn build_cost(&self) -> u32 {
        match self {
            StorageIndex::Hash(_) => 1,
            StorageIndex::Value(_) => 2,
            StorageIndex::Space(_) => 3,
        }
    }

    pub fn hit_count(&self) -> u64 {
        match self {
            StorageIndex::Value(index) => index.hits.load(Ordering::Relaxed),
            StorageIndex::Hash(index) => index.hits.load(Ordering::Relaxed),
            StorageIndex::Space(index) => index.hits.load(Ordering::Relaxed),
        }
    }

    /// Re-keys `id` from the record's current state. Slots gated behind an
    /// inactive union arm leave the index.
    pub fn update(&mut self, id: u32, record: &RecordBuf) {
        match self {
            StorageIndex::Value(index) => {
                index.remove(id);
                if record.is_active(index.slot) {
                    if let Some(key) = IndexKey::new(record.slot(index.slot)) {
                        index.insert(id, key);
                    }
                }
            }
            StorageIndex::Hash(index) => {
                index.remove(id);
                if record.is_active(index.slot) {
                    if let Some(key) = IndexKey::new(record.slot(index.slot)) {
                        index.insert(id, key);
                    }
                }
            }
            StorageIndex::Space(index) => index.update(id, record),
        }
    }

    pub fn remove(&mut self, id: u32) {
        match self {
            StorageIndex::Value(index) => index.remove(id),
            StorageIndex::Hash(index) => index.remove(id),
            StorageIndex::Space(index) => index.remove(id),
        }
    }
}
