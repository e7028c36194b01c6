//! Dynamically shaped record buffers.
//!
//! Records are reflection-described, so a record instance is a boxed slot
//! sequence laid out by [`RecordLayout`](crate::layout::RecordLayout). Typed
//! accessors check slot kinds; union arms are logically absent while their
//! discriminant holds a non-matching value.

use crate::error::FieldError;
use crate::intern::{intern, IStr};
use crate::layout::{RecordLayout, ResolvedKind, ScalarKind};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Stable reference to a record inside one indexed storage: a slot index plus
/// a generation counter. Handles stay valid across step-boundary compaction
/// and across migration; a stale generation simply fails to resolve.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct RecordHandle {
    index: u32,
    generation: u32,
}

impl RecordHandle {
    pub(crate) fn new(index: u32, generation: u32) -> RecordHandle {
        RecordHandle { index, generation }
    }

    pub fn null() -> RecordHandle {
        RecordHandle {
            index: u32::max_value(),
            generation: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.index == u32::max_value()
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for RecordHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// A single field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U64(u64),
    I64(i64),
    F64(f64),
    Bool(bool),
    Str(IStr),
    Handle(RecordHandle),
    Array(Vec<Value>),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::U64(_) => "u64",
            Value::I64(_) => "i64",
            Value::F64(_) => "f64",
            Value::Bool(_) => "bool",
            Value::Str(_) => "str",
            Value::Handle(_) => "handle",
            Value::Array(_) => "array",
        }
    }

    pub(crate) fn default_for(kind: &ResolvedKind) -> Value {
        match kind {
            ResolvedKind::Scalar(scalar) => Value::default_scalar(*scalar),
            ResolvedKind::Array(_) => Value::Array(Vec::new()),
        }
    }

    fn default_scalar(kind: ScalarKind) -> Value {
        match kind {
            ScalarKind::U64 => Value::U64(0),
            ScalarKind::I64 => Value::I64(0),
            ScalarKind::F64 => Value::F64(0.0),
            ScalarKind::Bool => Value::Bool(false),
            ScalarKind::Str => Value::Str(intern("")),
            ScalarKind::Handle => Value::Handle(RecordHandle::null()),
        }
    }

    fn matches_scalar(&self, kind: ScalarKind) -> bool {
        match (self, kind) {
            (Value::U64(_), ScalarKind::U64) => true,
            (Value::I64(_), ScalarKind::I64) => true,
            (Value::F64(_), ScalarKind::F64) => true,
            (Value::Bool(_), ScalarKind::Bool) => true,
            (Value::Str(_), ScalarKind::Str) => true,
            (Value::Handle(_), ScalarKind::Handle) => true,
            _ => false,
        }
    }

    pub(crate) fn matches(&self, kind: &ResolvedKind) -> bool {
        match kind {
            ResolvedKind::Scalar(scalar) => self.matches_scalar(*scalar),
            ResolvedKind::Array(element) => match self {
                Value::Array(items) => items.iter().all(|v| v.matches_scalar(*element)),
                _ => false,
            },
        }
    }

    /// Discriminant view for union arm gating.
    pub(crate) fn as_discriminant(&self) -> Option<i64> {
        match self {
            Value::U64(v) => Some(*v as i64),
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view used by space indices.
    pub(crate) fn as_dimension(&self) -> Option<f64> {
        match self {
            Value::U64(v) => Some(*v as f64),
            Value::I64(v) => Some(*v as f64),
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }
}

macro_rules! typed_accessors {
    ($get:ident, $set:ident, $variant:ident, $ty:ty, $expected:expr) => {
        pub fn $get(&self, field: &str) -> Result<$ty, FieldError> {
            match self.get(intern(field))? {
                Value::$variant(v) => Ok(v.clone()),
                other => Err(FieldError::KindMismatch {
                    field: intern(field),
                    expected: $expected,
                    actual: other.kind_name(),
                }),
            }
        }

        pub fn $set(&mut self, field: &str, value: $ty) -> Result<(), FieldError> {
            self.set(intern(field), Value::$variant(value))
        }
    };
}

/// A record instance shaped by its layout.
#[derive(Clone)]
pub struct RecordBuf {
    layout: Arc<RecordLayout>,
    slots: Box<[Value]>,
}

impl RecordBuf {
    /// Builds a fresh record: defaults per slot kind, then the reflected init
    /// hook if the type declares one.
    pub(crate) fn new(layout: Arc<RecordLayout>) -> RecordBuf {
        let slots = layout.default_slots();
        let mut buf = RecordBuf { layout, slots };
        if let Some(init) = buf.layout.init.clone() {
            init(&mut buf);
        }
        buf
    }

    pub fn layout(&self) -> &Arc<RecordLayout> {
        &self.layout
    }

    pub fn type_name(&self) -> IStr {
        self.layout.type_name
    }

    pub fn get(&self, field: IStr) -> Result<&Value, FieldError> {
        let slot = self
            .layout
            .slot_index(field)
            .ok_or(FieldError::NoSuchField(field))?;
        Ok(&self.slots[slot as usize])
    }

    pub fn set(&mut self, field: IStr, value: Value) -> Result<(), FieldError> {
        let slot = self
            .layout
            .slot_index(field)
            .ok_or(FieldError::NoSuchField(field))?;
        let expected = &self.layout.slot(slot).kind;
        if !value.matches(expected) {
            return Err(FieldError::KindMismatch {
                field,
                expected: expected.name(),
                actual: value.kind_name(),
            });
        }
        if let Value::Array(items) = &value {
            // arrays keep their declared size field in sync
            if let Some(size_slot) = self.layout.slot(slot).size_field {
                let count = items.len() as u64;
                let size_value = match self.layout.slot(size_slot).kind {
                    ResolvedKind::Scalar(ScalarKind::I64) => Value::I64(count as i64),
                    _ => Value::U64(count),
                };
                self.slots[size_slot as usize] = size_value;
            }
        }
        self.slots[slot as usize] = value;
        Ok(())
    }

    typed_accessors!(u64, set_u64, U64, u64, "u64");
    typed_accessors!(i64, set_i64, I64, i64, "i64");
    typed_accessors!(f64, set_f64, F64, f64, "f64");
    typed_accessors!(bool, set_bool, Bool, bool, "bool");
    typed_accessors!(str, set_str, Str, IStr, "str");
    typed_accessors!(handle, set_handle, Handle, RecordHandle, "handle");

    pub fn array(&self, field: &str) -> Result<&Vec<Value>, FieldError> {
        match self.get(intern(field))? {
            Value::Array(items) => Ok(items),
            other => Err(FieldError::KindMismatch {
                field: intern(field),
                expected: "array",
                actual: other.kind_name(),
            }),
        }
    }

    pub fn set_array(&mut self, field: &str, items: Vec<Value>) -> Result<(), FieldError> {
        self.set(intern(field), Value::Array(items))
    }

    pub(crate) fn slot(&self, index: u16) -> &Value {
        &self.slots[index as usize]
    }

    pub(crate) fn set_slot(&mut self, index: u16, value: Value) {
        self.slots[index as usize] = value;
    }

    /// Whether the slot is logically present under union arm gating.
    pub(crate) fn is_active(&self, index: u16) -> bool {
        match &self.layout.slot(index).condition {
            None => true,
            Some(condition) => self.slots[condition.field as usize]
                .as_discriminant()
                .map(|tag| condition.values.contains(&tag))
                .unwrap_or(false),
        }
    }

    /// Captures the observed-field projection for later diffing.
    pub(crate) fn snapshot_observed(&self) -> ObservedImage {
        ObservedImage(
            self.layout
                .observed
                .iter()
                .map(|&slot| self.slots[slot as usize].clone())
                .collect(),
        )
    }

    pub(crate) fn run_shutdown(&mut self) {
        if let Some(shutdown) = self.layout.shutdown.clone() {
            shutdown(self);
        }
    }
}

impl fmt::Debug for RecordBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut map = f.debug_struct(self.layout.type_name.as_str());
        for (i, slot) in self.layout.slots.iter().enumerate() {
            map.field(slot.name.as_str(), &self.slots[i]);
        }
        map.finish()
    }
}

/// Pre-image of a record's observed projection, captured at token resolve.
pub(crate) struct ObservedImage(SmallVec<[Value; 8]>);

impl ObservedImage {
    /// True when any observed slot of `current` differs from the image.
    pub(crate) fn differs(&self, current: &RecordBuf) -> bool {
        current
            .layout
            .observed
            .iter()
            .zip(self.0.iter())
            .any(|(&slot, old)| current.slots[slot as usize] != *old)
    }

    /// Image value of an observed slot, or None when the slot is unobserved.
    pub(crate) fn value_of(&self, layout: &RecordLayout, slot: u16) -> Option<&Value> {
        layout
            .observed
            .binary_search(&slot)
            .ok()
            .map(|position| &self.0[position])
    }
}
