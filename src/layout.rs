//! Record layout service.
//!
//! Consumes the reflection registry and computes, per record type, everything
//! the storages need: slot layout with size/alignment figures, init and
//! shutdown functors, the observed-field projection and union arm gating.
//! Copy-out plans are compiled against these layouts by the event router.

use crate::error::LayoutError;
use crate::intern::IStr;
use crate::record::Value;
use crate::reflection::{FieldInfo, FieldKind, FieldPath, RecordHook, Registry, TypeInfo};
use fxhash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;

/// Scalar slot kinds records can hold.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScalarKind {
    U64,
    I64,
    F64,
    Bool,
    Str,
    Handle,
}

impl ScalarKind {
    pub fn name(&self) -> &'static str {
        match self {
            ScalarKind::U64 => "u64",
            ScalarKind::I64 => "i64",
            ScalarKind::F64 => "f64",
            ScalarKind::Bool => "bool",
            ScalarKind::Str => "str",
            ScalarKind::Handle => "handle",
        }
    }

    fn parse(name: IStr) -> Option<ScalarKind> {
        match name.as_str() {
            "u64" => Some(ScalarKind::U64),
            "i64" => Some(ScalarKind::I64),
            "f64" => Some(ScalarKind::F64),
            "bool" => Some(ScalarKind::Bool),
            "str" => Some(ScalarKind::Str),
            "handle" => Some(ScalarKind::Handle),
            _ => None,
        }
    }

    fn size(&self) -> u32 {
        match self {
            ScalarKind::Bool => 1,
            _ => 8,
        }
    }

    fn align(&self) -> u32 {
        self.size()
    }

    pub(crate) fn is_integer(&self) -> bool {
        matches!(self, ScalarKind::U64 | ScalarKind::I64)
    }
}

/// Resolved kind of a slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolvedKind {
    Scalar(ScalarKind),
    Array(ScalarKind),
}

impl ResolvedKind {
    pub fn name(&self) -> &'static str {
        match self {
            ResolvedKind::Scalar(s) => s.name(),
            ResolvedKind::Array(_) => "array",
        }
    }

    fn size(&self) -> u32 {
        match self {
            ResolvedKind::Scalar(s) => s.size(),
            // pointer + length + capacity figure for the backing sequence
            ResolvedKind::Array(_) => 24,
        }
    }

    fn align(&self) -> u32 {
        match self {
            ResolvedKind::Scalar(s) => s.align(),
            ResolvedKind::Array(_) => 8,
        }
    }
}

/// Union arm gating: the slot is logically present only while the discriminant
/// slot holds one of the permitted values.
#[derive(Clone, Debug)]
pub struct SlotCondition {
    pub field: u16,
    pub values: SmallVec<[i64; 4]>,
}

#[derive(Clone, Debug)]
pub struct SlotLayout {
    pub name: IStr,
    pub kind: ResolvedKind,
    pub offset: u32,
    pub size: u32,
    pub observed: bool,
    pub ignored: bool,
    pub size_field: Option<u16>,
    pub condition: Option<SlotCondition>,
    pub(crate) renamed_from: Option<IStr>,
}

/// Computed storable layout of one record type.
pub struct RecordLayout {
    pub type_name: IStr,
    pub size: u32,
    pub align: u32,
    pub slots: Vec<SlotLayout>,
    by_name: FxHashMap<IStr, u16>,
    /// Sorted slot indices forming the observed projection.
    pub(crate) observed: SmallVec<[u16; 8]>,
    pub(crate) init: Option<RecordHook>,
    pub(crate) shutdown: Option<RecordHook>,
}

impl fmt::Debug for RecordLayout {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RecordLayout")
            .field("type_name", &self.type_name)
            .field("size", &self.size)
            .field("align", &self.align)
            .field("slots", &self.slots.len())
            .field("observed", &self.observed)
            .finish()
    }
}

impl RecordLayout {
    /// Computes the layout of `info`, validating all field meta.
    pub fn build(info: &TypeInfo, registry: &Registry) -> Result<RecordLayout, LayoutError> {
        let record = info.name;
        let mut by_name = FxHashMap::default();
        for (i, field) in info.fields.iter().enumerate() {
            by_name.insert(field.name, i as u16);
        }

        let mut slots = Vec::with_capacity(info.fields.len());
        for field in &info.fields {
            let kind = resolve_kind(record, field)?;
            let size_field = resolve_size_field(record, field, &by_name, &info.fields)?;
            let condition = resolve_condition(record, field, &by_name, &info.fields)?;
            slots.push(SlotLayout {
                name: field.name,
                kind,
                offset: 0,
                size: 0,
                observed: field.observed,
                ignored: field.ignore,
                size_field,
                condition,
                renamed_from: field.renamed_from,
            });
        }

        let (size, align) = assign_offsets(&mut slots);

        let mut observed: SmallVec<[u16; 8]> = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.observed && !s.ignored)
            .map(|(i, _)| i as u16)
            .collect();
        for meta in registry.on_change_for(record) {
            for path in &meta.observed_fields {
                let slot = resolve_single(path, &by_name).ok_or_else(|| {
                    LayoutError::UnresolvedObservedField {
                        record,
                        path: format!("{}", path),
                    }
                })?;
                if !observed.contains(&slot) {
                    observed.push(slot);
                }
            }
        }
        observed.sort();

        for (i, slot) in slots.iter_mut().enumerate() {
            if observed.contains(&(i as u16)) {
                slot.observed = true;
            }
        }

        Ok(RecordLayout {
            type_name: record,
            size,
            align,
            slots,
            by_name,
            observed,
            init: info.init.clone(),
            shutdown: info.shutdown.clone(),
        })
    }

    pub(crate) fn slot_index(&self, name: IStr) -> Option<u16> {
        self.by_name.get(&name).cloned()
    }

    pub fn slot(&self, index: u16) -> &SlotLayout {
        &self.slots[index as usize]
    }

    /// Resolves a field path to a slot. Only flat paths resolve; nested paths
    /// have no counterpart in the slot model.
    pub(crate) fn resolve_path(&self, path: &FieldPath) -> Option<u16> {
        if path.is_single() {
            self.slot_index(path.head())
        } else {
            None
        }
    }

    /// Default slot values for a fresh record, before the init hook runs.
    pub(crate) fn default_slots(&self) -> Box<[Value]> {
        self.slots
            .iter()
            .map(|s| Value::default_for(&s.kind))
            .collect::<Vec<_>>()
            .into_boxed_slice()
    }
}

fn resolve_single(path: &FieldPath, by_name: &FxHashMap<IStr, u16>) -> Option<u16> {
    if path.is_single() {
        by_name.get(&path.head()).cloned()
    } else {
        None
    }
}

fn resolve_kind(record: IStr, field: &FieldInfo) -> Result<ResolvedKind, LayoutError> {
    match &field.kind {
        FieldKind::U64 => Ok(ResolvedKind::Scalar(ScalarKind::U64)),
        FieldKind::I64 => Ok(ResolvedKind::Scalar(ScalarKind::I64)),
        FieldKind::F64 => Ok(ResolvedKind::Scalar(ScalarKind::F64)),
        FieldKind::Bool => Ok(ResolvedKind::Scalar(ScalarKind::Bool)),
        FieldKind::Str => Ok(ResolvedKind::Scalar(ScalarKind::Str)),
        FieldKind::Handle => Ok(ResolvedKind::Scalar(ScalarKind::Handle)),
        FieldKind::Array { element } => match ScalarKind::parse(*element) {
            Some(kind) => Ok(ResolvedKind::Array(kind)),
            None => Err(LayoutError::UnknownElementType {
                record,
                field: field.name,
                element: *element,
            }),
        },
    }
}

fn resolve_size_field(
    record: IStr,
    field: &FieldInfo,
    by_name: &FxHashMap<IStr, u16>,
    fields: &[FieldInfo],
) -> Result<Option<u16>, LayoutError> {
    let size_field = match field.size_field {
        Some(name) => name,
        None => return Ok(None),
    };
    let slot = by_name.get(&size_field).cloned();
    let integer = slot
        .map(|s| matches!(fields[s as usize].kind, FieldKind::U64 | FieldKind::I64))
        .unwrap_or(false);
    if !integer {
        return Err(LayoutError::MissingSizeField {
            record,
            field: field.name,
            size_field,
        });
    }
    Ok(slot)
}

fn resolve_condition(
    record: IStr,
    field: &FieldInfo,
    by_name: &FxHashMap<IStr, u16>,
    fields: &[FieldInfo],
) -> Result<Option<SlotCondition>, LayoutError> {
    let condition = match field.visibility_condition_field {
        Some(name) => name,
        None => return Ok(None),
    };
    let slot = by_name.get(&condition).cloned();
    let integer = slot
        .map(|s| matches!(fields[s as usize].kind, FieldKind::U64 | FieldKind::I64))
        .unwrap_or(false);
    if !integer {
        return Err(LayoutError::NonIntegerCondition {
            record,
            field: field.name,
            condition,
        });
    }
    Ok(Some(SlotCondition {
        field: slot.unwrap_or(0),
        values: field.visibility_condition_values.clone(),
    }))
}

/// Assigns offset figures. Unconditional fields are laid out sequentially;
/// fields gated on the same discriminant share one overlapped region whose
/// size is the largest arm.
fn assign_offsets(slots: &mut [SlotLayout]) -> (u32, u32) {
    let mut align = 1u32;
    for slot in slots.iter() {
        align = align.max(slot.kind.align());
    }

    let mut cursor = 0u32;
    let mut region_of: FxHashMap<u16, (u32, FxHashMap<Vec<i64>, u32>)> = FxHashMap::default();
    let mut region_end = 0u32;

    for i in 0..slots.len() {
        let slot_align = slots[i].kind.align();
        let slot_size = slots[i].kind.size();
        match slots[i].condition.clone() {
            None => {
                cursor = round_up(cursor.max(region_end), slot_align);
                slots[i].offset = cursor;
                slots[i].size = slot_size;
                cursor += slot_size;
            }
            Some(condition) => {
                let mut arm_key: Vec<i64> = condition.values.to_vec();
                arm_key.sort();
                let entry = region_of.entry(condition.field).or_insert_with(|| {
                    let start = round_up(cursor.max(region_end), align);
                    (start, FxHashMap::default())
                });
                let arm_cursor = entry.1.entry(arm_key).or_insert(0);
                let offset = round_up(*arm_cursor, slot_align);
                slots[i].offset = entry.0 + offset;
                slots[i].size = slot_size;
                *arm_cursor = offset + slot_size;
                region_end = region_end.max(slots[i].offset + slot_size);
            }
        }
    }

    let size = round_up(cursor.max(region_end), align);
    (size.max(align), align)
}

fn round_up(value: u32, align: u32) -> u32 {
    (value + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::intern;
    use crate::reflection::{FieldInfo, FieldKind, Registry, TypeInfo};

    fn empty_registry() -> std::sync::Arc<Registry> {
        Registry::builder(1).build()
    }

    #[test]
    fn plain_fields_lay_out_sequentially() {
        let info = TypeInfo::new("unit")
            .field(FieldInfo::new("id", FieldKind::U64))
            .field(FieldInfo::new("alive", FieldKind::Bool))
            .field(FieldInfo::new("hp", FieldKind::F64));
        let layout = RecordLayout::build(&info, &empty_registry()).unwrap();

        assert_eq!(layout.slot(0).offset, 0);
        assert_eq!(layout.slot(1).offset, 8);
        assert_eq!(layout.slot(2).offset, 16);
        assert_eq!(layout.size, 24);
        assert_eq!(layout.align, 8);
    }

    #[test]
    fn union_arms_overlap() {
        let info = TypeInfo::new("shape")
            .field(FieldInfo::new("tag", FieldKind::U64))
            .field(FieldInfo::new("radius", FieldKind::F64).visible_when("tag", &[0]))
            .field(FieldInfo::new("width", FieldKind::F64).visible_when("tag", &[1]))
            .field(FieldInfo::new("height", FieldKind::F64).visible_when("tag", &[1]));
        let layout = RecordLayout::build(&info, &empty_registry()).unwrap();

        // radius and width share the region start; height extends the larger arm
        assert_eq!(layout.slot(1).offset, layout.slot(2).offset);
        assert_eq!(layout.slot(3).offset, layout.slot(2).offset + 8);
        assert_eq!(layout.size, 24);
    }

    #[test]
    fn unknown_array_element_fails() {
        let info = TypeInfo::new("bag").field(FieldInfo::new(
            "items",
            FieldKind::Array {
                element: intern("mystery"),
            },
        ));
        match RecordLayout::build(&info, &empty_registry()) {
            Err(LayoutError::UnknownElementType { element, .. }) => {
                assert_eq!(element, intern("mystery"))
            }
            other => panic!("expected UnknownElementType, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn missing_size_field_fails() {
        let info = TypeInfo::new("bag").field(
            FieldInfo::new(
                "items",
                FieldKind::Array {
                    element: intern("u64"),
                },
            )
            .sized_by("item_count"),
        );
        assert!(matches!(
            RecordLayout::build(&info, &empty_registry()),
            Err(LayoutError::MissingSizeField { .. })
        ));
    }

    #[test]
    fn non_integer_condition_fails() {
        let info = TypeInfo::new("shape")
            .field(FieldInfo::new("tag", FieldKind::F64))
            .field(FieldInfo::new("radius", FieldKind::F64).visible_when("tag", &[0]));
        assert!(matches!(
            RecordLayout::build(&info, &empty_registry()),
            Err(LayoutError::NonIntegerCondition { .. })
        ));
    }

    #[test]
    fn observed_projection_unions_meta_and_field_flags() {
        use crate::reflection::{FieldPath, OnChangeEvent};

        let registry = Registry::builder(1)
            .on_change_event(OnChangeEvent {
                trigger_type: intern("unit"),
                event_type: intern("unit_changed"),
                observed_fields: vec![FieldPath::parse("hp")],
                unchanged_copy_outs: vec![],
                changed_copy_outs: vec![],
            })
            .build();
        let info = TypeInfo::new("unit")
            .field(FieldInfo::new("id", FieldKind::U64).observed())
            .field(FieldInfo::new("hp", FieldKind::F64))
            .field(FieldInfo::new("scratch", FieldKind::U64));
        let layout = RecordLayout::build(&info, &registry).unwrap();

        assert_eq!(layout.observed.as_slice(), &[0, 1]);
        assert!(layout.slot(1).observed);
        assert!(!layout.slot(2).observed);
    }
}
