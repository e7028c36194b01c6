//! The read-only reflection surface the repository consumes.
//!
//! A [`Registry`] lists record types, their fields and field-level meta, plus
//! the automatic event declarations (on-add / on-change / on-remove) that
//! drive the event router. The core never mutates a published registry;
//! publishing a registry with a higher version triggers migration.

use crate::intern::{intern, IStr};
use crate::record::RecordBuf;
use fxhash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Dotted path naming a field of a record.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(pub(crate) SmallVec<[IStr; 2]>);

impl FieldPath {
    pub fn parse(text: &str) -> FieldPath {
        FieldPath(text.split('.').map(intern).collect())
    }

    pub(crate) fn head(&self) -> IStr {
        self.0[0]
    }

    pub(crate) fn is_single(&self) -> bool {
        self.0.len() == 1
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            f.write_str(segment.as_str())?;
        }
        Ok(())
    }
}

impl fmt::Debug for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl From<&str> for FieldPath {
    fn from(text: &str) -> FieldPath {
        FieldPath::parse(text)
    }
}

/// Declared kind of a record field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldKind {
    U64,
    I64,
    F64,
    Bool,
    Str,
    Handle,
    /// Dynamic array; `element` names a scalar kind (`"u64"`, `"f64"`, ...).
    Array { element: IStr },
}

/// A field plus its reflection meta.
#[derive(Clone, Debug)]
pub struct FieldInfo {
    pub name: IStr,
    pub kind: FieldKind,
    /// Changes to this field fire on-change events even without an explicit
    /// observed-fields listing in the event meta.
    pub observed: bool,
    /// Excluded from observation and migration.
    pub ignore: bool,
    /// For arrays: name of the integer field mirroring the element count.
    pub size_field: Option<IStr>,
    /// Union arm gating: discriminant field name.
    pub visibility_condition_field: Option<IStr>,
    /// Permissible discriminant values for this arm.
    pub visibility_condition_values: SmallVec<[i64; 4]>,
    /// Migration matches this field to an old field of the given name.
    pub renamed_from: Option<IStr>,
}

impl FieldInfo {
    pub fn new(name: &str, kind: FieldKind) -> FieldInfo {
        FieldInfo {
            name: intern(name),
            kind,
            observed: false,
            ignore: false,
            size_field: None,
            visibility_condition_field: None,
            visibility_condition_values: SmallVec::new(),
            renamed_from: None,
        }
    }

    pub fn observed(mut self) -> Self {
        self.observed = true;
        self
    }

    pub fn ignored(mut self) -> Self {
        self.ignore = true;
        self
    }

    pub fn sized_by(mut self, field: &str) -> Self {
        self.size_field = Some(intern(field));
        self
    }

    pub fn visible_when(mut self, field: &str, values: &[i64]) -> Self {
        self.visibility_condition_field = Some(intern(field));
        self.visibility_condition_values = values.iter().cloned().collect();
        self
    }

    pub fn renamed_from(mut self, old_name: &str) -> Self {
        self.renamed_from = Some(intern(old_name));
        self
    }
}

/// Reflected construction / destruction hook running in place on a record.
pub type RecordHook = Arc<dyn Fn(&mut RecordBuf) + Send + Sync>;

/// A record type description.
#[derive(Clone)]
pub struct TypeInfo {
    pub name: IStr,
    pub fields: Vec<FieldInfo>,
    pub(crate) init: Option<RecordHook>,
    pub(crate) shutdown: Option<RecordHook>,
}

impl TypeInfo {
    pub fn new(name: &str) -> TypeInfo {
        TypeInfo {
            name: intern(name),
            fields: Vec::new(),
            init: None,
            shutdown: None,
        }
    }

    pub fn field(mut self, field: FieldInfo) -> Self {
        self.fields.push(field);
        self
    }

    /// Marks the type as explicitly initialized; the hook runs after zeroing.
    pub fn init_with<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut RecordBuf) + Send + Sync + 'static,
    {
        self.init = Some(Arc::new(hook));
        self
    }

    /// Marks the type as explicitly finalized.
    pub fn shutdown_with<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut RecordBuf) + Send + Sync + 'static,
    {
        self.shutdown = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TypeInfo")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .field("explicit_init", &self.init.is_some())
            .field("explicit_shutdown", &self.shutdown.is_some())
            .finish()
    }
}

/// Field-path mapping from a triggering record into an emitted event.
#[derive(Clone, Debug)]
pub struct CopyOut {
    pub source: FieldPath,
    pub target: FieldPath,
}

impl CopyOut {
    pub fn new(source: &str, target: &str) -> CopyOut {
        CopyOut {
            source: FieldPath::parse(source),
            target: FieldPath::parse(target),
        }
    }
}

#[derive(Clone, Debug)]
pub struct OnAddEvent {
    pub trigger_type: IStr,
    pub event_type: IStr,
    pub copy_outs: Vec<CopyOut>,
}

#[derive(Clone, Debug)]
pub struct OnChangeEvent {
    pub trigger_type: IStr,
    pub event_type: IStr,
    pub observed_fields: Vec<FieldPath>,
    /// Evaluated against the pre-image; sources must be observed fields.
    pub unchanged_copy_outs: Vec<CopyOut>,
    /// Evaluated against the post-image.
    pub changed_copy_outs: Vec<CopyOut>,
}

#[derive(Clone, Debug)]
pub struct OnRemoveEvent {
    pub trigger_type: IStr,
    pub event_type: IStr,
    pub copy_outs: Vec<CopyOut>,
}

/// A published, immutable listing of record types and automatic event metas.
#[derive(Debug)]
pub struct Registry {
    version: u64,
    types: FxHashMap<IStr, TypeInfo>,
    on_add: Vec<OnAddEvent>,
    on_change: Vec<OnChangeEvent>,
    on_remove: Vec<OnRemoveEvent>,
}

impl Registry {
    pub fn builder(version: u64) -> RegistryBuilder {
        RegistryBuilder {
            version,
            types: FxHashMap::default(),
            on_add: Vec::new(),
            on_change: Vec::new(),
            on_remove: Vec::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn type_info(&self, name: IStr) -> Option<&TypeInfo> {
        self.types.get(&name)
    }

    pub(crate) fn on_add_for(&self, trigger: IStr) -> impl Iterator<Item = &OnAddEvent> {
        self.on_add.iter().filter(move |m| m.trigger_type == trigger)
    }

    pub(crate) fn on_change_for(&self, trigger: IStr) -> impl Iterator<Item = &OnChangeEvent> {
        self.on_change
            .iter()
            .filter(move |m| m.trigger_type == trigger)
    }

    pub(crate) fn on_remove_for(&self, trigger: IStr) -> impl Iterator<Item = &OnRemoveEvent> {
        self.on_remove
            .iter()
            .filter(move |m| m.trigger_type == trigger)
    }
}

pub struct RegistryBuilder {
    version: u64,
    types: FxHashMap<IStr, TypeInfo>,
    on_add: Vec<OnAddEvent>,
    on_change: Vec<OnChangeEvent>,
    on_remove: Vec<OnRemoveEvent>,
}

impl RegistryBuilder {
    pub fn with_type(mut self, info: TypeInfo) -> Self {
        self.types.insert(info.name, info);
        self
    }

    pub fn on_add_event(mut self, meta: OnAddEvent) -> Self {
        self.on_add.push(meta);
        self
    }

    pub fn on_change_event(mut self, meta: OnChangeEvent) -> Self {
        self.on_change.push(meta);
        self
    }

    pub fn on_remove_event(mut self, meta: OnRemoveEvent) -> Self {
        self.on_remove.push(meta);
        self
    }

    pub fn build(self) -> Arc<Registry> {
        Arc::new(Registry {
            version: self.version,
            types: self.types,
            on_add: self.on_add,
            on_change: self.on_change,
            on_remove: self.on_remove,
        })
    }
}
