use crate::intern::IStr;
use thiserror::Error;

/// Reflection describes a type the layout service cannot build.
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("record type `{0}` is not present in the reflection registry")]
    UnknownType(IStr),

    #[error("field `{field}` of `{record}` declares unknown dynamic array element type `{element}`")]
    UnknownElementType {
        record: IStr,
        field: IStr,
        element: IStr,
    },

    #[error("field `{field}` of `{record}` references missing or non-integer size field `{size_field}`")]
    MissingSizeField {
        record: IStr,
        field: IStr,
        size_field: IStr,
    },

    #[error("visibility condition of field `{field}` in `{record}` resolves to non-integer field `{condition}`")]
    NonIntegerCondition {
        record: IStr,
        field: IStr,
        condition: IStr,
    },

    #[error("observed field path `{path}` cannot be resolved in `{record}`")]
    UnresolvedObservedField { record: IStr, path: String },

    #[error("copy-out path `{path}` cannot be resolved between `{record}` and `{event}`")]
    UnresolvedCopyOut {
        record: IStr,
        event: IStr,
        path: String,
    },

    #[error("copy-out `{copy_source}` -> `{target}` between `{record}` and `{event}` has mismatched field kinds")]
    CopyOutKindMismatch {
        record: IStr,
        event: IStr,
        copy_source: String,
        target: String,
    },

    #[error("unchanged copy-out source `{path}` of `{record}` is not an observed field")]
    UnobservedCopyOutSource { record: IStr, path: String },
}

/// A world failed to deploy its record types, mutators or scheduler.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error("record type `{0}` is not present in the repository")]
    UnknownType(IStr),

    #[error("`{owner}` declares unsupported binding on `{target}`: {reason}")]
    UnknownBinding {
        owner: IStr,
        target: IStr,
        reason: String,
    },

    #[error("record type `{record}` is already deployed as a {existing} storage, requested {requested}")]
    StorageClassMismatch {
        record: IStr,
        existing: &'static str,
        requested: &'static str,
    },

    #[error("`{scope}` cannot be scheduled: {reason}")]
    AccessConflict { scope: IStr, reason: String },

    #[error("scheduler `{0}` is not registered")]
    UnknownScheduler(IStr),

    #[error("mutator `{0}` is not registered")]
    UnknownMutator(IStr),
}

/// A record could not be carried across a reflection migration.
///
/// The record is dropped with a diagnostic; migration itself continues.
#[derive(Debug, Error)]
#[error("record of `{record}` cannot be patched: field `{field}` is incompatible with the new layout")]
pub struct PatchIncompatible {
    pub record: IStr,
    pub field: IStr,
}

/// Record field access failure.
#[derive(Debug, Error)]
pub enum FieldError {
    #[error("record has no field `{0}`")]
    NoSuchField(IStr),

    #[error("field `{field}` holds {actual}, not {expected}")]
    KindMismatch {
        field: IStr,
        expected: &'static str,
        actual: &'static str,
    },
}

/// Fatal failure signalled by a mutator body.
///
/// Remaining mutators of the current layer finish, subsequent layers of the
/// pipeline are skipped, and the step boundary still flushes pending events.
#[derive(Debug)]
pub struct Fatal {
    pub message: String,
}

impl Fatal {
    pub fn new(message: impl Into<String>) -> Fatal {
        Fatal {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Fatal {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Result type returned by mutator and scheduler bodies.
pub type MutatorResult = Result<(), Fatal>;
