//! Mutator definitions: a stateless body plus declared query bindings.
//!
//! Mutators are registered with the universe by name and referenced from
//! world configuration; deployment instantiates their bindings against the
//! world's repository.

use crate::error::MutatorResult;
use crate::intern::{intern, IStr};
use crate::query::{BindingDecl, MutatorContext, QueryShape};
use crate::reflection::FieldPath;
use std::fmt;
use std::sync::Arc;

pub struct MutatorDef {
    pub name: IStr,
    pub(crate) bindings: Vec<BindingDecl>,
    /// Re-run in the one-shot pipeline after a migration completes.
    pub on_migration: bool,
    pub(crate) body: Arc<dyn Fn(&MutatorContext<'_>) -> MutatorResult + Send + Sync>,
}

impl fmt::Debug for MutatorDef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MutatorDef")
            .field("name", &self.name)
            .field("bindings", &self.bindings)
            .field("on_migration", &self.on_migration)
            .finish()
    }
}

/// Incrementally builds a [`MutatorDef`], declaring bindings first and the
/// body last.
pub struct MutatorBuilder {
    name: IStr,
    bindings: Vec<BindingDecl>,
    on_migration: bool,
}

impl MutatorBuilder {
    pub fn new(name: &str) -> MutatorBuilder {
        MutatorBuilder {
            name: intern(name),
            bindings: Vec::new(),
            on_migration: false,
        }
    }

    pub fn read_singleton(mut self, target: &str) -> Self {
        self.bindings.push(BindingDecl::singleton_read(target));
        self
    }

    pub fn write_singleton(mut self, target: &str) -> Self {
        self.bindings.push(BindingDecl::singleton_write(target));
        self
    }

    pub fn insert(mut self, target: &str) -> Self {
        self.bindings.push(BindingDecl::insert(target));
        self
    }

    pub fn read(mut self, target: &str, shape: QueryShape) -> Self {
        self.bindings.push(BindingDecl::read(target, shape));
        self
    }

    pub fn write(mut self, target: &str, shape: QueryShape) -> Self {
        self.bindings.push(BindingDecl::write(target, shape));
        self
    }

    pub fn read_all(self, target: &str) -> Self {
        self.read(target, QueryShape::Sequence)
    }

    pub fn write_all(self, target: &str) -> Self {
        self.write(target, QueryShape::Sequence)
    }

    pub fn read_eq(self, target: &str, field: &str) -> Self {
        self.read(target, QueryShape::Eq(FieldPath::parse(field)))
    }

    pub fn write_eq(self, target: &str, field: &str) -> Self {
        self.write(target, QueryShape::Eq(FieldPath::parse(field)))
    }

    pub fn read_range(self, target: &str, field: &str) -> Self {
        self.read(target, QueryShape::Range(FieldPath::parse(field)))
    }

    pub fn write_range(self, target: &str, field: &str) -> Self {
        self.write(target, QueryShape::Range(FieldPath::parse(field)))
    }

    pub fn submit_events(mut self, target: &str) -> Self {
        self.bindings.push(BindingDecl::event_insert(target));
        self
    }

    pub fn read_events(mut self, target: &str) -> Self {
        self.bindings.push(BindingDecl::event_read(target));
        self
    }

    pub fn on_migration(mut self) -> Self {
        self.on_migration = true;
        self
    }

    pub fn build<F>(self, body: F) -> Arc<MutatorDef>
    where
        F: Fn(&MutatorContext<'_>) -> MutatorResult + Send + Sync + 'static,
    {
        Arc::new(MutatorDef {
            name: self.name,
            bindings: self.bindings,
            on_migration: self.on_migration,
            body: Arc::new(body),
        })
    }
}
