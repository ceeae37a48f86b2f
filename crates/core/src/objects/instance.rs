//! `Instance`: a live object of some `Class` (§3.2). Size is fixed at
//! allocation time — instance fields are a flat map seeded from the
//! class's field template when the instance is created, never grown.

use std::collections::HashMap;

use crate::handle::GcRef;
use crate::objects::class::ClassObj;
use crate::objects::strings::StringObj;
use crate::value::Value;

#[derive(Debug)]
pub struct InstanceObj {
    pub class: GcRef<ClassObj>,
    fields: HashMap<GcRef<StringObj>, Value>,
    hidden_fields: HashMap<GcRef<StringObj>, Value>,
    /// Set once the finalizer queue has run this instance's finalizer
    /// (§4.2: "resurrected exactly once, finalized before being freed").
    pub finalized: bool,
}

impl InstanceObj {
    pub fn new(
        class: GcRef<ClassObj>,
        fields: HashMap<GcRef<StringObj>, Value>,
        hidden_fields: HashMap<GcRef<StringObj>, Value>,
    ) -> Self {
        InstanceObj {
            class,
            fields,
            hidden_fields,
            finalized: false,
        }
    }

    pub fn get_field(&self, name: GcRef<StringObj>) -> Option<Value> {
        self.fields.get(&name).copied()
    }

    pub fn set_field(&mut self, name: GcRef<StringObj>, value: Value) -> bool {
        if let Some(slot) = self.fields.get_mut(&name) {
            *slot = value;
            true
        } else {
            false
        }
    }

    pub fn get_hidden_field(&self, name: GcRef<StringObj>) -> Option<Value> {
        self.hidden_fields.get(&name).copied()
    }

    pub fn set_hidden_field(&mut self, name: GcRef<StringObj>, value: Value) -> bool {
        if let Some(slot) = self.hidden_fields.get_mut(&name) {
            *slot = value;
            true
        } else {
            false
        }
    }

    pub fn fields_iter(&self) -> impl Iterator<Item = (&GcRef<StringObj>, &Value)> {
        self.fields.iter()
    }

    pub fn hidden_fields_iter(&self) -> impl Iterator<Item = (&GcRef<StringObj>, &Value)> {
        self.hidden_fields.iter()
    }

    /// Unconditional insert, unlike [`Self::set_field`]. Used by the
    /// graph deserializer (`croc-runtime`'s serializer module), which
    /// rebuilds an instance's field map wholesale from the wire rather
    /// than assigning into a class-template-seeded map.
    pub fn insert_field(&mut self, name: GcRef<StringObj>, value: Value) {
        self.fields.insert(name, value);
    }

    pub fn insert_hidden_field(&mut self, name: GcRef<StringObj>, value: Value) {
        self.hidden_fields.insert(name, value);
    }
}
