//! `Class`: named blueprint for instances (§3.2, §9 "Multiple
//! inheritance"). A class has a single optional parent, established at
//! freeze time — no mixins, no interfaces.

use std::collections::HashMap;

use crate::handle::GcRef;
use crate::objects::function::FunctionObj;
use crate::objects::strings::StringObj;
use crate::value::Value;

#[derive(Debug)]
pub struct ClassObj {
    pub name: GcRef<StringObj>,
    pub parent: Option<GcRef<ClassObj>>,
    methods: HashMap<GcRef<StringObj>, Value>,
    fields: HashMap<GcRef<StringObj>, Value>,
    hidden_fields: HashMap<GcRef<StringObj>, Value>,
    pub constructor: Option<GcRef<FunctionObj>>,
    pub finalizer: Option<GcRef<FunctionObj>>,
    pub frozen: bool,
}

impl ClassObj {
    pub fn new(name: GcRef<StringObj>, parent: Option<GcRef<ClassObj>>) -> Self {
        ClassObj {
            name,
            parent,
            methods: HashMap::new(),
            fields: HashMap::new(),
            hidden_fields: HashMap::new(),
            constructor: None,
            finalizer: None,
            frozen: false,
        }
    }

    pub fn is_finalizable(&self) -> bool {
        self.finalizer.is_some()
    }

    /// Mutation is only legal while `!frozen` (§3.2: "Unfrozen classes
    /// accept structural modification; frozen classes are immutable
    /// blueprints").
    pub fn add_method(&mut self, name: GcRef<StringObj>, value: Value) -> Result<(), FrozenError> {
        if self.frozen {
            return Err(FrozenError);
        }
        self.methods.insert(name, value);
        Ok(())
    }

    pub fn add_field(&mut self, name: GcRef<StringObj>, value: Value) -> Result<(), FrozenError> {
        if self.frozen {
            return Err(FrozenError);
        }
        self.fields.insert(name, value);
        Ok(())
    }

    pub fn add_hidden_field(
        &mut self,
        name: GcRef<StringObj>,
        value: Value,
    ) -> Result<(), FrozenError> {
        if self.frozen {
            return Err(FrozenError);
        }
        self.hidden_fields.insert(name, value);
        Ok(())
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn own_method(&self, name: GcRef<StringObj>) -> Option<Value> {
        self.methods.get(&name).copied()
    }

    pub fn own_field(&self, name: GcRef<StringObj>) -> Option<Value> {
        self.fields.get(&name).copied()
    }

    pub fn hidden_field(&self, name: GcRef<StringObj>) -> Option<Value> {
        self.hidden_fields.get(&name).copied()
    }

    pub fn fields_iter(&self) -> impl Iterator<Item = (&GcRef<StringObj>, &Value)> {
        self.fields.iter()
    }

    pub fn methods_iter(&self) -> impl Iterator<Item = (&GcRef<StringObj>, &Value)> {
        self.methods.iter()
    }

    pub fn hidden_iter(&self) -> impl Iterator<Item = (&GcRef<StringObj>, &Value)> {
        self.hidden_fields.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrozenError;
