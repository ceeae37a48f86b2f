//! The `Throwable` class hierarchy (§7) and the glue between a raw
//! [`croc_core::error::NativeError`] and an actual thrown `Instance`.
//!
//! Grounded in the teacher's `error.rs` in spirit (a narrow place native
//! code reports failure through) but shaped entirely differently: Croc
//! exceptions are real heap values that unwind through `catch`/`finally`
//! records rather than thread-local state read back across an FFI
//! boundary, since there is no FFI boundary here — native and script
//! frames share one call stack.

use std::collections::HashMap;

use croc_core::error::{ErrorKind, ExceptionRoot, NativeError};
use croc_core::objects::instance::InstanceObj;
use croc_core::{GcRef, Value, Vm};

const LEAVES: &[ErrorKind] = &[
    ErrorKind::TypeError,
    ErrorKind::ValueError,
    ErrorKind::RangeError,
    ErrorKind::FieldError,
    ErrorKind::BoundsError,
    ErrorKind::ImportError,
    ErrorKind::IoError,
    ErrorKind::EofError,
    ErrorKind::StateError,
    ErrorKind::SyntaxError,
    ErrorKind::LookupError,
    ErrorKind::NotImplementedError,
];

/// Handles to every class in the `Throwable` hierarchy, so native code can
/// construct an instance of the right leaf without walking the globals
/// namespace by name on every throw.
#[derive(Clone)]
pub struct ExceptionClasses {
    pub throwable: GcRef<croc_core::objects::class::ClassObj>,
    pub exception: GcRef<croc_core::objects::class::ClassObj>,
    pub error: GcRef<croc_core::objects::class::ClassObj>,
    leaves: HashMap<ErrorKind, GcRef<croc_core::objects::class::ClassObj>>,
    message_field: GcRef<croc_core::objects::strings::StringObj>,
    cause_field: GcRef<croc_core::objects::strings::StringObj>,
}

impl ExceptionClasses {
    pub fn leaf(&self, kind: ErrorKind) -> GcRef<croc_core::objects::class::ClassObj> {
        self.leaves[&kind]
    }

    pub fn message_field(&self) -> GcRef<croc_core::objects::strings::StringObj> {
        self.message_field
    }

    pub fn cause_field(&self) -> GcRef<croc_core::objects::strings::StringObj> {
        self.cause_field
    }
}

/// Build the `Throwable`/`Exception`/`Error`/leaf class tree and register
/// it under `vm.globals` (§7). Called once, when a `Vm` is opened.
pub fn bootstrap(vm: &mut Vm) -> ExceptionClasses {
    let throwable_name = vm.heap.intern_string("Throwable");
    let exception_name = vm.heap.intern_string("Exception");
    let error_name = vm.heap.intern_string("Error");
    let message_field = vm.heap.intern_string("message");
    let cause_field = vm.heap.intern_string("cause");

    let throwable = vm.alloc_class(throwable_name, None);
    let exception = vm.alloc_class(exception_name, Some(throwable));
    let error = vm.alloc_class(error_name, Some(throwable));

    vm.heap
        .get_class_mut(throwable)
        .add_field(message_field, Value::Null)
        .expect("freshly created class is never frozen");
    vm.heap
        .get_class_mut(throwable)
        .add_field(cause_field, Value::Null)
        .expect("freshly created class is never frozen");

    let mut leaves = HashMap::new();
    for &kind in LEAVES {
        let name = vm.heap.intern_string(kind.name());
        let root = match kind.root() {
            ExceptionRoot::Exception => exception,
            ExceptionRoot::Error => error,
        };
        let class = vm.alloc_class(name, Some(root));
        vm.heap.get_class_mut(class).freeze();
        leaves.insert(kind, class);
    }

    vm.heap.get_class_mut(exception).freeze();
    vm.heap.get_class_mut(error).freeze();
    vm.heap.get_class_mut(throwable).freeze();

    let globals_entry_pairs = [
        (throwable_name, Value::Class(throwable)),
        (exception_name, Value::Class(exception)),
        (error_name, Value::Class(error)),
    ];
    for (name, value) in globals_entry_pairs {
        vm.heap.get_namespace_mut(vm.globals).set(name, value);
    }
    for (&kind, &class) in &leaves {
        let name = vm.heap.intern_string(kind.name());
        vm.heap.get_namespace_mut(vm.globals).set(name, Value::Class(class));
    }

    ExceptionClasses {
        throwable,
        exception,
        error,
        leaves,
        message_field,
        cause_field,
    }
}

/// Turn a raw `NativeError` into a freshly allocated `Instance` of the
/// matching leaf class, ready to be thrown (§7, §4.7).
pub fn instantiate(vm: &mut Vm, classes: &ExceptionClasses, err: NativeError) -> Value {
    let class = classes.leaf(err.kind);
    let msg = vm.heap.intern_string(&err.message);
    let mut fields = HashMap::new();
    fields.insert(classes.message_field, Value::String(msg));
    fields.insert(classes.cause_field, Value::Null);
    let instance = InstanceObj::new(class, fields, HashMap::new());
    Value::Instance(vm.alloc_instance(instance))
}

/// §4.7 "cause chaining": wrap `new_err`, recording `cause` as its cause
/// field, for a `throw` that occurs while unwinding from another.
pub fn instantiate_with_cause(
    vm: &mut Vm,
    classes: &ExceptionClasses,
    err: NativeError,
    cause: Value,
) -> Value {
    let v = instantiate(vm, classes, err);
    if let Value::Instance(handle) = v {
        vm.heap
            .get_instance_mut(handle)
            .set_field(classes.cause_field, cause);
    }
    v
}

/// Walk `value`'s class chain looking for `target` (§7: `catch` matches a
/// thrown instance whose class is `target` or a subclass of it).
pub fn is_instance_of(
    vm: &Vm,
    value: Value,
    target: GcRef<croc_core::objects::class::ClassObj>,
) -> bool {
    let Value::Instance(handle) = value else {
        return false;
    };
    let mut class = Some(vm.heap.get_instance(handle).class);
    while let Some(c) = class {
        if c == target {
            return true;
        }
        class = vm.heap.get_class(c).parent;
    }
    false
}
