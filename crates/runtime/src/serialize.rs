//! Object-graph serializer (§4.9, §6).
//!
//! A self-contained byte stream for a `Value` graph that preserves
//! reference identity — including cycles — via back-reference IDs
//! assigned the first time each heap object is visited, not after the
//! fact. A [`Transients`] implementation lets the host substitute a named
//! placeholder for a value that has no sensible on-wire form (an open
//! file handle, a window, ...) instead of failing the whole write; the
//! same name resolves back to a live value on read.
//!
//! Grounded in the teacher's `bincode`-based report snapshots for the
//! framing idea (a fixed header, length-prefixed fields) but the
//! back-reference bookkeeping and the `opSerialize`/`opDeserialize` hook
//! dispatch have no teacher counterpart; built directly off the
//! reference-object invariants, the way `funcdef_wire.rs`'s plain-data
//! sibling encoder was.

use std::collections::HashMap;

use croc_core::handle::GcRef;
use croc_core::heap::GcObject;
use croc_core::objects::array::ArrayObj;
use croc_core::objects::function::{FuncDefObj, FunctionObj, UpvalueObj};
use croc_core::objects::instance::InstanceObj;
use croc_core::objects::memblock::MemblockObj;
use croc_core::objects::namespace::NamespaceObj;
use croc_core::objects::table::TableObj;
use croc_core::objects::thread::ThreadObj;
use croc_core::objects::weakref::referent_slot;
use croc_core::value::{TableKey, TableKeyError, Value};
use croc_core::Vm;

use crate::exceptions::ExceptionClasses;
use crate::funcdef_wire::{read_funcdef, write_funcdef};
use crate::interpreter::{self, Outcome};
use crate::wire::{Reader, Truncated, Writer};

/// Every stream opens with this many bytes identifying the host that
/// wrote it: magic byte, pointer width, `int` size, `float` size, format
/// version. A reader that doesn't match word size or float size refuses
/// the stream outright rather than silently misinterpreting its bytes.
pub const SIGNATURE_LEN: usize = 5;
const MAGIC: u8 = 0xC8;
const FORMAT_VERSION: u8 = 1;

fn signature() -> [u8; SIGNATURE_LEN] {
    [
        MAGIC,
        std::mem::size_of::<usize>() as u8,
        std::mem::size_of::<i64>() as u8,
        std::mem::size_of::<f64>() as u8,
        FORMAT_VERSION,
    ]
}

/// Lets the host intercept values with no on-wire representation.
pub trait Transients {
    /// Called before every reference-typed value is written. Returning
    /// `Some(name)` writes a placeholder instead of the value's contents.
    fn substitute(&self, vm: &Vm, v: Value) -> Option<Box<str>>;
    /// Called when a placeholder is read back; `None` fails the read.
    fn resolve(&self, vm: &mut Vm, name: &str) -> Option<Value>;
}

/// Substitutes nothing; every forbidden value becomes a hard error.
pub struct NoTransients;

impl Transients for NoTransients {
    fn substitute(&self, _vm: &Vm, _v: Value) -> Option<Box<str>> {
        None
    }
    fn resolve(&self, _vm: &mut Vm, _name: &str) -> Option<Value> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializeError {
    /// A value kind §4.9 forbids outright (a live thread, a borrowed
    /// memblock, an open upvalue, a finalizable instance, ...) reached the
    /// writer with no transient substituting it.
    Forbidden(&'static str),
    /// `opSerialize` ran but didn't leave exactly one result on the stack.
    HookArity,
    BadSignature,
    UnresolvedTransient(Box<str>),
    Truncated,
    InvalidTableKey,
}

impl From<Truncated> for SerializeError {
    fn from(_: Truncated) -> Self {
        SerializeError::Truncated
    }
}

impl From<TableKeyError> for SerializeError {
    fn from(_: TableKeyError) -> Self {
        SerializeError::InvalidTableKey
    }
}

const TAG_NULL: u8 = 0;
const TAG_FALSE: u8 = 1;
const TAG_TRUE: u8 = 2;
const TAG_INT: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_STRING: u8 = 5;
const TAG_MEMBLOCK: u8 = 6;
const TAG_ARRAY: u8 = 7;
const TAG_TABLE: u8 = 8;
const TAG_NAMESPACE: u8 = 9;
const TAG_FUNCTION: u8 = 10;
const TAG_FUNCDEF: u8 = 11;
const TAG_CLASS: u8 = 12;
const TAG_INSTANCE_DEFAULT: u8 = 13;
const TAG_INSTANCE_HOOKED: u8 = 14;
const TAG_BACKREF: u8 = 15;
const TAG_TRANSIENT: u8 = 16;

/// Serialize `root` and everything reachable from it into a byte stream.
/// `thread` is only used as the call stack `opSerialize` hooks run on; it
/// is left exactly as it was found once this returns.
pub fn serialize(
    vm: &mut Vm,
    classes: &ExceptionClasses,
    thread: GcRef<ThreadObj>,
    transients: &dyn Transients,
    root: Value,
) -> Result<Vec<u8>, SerializeError> {
    let mut w = Writer::new();
    w.buf.extend_from_slice(&signature());
    let mut seen = HashMap::new();
    write_value(vm, classes, thread, transients, &mut w, &mut seen, root)?;
    Ok(w.buf)
}

fn write_value(
    vm: &mut Vm,
    classes: &ExceptionClasses,
    thread: GcRef<ThreadObj>,
    transients: &dyn Transients,
    w: &mut Writer,
    seen: &mut HashMap<u32, u32>,
    v: Value,
) -> Result<(), SerializeError> {
    match v {
        Value::Null => {
            w.u8(TAG_NULL);
            Ok(())
        }
        Value::Bool(false) => {
            w.u8(TAG_FALSE);
            Ok(())
        }
        Value::Bool(true) => {
            w.u8(TAG_TRUE);
            Ok(())
        }
        Value::Int(i) => {
            w.u8(TAG_INT);
            w.svarint(i);
            Ok(())
        }
        Value::Float(f) => {
            w.u8(TAG_FLOAT);
            w.f64(f);
            Ok(())
        }
        _ => write_reference(vm, classes, thread, transients, w, seen, v),
    }
}

fn write_reference(
    vm: &mut Vm,
    classes: &ExceptionClasses,
    thread: GcRef<ThreadObj>,
    transients: &dyn Transients,
    w: &mut Writer,
    seen: &mut HashMap<u32, u32>,
    v: Value,
) -> Result<(), SerializeError> {
    // Transient substitution wins even over a value that would otherwise
    // serialize fine — the host knows which identities matter on the far
    // side better than we do.
    if let Some(name) = transients.substitute(vm, v) {
        w.u8(TAG_TRANSIENT);
        w.str(&name);
        return Ok(());
    }

    let slot = referent_slot(&v).expect("write_value routes value kinds to write_reference only for reference types");
    if let Some(&id) = seen.get(&slot) {
        w.u8(TAG_BACKREF);
        w.uvarint(id as u64);
        return Ok(());
    }
    let id = seen.len() as u32;
    seen.insert(slot, id);

    match v {
        Value::String(s) => {
            w.u8(TAG_STRING);
            w.str(vm.heap.get_string(s).as_str());
        }
        Value::Memblock(m) => {
            let block = vm.heap.get_memblock(m);
            if !block.is_owned() {
                return Err(SerializeError::Forbidden("borrowed memblock"));
            }
            w.u8(TAG_MEMBLOCK);
            w.bytes(block.as_slice());
        }
        Value::Array(a) => {
            w.u8(TAG_ARRAY);
            let values: Vec<Value> = vm.heap.get_array(a).iter().copied().collect();
            w.uvarint(values.len() as u64);
            for elem in values {
                write_value(vm, classes, thread, transients, w, seen, elem)?;
            }
        }
        Value::Table(t) => {
            w.u8(TAG_TABLE);
            let entries: Vec<(Value, Value)> = vm
                .heap
                .get_table(t)
                .iter()
                .map(|(k, v)| (k.0, *v))
                .collect();
            w.uvarint(entries.len() as u64);
            for (k, val) in entries {
                write_value(vm, classes, thread, transients, w, seen, k)?;
                write_value(vm, classes, thread, transients, w, seen, val)?;
            }
        }
        Value::Namespace(n) => {
            w.u8(TAG_NAMESPACE);
            let name = vm.heap.get_namespace(n).name;
            write_value(vm, classes, thread, transients, w, seen, Value::String(name))?;
            let parent = vm.heap.get_namespace(n).parent;
            write_option_ref(vm, classes, thread, transients, w, seen, parent.map(Value::Namespace))?;
            let entries: Vec<(Value, Value)> = vm
                .heap
                .get_namespace(n)
                .iter()
                .map(|(k, v)| (Value::String(*k), *v))
                .collect();
            w.uvarint(entries.len() as u64);
            for (k, val) in entries {
                write_value(vm, classes, thread, transients, w, seen, k)?;
                write_value(vm, classes, thread, transients, w, seen, val)?;
            }
        }
        Value::FuncDef(fd) => {
            w.u8(TAG_FUNCDEF);
            write_funcdef(w, &vm.heap.get_funcdef(fd).def);
        }
        Value::Function(f) => {
            let (funcdef, upvals, env) = match vm.heap.get_function(f) {
                FunctionObj::Native { .. } => {
                    return Err(SerializeError::Forbidden("native function"))
                }
                FunctionObj::Script { funcdef, upvals, env } => {
                    (*funcdef, upvals.clone(), *env)
                }
            };
            w.u8(TAG_FUNCTION);
            write_value(vm, classes, thread, transients, w, seen, Value::FuncDef(funcdef))?;
            write_value(vm, classes, thread, transients, w, seen, Value::Namespace(env))?;
            w.uvarint(upvals.len() as u64);
            for uv in upvals {
                if vm.heap.get_upvalue(uv).is_open() {
                    return Err(SerializeError::Forbidden("open upvalue"));
                }
                let value = vm.heap.get_upvalue(uv).get(&[]);
                write_value(vm, classes, thread, transients, w, seen, value)?;
            }
        }
        Value::Class(c) => {
            w.u8(TAG_CLASS);
            let name = vm.heap.get_class(c).name;
            write_value(vm, classes, thread, transients, w, seen, Value::String(name))?;
            let parent = vm.heap.get_class(c).parent;
            write_option_ref(vm, classes, thread, transients, w, seen, parent.map(Value::Class))?;
            w.u8(vm.heap.get_class(c).frozen as u8);
            let constructor = vm.heap.get_class(c).constructor.map(Value::Function);
            write_option_ref(vm, classes, thread, transients, w, seen, constructor)?;
            let finalizer = vm.heap.get_class(c).finalizer.map(Value::Function);
            write_option_ref(vm, classes, thread, transients, w, seen, finalizer)?;
            write_name_value_map(vm, classes, thread, transients, w, seen, c, MapKind::Field)?;
            write_name_value_map(vm, classes, thread, transients, w, seen, c, MapKind::Hidden)?;
            write_name_value_map(vm, classes, thread, transients, w, seen, c, MapKind::Method)?;
        }
        Value::Instance(i) => {
            if vm.heap.get_class(vm.heap.get_instance(i).class).is_finalizable() {
                return Err(SerializeError::Forbidden("finalizable instance"));
            }
            let class = vm.heap.get_instance(i).class;
            let hook_name = vm.heap.intern_string("opSerialize");
            let hook = interpreter::lookup_method(vm, Value::Instance(i), hook_name);
            if let Some(Value::Function(hook_fn)) = hook {
                let outcome = interpreter::call_sync(vm, classes, thread, hook_fn, vec![Value::Instance(i)]);
                let payload = match outcome {
                    Outcome::Returned(mut results) if results.len() == 1 => results.pop().unwrap(),
                    Outcome::Returned(_) => return Err(SerializeError::HookArity),
                    Outcome::Yielded(_) => return Err(SerializeError::HookArity),
                    Outcome::Threw(_) => return Err(SerializeError::HookArity),
                };
                w.u8(TAG_INSTANCE_HOOKED);
                write_value(vm, classes, thread, transients, w, seen, Value::Class(class))?;
                write_value(vm, classes, thread, transients, w, seen, payload)?;
            } else {
                w.u8(TAG_INSTANCE_DEFAULT);
                write_value(vm, classes, thread, transients, w, seen, Value::Class(class))?;
                let fields: Vec<(Value, Value)> = vm
                    .heap
                    .get_instance(i)
                    .fields_iter()
                    .map(|(k, v)| (Value::String(*k), *v))
                    .collect();
                w.uvarint(fields.len() as u64);
                for (k, val) in fields {
                    write_value(vm, classes, thread, transients, w, seen, k)?;
                    write_value(vm, classes, thread, transients, w, seen, val)?;
                }
                let hidden: Vec<(Value, Value)> = vm
                    .heap
                    .get_instance(i)
                    .hidden_fields_iter()
                    .map(|(k, v)| (Value::String(*k), *v))
                    .collect();
                w.uvarint(hidden.len() as u64);
                for (k, val) in hidden {
                    write_value(vm, classes, thread, transients, w, seen, k)?;
                    write_value(vm, classes, thread, transients, w, seen, val)?;
                }
            }
        }
        Value::Thread(_) => return Err(SerializeError::Forbidden("thread")),
        Value::WeakRef(_) => return Err(SerializeError::Forbidden("weak reference")),
        Value::NativeObj(_) => return Err(SerializeError::Forbidden("native object")),
        Value::Upvalue(_) => return Err(SerializeError::Forbidden("bare upvalue")),
        Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) => unreachable!(),
    }
    Ok(())
}

enum MapKind {
    Field,
    Hidden,
    Method,
}

fn write_name_value_map(
    vm: &mut Vm,
    classes: &ExceptionClasses,
    thread: GcRef<ThreadObj>,
    transients: &dyn Transients,
    w: &mut Writer,
    seen: &mut HashMap<u32, u32>,
    class: GcRef<croc_core::objects::class::ClassObj>,
    kind: MapKind,
) -> Result<(), SerializeError> {
    let entries: Vec<(Value, Value)> = {
        let c = vm.heap.get_class(class);
        match kind {
            MapKind::Field => c.fields_iter().map(|(k, v)| (Value::String(*k), *v)).collect(),
            MapKind::Hidden => c.hidden_iter().map(|(k, v)| (Value::String(*k), *v)).collect(),
            MapKind::Method => c.methods_iter().map(|(k, v)| (Value::String(*k), *v)).collect(),
        }
    };
    w.uvarint(entries.len() as u64);
    for (k, v) in entries {
        write_value(vm, classes, thread, transients, w, seen, k)?;
        write_value(vm, classes, thread, transients, w, seen, v)?;
    }
    Ok(())
}

fn write_option_ref(
    vm: &mut Vm,
    classes: &ExceptionClasses,
    thread: GcRef<ThreadObj>,
    transients: &dyn Transients,
    w: &mut Writer,
    seen: &mut HashMap<u32, u32>,
    v: Option<Value>,
) -> Result<(), SerializeError> {
    match v {
        None => {
            w.u8(0);
            Ok(())
        }
        Some(v) => {
            w.u8(1);
            write_value(vm, classes, thread, transients, w, seen, v)
        }
    }
}

/// Deserialize a stream produced by [`serialize`]. `thread` is the call
/// stack `opDeserialize` hooks run on.
pub fn deserialize(
    vm: &mut Vm,
    classes: &ExceptionClasses,
    thread: GcRef<ThreadObj>,
    transients: &dyn Transients,
    data: &[u8],
) -> Result<Value, SerializeError> {
    if data.len() < SIGNATURE_LEN || data[..SIGNATURE_LEN] != signature() {
        return Err(SerializeError::BadSignature);
    }
    let mut r = Reader::new(&data[SIGNATURE_LEN..]);
    let mut backrefs: Vec<Value> = Vec::new();
    read_value(vm, classes, thread, transients, &mut r, &mut backrefs)
}

fn read_value(
    vm: &mut Vm,
    classes: &ExceptionClasses,
    thread: GcRef<ThreadObj>,
    transients: &dyn Transients,
    r: &mut Reader,
    backrefs: &mut Vec<Value>,
) -> Result<Value, SerializeError> {
    let tag = r.u8()?;
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_FALSE => Ok(Value::Bool(false)),
        TAG_TRUE => Ok(Value::Bool(true)),
        TAG_INT => Ok(Value::Int(r.svarint()?)),
        TAG_FLOAT => Ok(Value::Float(r.f64()?)),
        TAG_BACKREF => {
            let id = r.uvarint()? as usize;
            backrefs
                .get(id)
                .copied()
                .ok_or(SerializeError::Truncated)
        }
        TAG_TRANSIENT => {
            let name = r.str()?;
            transients
                .resolve(vm, name)
                .ok_or_else(|| SerializeError::UnresolvedTransient(name.into()))
        }
        TAG_STRING => {
            let s = r.str()?;
            let handle = vm.heap.intern_string(s);
            let v = Value::String(handle);
            backrefs.push(v);
            Ok(v)
        }
        TAG_MEMBLOCK => {
            let bytes = r.bytes()?.to_vec();
            let size = bytes.len() + 24;
            let handle = vm
                .heap
                .alloc(GcObject::Memblock(MemblockObj::owned(bytes)), size);
            let v = Value::Memblock(handle);
            backrefs.push(v);
            Ok(v)
        }
        TAG_ARRAY => {
            let len = r.uvarint()? as usize;
            let handle = vm.alloc_array(vec![Value::Null; len]);
            let v = Value::Array(handle);
            backrefs.push(v);
            for i in 0..len {
                let elem = read_value(vm, classes, thread, transients, r, backrefs)?;
                vm.heap
                    .get_array_mut(handle)
                    .set(i as i64, elem)
                    .expect("index within the length just allocated");
            }
            Ok(v)
        }
        TAG_TABLE => {
            let len = r.uvarint()? as usize;
            let handle = vm.alloc_table();
            let v = Value::Table(handle);
            backrefs.push(v);
            for _ in 0..len {
                let key = read_value(vm, classes, thread, transients, r, backrefs)?;
                let val = read_value(vm, classes, thread, transients, r, backrefs)?;
                vm.heap.get_table_mut(handle).insert(TableKey::try_new(key)?, val);
            }
            Ok(v)
        }
        TAG_NAMESPACE => {
            let name_v = read_value(vm, classes, thread, transients, r, backrefs)?;
            let Value::String(name) = name_v else {
                return Err(SerializeError::Truncated);
            };
            let handle = vm.alloc_namespace(name, None);
            let v = Value::Namespace(handle);
            backrefs.push(v);
            let has_parent = r.u8()? != 0;
            if has_parent {
                let parent_v = read_value(vm, classes, thread, transients, r, backrefs)?;
                if let Value::Namespace(parent) = parent_v {
                    vm.heap.get_namespace_mut(handle).parent = Some(parent);
                }
            }
            let nentries = r.uvarint()? as usize;
            for _ in 0..nentries {
                let key = read_value(vm, classes, thread, transients, r, backrefs)?;
                let val = read_value(vm, classes, thread, transients, r, backrefs)?;
                if let Value::String(key) = key {
                    vm.heap.get_namespace_mut(handle).set(key, val);
                }
            }
            Ok(v)
        }
        TAG_FUNCDEF => {
            let def = read_funcdef(r)?;
            let size = 128;
            let handle = vm.heap.alloc(GcObject::FuncDef(FuncDefObj::new(def)), size);
            let v = Value::FuncDef(handle);
            backrefs.push(v);
            Ok(v)
        }
        TAG_FUNCTION => {
            let funcdef_v = read_value(vm, classes, thread, transients, r, backrefs)?;
            let Value::FuncDef(funcdef) = funcdef_v else {
                return Err(SerializeError::Truncated);
            };
            let env_v = read_value(vm, classes, thread, transients, r, backrefs)?;
            let Value::Namespace(env) = env_v else {
                return Err(SerializeError::Truncated);
            };
            let nupvals = r.uvarint()? as usize;
            let mut upvals = Vec::with_capacity(nupvals);
            for _ in 0..nupvals {
                let value = read_value(vm, classes, thread, transients, r, backrefs)?;
                let uv = vm
                    .heap
                    .alloc(GcObject::Upvalue(UpvalueObj::closed(thread, value)), 24);
                upvals.push(uv);
            }
            let handle = vm.heap.alloc(
                GcObject::Function(FunctionObj::Script { funcdef, upvals, env }),
                64,
            );
            let v = Value::Function(handle);
            backrefs.push(v);
            Ok(v)
        }
        TAG_CLASS => {
            let name_v = read_value(vm, classes, thread, transients, r, backrefs)?;
            let Value::String(name) = name_v else {
                return Err(SerializeError::Truncated);
            };
            let has_parent = r.u8()? != 0;
            let parent = if has_parent {
                match read_value(vm, classes, thread, transients, r, backrefs)? {
                    Value::Class(p) => Some(p),
                    _ => return Err(SerializeError::Truncated),
                }
            } else {
                None
            };
            let handle = vm.alloc_class(name, parent);
            let v = Value::Class(handle);
            backrefs.push(v);
            let frozen = r.u8()? != 0;

            let ctor_present = r.u8()? != 0;
            if ctor_present {
                if let Value::Function(f) = read_value(vm, classes, thread, transients, r, backrefs)? {
                    vm.heap.get_class_mut(handle).constructor = Some(f);
                }
            }
            let fin_present = r.u8()? != 0;
            if fin_present {
                if let Value::Function(f) = read_value(vm, classes, thread, transients, r, backrefs)? {
                    vm.heap.get_class_mut(handle).finalizer = Some(f);
                }
            }
            read_into_class_map(vm, classes, thread, transients, r, backrefs, handle, MapKind::Field)?;
            read_into_class_map(vm, classes, thread, transients, r, backrefs, handle, MapKind::Hidden)?;
            read_into_class_map(vm, classes, thread, transients, r, backrefs, handle, MapKind::Method)?;
            if frozen {
                vm.heap.get_class_mut(handle).freeze();
            }
            Ok(v)
        }
        TAG_INSTANCE_DEFAULT => {
            let class_v = read_value(vm, classes, thread, transients, r, backrefs)?;
            let Value::Class(class) = class_v else {
                return Err(SerializeError::Truncated);
            };
            let handle = vm.alloc_instance(InstanceObj::new(class, Default::default(), Default::default()));
            let v = Value::Instance(handle);
            backrefs.push(v);
            let nfields = r.uvarint()? as usize;
            for _ in 0..nfields {
                let key = read_value(vm, classes, thread, transients, r, backrefs)?;
                let val = read_value(vm, classes, thread, transients, r, backrefs)?;
                if let Value::String(key) = key {
                    vm.heap.get_instance_mut(handle).insert_field(key, val);
                }
            }
            let nhidden = r.uvarint()? as usize;
            for _ in 0..nhidden {
                let key = read_value(vm, classes, thread, transients, r, backrefs)?;
                let val = read_value(vm, classes, thread, transients, r, backrefs)?;
                if let Value::String(key) = key {
                    vm.heap.get_instance_mut(handle).insert_hidden_field(key, val);
                }
            }
            Ok(v)
        }
        TAG_INSTANCE_HOOKED => {
            let class_v = read_value(vm, classes, thread, transients, r, backrefs)?;
            let Value::Class(class) = class_v else {
                return Err(SerializeError::Truncated);
            };
            let handle = vm.alloc_instance(InstanceObj::new(class, Default::default(), Default::default()));
            let v = Value::Instance(handle);
            backrefs.push(v);
            let payload = read_value(vm, classes, thread, transients, r, backrefs)?;
            let hook_name = vm.heap.intern_string("opDeserialize");
            if let Some(Value::Function(hook_fn)) = interpreter::lookup_method(vm, v, hook_name) {
                interpreter::call_sync(vm, classes, thread, hook_fn, vec![v, payload]);
            }
            Ok(v)
        }
        _ => Err(SerializeError::Truncated),
    }
}

fn read_into_class_map(
    vm: &mut Vm,
    classes: &ExceptionClasses,
    thread: GcRef<ThreadObj>,
    transients: &dyn Transients,
    r: &mut Reader,
    backrefs: &mut Vec<Value>,
    class: GcRef<croc_core::objects::class::ClassObj>,
    kind: MapKind,
) -> Result<(), SerializeError> {
    let n = r.uvarint()? as usize;
    for _ in 0..n {
        let key = read_value(vm, classes, thread, transients, r, backrefs)?;
        let val = read_value(vm, classes, thread, transients, r, backrefs)?;
        let Value::String(key) = key else {
            return Err(SerializeError::Truncated);
        };
        let result = match kind {
            MapKind::Field => vm.heap.get_class_mut(class).add_field(key, val),
            MapKind::Hidden => vm.heap.get_class_mut(class).add_hidden_field(key, val),
            MapKind::Method => vm.heap.get_class_mut(class).add_method(key, val),
        };
        result.expect("a freshly read class is never frozen before this loop finishes");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exceptions;

    fn setup() -> (Vm, ExceptionClasses, GcRef<ThreadObj>) {
        let mut vm = Vm::new(1 << 20);
        let classes = exceptions::bootstrap(&mut vm);
        let thread = vm.main_thread;
        (vm, classes, thread)
    }

    #[test]
    fn scalars_roundtrip() {
        let (mut vm, classes, thread) = setup();
        for v in [Value::Null, Value::Bool(true), Value::Int(-7), Value::Float(2.5)] {
            let bytes = serialize(&mut vm, &classes, thread, &NoTransients, v).unwrap();
            let back = deserialize(&mut vm, &classes, thread, &NoTransients, &bytes).unwrap();
            assert_eq!(v, back);
        }
    }

    #[test]
    fn string_content_roundtrips_through_interning() {
        let (mut vm, classes, thread) = setup();
        let s = vm.heap.intern_string("hello graph");
        let bytes = serialize(&mut vm, &classes, thread, &NoTransients, Value::String(s)).unwrap();
        let back = deserialize(&mut vm, &classes, thread, &NoTransients, &bytes).unwrap();
        assert_eq!(Value::String(s), back);
    }

    #[test]
    fn self_referential_table_round_trips_by_identity() {
        let (mut vm, classes, thread) = setup();
        let t = vm.alloc_table();
        let key = TableKey::try_new(Value::String(vm.heap.intern_string("self"))).unwrap();
        vm.heap.get_table_mut(t).insert(key, Value::Table(t));

        let bytes = serialize(&mut vm, &classes, thread, &NoTransients, Value::Table(t)).unwrap();
        let back = deserialize(&mut vm, &classes, thread, &NoTransients, &bytes).unwrap();

        let Value::Table(restored) = back else {
            panic!("expected a table back");
        };
        let self_key = TableKey::try_new(Value::String(vm.heap.intern_string("self"))).unwrap();
        assert_eq!(vm.heap.get_table(restored).get(&self_key), Some(Value::Table(restored)));
    }

    #[test]
    fn native_function_is_forbidden_without_a_transient() {
        let (mut vm, classes, thread) = setup();
        fn dummy(_vm: &mut Vm, _t: GcRef<ThreadObj>, _n: u32) -> Result<u32, croc_core::error::NativeError> {
            Ok(0)
        }
        let f = vm.heap.alloc(
            GcObject::Function(FunctionObj::Native {
                name: "dummy".into(),
                func: dummy,
                upvals: Vec::new(),
            }),
            64,
        );
        let err = serialize(&mut vm, &classes, thread, &NoTransients, Value::Function(f)).unwrap_err();
        assert_eq!(err, SerializeError::Forbidden("native function"));
    }

    #[test]
    fn thread_value_is_forbidden() {
        let (mut vm, classes, thread) = setup();
        let err = serialize(&mut vm, &classes, thread, &NoTransients, Value::Thread(thread)).unwrap_err();
        assert_eq!(err, SerializeError::Forbidden("thread"));
    }

    #[test]
    fn bad_signature_is_rejected() {
        let (mut vm, classes, thread) = setup();
        let err = deserialize(&mut vm, &classes, thread, &NoTransients, &[0, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err, SerializeError::BadSignature);
    }
}
