//! `Value`: what the language talks about (§3.1).
//!
//! A tagged union over the fixed-order type list from the spec. Value types
//! (`Null`/`Bool`/`Int`/`Float`) are inline; everything else is a `Copy`
//! handle into the heap, so `Value` itself is `Copy` — pushing, popping and
//! duplicating it on a thread's stack never touches the allocator.

use std::hash::{Hash, Hasher};

use crate::handle::GcRef;
use crate::objects::array::ArrayObj;
use crate::objects::class::ClassObj;
use crate::objects::function::{FuncDefObj, FunctionObj, UpvalueObj};
use crate::objects::instance::InstanceObj;
use crate::objects::memblock::MemblockObj;
use crate::objects::namespace::NamespaceObj;
use crate::objects::nativeobj::NativeObjData;
use crate::objects::table::TableObj;
use crate::objects::thread::ThreadObj;
use crate::objects::weakref::WeakRefObj;
use crate::objects::strings::StringObj;

/// Type discriminant, in the fixed order §3.1 specifies. The order is load
/// bearing: `TypeMask` bitsets (§4.6 parameter type masks) index by this
/// enum's discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum ValueTag {
    Null = 0,
    Bool = 1,
    Int = 2,
    Float = 3,
    NativeObj = 4,
    String = 5,
    WeakRef = 6,
    Table = 7,
    Namespace = 8,
    Array = 9,
    Memblock = 10,
    Function = 11,
    FuncDef = 12,
    Class = 13,
    Instance = 14,
    Thread = 15,
    /// Internal: never observable as the tag of a script-visible `Value`,
    /// but part of the same tagged union for GC and serializer purposes.
    Upvalue = 16,
}

impl ValueTag {
    pub const COUNT: usize = 17;

    pub fn name(self) -> &'static str {
        match self {
            ValueTag::Null => "null",
            ValueTag::Bool => "bool",
            ValueTag::Int => "int",
            ValueTag::Float => "float",
            ValueTag::NativeObj => "nativeobj",
            ValueTag::String => "string",
            ValueTag::WeakRef => "weakref",
            ValueTag::Table => "table",
            ValueTag::Namespace => "namespace",
            ValueTag::Array => "array",
            ValueTag::Memblock => "memblock",
            ValueTag::Function => "function",
            ValueTag::FuncDef => "funcdef",
            ValueTag::Class => "class",
            ValueTag::Instance => "instance",
            ValueTag::Thread => "thread",
            ValueTag::Upvalue => "upvalue",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    NativeObj(GcRef<NativeObjData>),
    String(GcRef<StringObj>),
    WeakRef(GcRef<WeakRefObj>),
    Table(GcRef<TableObj>),
    Namespace(GcRef<NamespaceObj>),
    Array(GcRef<ArrayObj>),
    Memblock(GcRef<MemblockObj>),
    Function(GcRef<FunctionObj>),
    FuncDef(GcRef<FuncDefObj>),
    Class(GcRef<ClassObj>),
    Instance(GcRef<InstanceObj>),
    Thread(GcRef<ThreadObj>),
    /// Internal-only: closed-over-variable cell. Never constructed from
    /// script-visible code; exists on the stack only while an upvalue is
    /// being opened/closed by the interpreter.
    Upvalue(GcRef<UpvalueObj>),
}

impl Value {
    pub fn tag(&self) -> ValueTag {
        match self {
            Value::Null => ValueTag::Null,
            Value::Bool(_) => ValueTag::Bool,
            Value::Int(_) => ValueTag::Int,
            Value::Float(_) => ValueTag::Float,
            Value::NativeObj(_) => ValueTag::NativeObj,
            Value::String(_) => ValueTag::String,
            Value::WeakRef(_) => ValueTag::WeakRef,
            Value::Table(_) => ValueTag::Table,
            Value::Namespace(_) => ValueTag::Namespace,
            Value::Array(_) => ValueTag::Array,
            Value::Memblock(_) => ValueTag::Memblock,
            Value::Function(_) => ValueTag::Function,
            Value::FuncDef(_) => ValueTag::FuncDef,
            Value::Class(_) => ValueTag::Class,
            Value::Instance(_) => ValueTag::Instance,
            Value::Thread(_) => ValueTag::Thread,
            Value::Upvalue(_) => ValueTag::Upvalue,
        }
    }

    /// §3.1 truthiness: exactly `null`, `false`, `0`, `0.0` (and `-0.0`,
    /// since `-0.0 == 0.0` bitwise-irrelevant here — we compare by value)
    /// are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            _ => true,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Acyclic reference types, per §4.2: these never need the cycle
    /// collector because their contents can't form a reference cycle
    /// through further reference-typed fields reachable from script code.
    pub fn is_acyclic_kind(tag: ValueTag) -> bool {
        matches!(
            tag,
            ValueTag::NativeObj | ValueTag::String | ValueTag::WeakRef | ValueTag::Memblock
        )
    }

    /// Identity/bit-pattern equality per §3.1 and testable property 1:
    /// never invokes a metamethod, and distinct tags are always unequal.
    pub fn raw_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits() || a == b,
            (Value::NativeObj(a), Value::NativeObj(b)) => a.slot() == b.slot(),
            (Value::String(a), Value::String(b)) => a.slot() == b.slot(),
            (Value::WeakRef(a), Value::WeakRef(b)) => a.slot() == b.slot(),
            (Value::Table(a), Value::Table(b)) => a.slot() == b.slot(),
            (Value::Namespace(a), Value::Namespace(b)) => a.slot() == b.slot(),
            (Value::Array(a), Value::Array(b)) => a.slot() == b.slot(),
            (Value::Memblock(a), Value::Memblock(b)) => a.slot() == b.slot(),
            (Value::Function(a), Value::Function(b)) => a.slot() == b.slot(),
            (Value::FuncDef(a), Value::FuncDef(b)) => a.slot() == b.slot(),
            (Value::Class(a), Value::Class(b)) => a.slot() == b.slot(),
            (Value::Instance(a), Value::Instance(b)) => a.slot() == b.slot(),
            (Value::Thread(a), Value::Thread(b)) => a.slot() == b.slot(),
            (Value::Upvalue(a), Value::Upvalue(b)) => a.slot() == b.slot(),
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.raw_eq(other)
    }
}

/// A hashable, insertable table key: value types hash by bit pattern,
/// reference types hash by identity (§3.1), `null` and `NaN` are rejected
/// before a `TableKey` is ever constructed (§3.2, enforced by
/// `TableObj::insert`).
#[derive(Debug, Clone, Copy)]
pub struct TableKey(pub Value);

impl PartialEq for TableKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.raw_eq(&other.0)
    }
}

impl Eq for TableKey {}

impl Hash for TableKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&tag_discriminant(&self.0)).hash(state);
        match &self.0 {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            // `raw_eq` treats `0.0` and `-0.0` as equal (they compare
            // equal under `==`), so their hashes must agree too — normalize
            // signed zero before hashing the bit pattern.
            Value::Float(f) => {
                let bits = if *f == 0.0 { 0u64 } else { f.to_bits() };
                bits.hash(state);
            }
            Value::NativeObj(r) => r.slot().hash(state),
            Value::String(r) => r.slot().hash(state),
            Value::WeakRef(r) => r.slot().hash(state),
            Value::Table(r) => r.slot().hash(state),
            Value::Namespace(r) => r.slot().hash(state),
            Value::Array(r) => r.slot().hash(state),
            Value::Memblock(r) => r.slot().hash(state),
            Value::Function(r) => r.slot().hash(state),
            Value::FuncDef(r) => r.slot().hash(state),
            Value::Class(r) => r.slot().hash(state),
            Value::Instance(r) => r.slot().hash(state),
            Value::Thread(r) => r.slot().hash(state),
            Value::Upvalue(r) => r.slot().hash(state),
        }
    }
}

/// Returns a unit value carrying only the tag's discriminant, so
/// `TableKey`'s `Hash` impl folds the tag into the hash without a second
/// match arm duplicating `Value::tag`.
fn tag_discriminant(v: &Value) -> ValueTag {
    v.tag()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKeyError {
    NullKey,
    NanKey,
}

impl TableKey {
    pub fn try_new(v: Value) -> Result<TableKey, TableKeyError> {
        match v {
            Value::Null => Err(TableKeyError::NullKey),
            Value::Float(f) if f.is_nan() => Err(TableKeyError::NanKey),
            other => Ok(TableKey(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_tags_are_never_equal() {
        // Property 1: Int(0) vs Bool(false) share "falsy" but must compare
        // unequal without ever consulting a metamethod table.
        assert!(!Value::Int(0).raw_eq(&Value::Bool(false)));
        assert!(!Value::Null.raw_eq(&Value::Int(0)));
        assert!(!Value::Float(0.0).raw_eq(&Value::Int(0)));
    }

    #[test]
    fn truthiness_matches_property_2() {
        let falsy = [
            Value::Null,
            Value::Bool(false),
            Value::Int(0),
            Value::Float(0.0),
            Value::Float(-0.0),
        ];
        for v in falsy {
            assert!(!v.is_truthy(), "{v:?} should be falsy");
        }
        let truthy = [
            Value::Bool(true),
            Value::Int(1),
            Value::Int(-1),
            Value::Float(0.1),
            Value::Float(f64::NAN),
        ];
        for v in truthy {
            assert!(v.is_truthy(), "{v:?} should be truthy");
        }
    }

    #[test]
    fn table_key_rejects_null_and_nan() {
        assert_eq!(TableKey::try_new(Value::Null), Err(TableKeyError::NullKey));
        assert_eq!(
            TableKey::try_new(Value::Float(f64::NAN)),
            Err(TableKeyError::NanKey)
        );
        assert!(TableKey::try_new(Value::Int(5)).is_ok());
    }

    #[test]
    fn positive_and_negative_zero_keys_hash_equal() {
        use std::hash::{BuildHasher, Hash, Hasher};

        let pos = TableKey::try_new(Value::Float(0.0)).unwrap();
        let neg = TableKey::try_new(Value::Float(-0.0)).unwrap();
        assert_eq!(pos, neg, "0.0 and -0.0 must compare equal as table keys");

        let hasher_builder = std::collections::hash_map::RandomState::new();
        let hash_of = |k: &TableKey| {
            let mut h = hasher_builder.build_hasher();
            k.hash(&mut h);
            h.finish()
        };
        assert_eq!(
            hash_of(&pos),
            hash_of(&neg),
            "equal keys must hash equal, or HashMap lookups silently miss"
        );
    }
}
