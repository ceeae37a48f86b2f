//! Module bytecode container (§6): the file format a compiled module is
//! shipped as. Distinct from the graph serializer (`serialize.rs`) — a
//! module is always exactly one `[name, FuncDef]` pair, never an arbitrary
//! `Value` graph, so it gets its own small framing rather than going
//! through back-reference bookkeeping it has no use for.

use croc_core::bytecode::FuncDef;
use croc_core::heap::GcObject;
use croc_core::objects::function::{FuncDefObj, FunctionObj};
use croc_core::{GcRef, Vm};

use crate::funcdef_wire::{read_funcdef, write_funcdef};
use crate::wire::{Reader, Truncated, Writer};

const MAGIC: &[u8; 4] = b"Croc";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleFormatError {
    BadMagic,
    Truncated,
    /// §6: a module's top-level `FuncDef` must be cacheable (no free
    /// upvalues) — it's closed exactly once, over the module's own
    /// top-level namespace, the first time the module is imported.
    NotCacheable,
}

impl From<Truncated> for ModuleFormatError {
    fn from(_: Truncated) -> Self {
        ModuleFormatError::Truncated
    }
}

/// Encode `name` and `top_level` as a module (§6). Fails if `top_level`
/// isn't cacheable — a module body with free upvalues would mean
/// re-importing it produces closures capturing different things each
/// time, which the import cache (one `Function` per module, ever) can't
/// represent.
pub fn write_module(name: &str, top_level: &FuncDef) -> Result<Vec<u8>, ModuleFormatError> {
    if !top_level.is_cacheable() {
        return Err(ModuleFormatError::NotCacheable);
    }
    let mut w = Writer::new();
    w.buf.extend_from_slice(MAGIC);
    w.str(name);
    write_funcdef(&mut w, top_level);
    Ok(w.buf)
}

pub fn read_module(data: &[u8]) -> Result<(Box<str>, FuncDef), ModuleFormatError> {
    if data.len() < MAGIC.len() || &data[..MAGIC.len()] != MAGIC {
        return Err(ModuleFormatError::BadMagic);
    }
    let mut r = Reader::new(&data[MAGIC.len()..]);
    let name: Box<str> = r.str()?.into();
    let top_level = read_funcdef(&mut r)?;
    if !top_level.is_cacheable() {
        return Err(ModuleFormatError::NotCacheable);
    }
    Ok((name, top_level))
}

/// Close a module's top-level `FuncDef` into a callable `Function`, over
/// `vm.globals` (§6: a module's top level runs with the global namespace
/// as its environment, the same as the implicit main chunk). Mirrors
/// `interpreter::make_closure`'s shape for the one case it never handles
/// itself — a `FuncDef` with no enclosing frame to capture upvalues
/// from — which is exactly why `write_module`/`read_module` above refuse
/// a non-cacheable one: there is no `ParentLocal` slot to read here.
pub fn instantiate_module(vm: &mut Vm, top_level: FuncDef) -> GcRef<FunctionObj> {
    debug_assert!(top_level.is_cacheable());
    let def_handle = vm.heap.alloc(GcObject::FuncDef(FuncDefObj::new(top_level)), 128);
    let closure = FunctionObj::Script {
        funcdef: def_handle,
        upvals: Vec::new(),
        env: vm.globals,
    };
    let handle = vm.heap.alloc(GcObject::Function(closure), 64);
    vm.heap.get_funcdef(def_handle).cached_closure.set(Some(handle));
    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use croc_core::bytecode::{DebugInfo, FuncDef};

    fn empty_module(name: &str) -> FuncDef {
        FuncDef {
            name: name.into(),
            num_params: 0,
            max_params: 0,
            is_vararg: false,
            num_locals: 0,
            constants: Vec::new(),
            code: Vec::new(),
            upvals: Vec::new(),
            inner: Vec::new(),
            param_type_masks: Vec::new(),
            switch_tables: Vec::new(),
            debug: DebugInfo::default(),
        }
    }

    #[test]
    fn round_trips_name_and_body() {
        let fd = empty_module("main");
        let bytes = write_module("mymodule", &fd).unwrap();
        assert_eq!(&bytes[..4], b"Croc");
        let (name, back) = read_module(&bytes).unwrap();
        assert_eq!(&*name, "mymodule");
        assert_eq!(back.name.as_ref(), "main");
    }

    #[test]
    fn rejects_bad_magic() {
        let err = read_module(&[0, 1, 2, 3, 4]).unwrap_err();
        assert_eq!(err, ModuleFormatError::BadMagic);
    }
}
