//! Plain-data encoding of a `FuncDef` (§4.9, §6): constants, instructions,
//! upvalue descriptors, switch tables and debug info. None of this nests a
//! `GcRef`, so unlike the graph serializer's heap-object kinds a `FuncDef`
//! body never needs back-reference shelling — `inner` funcdefs are encoded
//! inline, the same way the compiler embeds them.
//!
//! Shared by the graph serializer (a `FuncDefObj` is one of its
//! back-reference-tracked kinds) and the module bytecode format (§6),
//! which wraps exactly one top-level `FuncDef` per compiled module.

use croc_core::bytecode::{Constant, DebugInfo, FuncDef, Instruction, LocalVarInfo, SwitchTable, TypeMask, UpvalSource};

use crate::wire::{Reader, Truncated, Writer};

pub fn write_funcdef(w: &mut Writer, fd: &FuncDef) {
    w.str(&fd.name);
    w.uvarint(fd.num_params as u64);
    w.uvarint(fd.max_params as u64);
    w.u8(fd.is_vararg as u8);
    w.uvarint(fd.num_locals as u64);

    w.uvarint(fd.constants.len() as u64);
    for k in &fd.constants {
        write_constant(w, k);
    }

    w.uvarint(fd.code.len() as u64);
    for instr in &fd.code {
        write_instruction(w, instr);
    }

    w.uvarint(fd.upvals.len() as u64);
    for u in &fd.upvals {
        match u {
            UpvalSource::ParentLocal(i) => {
                w.u8(0);
                w.uvarint(*i as u64);
            }
            UpvalSource::ParentUpval(i) => {
                w.u8(1);
                w.uvarint(*i as u64);
            }
        }
    }

    w.uvarint(fd.inner.len() as u64);
    for inner in &fd.inner {
        write_funcdef(w, inner);
    }

    w.uvarint(fd.param_type_masks.len() as u64);
    for m in &fd.param_type_masks {
        w.uvarint(m.0 as u64);
    }

    w.uvarint(fd.switch_tables.len() as u64);
    for t in &fd.switch_tables {
        w.uvarint(t.cases.len() as u64);
        for (konst, target) in &t.cases {
            w.uvarint(*konst as u64);
            w.uvarint(*target as u64);
        }
    }

    write_debug_info(w, &fd.debug);
}

pub fn read_funcdef(r: &mut Reader) -> Result<FuncDef, Truncated> {
    let name: Box<str> = r.str()?.into();
    let num_params = r.uvarint()? as u32;
    let max_params = r.uvarint()? as u32;
    let is_vararg = r.u8()? != 0;
    let num_locals = r.uvarint()? as u32;

    let nconst = r.uvarint()?;
    let mut constants = Vec::with_capacity(nconst as usize);
    for _ in 0..nconst {
        constants.push(read_constant(r)?);
    }

    let ncode = r.uvarint()?;
    let mut code = Vec::with_capacity(ncode as usize);
    for _ in 0..ncode {
        code.push(read_instruction(r)?);
    }

    let nupvals = r.uvarint()?;
    let mut upvals = Vec::with_capacity(nupvals as usize);
    for _ in 0..nupvals {
        let kind = r.u8()?;
        let idx = r.uvarint()? as u32;
        upvals.push(match kind {
            0 => UpvalSource::ParentLocal(idx),
            _ => UpvalSource::ParentUpval(idx),
        });
    }

    let ninner = r.uvarint()?;
    let mut inner = Vec::with_capacity(ninner as usize);
    for _ in 0..ninner {
        inner.push(read_funcdef(r)?);
    }

    let nmasks = r.uvarint()?;
    let mut param_type_masks = Vec::with_capacity(nmasks as usize);
    for _ in 0..nmasks {
        param_type_masks.push(TypeMask(r.uvarint()? as u32));
    }

    let ntables = r.uvarint()?;
    let mut switch_tables = Vec::with_capacity(ntables as usize);
    for _ in 0..ntables {
        let ncases = r.uvarint()?;
        let mut cases = Vec::with_capacity(ncases as usize);
        for _ in 0..ncases {
            let konst = r.uvarint()? as u32;
            let target = r.uvarint()? as u32;
            cases.push((konst, target));
        }
        switch_tables.push(SwitchTable { cases });
    }

    let debug = read_debug_info(r)?;

    Ok(FuncDef {
        name,
        num_params,
        max_params,
        is_vararg,
        num_locals,
        constants,
        code,
        upvals,
        inner,
        param_type_masks,
        switch_tables,
        debug,
    })
}

fn write_debug_info(w: &mut Writer, d: &DebugInfo) {
    w.uvarint(d.lines.len() as u64);
    for l in &d.lines {
        w.uvarint(*l as u64);
    }
    w.str(&d.source_name);
    w.uvarint(d.locals.len() as u64);
    for l in &d.locals {
        w.str(&l.name);
        w.uvarint(l.slot as u64);
        w.uvarint(l.start_pc as u64);
        w.uvarint(l.end_pc as u64);
    }
}

fn read_debug_info(r: &mut Reader) -> Result<DebugInfo, Truncated> {
    let nlines = r.uvarint()?;
    let mut lines = Vec::with_capacity(nlines as usize);
    for _ in 0..nlines {
        lines.push(r.uvarint()? as u32);
    }
    let source_name: Box<str> = r.str()?.into();
    let nlocals = r.uvarint()?;
    let mut locals = Vec::with_capacity(nlocals as usize);
    for _ in 0..nlocals {
        let name: Box<str> = r.str()?.into();
        let slot = r.uvarint()? as u32;
        let start_pc = r.uvarint()? as u32;
        let end_pc = r.uvarint()? as u32;
        locals.push(LocalVarInfo { name, slot, start_pc, end_pc });
    }
    Ok(DebugInfo { lines, source_name, locals })
}

fn write_constant(w: &mut Writer, k: &Constant) {
    match k {
        Constant::Null => w.u8(0),
        Constant::Bool(b) => {
            w.u8(1);
            w.u8(*b as u8);
        }
        Constant::Int(i) => {
            w.u8(2);
            w.svarint(*i);
        }
        Constant::Float(f) => {
            w.u8(3);
            w.f64(*f);
        }
        Constant::String(s) => {
            w.u8(4);
            w.str(s);
        }
    }
}

fn read_constant(r: &mut Reader) -> Result<Constant, Truncated> {
    Ok(match r.u8()? {
        0 => Constant::Null,
        1 => Constant::Bool(r.u8()? != 0),
        2 => Constant::Int(r.svarint()?),
        3 => Constant::Float(r.f64()?),
        4 => Constant::String(r.str()?.into()),
        _ => return Err(Truncated),
    })
}

/// One byte per opcode, in declaration order. Stable only within one
/// `FORMAT_VERSION` of the graph/module format (see `serializer.rs`).
fn write_instruction(w: &mut Writer, instr: &Instruction) {
    use Instruction::*;
    match instr {
        LoadConst { dst, konst } => {
            w.u8(0);
            w.uvarint(*dst as u64);
            w.uvarint(*konst as u64);
        }
        LoadNull { dst } => {
            w.u8(1);
            w.uvarint(*dst as u64);
        }
        LoadBool { dst, value } => {
            w.u8(2);
            w.uvarint(*dst as u64);
            w.u8(*value as u8);
        }
        Move { dst, src } => {
            w.u8(3);
            w.uvarint(*dst as u64);
            w.uvarint(*src as u64);
        }
        MultiMove { dst, src, count } => {
            w.u8(4);
            w.uvarint(*dst as u64);
            w.uvarint(*src as u64);
            w.uvarint(*count as u64);
        }
        GetGlobal { dst, name } => {
            w.u8(5);
            w.uvarint(*dst as u64);
            w.uvarint(*name as u64);
        }
        SetGlobal { name, src } => {
            w.u8(6);
            w.uvarint(*name as u64);
            w.uvarint(*src as u64);
        }
        GetUpval { dst, upval } => {
            w.u8(7);
            w.uvarint(*dst as u64);
            w.uvarint(*upval as u64);
        }
        SetUpval { upval, src } => {
            w.u8(8);
            w.uvarint(*upval as u64);
            w.uvarint(*src as u64);
        }
        GetNamespace { dst, ns, name } => {
            w.u8(9);
            w.uvarint(*dst as u64);
            w.uvarint(*ns as u64);
            w.uvarint(*name as u64);
        }
        SetNamespace { ns, name, src } => {
            w.u8(10);
            w.uvarint(*ns as u64);
            w.uvarint(*name as u64);
            w.uvarint(*src as u64);
        }
        Index { dst, container, key } => {
            w.u8(11);
            w.uvarint(*dst as u64);
            w.uvarint(*container as u64);
            w.uvarint(*key as u64);
        }
        IndexAssign { container, key, src } => {
            w.u8(12);
            w.uvarint(*container as u64);
            w.uvarint(*key as u64);
            w.uvarint(*src as u64);
        }
        Slice { dst, container, lo, hi } => {
            w.u8(13);
            w.uvarint(*dst as u64);
            w.uvarint(*container as u64);
            w.uvarint(*lo as u64);
            w.uvarint(*hi as u64);
        }
        Add { dst, lhs, rhs } => write_triop(w, 14, *dst, *lhs, *rhs),
        Sub { dst, lhs, rhs } => write_triop(w, 15, *dst, *lhs, *rhs),
        Mul { dst, lhs, rhs } => write_triop(w, 16, *dst, *lhs, *rhs),
        Div { dst, lhs, rhs } => write_triop(w, 17, *dst, *lhs, *rhs),
        Mod { dst, lhs, rhs } => write_triop(w, 18, *dst, *lhs, *rhs),
        Neg { dst, src } => {
            w.u8(19);
            w.uvarint(*dst as u64);
            w.uvarint(*src as u64);
        }
        BitAnd { dst, lhs, rhs } => write_triop(w, 20, *dst, *lhs, *rhs),
        BitOr { dst, lhs, rhs } => write_triop(w, 21, *dst, *lhs, *rhs),
        BitXor { dst, lhs, rhs } => write_triop(w, 22, *dst, *lhs, *rhs),
        Shl { dst, lhs, rhs } => write_triop(w, 23, *dst, *lhs, *rhs),
        Shr { dst, lhs, rhs } => write_triop(w, 24, *dst, *lhs, *rhs),
        BitNot { dst, src } => {
            w.u8(25);
            w.uvarint(*dst as u64);
            w.uvarint(*src as u64);
        }
        Cmp { dst, lhs, rhs } => write_triop(w, 26, *dst, *lhs, *rhs),
        Eq { dst, lhs, rhs } => write_triop(w, 27, *dst, *lhs, *rhs),
        Not { dst, src } => {
            w.u8(28);
            w.uvarint(*dst as u64);
            w.uvarint(*src as u64);
        }
        Cat { dst, base, count } => {
            w.u8(29);
            w.uvarint(*dst as u64);
            w.uvarint(*base as u64);
            w.uvarint(*count as u64);
        }
        Jmp { target } => {
            w.u8(30);
            w.uvarint(*target as u64);
        }
        JmpIf { cond, target } => {
            w.u8(31);
            w.uvarint(*cond as u64);
            w.uvarint(*target as u64);
        }
        JmpIfNot { cond, target } => {
            w.u8(32);
            w.uvarint(*cond as u64);
            w.uvarint(*target as u64);
        }
        ForPrep { base, target } => {
            w.u8(33);
            w.uvarint(*base as u64);
            w.uvarint(*target as u64);
        }
        ForLoop { base, target } => {
            w.u8(34);
            w.uvarint(*base as u64);
            w.uvarint(*target as u64);
        }
        ForeachPrep { base, target } => {
            w.u8(35);
            w.uvarint(*base as u64);
            w.uvarint(*target as u64);
        }
        ForeachLoop { base, target } => {
            w.u8(36);
            w.uvarint(*base as u64);
            w.uvarint(*target as u64);
        }
        Closure { dst, funcdef } => {
            w.u8(37);
            w.uvarint(*dst as u64);
            w.uvarint(*funcdef as u64);
        }
        Call { func, nargs, nresults } => {
            w.u8(38);
            w.uvarint(*func as u64);
            w.uvarint(*nargs as u64);
            write_opt_u32(w, *nresults);
        }
        TailCall { func, nargs } => {
            w.u8(39);
            w.uvarint(*func as u64);
            w.uvarint(*nargs as u64);
        }
        Return { base, count } => {
            w.u8(40);
            w.uvarint(*base as u64);
            write_opt_u32(w, *count);
        }
        Vararg { dst, count } => {
            w.u8(41);
            w.uvarint(*dst as u64);
            write_opt_u32(w, *count);
        }
        NewClass { dst, name, parent } => {
            w.u8(42);
            w.uvarint(*dst as u64);
            w.uvarint(*name as u64);
            write_opt_u32(w, *parent);
        }
        NewInstance { dst, class } => {
            w.u8(43);
            w.uvarint(*dst as u64);
            w.uvarint(*class as u64);
        }
        Method { dst, object, name } => {
            w.u8(44);
            w.uvarint(*dst as u64);
            w.uvarint(*object as u64);
            w.uvarint(*name as u64);
        }
        PushCatch { exc_slot, handler } => {
            w.u8(45);
            w.uvarint(*exc_slot as u64);
            w.uvarint(*handler as u64);
        }
        PushFinally { handler } => {
            w.u8(46);
            w.uvarint(*handler as u64);
        }
        PopHandler => w.u8(47),
        Throw { src } => {
            w.u8(48);
            w.uvarint(*src as u64);
        }
        EndFinally => w.u8(49),
        Switch { src, table, default } => {
            w.u8(50);
            w.uvarint(*src as u64);
            w.uvarint(*table as u64);
            w.uvarint(*default as u64);
        }
        Yield { base, count, nresults } => {
            w.u8(51);
            w.uvarint(*base as u64);
            write_opt_u32(w, *count);
            write_opt_u32(w, *nresults);
        }
        Halt => w.u8(52),
    }
}

fn write_triop(w: &mut Writer, op: u8, dst: u32, lhs: u32, rhs: u32) {
    w.u8(op);
    w.uvarint(dst as u64);
    w.uvarint(lhs as u64);
    w.uvarint(rhs as u64);
}

fn write_opt_u32(w: &mut Writer, v: Option<u32>) {
    match v {
        Some(n) => {
            w.u8(1);
            w.uvarint(n as u64);
        }
        None => w.u8(0),
    }
}

fn read_opt_u32(r: &mut Reader) -> Result<Option<u32>, Truncated> {
    Ok(match r.u8()? {
        0 => None,
        _ => Some(r.uvarint()? as u32),
    })
}

fn read_triop(r: &mut Reader) -> Result<(u32, u32, u32), Truncated> {
    Ok((r.uvarint()? as u32, r.uvarint()? as u32, r.uvarint()? as u32))
}

fn read_instruction(r: &mut Reader) -> Result<Instruction, Truncated> {
    use Instruction::*;
    Ok(match r.u8()? {
        0 => LoadConst { dst: r.uvarint()? as u32, konst: r.uvarint()? as u32 },
        1 => LoadNull { dst: r.uvarint()? as u32 },
        2 => LoadBool { dst: r.uvarint()? as u32, value: r.u8()? != 0 },
        3 => Move { dst: r.uvarint()? as u32, src: r.uvarint()? as u32 },
        4 => MultiMove { dst: r.uvarint()? as u32, src: r.uvarint()? as u32, count: r.uvarint()? as u32 },
        5 => GetGlobal { dst: r.uvarint()? as u32, name: r.uvarint()? as u32 },
        6 => SetGlobal { name: r.uvarint()? as u32, src: r.uvarint()? as u32 },
        7 => GetUpval { dst: r.uvarint()? as u32, upval: r.uvarint()? as u32 },
        8 => SetUpval { upval: r.uvarint()? as u32, src: r.uvarint()? as u32 },
        9 => GetNamespace { dst: r.uvarint()? as u32, ns: r.uvarint()? as u32, name: r.uvarint()? as u32 },
        10 => SetNamespace { ns: r.uvarint()? as u32, name: r.uvarint()? as u32, src: r.uvarint()? as u32 },
        11 => Index { dst: r.uvarint()? as u32, container: r.uvarint()? as u32, key: r.uvarint()? as u32 },
        12 => IndexAssign { container: r.uvarint()? as u32, key: r.uvarint()? as u32, src: r.uvarint()? as u32 },
        13 => Slice {
            dst: r.uvarint()? as u32,
            container: r.uvarint()? as u32,
            lo: r.uvarint()? as u32,
            hi: r.uvarint()? as u32,
        },
        14 => {
            let (dst, lhs, rhs) = read_triop(r)?;
            Add { dst, lhs, rhs }
        }
        15 => {
            let (dst, lhs, rhs) = read_triop(r)?;
            Sub { dst, lhs, rhs }
        }
        16 => {
            let (dst, lhs, rhs) = read_triop(r)?;
            Mul { dst, lhs, rhs }
        }
        17 => {
            let (dst, lhs, rhs) = read_triop(r)?;
            Div { dst, lhs, rhs }
        }
        18 => {
            let (dst, lhs, rhs) = read_triop(r)?;
            Mod { dst, lhs, rhs }
        }
        19 => Neg { dst: r.uvarint()? as u32, src: r.uvarint()? as u32 },
        20 => {
            let (dst, lhs, rhs) = read_triop(r)?;
            BitAnd { dst, lhs, rhs }
        }
        21 => {
            let (dst, lhs, rhs) = read_triop(r)?;
            BitOr { dst, lhs, rhs }
        }
        22 => {
            let (dst, lhs, rhs) = read_triop(r)?;
            BitXor { dst, lhs, rhs }
        }
        23 => {
            let (dst, lhs, rhs) = read_triop(r)?;
            Shl { dst, lhs, rhs }
        }
        24 => {
            let (dst, lhs, rhs) = read_triop(r)?;
            Shr { dst, lhs, rhs }
        }
        25 => BitNot { dst: r.uvarint()? as u32, src: r.uvarint()? as u32 },
        26 => {
            let (dst, lhs, rhs) = read_triop(r)?;
            Cmp { dst, lhs, rhs }
        }
        27 => {
            let (dst, lhs, rhs) = read_triop(r)?;
            Eq { dst, lhs, rhs }
        }
        28 => Not { dst: r.uvarint()? as u32, src: r.uvarint()? as u32 },
        29 => Cat { dst: r.uvarint()? as u32, base: r.uvarint()? as u32, count: r.uvarint()? as u32 },
        30 => Jmp { target: r.uvarint()? as u32 },
        31 => JmpIf { cond: r.uvarint()? as u32, target: r.uvarint()? as u32 },
        32 => JmpIfNot { cond: r.uvarint()? as u32, target: r.uvarint()? as u32 },
        33 => ForPrep { base: r.uvarint()? as u32, target: r.uvarint()? as u32 },
        34 => ForLoop { base: r.uvarint()? as u32, target: r.uvarint()? as u32 },
        35 => ForeachPrep { base: r.uvarint()? as u32, target: r.uvarint()? as u32 },
        36 => ForeachLoop { base: r.uvarint()? as u32, target: r.uvarint()? as u32 },
        37 => Closure { dst: r.uvarint()? as u32, funcdef: r.uvarint()? as u32 },
        38 => Call { func: r.uvarint()? as u32, nargs: r.uvarint()? as u32, nresults: read_opt_u32(r)? },
        39 => TailCall { func: r.uvarint()? as u32, nargs: r.uvarint()? as u32 },
        40 => Return { base: r.uvarint()? as u32, count: read_opt_u32(r)? },
        41 => Vararg { dst: r.uvarint()? as u32, count: read_opt_u32(r)? },
        42 => NewClass { dst: r.uvarint()? as u32, name: r.uvarint()? as u32, parent: read_opt_u32(r)? },
        43 => NewInstance { dst: r.uvarint()? as u32, class: r.uvarint()? as u32 },
        44 => Method { dst: r.uvarint()? as u32, object: r.uvarint()? as u32, name: r.uvarint()? as u32 },
        45 => PushCatch { exc_slot: r.uvarint()? as u32, handler: r.uvarint()? as u32 },
        46 => PushFinally { handler: r.uvarint()? as u32 },
        47 => PopHandler,
        48 => Throw { src: r.uvarint()? as u32 },
        49 => EndFinally,
        50 => Switch { src: r.uvarint()? as u32, table: r.uvarint()? as u32, default: r.uvarint()? as u32 },
        51 => Yield { base: r.uvarint()? as u32, count: read_opt_u32(r)?, nresults: read_opt_u32(r)? },
        52 => Halt,
        _ => return Err(Truncated),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use croc_core::bytecode::UpvalSource;

    fn sample_funcdef() -> FuncDef {
        FuncDef {
            name: "f".into(),
            num_params: 1,
            max_params: 1,
            is_vararg: false,
            num_locals: 2,
            constants: vec![Constant::Int(7), Constant::String("hi".into())],
            code: vec![
                Instruction::LoadConst { dst: 0, konst: 0 },
                Instruction::Add { dst: 1, lhs: 0, rhs: 0 },
                Instruction::Return { base: 1, count: Some(1) },
            ],
            upvals: vec![UpvalSource::ParentLocal(0), UpvalSource::ParentUpval(1)],
            inner: vec![],
            param_type_masks: vec![TypeMask::ANY],
            switch_tables: vec![SwitchTable { cases: vec![(0, 10)] }],
            debug: DebugInfo {
                lines: vec![1, 1, 2],
                source_name: "test.croc".into(),
                locals: vec![LocalVarInfo { name: "x".into(), slot: 0, start_pc: 0, end_pc: 3 }],
            },
        }
    }

    #[test]
    fn funcdef_roundtrips() {
        let fd = sample_funcdef();
        let mut w = Writer::new();
        write_funcdef(&mut w, &fd);
        let mut r = Reader::new(&w.buf);
        let fd2 = read_funcdef(&mut r).unwrap();
        assert_eq!(fd, fd2);
        assert_eq!(r.pos, w.buf.len());
    }

    #[test]
    fn nested_inner_funcdefs_roundtrip() {
        let mut outer = sample_funcdef();
        outer.inner.push(sample_funcdef());
        let mut w = Writer::new();
        write_funcdef(&mut w, &outer);
        let mut r = Reader::new(&w.buf);
        assert_eq!(read_funcdef(&mut r).unwrap(), outer);
    }
}
