//! Shared helpers for the integration tests: small constructors for
//! resolved AST nodes (standing in for the external parser/resolver) and a
//! ground-truth checker that re-verifies every compiled funcode against
//! the emitted byte stream.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};

use starling::syntax::{Arg, BinOp, Binding, Expr, Ident, Literal, Pos, Scope, Stmt};
use starling::{decode_op, Dialect, Funcode, Opcode, Program, StackEffect};

pub fn pos(line: u32) -> Pos {
    Pos::new(line, 1)
}

pub fn ident(name: &str, scope: Scope, index: u32) -> Ident {
    Ident {
        name: name.to_string(),
        pos: pos(1),
        binding: Binding::new(scope, index),
    }
}

pub fn local(name: &str, index: u32) -> Ident {
    ident(name, Scope::Local, index)
}

pub fn global(name: &str, index: u32) -> Ident {
    ident(name, Scope::Global, index)
}

pub fn var(id: &Ident) -> Expr {
    Expr::Ident(id.clone())
}

pub fn int(v: i64) -> Expr {
    Expr::Literal {
        pos: pos(1),
        value: Literal::Int(v),
    }
}

pub fn str_lit(s: &str) -> Expr {
    Expr::Literal {
        pos: pos(1),
        value: Literal::Str(s.to_string()),
    }
}

pub fn binary(op: BinOp, x: Expr, y: Expr) -> Expr {
    Expr::Binary {
        pos: pos(1),
        op,
        x: Box::new(x),
        y: Box::new(y),
    }
}

pub fn assign(lhs: &Ident, rhs: Expr) -> Stmt {
    Stmt::Assign {
        pos: pos(1),
        lhs: var(lhs),
        rhs,
    }
}

pub fn call(func: &Ident, args: Vec<Arg>) -> Expr {
    Expr::Call {
        pos: pos(1),
        func: Box::new(var(func)),
        args,
    }
}

/// The decoded instructions of a funcode as `(op, arg)` pairs.
pub fn ops(fc: &Funcode) -> Vec<(Opcode, u32)> {
    fc.instructions().map(|(_, op, arg)| (op, arg)).collect()
}

/// Just the opcodes, when operands don't matter to the assertion.
pub fn op_list(fc: &Funcode) -> Vec<Opcode> {
    fc.instructions().map(|(_, op, _)| op).collect()
}

/// The pc of the `n`th (0-based) occurrence of `op`.
pub fn pc_of(fc: &Funcode, op: Opcode, n: usize) -> u32 {
    fc.instructions()
        .filter(|&(_, o, _)| o == op)
        .nth(n)
        .unwrap_or_else(|| panic!("no {op} #{n} in {}", fc.name))
        .0
}

/// Verify a whole program: every funcode re-checks against its own byte
/// stream and passes the validator with everything enabled.
pub fn check_program(prog: &Program) {
    check_funcode(prog, &prog.toplevel);
    for f in &prog.functions {
        check_funcode(prog, f);
    }
}

/// Ground-truth properties of one funcode:
///
/// - linear decoding from pc 0 ends exactly at the code length;
/// - every branch operand is a decoded instruction boundary;
/// - re-running the stack from depth 0 along every path yields depths
///   that are non-negative, bounded by `max_stack`, and equal wherever
///   paths merge;
/// - the validator accepts it with all dialect features on.
pub fn check_funcode(prog: &Program, fc: &Funcode) {
    let mut insns: BTreeMap<u32, (Opcode, u32, u32)> = BTreeMap::new();
    let mut pc: u32 = 0;
    while (pc as usize) < fc.code.len() {
        let (op, arg, next) = decode_op(&fc.code, pc)
            .unwrap_or_else(|| panic!("undecodable instruction at pc {pc} in {}", fc.name));
        insns.insert(pc, (op, arg, next));
        pc = next;
    }
    assert_eq!(
        pc as usize,
        fc.code.len(),
        "linear decode of {} does not end at the code length",
        fc.name
    );

    for (&pc, &(op, arg, _)) in &insns {
        if matches!(
            op,
            Opcode::Jmp | Opcode::CJmp | Opcode::IterJmp | Opcode::ExceptPush
        ) {
            assert!(
                insns.contains_key(&arg),
                "{op} at pc {pc} targets {arg}, not an instruction boundary"
            );
        }
    }

    let max = i64::from(fc.max_stack);
    let mut depths: HashMap<u32, i64> = HashMap::new();
    let mut work: Vec<(u32, i64)> = Vec::new();
    if !fc.code.is_empty() {
        work.push((0, 0));
    }
    while let Some((pc, depth)) = work.pop() {
        if let Some(&seen) = depths.get(&pc) {
            assert_eq!(
                seen, depth,
                "paths disagree on the stack depth at pc {pc} in {}",
                fc.name
            );
            continue;
        }
        depths.insert(pc, depth);
        assert!(depth >= 0 && depth <= max, "depth {depth} at pc {pc}");

        let (op, arg, next) = insns[&pc];
        match op {
            Opcode::Return => {}
            Opcode::Jmp => work.push((arg, depth)),
            Opcode::CJmp => {
                let d = depth - 1;
                assert!(d >= 0, "underflow at cjmp, pc {pc}");
                work.push((arg, d));
                work.push((next, d));
            }
            Opcode::IterJmp => {
                // Taken: the iterator is dropped, nothing pushed.
                // Fall-through: the next element is on the stack.
                work.push((arg, depth));
                work.push((next, depth + 1));
            }
            Opcode::ExceptPush => {
                work.push((arg, depth));
                work.push((next, depth));
            }
            _ => {
                let d = apply_effect(op, arg, depth);
                assert!(d <= max, "depth {d} exceeds max_stack at pc {pc}");
                work.push((next, d));
            }
        }
    }

    fc.validate(prog, &Dialect::default(), |_| true, |_| true)
        .unwrap_or_else(|e| panic!("freshly compiled {} fails validation: {e}", fc.name));
}

fn apply_effect(op: Opcode, arg: u32, depth: i64) -> i64 {
    let a = i64::from(arg);
    let (pops, pushes) = match op.stack_effect() {
        StackEffect::Fixed { pops, pushes } => (i64::from(pops), i64::from(pushes)),
        StackEffect::Variable => match op {
            Opcode::Call => (1 + (a >> 8) + 2 * (a & 0xff), 1),
            Opcode::CallVar | Opcode::CallKw => (2 + (a >> 8) + 2 * (a & 0xff), 1),
            Opcode::CallVarKw => (3 + (a >> 8) + 2 * (a & 0xff), 1),
            Opcode::Load => (a + 1, a),
            Opcode::MakeList | Opcode::MakeTuple => (a, 1),
            Opcode::Unpack => (1, a),
            other => panic!("unhandled variable-effect opcode {other}"),
        },
    };
    let d = depth - pops;
    assert!(d >= 0, "stack underflow at {op}");
    d + pushes
}
