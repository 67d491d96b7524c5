//! Human-readable instruction dumps for debugging and tests.

use std::fmt::Write;

use crate::opcode::Opcode;
use crate::program::{Funcode, Program};

/// Render one instruction, resolving the operand against the program's
/// pools where that helps a human: the constant's value, the function,
/// variable, or attribute name, or the call arity.
pub fn print_op(prog: &Program, fcode: &Funcode, pc: u32, op: Opcode, arg: u32) -> String {
    if !op.has_arg() {
        return format!("{pc}\t{op}");
    }
    let comment = match op {
        Opcode::Constant => prog.constants.get(arg as usize).map(|c| c.to_string()),
        Opcode::MakeFunc => prog.functions.get(arg as usize).map(|f| f.name.clone()),
        Opcode::Local | Opcode::SetLocal => {
            fcode.locals.get(arg as usize).map(|id| id.name.clone())
        }
        Opcode::Free => fcode.freevars.get(arg as usize).map(|id| id.name.clone()),
        Opcode::Global | Opcode::SetGlobal => {
            prog.globals.get(arg as usize).map(|id| id.name.clone())
        }
        Opcode::Attr | Opcode::SetField | Opcode::Predeclared | Opcode::Universal => {
            prog.names.get(arg as usize).cloned()
        }
        Opcode::Call | Opcode::CallVar | Opcode::CallKw | Opcode::CallVarKw => {
            Some(format!("{} pos, {} named", arg >> 8, arg & 0xff))
        }
        _ => None,
    };
    match comment {
        Some(comment) => format!("{pc}\t{op} {arg}\t; {comment}"),
        None => format!("{pc}\t{op} {arg}"),
    }
}

/// Disassemble a whole funcode, one instruction per line.
pub fn disassemble(prog: &Program, fcode: &Funcode) -> String {
    let mut out = String::new();
    for (pc, op, arg) in fcode.instructions() {
        let _ = writeln!(out, "{}", print_op(prog, fcode, pc, op, arg));
    }
    out
}
