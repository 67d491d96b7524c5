//! Post-compile validation: re-walk a funcode's byte stream and check
//! every operand against the pools it indexes, plus the dialect gates.
//!
//! A freshly compiled funcode always validates with every dialect feature
//! enabled; validation earns its keep when a program is reloaded from
//! storage or checked against a narrower dialect than it was compiled
//! under.

use crate::codec;
use crate::error::{Error, Result};
use crate::opcode::Opcode;
use crate::program::{Funcode, Program};

/// The optional language features a host may enable. Gated opcodes are
/// rejected by [`Funcode::validate`] when their feature is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    /// `try`/`except` statements (`ERROR`, `EXCEPTPUSH`, `EXCEPTPOP`).
    pub allow_try_except: bool,
    /// Bitwise operators (`AMP`, `PIPE`, `CARET`, `SHL`, `SHR`, `TILDE`).
    pub allow_bitwise: bool,
    /// Sets (`MAKESET`).
    pub allow_set: bool,
}

impl Default for Dialect {
    /// Everything enabled.
    fn default() -> Self {
        Dialect {
            allow_try_except: true,
            allow_bitwise: true,
            allow_set: true,
        }
    }
}

impl Funcode {
    /// Check every instruction of this funcode against the program's
    /// pools and the dialect gates.
    ///
    /// The predicates say which `PREDECLARED`/`UNIVERSAL` names the host
    /// actually provides; pass `|_| true` to accept any.
    pub fn validate(
        &self,
        prog: &Program,
        dialect: &Dialect,
        is_predeclared: impl Fn(&str) -> bool,
        is_universal: impl Fn(&str) -> bool,
    ) -> Result<()> {
        let code = &self.code;
        let mut pc: u32 = 0;
        while (pc as usize) < code.len() {
            let start = pc;
            let byte = code[pc as usize];
            let op = Opcode::from_u8(byte).ok_or(Error::IllegalOpcode { pc: start, op: byte })?;
            pc += 1;

            self.check_dialect(start, op, dialect)?;

            if !op.has_arg() {
                continue;
            }
            let (arg, next) = codec::decode_operand(code, pc)
                .ok_or(Error::TruncatedOperand { pc: start, op })?;
            pc = next;

            let out_of_range = |pool: &'static str, limit: u32| Error::OutOfRange {
                pc: start,
                op,
                arg,
                pool,
                limit,
            };

            match op {
                Opcode::Local | Opcode::SetLocal => {
                    if arg as usize >= self.locals.len() {
                        return Err(out_of_range("locals", self.locals.len() as u32));
                    }
                }
                Opcode::Free => {
                    if arg as usize >= self.freevars.len() {
                        return Err(out_of_range("free variables", self.freevars.len() as u32));
                    }
                }
                Opcode::Global | Opcode::SetGlobal => {
                    if arg as usize >= prog.globals.len() {
                        return Err(out_of_range("globals", prog.globals.len() as u32));
                    }
                }
                Opcode::Attr | Opcode::SetField | Opcode::Predeclared | Opcode::Universal => {
                    if arg as usize >= prog.names.len() {
                        return Err(out_of_range("names", prog.names.len() as u32));
                    }
                    let name = &prog.names[arg as usize];
                    if op == Opcode::Predeclared && !is_predeclared(name) {
                        return Err(Error::UnknownName {
                            pc: start,
                            op,
                            kind: "predeclared name",
                            name: name.clone(),
                        });
                    }
                    if op == Opcode::Universal && !is_universal(name) {
                        return Err(Error::UnknownName {
                            pc: start,
                            op,
                            kind: "universal name",
                            name: name.clone(),
                        });
                    }
                }
                Opcode::Constant => {
                    if arg as usize >= prog.constants.len() {
                        return Err(out_of_range("constants", prog.constants.len() as u32));
                    }
                }
                Opcode::MakeFunc => {
                    if arg as usize >= prog.functions.len() {
                        return Err(out_of_range("functions", prog.functions.len() as u32));
                    }
                }
                Opcode::Jmp | Opcode::CJmp | Opcode::IterJmp | Opcode::ExceptPush => {
                    if arg as usize >= code.len() {
                        return Err(out_of_range("code", code.len() as u32));
                    }
                }
                Opcode::Load => {
                    // One extra slot for the module value.
                    if arg >= self.max_stack {
                        return Err(out_of_range("stack", self.max_stack));
                    }
                }
                Opcode::MakeList | Opcode::MakeTuple | Opcode::Unpack => {
                    if arg > self.max_stack {
                        return Err(out_of_range("stack", self.max_stack));
                    }
                }
                // Call arity is structurally bounded by the encoding.
                Opcode::Call | Opcode::CallVar | Opcode::CallKw | Opcode::CallVarKw => {}
                _ => {}
            }
        }
        Ok(())
    }

    fn check_dialect(&self, pc: u32, op: Opcode, dialect: &Dialect) -> Result<()> {
        let feature = match op {
            Opcode::Error | Opcode::ExceptPush | Opcode::ExceptPop => {
                (!dialect.allow_try_except).then_some("try/except")
            }
            Opcode::Amp
            | Opcode::Pipe
            | Opcode::Caret
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::Tilde => (!dialect.allow_bitwise).then_some("bitwise"),
            Opcode::MakeSet => (!dialect.allow_set).then_some("set"),
            _ => None,
        };
        match feature {
            Some(feature) => Err(Error::DisabledFeature { pc, op, feature }),
            None => Ok(()),
        }
    }
}
