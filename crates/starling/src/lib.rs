//! Starling: a bytecode compiler for a Python-like configuration language.
//!
//! The compiler takes a *resolved* abstract syntax tree, one in which an
//! external resolver has annotated every identifier with a scope and an
//! index (see [`syntax`]), and produces an executable [`Program`]: one
//! [`Funcode`] per function (stack-machine bytecode plus auxiliary tables)
//! ready for a separate virtual machine to interpret.
//!
//! # Pipeline
//!
//! - The tree is translated into a control-flow graph of basic blocks
//!   (`if`, `for`, `try`, comprehensions, and short-circuit booleans all
//!   become edges).
//! - The graph is linearized: blocks are placed depth-first with natural
//!   fall-through, empty blocks are jump-threaded away, branch operands
//!   are patched into fixed-width slots, and the operand stack is
//!   abstractly interpreted to compute each funcode's `max_stack`.
//! - Instructions are emitted as one opcode byte plus, for argumented
//!   opcodes, a 7-bit little-endian varint operand; source lines land in a
//!   compact delta-encoded pc→line table.
//!
//! # Example
//!
//! ```
//! use starling::syntax::{Binding, Expr, Ident, Literal, Pos, Scope, Stmt};
//!
//! // x = "a" + "b"    (as the resolver would hand it over)
//! let x = Ident {
//!     name: "x".to_string(),
//!     pos: Pos::new(1, 1),
//!     binding: Binding::new(Scope::Global, 0),
//! };
//! let lit = |s: &str| Expr::Literal {
//!     pos: Pos::new(1, 5),
//!     value: Literal::Str(s.to_string()),
//! };
//! let stmts = [Stmt::Assign {
//!     pos: Pos::new(1, 3),
//!     lhs: Expr::Ident(x.clone()),
//!     rhs: Expr::Binary {
//!         pos: Pos::new(1, 9),
//!         op: starling::syntax::BinOp::Plus,
//!         x: Box::new(lit("a")),
//!         y: Box::new(lit("b")),
//!     },
//! }];
//! let program = starling::compile_file("demo.star", &stmts, &[], &[x]);
//!
//! // The two string literals were folded at compile time.
//! assert_eq!(
//!     program.constants,
//!     vec![starling::Constant::Str("ab".to_string())]
//! );
//! program
//!     .toplevel
//!     .validate(&program, &starling::Dialect::default(), |_| true, |_| true)
//!     .unwrap();
//! ```
//!
//! Compilation is a pure, single-threaded computation; the returned
//! program and its pools are immutable. Structural well-formedness is
//! guaranteed by construction; [`Funcode::validate`] exists for programs
//! reloaded from storage and for enforcing a narrower [`Dialect`].

mod codec;
mod compiler;
mod disasm;
mod error;
mod linearize;
mod opcode;
mod program;
pub mod syntax;
mod validate;

pub use codec::{decode_op, decode_op_unsafe, decode_operand, decode_operand_unsafe, Instructions};
pub use compiler::{compile_expr, compile_file};
pub use disasm::{disassemble, print_op};
pub use error::{Error, Result};
pub use opcode::{Opcode, StackEffect, ARG_MIN, OPCODE_MAX};
pub use program::{Constant, Funcode, Ident, Program, VERSION};
pub use validate::Dialect;
