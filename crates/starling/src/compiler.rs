//! Bytecode compiler: translates a resolved AST into a control-flow graph
//! of basic blocks, then hands the graph to [`crate::linearize`].
//!
//! The compiler walks the tree exactly once. Instructions are appended to a
//! *current block*; control flow attaches successor edges and either moves
//! emission to a fresh block or marks the point unreachable (statements
//! after a `return`/`break`/`continue` land in a dead block that the
//! linearizer never places). Blocks live in an arena and refer to each
//! other by index, so loops and diamond merges need no ownership cycles.
//!
//! Errors here are compiler or resolver bugs (an unresolved identifier, a
//! stack that would underflow, a call with 256 positional arguments) and
//! panic with a diagnostic rather than returning `Result`.

use std::borrow::Cow;
use std::collections::HashMap;

use num_bigint::BigInt;

use crate::linearize;
use crate::opcode::Opcode;
use crate::program;
use crate::program::{Constant, Funcode, Program, VERSION};
use crate::syntax::{
    Arg, AugOp, BinOp, CompBody, CompClause, CompKind, Expr, Function, Ident, Literal, Param,
    Pos, Scope, Stmt, UnaryOp,
};

/// Compile a module body into a [`Program`].
///
/// `locals` is the toplevel frame computed by the resolver (comprehension
/// variables and the like); `globals` is the module's global frame, which
/// `GLOBAL`/`SETGLOBAL` operands index.
pub fn compile_file(
    filename: &str,
    stmts: &[Stmt],
    locals: &[Ident],
    globals: &[Ident],
) -> Program {
    let mut pcomp = Pcomp {
        filename: filename.to_string(),
        loads: Vec::new(),
        names: Vec::new(),
        name_pool: HashMap::new(),
        constants: Vec::new(),
        constant_pool: HashMap::new(),
        functions: Vec::new(),
    };
    let toplevel = pcomp.function("<toplevel>", Pos::new(1, 1), stmts, locals, &[], 0, false, false);
    Program {
        version: VERSION,
        filename: pcomp.filename,
        loads: pcomp.loads,
        names: pcomp.names,
        constants: pcomp.constants,
        functions: pcomp.functions,
        globals: globals.iter().map(diag_ident).collect(),
        toplevel,
    }
}

/// Compile a single expression; the resulting program's `toplevel` returns
/// the expression's value.
pub fn compile_expr(filename: &str, expr: &Expr, locals: &[Ident]) -> Program {
    let stmts = [Stmt::Return {
        pos: Pos::default(),
        result: Some(expr.clone()),
    }];
    compile_file(filename, &stmts, locals, &[])
}

fn diag_ident(id: &Ident) -> program::Ident {
    program::Ident {
        name: id.name.clone(),
        pos: id.pos,
    }
}

// ---------------------------------------------------------------------------
// Program-level state
// ---------------------------------------------------------------------------

/// Interning key for the constant pool. Floats are keyed by bit pattern so
/// the pool can live in a `HashMap`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Str(String),
    Int(i64),
    BigInt(BigInt),
    Float(u64),
}

impl ConstKey {
    fn of(c: &Constant) -> ConstKey {
        match c {
            Constant::Str(s) => ConstKey::Str(s.clone()),
            Constant::Int(i) => ConstKey::Int(*i),
            Constant::BigInt(n) => ConstKey::BigInt(n.clone()),
            Constant::Float(x) => ConstKey::Float(x.to_bits()),
        }
    }
}

/// Shared state for one compilation: the program's pools plus the
/// value→index maps used to intern into them. Local to a single
/// `compile_file` call, never process-global.
struct Pcomp {
    filename: String,
    loads: Vec<program::Ident>,
    names: Vec<String>,
    name_pool: HashMap<String, u32>,
    constants: Vec<Constant>,
    constant_pool: HashMap<ConstKey, u32>,
    functions: Vec<Funcode>,
}

impl Pcomp {
    /// Intern a name, returning its stable pool index.
    fn name_index(&mut self, name: &str) -> u32 {
        if let Some(&i) = self.name_pool.get(name) {
            return i;
        }
        let i = self.names.len() as u32;
        self.names.push(name.to_string());
        self.name_pool.insert(name.to_string(), i);
        i
    }

    /// Intern a constant, returning its stable pool index.
    fn constant_index(&mut self, c: Constant) -> u32 {
        let key = ConstKey::of(&c);
        if let Some(&i) = self.constant_pool.get(&key) {
            return i;
        }
        let i = self.constants.len() as u32;
        self.constants.push(c);
        self.constant_pool.insert(key, i);
        i
    }

    fn function_index(&mut self, f: Funcode) -> u32 {
        let i = self.functions.len() as u32;
        self.functions.push(f);
        i
    }

    /// Compile one function body to a finished [`Funcode`].
    #[allow(clippy::too_many_arguments)]
    fn function(
        &mut self,
        name: &str,
        pos: Pos,
        stmts: &[Stmt],
        locals: &[Ident],
        freevars: &[Ident],
        num_params: u32,
        has_varargs: bool,
        has_kwargs: bool,
    ) -> Funcode {
        let mut fcomp = Fcomp {
            pcomp: self,
            name: name.to_string(),
            pos,
            locals: locals.iter().map(diag_ident).collect(),
            freevars: freevars.iter().map(diag_ident).collect(),
            num_params,
            has_varargs,
            has_kwargs,
            blocks: Vec::new(),
            curr: None,
            loops: Vec::new(),
            exhandlers: Vec::new(),
            line: 0,
        };
        let entry = fcomp.new_block();
        fcomp.enter(entry);
        fcomp.stmts(stmts);
        // Falling off the end returns None.
        fcomp.emit(Opcode::None);
        fcomp.emit(Opcode::Return);
        fcomp.finish(entry)
    }
}

// ---------------------------------------------------------------------------
// Control-flow graph
// ---------------------------------------------------------------------------

/// Index of a block in the function's arena.
pub(crate) type BlockId = usize;

/// One instruction. `line == 0` means the previous line still applies.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Insn {
    pub(crate) op: Opcode,
    pub(crate) arg: u32,
    pub(crate) line: u32,
}

/// A basic block: straight-line instructions plus up to three successor
/// edges. `cjmp` is the taken edge of a trailing `CJMP`/`ITERJMP`;
/// `except` is set on the block whose `EXCEPTPUSH` opens a handler.
/// `index`, `addr`, and `initial_stack` are written by the linearizer.
#[derive(Debug)]
pub(crate) struct Block {
    pub(crate) insns: Vec<Insn>,
    pub(crate) jmp: Option<BlockId>,
    pub(crate) cjmp: Option<BlockId>,
    pub(crate) except: Option<BlockId>,
    /// Placement order, or -1 while unvisited.
    pub(crate) index: i32,
    /// Code address assigned during placement.
    pub(crate) addr: u32,
    /// Operand stack depth on entry, or -1 while unknown.
    pub(crate) initial_stack: i32,
}

impl Block {
    fn new() -> Block {
        Block {
            insns: Vec::new(),
            jmp: None,
            cjmp: None,
            except: None,
            index: -1,
            addr: 0,
            initial_stack: -1,
        }
    }
}

/// A loop's branch targets while its body is being compiled.
#[derive(Clone, Copy)]
struct LoopFrame {
    break_: BlockId,
    continue_: BlockId,
}

// ---------------------------------------------------------------------------
// Function-level compiler
// ---------------------------------------------------------------------------

struct Fcomp<'a> {
    pcomp: &'a mut Pcomp,
    name: String,
    pos: Pos,
    locals: Vec<program::Ident>,
    freevars: Vec<program::Ident>,
    num_params: u32,
    has_varargs: bool,
    has_kwargs: bool,
    blocks: Vec<Block>,
    /// Block currently receiving instructions; `None` after an
    /// unconditional transfer (the next statement is unreachable).
    curr: Option<BlockId>,
    loops: Vec<LoopFrame>,
    /// For each open `try`, the loop-stack depth at the time its handler
    /// was pushed; `break`/`continue` consult this to unwind the runtime
    /// handler stack.
    exhandlers: Vec<usize>,
    /// Pending source line, attached to the next emitted instruction.
    line: u32,
}

impl Fcomp<'_> {
    fn finish(mut self, entry: BlockId) -> Funcode {
        let (code, pcline, max_stack) = linearize::assemble(&mut self.blocks, entry);
        Funcode {
            name: self.name,
            pos: self.pos,
            filename: self.pcomp.filename.clone(),
            code,
            pcline,
            locals: self.locals,
            freevars: self.freevars,
            max_stack,
            num_params: self.num_params,
            has_varargs: self.has_varargs,
            has_kwargs: self.has_kwargs,
        }
    }

    // -- emission helpers --

    fn new_block(&mut self) -> BlockId {
        self.blocks.push(Block::new());
        self.blocks.len() - 1
    }

    /// Make `b` the current block.
    fn enter(&mut self, b: BlockId) {
        self.curr = Some(b);
    }

    /// Record the source position of the next instruction.
    fn set_pos(&mut self, pos: Pos) {
        self.line = pos.line;
    }

    fn push_insn(&mut self, op: Opcode, arg: u32) {
        let line = std::mem::take(&mut self.line);
        let b = self.curr.expect("emit with no current block");
        self.blocks[b].insns.push(Insn { op, arg, line });
    }

    fn emit(&mut self, op: Opcode) {
        debug_assert!(!op.has_arg(), "{op} needs an operand");
        self.push_insn(op, 0);
    }

    fn emit1(&mut self, op: Opcode, arg: u32) {
        debug_assert!(op.has_arg(), "{op} takes no operand");
        self.push_insn(op, arg);
    }

    /// Attach an unconditional edge to `b` and mark the current point
    /// unreachable. A block must not fall through to itself; self-loops go
    /// through a distinct successor.
    fn jump(&mut self, b: BlockId) {
        let cur = self.curr.expect("jump with no current block");
        assert_ne!(cur, b, "jump to self");
        self.blocks[cur].jmp = Some(b);
        self.curr = None;
    }

    /// Emit a conditional branch: to `t` when taken, falling through to
    /// `f`. The operand is patched by the linearizer.
    fn condjump(&mut self, op: Opcode, t: BlockId, f: BlockId) {
        debug_assert!(
            matches!(op, Opcode::CJmp | Opcode::IterJmp),
            "{op} is not a conditional branch"
        );
        self.emit1(op, 0);
        let cur = self.curr.expect("condjump with no current block");
        self.blocks[cur].cjmp = Some(t);
        self.jump(f);
    }

    // -- identifiers --

    /// Emit a store to a resolved identifier.
    fn set(&mut self, id: &Ident) {
        match id.binding.scope {
            Scope::Local => self.emit1(Opcode::SetLocal, id.binding.index),
            Scope::Global => self.emit1(Opcode::SetGlobal, id.binding.index),
            scope => panic!("set of {} ({scope:?}): resolver bug", id.name),
        }
    }

    /// Emit a load of a resolved identifier. Local, global, and
    /// predeclared lookups can fail at runtime, so they record a position.
    fn lookup(&mut self, id: &Ident) {
        match id.binding.scope {
            Scope::Local => {
                self.set_pos(id.pos);
                self.emit1(Opcode::Local, id.binding.index);
            }
            Scope::Free => self.emit1(Opcode::Free, id.binding.index),
            Scope::Global => {
                self.set_pos(id.pos);
                self.emit1(Opcode::Global, id.binding.index);
            }
            Scope::Predeclared => {
                self.set_pos(id.pos);
                let name = self.pcomp.name_index(&id.name);
                self.emit1(Opcode::Predeclared, name);
            }
            Scope::Universal => {
                let name = self.pcomp.name_index(&id.name);
                self.emit1(Opcode::Universal, name);
            }
        }
    }

    fn constant(&mut self, c: Constant) {
        let i = self.pcomp.constant_index(c);
        self.emit1(Opcode::Constant, i);
    }

    fn string(&mut self, s: String) {
        self.constant(Constant::Str(s));
    }

    // -- statements --

    fn stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        if self.curr.is_none() {
            // Unreachable statement; compile it into a block the
            // linearizer will drop.
            let dead = self.new_block();
            self.enter(dead);
        }
        match stmt {
            Stmt::Expr(e) => {
                if matches!(e, Expr::Literal { .. }) {
                    // A bare literal statement (doc string) compiles to
                    // nothing.
                    return;
                }
                self.expr(e);
                self.emit(Opcode::Pop);
            }

            Stmt::Assign { pos, lhs, rhs } => {
                self.expr(rhs);
                self.assign(*pos, lhs);
            }

            Stmt::AugAssign { pos, op, lhs, rhs } => self.aug_assign(*pos, *op, lhs, rhs),

            Stmt::If { cond, then, orelse, .. } => {
                let t = self.new_block();
                let f = self.new_block();
                let done = self.new_block();
                self.ifelse(cond, t, f);

                self.enter(t);
                self.stmts(then);
                self.jump(done);

                self.enter(f);
                self.stmts(orelse);
                self.jump(done);

                self.enter(done);
            }

            Stmt::For { pos, vars, iterable, body } => {
                let head = self.new_block();
                let body_b = self.new_block();
                let tail = self.new_block();

                self.expr(iterable);
                self.set_pos(*pos);
                self.emit(Opcode::IterPush);
                self.jump(head);

                self.enter(head);
                // Taken edge: the iterator is exhausted and dropped.
                // Fall-through: the next element is on the stack.
                self.condjump(Opcode::IterJmp, tail, body_b);

                self.enter(body_b);
                self.assign(*pos, vars);
                self.loops.push(LoopFrame { break_: tail, continue_: head });
                self.stmts(body);
                self.loops.pop();
                self.jump(head);

                self.enter(tail);
                self.emit(Opcode::IterPop);
            }

            Stmt::Break { .. } => {
                let frame = *self
                    .loops
                    .last()
                    .expect("break outside a loop: resolver bug");
                self.pop_active_handlers();
                self.jump(frame.break_);
                let dead = self.new_block();
                self.enter(dead);
            }

            Stmt::Continue { .. } => {
                let frame = *self
                    .loops
                    .last()
                    .expect("continue outside a loop: resolver bug");
                self.pop_active_handlers();
                self.jump(frame.continue_);
                let dead = self.new_block();
                self.enter(dead);
            }

            Stmt::Pass { .. } => {}

            Stmt::Return { result, .. } => {
                match result {
                    Some(e) => self.expr(e),
                    None => self.emit(Opcode::None),
                }
                self.emit(Opcode::Return);
                let dead = self.new_block();
                self.enter(dead);
            }

            Stmt::Def { name, function } => {
                self.function(function);
                self.set(name);
            }

            Stmt::Try { pos, body, handler } => {
                let fallback = self.new_block();
                let done = self.new_block();

                // Each protected region needs its own except edge; split
                // if this block already opened one.
                if self.blocks[self.curr.unwrap()].except.is_some() {
                    let b = self.new_block();
                    self.jump(b);
                    self.enter(b);
                }

                self.exhandlers.push(self.loops.len());
                self.set_pos(*pos);
                self.emit1(Opcode::ExceptPush, 0); // patched by the linearizer
                let cur = self.curr.unwrap();
                self.blocks[cur].except = Some(fallback);

                self.stmts(body);
                self.emit(Opcode::ExceptPop);
                self.jump(done);

                self.enter(fallback);
                match &handler.binding {
                    Some((type_expr, target)) => {
                        self.expr(type_expr);
                        self.set_pos(handler.pos);
                        self.emit(Opcode::Error);
                        self.set(target);
                        self.stmts(&handler.body);
                        // The caught value does not outlive the handler.
                        self.emit(Opcode::None);
                        self.set(target);
                    }
                    None => {
                        self.emit(Opcode::ExceptPop);
                        self.stmts(&handler.body);
                    }
                }
                self.jump(done);
                self.exhandlers.pop();

                self.enter(done);
            }

            Stmt::Load { pos, module, from, into } => {
                assert_eq!(from.len(), into.len(), "malformed load: resolver bug");
                for orig in from {
                    self.string(orig.clone());
                }
                self.string(module.clone());
                self.pcomp.loads.push(program::Ident {
                    name: module.clone(),
                    pos: *pos,
                });
                self.set_pos(*pos);
                self.emit1(Opcode::Load, from.len() as u32);
                // The runtime leaves the loaded values with the first
                // binding's on top, so the stores run in reverse.
                for id in into.iter().rev() {
                    self.set(id);
                }
            }
        }
    }

    /// Emit an `EXCEPTPOP` for every handler opened inside the loop being
    /// exited, innermost first. Handlers opened outside it stay armed.
    fn pop_active_handlers(&mut self) {
        let depth = self.loops.len();
        let n = self.exhandlers.iter().filter(|&&h| h >= depth).count();
        for _ in 0..n {
            self.emit(Opcode::ExceptPop);
        }
    }

    // -- assignment --

    /// Store the value on top of the stack into `lhs`.
    fn assign(&mut self, pos: Pos, lhs: &Expr) {
        match lhs {
            Expr::Ident(id) => self.set(id),
            Expr::Tuple { elems, .. } | Expr::List { elems, .. } => {
                self.assign_sequence(pos, elems);
            }
            Expr::Index { pos: lbrack, x, y } => {
                // x[y] = rhs: rotate the receiver and key under the value.
                self.expr(x);
                self.emit(Opcode::Exch);
                self.expr(y);
                self.emit(Opcode::Exch);
                self.set_pos(*lbrack);
                self.emit(Opcode::SetIndex);
            }
            Expr::Dot { pos: dot, x, attr } => {
                self.expr(x);
                self.emit(Opcode::Exch);
                let name = self.pcomp.name_index(attr);
                self.set_pos(*dot);
                self.emit1(Opcode::SetField, name);
            }
            _ => panic!("unexpected assignment target: resolver bug"),
        }
    }

    fn assign_sequence(&mut self, pos: Pos, lhs: &[Expr]) {
        self.set_pos(pos);
        self.emit1(Opcode::Unpack, lhs.len() as u32);
        // UNPACK leaves the first element on top.
        for e in lhs {
            self.assign(pos, e);
        }
    }

    /// `lhs op= rhs`. The address of the LHS is evaluated exactly once: the
    /// receiver/key components pushed for the load are kept on the stack
    /// (via `DUP`/`DUP2`) and reused by the store.
    fn aug_assign(&mut self, pos: Pos, op: AugOp, lhs: &Expr, rhs: &Expr) {
        enum Store<'e> {
            Ident(&'e Ident),
            Index(Pos),
            Field(Pos, u32),
        }

        let store = match lhs {
            Expr::Ident(id) => {
                self.lookup(id);
                Store::Ident(id)
            }
            Expr::Index { pos: lbrack, x, y } => {
                self.expr(x);
                self.expr(y);
                self.emit(Opcode::Dup2);
                self.set_pos(*lbrack);
                self.emit(Opcode::Index);
                Store::Index(*lbrack)
            }
            Expr::Dot { pos: dot, x, attr } => {
                self.expr(x);
                self.emit(Opcode::Dup);
                let name = self.pcomp.name_index(attr);
                self.set_pos(*dot);
                self.emit1(Opcode::Attr, name);
                Store::Field(*dot, name)
            }
            _ => panic!("unexpected augmented assignment target: resolver bug"),
        };

        self.expr(rhs);
        self.set_pos(pos);
        if op == AugOp::PlusEq {
            // Let the runtime extend lists in place.
            self.emit(Opcode::InplaceAdd);
        } else {
            self.emit(aug_binop_code(op));
        }

        match store {
            Store::Ident(id) => self.set(id),
            Store::Index(lbrack) => {
                self.set_pos(lbrack);
                self.emit(Opcode::SetIndex);
            }
            Store::Field(dot, name) => {
                self.set_pos(dot);
                self.emit1(Opcode::SetField, name);
            }
        }
    }

    // -- expressions --

    /// Compile `e`, leaving exactly one value on the stack.
    fn expr(&mut self, e: &Expr) {
        match e {
            Expr::Ident(id) => self.lookup(id),

            Expr::Literal { value, .. } => match value {
                Literal::None => self.emit(Opcode::None),
                Literal::Bool(true) => self.emit(Opcode::True),
                Literal::Bool(false) => self.emit(Opcode::False),
                Literal::Int(i) => self.constant(Constant::Int(*i)),
                Literal::BigInt(n) => self.constant(Constant::BigInt(n.clone())),
                Literal::Float(x) => self.constant(Constant::Float(*x)),
                Literal::Str(s) => self.string(s.clone()),
            },

            Expr::List { elems, .. } => {
                for x in elems {
                    self.expr(x);
                }
                self.emit1(Opcode::MakeList, elems.len() as u32);
            }

            Expr::Tuple { elems, .. } => {
                for x in elems {
                    self.expr(x);
                }
                self.emit1(Opcode::MakeTuple, elems.len() as u32);
            }

            Expr::Dict { entries, .. } => {
                self.emit(Opcode::MakeDict);
                for entry in entries {
                    self.emit(Opcode::Dup);
                    self.expr(&entry.key);
                    self.expr(&entry.value);
                    self.set_pos(entry.colon);
                    // A duplicate key is a runtime error.
                    self.emit(Opcode::SetDictUniq);
                }
            }

            Expr::Index { pos, x, y } => {
                self.expr(x);
                self.expr(y);
                self.set_pos(*pos);
                self.emit(Opcode::Index);
            }

            Expr::Slice { pos, x, lo, hi, step } => {
                self.expr(x);
                for part in [lo, hi, step] {
                    match part {
                        Some(e) => self.expr(e),
                        None => self.emit(Opcode::None),
                    }
                }
                self.set_pos(*pos);
                self.emit(Opcode::Slice);
            }

            Expr::Dot { pos, x, attr } => {
                self.expr(x);
                let name = self.pcomp.name_index(attr);
                self.set_pos(*pos);
                self.emit1(Opcode::Attr, name);
            }

            Expr::Unary { pos, op, x } => {
                self.expr(x);
                self.set_pos(*pos);
                match op {
                    UnaryOp::Plus => self.emit(Opcode::UPlus),
                    UnaryOp::Minus => self.emit(Opcode::UMinus),
                    UnaryOp::Tilde => self.emit(Opcode::Tilde),
                    UnaryOp::Not => self.emit(Opcode::Not),
                }
            }

            Expr::Binary { pos, op, x, y } => match op {
                BinOp::Or => {
                    // x or y: if x is truthy it is the result.
                    let done = self.new_block();
                    let y_b = self.new_block();

                    self.expr(x);
                    self.emit(Opcode::Dup);
                    self.condjump(Opcode::CJmp, done, y_b);

                    self.enter(y_b);
                    self.emit(Opcode::Pop);
                    self.expr(y);
                    self.jump(done);

                    self.enter(done);
                }
                BinOp::And => {
                    let done = self.new_block();
                    let y_b = self.new_block();

                    self.expr(x);
                    self.emit(Opcode::Dup);
                    self.condjump(Opcode::CJmp, y_b, done);

                    self.enter(y_b);
                    self.emit(Opcode::Pop);
                    self.expr(y);
                    self.jump(done);

                    self.enter(done);
                }
                BinOp::NotIn => {
                    self.expr(x);
                    self.expr(y);
                    self.set_pos(*pos);
                    self.emit(Opcode::In);
                    self.emit(Opcode::Not);
                }
                BinOp::Plus => self.plus(*pos, x, y),
                _ => {
                    self.expr(x);
                    self.expr(y);
                    self.set_pos(*pos);
                    self.emit(binop_code(*op));
                }
            },

            Expr::Cond { cond, then, orelse, .. } => {
                let t = self.new_block();
                let f = self.new_block();
                let done = self.new_block();
                self.ifelse(cond, t, f);

                self.enter(t);
                self.expr(then);
                self.jump(done);

                self.enter(f);
                self.expr(orelse);
                self.jump(done);

                self.enter(done);
            }

            Expr::Call { pos, func, args } => {
                self.expr(func);
                let (op, arg) = self.args(args);
                self.set_pos(*pos);
                self.emit1(op, arg);
            }

            Expr::Comprehension { kind, body, clauses, .. } => {
                match kind {
                    CompKind::List => self.emit1(Opcode::MakeList, 0),
                    CompKind::Dict => self.emit(Opcode::MakeDict),
                    CompKind::Set => self.emit(Opcode::MakeSet),
                }
                self.comprehension(body, clauses, 0);
            }

            Expr::Lambda { function, .. } => self.function(function),
        }
    }

    /// Compile `cond`, branching to `t` if truthy and `f` otherwise.
    /// Boolean structure lowers into control flow instead of values:
    /// `not` swaps the targets, `and`/`or` chain blocks, and `not in`
    /// reuses `IN` with swapped targets.
    fn ifelse(&mut self, cond: &Expr, t: BlockId, f: BlockId) {
        match cond {
            Expr::Unary { op: UnaryOp::Not, x, .. } => self.ifelse(x, f, t),

            Expr::Binary { op: BinOp::And, x, y, .. } => {
                let mid = self.new_block();
                self.ifelse(x, mid, f);
                self.enter(mid);
                self.ifelse(y, t, f);
            }

            Expr::Binary { op: BinOp::Or, x, y, .. } => {
                let mid = self.new_block();
                self.ifelse(x, t, mid);
                self.enter(mid);
                self.ifelse(y, t, f);
            }

            Expr::Binary { op: BinOp::NotIn, pos, x, y } => {
                self.expr(x);
                self.expr(y);
                self.set_pos(*pos);
                self.emit(Opcode::In);
                self.condjump(Opcode::CJmp, f, t);
            }

            _ => {
                self.expr(cond);
                self.condjump(Opcode::CJmp, t, f);
            }
        }
    }

    /// Compile a chain of `+`. The left-leaning tree is flattened into
    /// syntactic order and maximal runs of adjacent literals of the same
    /// addable kind (string, list, tuple) are concatenated at compile
    /// time. Everything else still gets one `PLUS` per operator so each
    /// addition keeps a distinct position for error reporting.
    fn plus(&mut self, pos: Pos, x: &Expr, y: &Expr) {
        let mut args: Vec<(Cow<'_, Expr>, Pos)> = Vec::new();
        let (mut left, mut op_pos, mut right) = (x, pos, y);
        loop {
            args.push((Cow::Borrowed(right), op_pos));
            match left {
                Expr::Binary { op: BinOp::Plus, pos, x, y } => {
                    right = y.as_ref();
                    op_pos = *pos;
                    left = x.as_ref();
                }
                _ => {
                    args.push((Cow::Borrowed(left), Pos::default()));
                    break;
                }
            }
        }
        args.reverse();

        let mut folded: Vec<(Cow<'_, Expr>, Pos)> = Vec::with_capacity(args.len());
        let mut i = 0;
        while i < args.len() {
            let mut j = i + 1;
            if let Some(kind) = addable(&args[i].0) {
                while j < args.len() && addable(&args[j].0) == Some(kind) {
                    j += 1;
                }
                if j > i + 1 {
                    let merged = concat_literals(kind, &args[i..j]);
                    folded.push((Cow::Owned(merged), args[i].1));
                    i = j;
                    continue;
                }
            }
            folded.push(args[i].clone());
            i = j;
        }

        self.expr(&folded[0].0);
        for (summand, plus_pos) in &folded[1..] {
            self.expr(summand);
            self.set_pos(*plus_pos);
            self.emit(Opcode::Plus);
        }
    }

    /// Emit the arguments of a call and pick the call opcode. Relies on the
    /// parser's ordering: positional, then named, then `*args`, `**kwargs`.
    fn args(&mut self, args: &[Arg]) -> (Opcode, u32) {
        let mut p: u32 = 0;
        let mut n: u32 = 0;
        let mut mode: u8 = 0;
        for arg in args {
            match arg {
                Arg::Positional(e) => {
                    self.expr(e);
                    p += 1;
                }
                Arg::Named { name, value, .. } => {
                    self.string(name.clone());
                    self.expr(value);
                    n += 1;
                }
                Arg::Star(e) => {
                    mode |= 1;
                    self.expr(e);
                }
                Arg::StarStar(e) => {
                    mode |= 2;
                    self.expr(e);
                }
            }
        }
        // The call operand packs both counts into one byte each.
        assert!(
            p < 256 && n < 256,
            "call has too many arguments ({p} positional, {n} named)"
        );
        let op = match mode {
            0 => Opcode::Call,
            1 => Opcode::CallVar,
            2 => Opcode::CallKw,
            _ => Opcode::CallVarKw,
        };
        (op, p << 8 | n)
    }

    /// Compile the clauses of a comprehension, innermost last. The
    /// accumulator sits on the stack throughout; the innermost body
    /// duplicates it and appends/stores one element. Comprehension loops
    /// do not join the loop stack; `break` inside one is a resolver
    /// error.
    fn comprehension(&mut self, body: &CompBody, clauses: &[CompClause], index: usize) {
        if index == clauses.len() {
            self.emit(Opcode::Dup); // the accumulator
            match body {
                CompBody::KeyValue(entry) => {
                    self.expr(&entry.key);
                    self.expr(&entry.value);
                    self.set_pos(entry.colon);
                    self.emit(Opcode::SetDict);
                }
                CompBody::Value(e) => {
                    self.expr(e);
                    self.emit(Opcode::Append);
                }
            }
            return;
        }
        match &clauses[index] {
            CompClause::If { cond, .. } => {
                let t = self.new_block();
                let done = self.new_block();
                self.ifelse(cond, t, done);

                self.enter(t);
                self.comprehension(body, clauses, index + 1);
                self.jump(done);

                self.enter(done);
            }
            CompClause::For { pos, vars, iterable } => {
                let head = self.new_block();
                let body_b = self.new_block();
                let tail = self.new_block();

                self.expr(iterable);
                self.set_pos(*pos);
                self.emit(Opcode::IterPush);
                self.jump(head);

                self.enter(head);
                self.condjump(Opcode::IterJmp, tail, body_b);

                self.enter(body_b);
                self.assign(*pos, vars);
                self.comprehension(body, clauses, index + 1);
                self.jump(head);

                self.enter(tail);
                self.emit(Opcode::IterPop);
            }
        }
    }

    /// Compile a function literal: evaluate the parameter defaults and
    /// capture the free variables (both as tuples), compile the body into
    /// its own funcode, and emit `MAKEFUNC`.
    fn function(&mut self, f: &Function) {
        // Evaluating the defaults can fail.
        self.set_pos(f.pos);

        let mut ndefaults = 0;
        for param in &f.params {
            if let Param::WithDefault(_, dflt) = param {
                self.expr(dflt);
                ndefaults += 1;
            }
        }
        self.emit1(Opcode::MakeTuple, ndefaults);

        // Free variables are captured by value from the enclosing frame;
        // their bindings are relative to it.
        for freevar in &f.freevars {
            self.lookup(freevar);
        }
        self.emit1(Opcode::MakeTuple, f.freevars.len() as u32);

        let funcode = self.pcomp.function(
            &f.name,
            f.pos,
            &f.body,
            &f.locals,
            &f.freevars,
            f.params.len() as u32,
            f.has_varargs,
            f.has_kwargs,
        );
        let index = self.pcomp.function_index(funcode);
        self.emit1(Opcode::MakeFunc, index);
    }
}

// ---------------------------------------------------------------------------
// Standalone helpers
// ---------------------------------------------------------------------------

/// Translate a comparison or arithmetic token into its opcode. The two
/// families are declared in the same order, so this is an ordinal offset
/// (checked at compile time in `opcode.rs`).
fn binop_code(op: BinOp) -> Opcode {
    debug_assert!((op as u8) <= BinOp::In as u8, "{op:?} has no direct opcode");
    Opcode::from_u8(Opcode::Eql as u8 + op as u8).expect("token family exceeds opcode family")
}

/// Translate an augmented-assignment token into its binary opcode
/// (`+=` is handled separately with `INPLACE_ADD`).
fn aug_binop_code(op: AugOp) -> Opcode {
    Opcode::from_u8(Opcode::Plus as u8 + op as u8).expect("token family exceeds opcode family")
}

/// The addable literal kinds recognized by the `+`-chain folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Addable {
    Str,
    List,
    Tuple,
}

fn addable(e: &Expr) -> Option<Addable> {
    match e {
        Expr::Literal { value: Literal::Str(_), .. } => Some(Addable::Str),
        Expr::List { .. } => Some(Addable::List),
        Expr::Tuple { .. } => Some(Addable::Tuple),
        _ => None,
    }
}

/// Concatenate a run of same-kind literals into one synthetic literal.
/// Positions inside the parts are preserved; the merged node itself has
/// none.
fn concat_literals(kind: Addable, parts: &[(Cow<'_, Expr>, Pos)]) -> Expr {
    match kind {
        Addable::Str => {
            let mut s = String::new();
            for (part, _) in parts {
                match &**part {
                    Expr::Literal { value: Literal::Str(t), .. } => s.push_str(t),
                    _ => unreachable!("non-string in string run"),
                }
            }
            Expr::Literal {
                pos: Pos::default(),
                value: Literal::Str(s),
            }
        }
        Addable::List => Expr::List {
            pos: Pos::default(),
            elems: concat_elems(parts),
        },
        Addable::Tuple => Expr::Tuple {
            pos: Pos::default(),
            elems: concat_elems(parts),
        },
    }
}

fn concat_elems(parts: &[(Cow<'_, Expr>, Pos)]) -> Vec<Expr> {
    let mut elems = Vec::new();
    for (part, _) in parts {
        match &**part {
            Expr::List { elems: es, .. } | Expr::Tuple { elems: es, .. } => {
                elems.extend(es.iter().cloned());
            }
            _ => unreachable!("non-display in list/tuple run"),
        }
    }
    elems
}
