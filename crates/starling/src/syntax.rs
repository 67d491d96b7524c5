//! Resolved abstract syntax tree consumed by the compiler.
//!
//! The lexer, parser, and resolver are external collaborators; this module
//! defines the shape of the tree they must hand over. Every identifier
//! arrives with a [`Binding`] (a scope tag plus an index into that scope's
//! frame), and every `def`/`lambda` carries a resolver-computed [`Function`]
//! record (parameters, body, locals, free variables). The compiler never
//! resolves names itself and panics on trees the resolver should have
//! rejected.

use num_bigint::BigInt;

/// A source position (1-based line and column). Line 0 means "unknown".
///
/// Only the line reaches the compiled PC-line table; the column is kept for
/// the diagnostics tables ([`crate::program::Ident`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Pos {
    pub line: u32,
    pub col: u32,
}

impl Pos {
    pub fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }
}

/// The scope a resolved identifier lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// A slot in the enclosing function's frame.
    Local,
    /// A slot in the enclosing function's free-variable list.
    Free,
    /// A slot in the module's global frame.
    Global,
    /// A name provided by the embedder, resolved by name at runtime.
    Predeclared,
    /// A name built into the language, resolved by name at runtime.
    Universal,
}

/// The resolver's verdict for one identifier: where it lives and at which
/// index. The index is meaningless for `Predeclared` and `Universal`
/// bindings, which are looked up by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub scope: Scope,
    pub index: u32,
}

impl Binding {
    pub fn new(scope: Scope, index: u32) -> Self {
        Self { scope, index }
    }
}

/// A resolved identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub name: String,
    pub pos: Pos,
    pub binding: Binding,
}

/// Binary operator tokens.
///
/// The comparison family (`Eq..=Le`) and the arithmetic family
/// (`Plus..=In`) are declared in the same order as the corresponding
/// opcode families so the compiler can translate by ordinal offset; a
/// compile-time assertion in [`crate::opcode`] pins the two orderings
/// together. `NotIn`, `And`, and `Or` have no direct opcode; they lower
/// into control flow or an `IN`+`NOT` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    NotEq,
    Gt,
    Ge,
    Lt,
    Le,
    Plus,
    Minus,
    Star,
    Slash,
    SlashSlash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Shl,
    Shr,
    In,
    NotIn,
    And,
    Or,
}

/// Augmented-assignment operator tokens, in the same order as the
/// arithmetic opcode family (`x += y` is special-cased to `INPLACE_ADD`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AugOp {
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    SlashSlashEq,
    PercentEq,
    AmpEq,
    PipeEq,
    CaretEq,
    ShlEq,
    ShrEq,
}

/// Unary operator tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Minus,
    Tilde,
    Not,
}

/// A literal value as produced by the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    BigInt(BigInt),
    Float(f64),
    Str(String),
}

/// One `key: value` entry of a dict display or dict comprehension body.
#[derive(Debug, Clone, PartialEq)]
pub struct DictEntry {
    /// Position of the colon (attached to the store instruction).
    pub colon: Pos,
    pub key: Expr,
    pub value: Expr,
}

/// One argument of a call.
///
/// The parser enforces the usual ordering: positional arguments, then
/// named arguments, then `*args`, then `**kwargs`. The compiler emits them
/// in a single pass and relies on that ordering.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Positional(Expr),
    Named { pos: Pos, name: String, value: Expr },
    Star(Expr),
    StarStar(Expr),
}

/// What a comprehension accumulates into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompKind {
    List,
    Set,
    Dict,
}

/// The body of a comprehension: a plain expression for list/set forms, a
/// `key: value` pair for dict forms.
#[derive(Debug, Clone, PartialEq)]
pub enum CompBody {
    Value(Expr),
    KeyValue(DictEntry),
}

/// One `for` or `if` clause of a comprehension.
#[derive(Debug, Clone, PartialEq)]
pub enum CompClause {
    For { pos: Pos, vars: Expr, iterable: Expr },
    If { pos: Pos, cond: Expr },
}

/// A function literal as computed by the resolver: the syntactic parts
/// (name, parameters, body) plus the frame layout (locals, free variables).
///
/// Free-variable identifiers carry bindings relative to the *enclosing*
/// frame (`Local` or `Free`), which is where the compiler captures them
/// from; inside the nested function they are addressed as `FREE` slots by
/// position in this list.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub pos: Pos,
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub has_varargs: bool,
    pub has_kwargs: bool,
    pub locals: Vec<Ident>,
    pub freevars: Vec<Ident>,
}

/// One formal parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Normal(Ident),
    /// `name=default`; the default is evaluated in the enclosing frame when
    /// the function literal is constructed.
    WithDefault(Ident, Expr),
    /// `*args`.
    Star(Ident),
    /// `**kwargs`.
    StarStar(Ident),
}

/// An expression. Evaluating one leaves exactly one value on the stack.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Ident(Ident),
    Literal {
        pos: Pos,
        value: Literal,
    },
    Unary {
        pos: Pos,
        op: UnaryOp,
        x: Box<Expr>,
    },
    Binary {
        /// Position of the operator token.
        pos: Pos,
        op: BinOp,
        x: Box<Expr>,
        y: Box<Expr>,
    },
    /// `then if cond else orelse`.
    Cond {
        pos: Pos,
        cond: Box<Expr>,
        then: Box<Expr>,
        orelse: Box<Expr>,
    },
    Tuple {
        pos: Pos,
        elems: Vec<Expr>,
    },
    List {
        pos: Pos,
        elems: Vec<Expr>,
    },
    Dict {
        pos: Pos,
        entries: Vec<DictEntry>,
    },
    /// `x[y]`; the position is the opening bracket.
    Index {
        pos: Pos,
        x: Box<Expr>,
        y: Box<Expr>,
    },
    /// `x[lo:hi:step]` with any part optional.
    Slice {
        pos: Pos,
        x: Box<Expr>,
        lo: Option<Box<Expr>>,
        hi: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    /// `x.attr`; the position is the dot.
    Dot {
        pos: Pos,
        x: Box<Expr>,
        attr: String,
    },
    /// A call; the position is the opening parenthesis.
    Call {
        pos: Pos,
        func: Box<Expr>,
        args: Vec<Arg>,
    },
    Comprehension {
        pos: Pos,
        kind: CompKind,
        body: Box<CompBody>,
        clauses: Vec<CompClause>,
    },
    Lambda {
        pos: Pos,
        function: Box<Function>,
    },
}

/// A statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// An expression evaluated for effect. A bare literal compiles to
    /// nothing (doc strings).
    Expr(Expr),
    Assign {
        pos: Pos,
        lhs: Expr,
        rhs: Expr,
    },
    /// `lhs op= rhs`; the position is the operator token.
    AugAssign {
        pos: Pos,
        op: AugOp,
        lhs: Expr,
        rhs: Expr,
    },
    If {
        pos: Pos,
        cond: Expr,
        then: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    For {
        pos: Pos,
        vars: Expr,
        iterable: Expr,
        body: Vec<Stmt>,
    },
    Break {
        pos: Pos,
    },
    Continue {
        pos: Pos,
    },
    Pass {
        pos: Pos,
    },
    Return {
        pos: Pos,
        result: Option<Expr>,
    },
    /// `def name(params): body`. The name's binding says where the
    /// function value is stored (global at top level, local inside a def).
    Def {
        name: Ident,
        function: Function,
    },
    /// `try: body except [type as target]: clause`.
    Try {
        pos: Pos,
        body: Vec<Stmt>,
        handler: ExceptClause,
    },
    /// `load("module", name, ...)`: `from` holds the names as they appear
    /// in the loaded module, `into` the (global) bindings they populate.
    Load {
        pos: Pos,
        module: String,
        from: Vec<String>,
        into: Vec<Ident>,
    },
}

/// The handler of a [`Stmt::Try`]. `binding` is `Some((type, target))` for
/// `except E as e:` and `None` for a bare `except:`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptClause {
    pub pos: Pos,
    pub binding: Option<(Expr, Ident)>,
    pub body: Vec<Stmt>,
}
