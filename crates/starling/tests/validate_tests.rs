//! Validator behavior: dialect gates, pool bounds, and malformed streams.
//!
//! Well-formed programs come from the compiler; malformed ones are
//! hand-assembled byte streams, the kind a corrupted or hostile serialized
//! program would produce.

mod common;

use common::*;
use starling::syntax::{BinOp, CompBody, CompClause, CompKind, ExceptClause, Expr, Pos, Stmt};
use starling::{compile_file, Dialect, Error, Funcode, Opcode, Program, VERSION};

fn handcrafted(code: Vec<u8>) -> Program {
    let toplevel = Funcode {
        name: "<toplevel>".to_string(),
        pos: Pos::default(),
        filename: "t.star".to_string(),
        code,
        pcline: Vec::new(),
        locals: Vec::new(),
        freevars: Vec::new(),
        max_stack: 0,
        num_params: 0,
        has_varargs: false,
        has_kwargs: false,
    };
    Program {
        version: VERSION,
        filename: "t.star".to_string(),
        loads: Vec::new(),
        names: Vec::new(),
        constants: Vec::new(),
        functions: Vec::new(),
        globals: Vec::new(),
        toplevel,
    }
}

fn validate(prog: &Program, dialect: &Dialect) -> Result<(), Error> {
    prog.toplevel.validate(prog, dialect, |_| true, |_| true)
}

#[test]
fn fresh_compile_always_validates() {
    let x = global("x", 0);
    let y = global("y", 1);
    let stmts = [assign(&x, binary(BinOp::Plus, var(&y), int(1)))];
    let prog = compile_file("t.star", &stmts, &[], &[x.clone(), y.clone()]);
    validate(&prog, &Dialect::default()).unwrap();
    // No gated opcode in sight, so the narrowest dialect accepts it too.
    let none = Dialect {
        allow_try_except: false,
        allow_bitwise: false,
        allow_set: false,
    };
    validate(&prog, &none).unwrap();
}

#[test]
fn try_except_is_gated() {
    let f = global("f", 0);
    let stmts = [Stmt::Try {
        pos: pos(1),
        body: vec![Stmt::Expr(call(&f, vec![]))],
        handler: ExceptClause {
            pos: pos(2),
            binding: None,
            body: vec![Stmt::Pass { pos: pos(2) }],
        },
    }];
    let prog = compile_file("t.star", &stmts, &[], &[f.clone()]);
    validate(&prog, &Dialect::default()).unwrap();

    let narrowed = Dialect {
        allow_try_except: false,
        ..Dialect::default()
    };
    let err = validate(&prog, &narrowed).unwrap_err();
    assert_eq!(
        err,
        Error::DisabledFeature {
            pc: 0,
            op: Opcode::ExceptPush,
            feature: "try/except",
        }
    );
    assert!(err.to_string().contains("requires the try/except dialect feature"));
}

#[test]
fn bitwise_is_gated() {
    let a = global("a", 0);
    let b = global("b", 1);
    let r = global("r", 2);
    let stmts = [assign(&r, binary(BinOp::Amp, var(&a), var(&b)))];
    let prog = compile_file("t.star", &stmts, &[], &[a.clone(), b.clone(), r.clone()]);
    validate(&prog, &Dialect::default()).unwrap();

    let narrowed = Dialect {
        allow_bitwise: false,
        ..Dialect::default()
    };
    let err = validate(&prog, &narrowed).unwrap_err();
    assert_eq!(
        err,
        Error::DisabledFeature {
            pc: pc_of(&prog.toplevel, Opcode::Amp, 0),
            op: Opcode::Amp,
            feature: "bitwise",
        }
    );
}

#[test]
fn sets_are_gated() {
    let xs = global("xs", 0);
    let s = global("s", 1);
    let x = local("x", 0);
    let comp = Expr::Comprehension {
        pos: pos(1),
        kind: CompKind::Set,
        body: Box::new(CompBody::Value(var(&x))),
        clauses: vec![CompClause::For {
            pos: pos(1),
            vars: var(&x),
            iterable: var(&xs),
        }],
    };
    let prog = compile_file(
        "t.star",
        &[assign(&s, comp)],
        &[x.clone()],
        &[xs.clone(), s.clone()],
    );
    validate(&prog, &Dialect::default()).unwrap();

    let narrowed = Dialect {
        allow_set: false,
        ..Dialect::default()
    };
    let err = validate(&prog, &narrowed).unwrap_err();
    assert!(matches!(
        err,
        Error::DisabledFeature {
            op: Opcode::MakeSet,
            feature: "set",
            ..
        }
    ));
}

#[test]
fn illegal_opcode_is_rejected() {
    let prog = handcrafted(vec![0xee]);
    assert_eq!(
        validate(&prog, &Dialect::default()).unwrap_err(),
        Error::IllegalOpcode { pc: 0, op: 0xee }
    );
}

#[test]
fn truncated_operand_is_rejected() {
    // A CONSTANT whose varint never terminates.
    let prog = handcrafted(vec![Opcode::Constant as u8, 0x80]);
    assert_eq!(
        validate(&prog, &Dialect::default()).unwrap_err(),
        Error::TruncatedOperand {
            pc: 0,
            op: Opcode::Constant,
        }
    );
}

#[test]
fn pool_bounds_are_checked() {
    // CONSTANT into an empty constant pool.
    let prog = handcrafted(vec![Opcode::Constant as u8, 5]);
    assert_eq!(
        validate(&prog, &Dialect::default()).unwrap_err(),
        Error::OutOfRange {
            pc: 0,
            op: Opcode::Constant,
            arg: 5,
            pool: "constants",
            limit: 0,
        }
    );

    // LOCAL into an empty frame.
    let prog = handcrafted(vec![Opcode::Local as u8, 0]);
    assert!(matches!(
        validate(&prog, &Dialect::default()).unwrap_err(),
        Error::OutOfRange { pool: "locals", .. }
    ));

    // SETGLOBAL past the globals table.
    let prog = handcrafted(vec![Opcode::SetGlobal as u8, 1]);
    assert!(matches!(
        validate(&prog, &Dialect::default()).unwrap_err(),
        Error::OutOfRange { pool: "globals", .. }
    ));

    // MAKEFUNC with no functions.
    let prog = handcrafted(vec![Opcode::MakeFunc as u8, 0]);
    assert!(matches!(
        validate(&prog, &Dialect::default()).unwrap_err(),
        Error::OutOfRange { pool: "functions", .. }
    ));
}

#[test]
fn branch_targets_must_stay_in_code() {
    // JMP to 200 in a 3-byte stream.
    let prog = handcrafted(vec![Opcode::Jmp as u8, 0xc8, 0x01]);
    assert_eq!(
        validate(&prog, &Dialect::default()).unwrap_err(),
        Error::OutOfRange {
            pc: 0,
            op: Opcode::Jmp,
            arg: 200,
            pool: "code",
            limit: 3,
        }
    );
}

#[test]
fn stack_shaped_operands_respect_max_stack() {
    // MAKELIST 5 but max_stack says nothing that wide ever existed.
    let prog = handcrafted(vec![Opcode::MakeList as u8, 5]);
    assert!(matches!(
        validate(&prog, &Dialect::default()).unwrap_err(),
        Error::OutOfRange { pool: "stack", .. }
    ));

    // LOAD counts one extra slot for the module value.
    let mut prog = handcrafted(vec![Opcode::Load as u8, 1]);
    prog.toplevel.max_stack = 1;
    assert!(matches!(
        validate(&prog, &Dialect::default()).unwrap_err(),
        Error::OutOfRange { pool: "stack", .. }
    ));
    prog.toplevel.max_stack = 2;
    validate(&prog, &Dialect::default()).unwrap();
}

#[test]
fn predeclared_and_universal_names_are_checked() {
    let mut prog = handcrafted(vec![Opcode::Predeclared as u8, 0]);
    prog.names.push("custom".to_string());

    prog.toplevel
        .validate(&prog, &Dialect::default(), |n| n == "custom", |_| true)
        .unwrap();
    let err = prog
        .toplevel
        .validate(&prog, &Dialect::default(), |_| false, |_| true)
        .unwrap_err();
    assert_eq!(
        err,
        Error::UnknownName {
            pc: 0,
            op: Opcode::Predeclared,
            kind: "predeclared name",
            name: "custom".to_string(),
        }
    );

    let mut prog = handcrafted(vec![Opcode::Universal as u8, 0]);
    prog.names.push("len".to_string());
    let err = prog
        .toplevel
        .validate(&prog, &Dialect::default(), |_| true, |_| false)
        .unwrap_err();
    assert!(matches!(err, Error::UnknownName { op: Opcode::Universal, .. }));
}

#[test]
fn validation_checks_nested_funcodes_too() {
    // A function body full of gated opcodes trips the gate when the host
    // validates it, independent of the toplevel.
    let a = local("a", 0);
    let f = global("f", 0);
    let function = starling::syntax::Function {
        pos: pos(1),
        name: "f".to_string(),
        params: vec![starling::syntax::Param::Normal(a.clone())],
        body: vec![Stmt::Return {
            pos: pos(1),
            result: Some(binary(BinOp::Pipe, var(&a), int(1))),
        }],
        has_varargs: false,
        has_kwargs: false,
        locals: vec![a.clone()],
        freevars: vec![],
    };
    let prog = compile_file(
        "t.star",
        &[Stmt::Def {
            name: f.clone(),
            function,
        }],
        &[],
        &[f.clone()],
    );

    let narrowed = Dialect {
        allow_bitwise: false,
        ..Dialect::default()
    };
    validate(&prog, &narrowed).unwrap(); // toplevel itself is clean
    let err = prog.functions[0]
        .validate(&prog, &narrowed, |_| true, |_| true)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::DisabledFeature {
            op: Opcode::Pipe,
            feature: "bitwise",
            ..
        }
    ));
}
