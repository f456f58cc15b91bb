//! End-to-end tiering behavior: constant folding through the emitter and the
//! IR pipeline, hot-loop tier-up with OSR, and type-speculation deopt.

use kestrel_engine::ast::*;
use kestrel_engine::ir::instr::DeoptReason;
use kestrel_engine::tier::Tier;
use kestrel_engine::{Engine, EngineConfig, Value};

fn engine() -> Engine {
    Engine::new(EngineConfig {
        jit_synchronous: true,
        gc_enable_concurrent_sweep: false,
        ..Default::default()
    })
}

fn num(n: f64) -> Expr {
    Expr::Number(n)
}

fn ident(name: &str) -> Expr {
    Expr::Ident(name.to_string())
}

fn binary(op: BinaryOp, l: Expr, r: Expr) -> Expr {
    Expr::Binary { op, left: Box::new(l), right: Box::new(r) }
}

/// `5 + 10` collapses to a single constant at emit time and evaluates to 15.
#[test]
fn test_constant_fold_to_single_return() {
    let mut engine = engine();
    let program = Program {
        functions: vec![],
        body: vec![Stmt::Return(Some(binary(BinaryOp::Add, num(5.0), num(10.0))))],
    };
    let result = engine.eval_program(&program, "fold.js").unwrap();
    assert!(matches!(result, Value::Number(n) if n == 15.0));
}

/// A function with a 20 000-iteration loop: the OSR threshold queues a
/// compile mid-loop, the function ends at Baseline or above with an OSR
/// entry for the loop header, and the result is exact.
#[test]
fn test_hot_loop_tiers_up_with_osr() {
    let mut engine = engine();
    let program = Program {
        functions: vec![FunctionDecl {
            name: "count".to_string(),
            params: vec!["n".to_string()],
            strict: false,
            body: vec![
                Stmt::Let { name: "i".to_string(), init: Some(num(0.0)) },
                Stmt::While {
                    cond: binary(BinaryOp::Lt, ident("i"), ident("n")),
                    body: vec![Stmt::Assign {
                        target: "i".to_string(),
                        value: binary(BinaryOp::Add, ident("i"), num(1.0)),
                    }],
                },
                Stmt::Return(Some(ident("i"))),
            ],
        }],
        body: vec![],
    };
    engine.load_module(&program, "loop.js").unwrap();

    let result = engine
        .call_function("count", vec![Value::Number(20_000.0)])
        .unwrap();
    assert!(matches!(result, Value::Number(n) if n == 20_000.0));

    engine.drain_compiles();
    let tier = engine.tier().tier_of(1);
    assert!(tier >= Tier::Baseline, "expected ≥ Baseline, got {:?}", tier);

    // The artifact exposes an OSR entry at the loop header
    let module_has_osr = {
        let artifact = engine.tier().shared().cache.current(1);
        artifact.map(|a| !a.blob.osr_entries.is_empty()).unwrap_or(false)
    };
    assert!(module_has_osr, "hot loop should have produced an OSR entry");
}

/// `add(a, b)` speculates int32 after thousands of int calls; one string
/// call fails the guard, records a type-instability deopt, drops the tier to
/// Baseline, and still produces the JS concatenation.
#[test]
fn test_type_speculation_deopt_on_string() {
    let mut engine = engine();
    let program = Program {
        functions: vec![FunctionDecl {
            name: "add".to_string(),
            params: vec!["a".to_string(), "b".to_string()],
            strict: false,
            body: vec![Stmt::Return(Some(binary(BinaryOp::Add, ident("a"), ident("b"))))],
        }],
        body: vec![],
    };
    engine.load_module(&program, "add.js").unwrap();

    for i in 0..20_000 {
        let result = engine
            .call_function("add", vec![Value::Number(i as f64), Value::Number(1.0)])
            .unwrap();
        assert!(matches!(result, Value::Number(n) if n == (i + 1) as f64));
    }
    engine.drain_compiles();
    assert!(engine.tier().tier_of(1) >= Tier::Optimizing);

    // The string call: guard failure, deopt, correct concatenation
    let result = engine
        .call_function("add", vec![Value::Number(3.0), Value::String("x".into())])
        .unwrap();
    match result {
        Value::String(s) => assert_eq!(&*s, "3x"),
        other => panic!("expected \"3x\", got {:?}", other),
    }

    assert_eq!(engine.tier().tier_of(1), Tier::Baseline);
    let history = engine.tier().shared().profiler.deopt_history(1);
    assert!(history
        .iter()
        .any(|r| r.reason == DeoptReason::TypeInstability));

    // Subsequent calls keep working without recompiling upward immediately
    for _ in 0..100 {
        let result = engine
            .call_function("add", vec![Value::Number(1.0), Value::Number(2.0)])
            .unwrap();
        assert!(matches!(result, Value::Number(n) if n == 3.0));
    }
}

/// Megamorphic-style alternation never crosses the stability floor, so the
/// optimizing tier is never attempted.
#[test]
fn test_unstable_types_block_optimizing_tier() {
    let mut engine = engine();
    let program = Program {
        functions: vec![FunctionDecl {
            name: "mix".to_string(),
            params: vec!["a".to_string()],
            strict: false,
            body: vec![Stmt::Return(Some(binary(BinaryOp::Add, ident("a"), ident("a"))))],
        }],
        body: vec![],
    };
    engine.load_module(&program, "mix.js").unwrap();

    for i in 0..15_000 {
        let arg = if i % 2 == 0 {
            Value::Number(1.0)
        } else {
            Value::String("s".into())
        };
        engine.call_function("mix", vec![arg]).unwrap();
    }
    engine.drain_compiles();
    assert!(engine.tier().tier_of(1) < Tier::Optimizing);
}

/// The engine stats snapshot reflects compiled functions.
#[test]
fn test_stats_reflect_tiering() {
    let mut engine = engine();
    let program = Program {
        functions: vec![FunctionDecl {
            name: "f".to_string(),
            params: vec![],
            strict: false,
            body: vec![Stmt::Return(Some(num(1.0)))],
        }],
        body: vec![],
    };
    engine.load_module(&program, "s.js").unwrap();
    for _ in 0..200 {
        engine.call_function("f", vec![]).unwrap();
    }
    engine.drain_compiles();
    let stats = engine.stats();
    assert!(stats.jit.baseline + stats.jit.optimizing + stats.jit.super_optimizing >= 1);
    assert!(stats.profiler.profiled_functions >= 1);
}
