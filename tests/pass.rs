mod common;

use common::{assert_close, rbc, Point, RBC_PARAMS};
use dynmodel_core::analysis::{MfsPolicy, TemporaryTermsMode};
use dynmodel_core::{
    DynamicModel, EvalContext, EvalOutputs, Evaluator, ModelError, OutputTarget, PassOptions, SymbolType,
};
use rstest::rstest;
use std::collections::HashMap;

fn evaluate(evaluator: &dyn Evaluator, point: &Point, order: usize) -> EvalOutputs {
    let mut out = EvalOutputs::with_order(order);
    evaluator.evaluate(&point.inputs(), &mut out).unwrap();
    out
}

fn higher_order() -> PassOptions {
    PassOptions { hessian: true, third_derivatives: true, ..Default::default() }
}

#[rstest]
#[case::plain(higher_order())]
#[case::no_temporaries(PassOptions { no_tmp_terms: true, ..higher_order() })]
#[case::blocks(PassOptions { block: true, ..higher_order() })]
#[case::scoped_blocks(PassOptions { block: true, temporary_terms: TemporaryTermsMode::BlockScoped, ..higher_order() })]
#[case::blocks_non_normalized(PassOptions { block: true, mfs: MfsPolicy::NonNormalized, ..higher_order() })]
fn test_graph_and_tape_agree(#[case] options: PassOptions) {
    let (mut m, ctx) = rbc();
    let artifacts = m.computing_pass(&options, &ctx).unwrap();
    let graph = m.graph_evaluator(&artifacts);
    let tape = m.tape_evaluator(&artifacts).unwrap();
    let point = Point::new(graph.shape(), &RBC_PARAMS);

    let expected = evaluate(&graph, &point, 3);
    let actual = evaluate(&tape, &point, 3);
    assert_close(&actual.residual, &expected.residual, 1e-12);
    assert_close(actual.g1.as_ref().unwrap(), expected.g1.as_ref().unwrap(), 1e-12);
    assert_close(actual.g2.as_ref().unwrap(), expected.g2.as_ref().unwrap(), 1e-12);
    assert_close(actual.g3.as_ref().unwrap(), expected.g3.as_ref().unwrap(), 1e-12);

    // Requesting fewer outputs leaves the lower orders unchanged
    let residual_only = evaluate(&tape, &point, 0);
    assert_close(&residual_only.residual, &expected.residual, 1e-12);
    assert!(residual_only.g1.is_none());
}

#[test]
fn test_block_layout_matches_plain_layout() {
    let (mut plain, ctx) = rbc();
    let plain_artifacts = plain.computing_pass(&higher_order(), &ctx).unwrap();
    let (mut blocked, _) = rbc();
    let block_artifacts = blocked.computing_pass(&PassOptions { block: true, ..higher_order() }, &ctx).unwrap();

    let a = plain.graph_evaluator(&plain_artifacts);
    let b = blocked.graph_evaluator(&block_artifacts);
    assert_eq!(a.shape(), b.shape());
    let point = Point::new(a.shape(), &RBC_PARAMS);
    let (x, y) = (evaluate(&a, &point, 2), evaluate(&b, &point, 2));
    assert_close(&y.residual, &x.residual, 1e-12);
    assert_close(y.g1.as_ref().unwrap(), x.g1.as_ref().unwrap(), 1e-12);
    assert_close(y.g2.as_ref().unwrap(), x.g2.as_ref().unwrap(), 1e-12);
}

#[test]
fn test_hessian_matches_jacobian_differences() {
    let (mut m, ctx) = rbc();
    let artifacts = m.computing_pass(&higher_order(), &ctx).unwrap();
    let graph = m.graph_evaluator(&artifacts);
    let shape = graph.shape().clone();
    let point = Point::new(&shape, &RBC_PARAMS);
    let n = shape.jacobian_cols;

    let hessian: HashMap<(usize, usize), f64> =
        evaluate(&graph, &point, 2).triplets(2).into_iter().map(|(r, c, v)| ((r, c), v)).collect();
    let h = 1e-6;
    for j in 0..shape.y_len {
        let mut up = Point::new(&shape, &RBC_PARAMS);
        up.y[j] += h;
        let mut down = Point::new(&shape, &RBC_PARAMS);
        down.y[j] -= h;
        let (g_up, g_down) = (evaluate(&graph, &up, 1), evaluate(&graph, &down, 1));
        for row in 0..shape.equations {
            for col in 0..n {
                let fd = (g_up.jacobian(&shape, row, col).unwrap() - g_down.jacobian(&shape, row, col).unwrap()) / (2.0 * h);
                let exact = hessian.get(&(row, j * n + col)).copied().unwrap_or(0.0);
                assert!((fd - exact).abs() < 1e-5 * (1.0 + exact.abs()), "eq {} cols ({}, {}): {} vs {}", row, j, col, fd, exact);
            }
        }
    }
}

#[test]
fn test_third_order_is_symmetric() {
    let (mut m, ctx) = rbc();
    let artifacts = m.computing_pass(&higher_order(), &ctx).unwrap();
    let graph = m.graph_evaluator(&artifacts);
    let n = graph.shape().jacobian_cols;
    let point = Point::new(graph.shape(), &RBC_PARAMS);
    let third: HashMap<(usize, usize), f64> =
        evaluate(&graph, &point, 3).triplets(3).into_iter().map(|(r, c, v)| ((r, c), v)).collect();
    assert!(!third.is_empty());
    for (&(row, col), &value) in &third {
        let (a, b, d) = (col / (n * n), (col / n) % n, col % n);
        assert_eq!(third.get(&(row, (d * n + b) * n + a)), Some(&value));
        assert_eq!(third.get(&(row, (b * n + a) * n + d)), Some(&value));
    }
}

#[test]
fn test_temporaries_do_not_change_values() {
    let (mut with, ctx) = rbc();
    let with_artifacts = with.computing_pass(&higher_order(), &ctx).unwrap();
    let (mut without, _) = rbc();
    let without_artifacts = without.computing_pass(&PassOptions { no_tmp_terms: true, ..higher_order() }, &ctx).unwrap();
    assert!(with_artifacts.plan.temp_count() > 0);
    assert_eq!(without_artifacts.plan.temp_count(), 0);

    let a = with.tape_evaluator(&with_artifacts).unwrap();
    let b = without.tape_evaluator(&without_artifacts).unwrap();
    let point = Point::new(a.shape(), &RBC_PARAMS);
    let (x, y) = (evaluate(&a, &point, 3), evaluate(&b, &point, 3));
    assert_close(&x.residual, &y.residual, 1e-12);
    assert_close(x.g1.as_ref().unwrap(), y.g1.as_ref().unwrap(), 1e-12);
    assert_close(x.g3.as_ref().unwrap(), y.g3.as_ref().unwrap(), 1e-12);
}

#[test]
fn test_steady_state_residuals_vanish() {
    // Deterministic steady state: z = 0, k = (alpha*beta/(1-beta*(1-delta)))^(1/(1-alpha))
    let [alpha, beta, _, delta] = RBC_PARAMS;
    let k = (alpha * beta / (1.0 - beta * (1.0 - delta))).powf(1.0 / (1.0 - alpha));
    let c = k.powf(alpha) - delta * k;

    let (mut m, ctx) = rbc();
    let artifacts = m.computing_pass(&PassOptions { bytecode: true, ..Default::default() }, &ctx).unwrap();
    let tape = m.tape_evaluator(&artifacts).unwrap();
    let mut out = EvalOutputs::with_order(1);
    tape.evaluate_steady(&RBC_PARAMS, &[c, k, 0.0], &mut out).unwrap();
    assert_close(&out.residual, &[0.0; 3], 1e-10);
}

#[test]
fn test_periods_match_single_evaluations() {
    let (mut m, ctx) = rbc();
    let artifacts = m.computing_pass(&PassOptions::default(), &ctx).unwrap();
    let tape = m.tape_evaluator(&artifacts).unwrap();
    let shape = tape.shape().clone();
    let ys: Vec<Vec<f64>> = (0..4).map(|p| (0..shape.y_len).map(|i| 0.8 + 0.1 * (p + i) as f64).collect()).collect();
    let point = Point::new(&shape, &RBC_PARAMS);
    let x = dynmodel_core::ExogenousMatrix::new(4, 1, vec![0.0, 0.1, 0.2, 0.3]).unwrap();

    let outputs = tape
        .evaluate_periods(&ys, &x, &point.params, &point.steady_state, 0, &EvalOutputs::with_order(1))
        .unwrap();
    assert_eq!(outputs.len(), 4);
    for (p, out) in outputs.iter().enumerate() {
        let inputs = dynmodel_core::EvalInputs { y: &ys[p], x: &x, params: &point.params, steady_state: &point.steady_state, it: p };
        let mut single = EvalOutputs::with_order(1);
        tape.evaluate(&inputs, &mut single).unwrap();
        assert_eq!(out, &single);
    }
}

#[rstest]
#[case(vec![0.0, 1e-10, 1e-6, 1e-2], vec![5, 5, 4, 3])]
fn test_emitted_jacobian_shrinks_with_cutoff(#[case] cutoffs: Vec<f64>, #[case] expected: Vec<usize>) {
    // a = eps*b + p*b(-1) + 1; b = 0.5*a(-1)
    let build = || {
        let mut m = DynamicModel::new();
        m.declare("a", SymbolType::Endogenous).unwrap();
        m.declare("b", SymbolType::Endogenous).unwrap();
        m.declare("eps", SymbolType::Parameter).unwrap();
        m.declare("p", SymbolType::Parameter).unwrap();
        let (a, a_lag, b, b_lag) = (m.var("a", 0).unwrap(), m.var("a", -1).unwrap(), m.var("b", 0).unwrap(), m.var("b", -1).unwrap());
        let (eps, p) = (m.param("eps").unwrap(), m.param("p").unwrap());
        let r = &mut m.registry;
        let small = r.mul(eps, b);
        let lagged = r.mul(p, b_lag);
        let one = r.one();
        let sum = r.add(small, lagged);
        let rhs0 = r.add(sum, one);
        let half = r.constant(0.5);
        let rhs1 = r.mul(half, a_lag);
        m.add_equation(a, rhs0);
        m.add_equation(b, rhs1);
        let mut ctx = EvalContext::new();
        for (name, value) in [("a", 1.0), ("b", 1.0), ("eps", 1e-8), ("p", 1e-3)] {
            ctx.set_by_name(&m.symbols, name, value).unwrap();
        }
        (m, ctx)
    };

    let mut emitted = Vec::new();
    for cutoff in cutoffs {
        let (mut m, ctx) = build();
        let options = PassOptions { cutoff, prune_emitted_jacobian: true, ..Default::default() };
        let artifacts = m.computing_pass(&options, &ctx).unwrap();
        assert_eq!(artifacts.tables.first.len(), 5);
        assert_eq!(artifacts.plan.shape.jacobian_cols, 4);
        emitted.push(artifacts.tables.emitted_first);
    }
    // Lowering the cutoff only adds entries and leaves the others untouched
    for pair in emitted.windows(2) {
        assert!(pair[1].iter().all(|(key, node)| pair[0].get(key) == Some(node)));
    }
    assert_eq!(emitted.iter().map(|t| t.len()).collect::<Vec<_>>(), expected);
}

#[test]
fn test_same_model_generates_identical_files() {
    let options = PassOptions {
        hessian: true,
        third_derivatives: true,
        params_derivatives: true,
        use_dll: true,
        bytecode: true,
        block: true,
        ..Default::default()
    };
    let mut outputs = Vec::new();
    for _ in 0..2 {
        let dir = tempfile::tempdir().unwrap();
        let (mut m, ctx) = rbc();
        let artifacts = m.computing_pass(&options, &ctx).unwrap();
        let written = m.write_dynamic_files(&artifacts, &OutputTarget::new(dir.path(), "rbc")).unwrap();
        let contents: Vec<(String, Vec<u8>)> = written
            .iter()
            .map(|p| (p.file_name().unwrap().to_string_lossy().into_owned(), std::fs::read(p).unwrap()))
            .collect();
        outputs.push(contents);
    }
    assert_eq!(outputs[0].len(), 6);
    assert_eq!(outputs[0], outputs[1]);
}

#[test]
fn test_invalid_options_are_rejected_before_any_work() {
    let (mut m, ctx) = rbc();
    let options = PassOptions { third_derivatives: true, ..Default::default() };
    assert!(matches!(m.computing_pass(&options, &ctx), Err(ModelError::Config { .. })));
    assert!(m.deriv_ids.is_empty());
}

#[test]
fn test_lagged_exogenous_needs_substitution_for_exogenous_columns() {
    // y = e(-1)
    let mut m = DynamicModel::new();
    m.declare("y", SymbolType::Endogenous).unwrap();
    m.declare("e", SymbolType::Exogenous).unwrap();
    let (y, e_lag) = (m.var("y", 0).unwrap(), m.var("e", -1).unwrap());
    m.add_equation(y, e_lag);
    let mut ctx = EvalContext::new();
    ctx.set_by_name(&m.symbols, "y", 0.0).unwrap();
    ctx.set_by_name(&m.symbols, "e", 0.0).unwrap();

    let options = PassOptions { hessian: true, ..Default::default() };
    assert!(matches!(m.computing_pass(&options, &ctx), Err(ModelError::ExogenousLag { lag: -1, .. })));

    m.substitute_exo_lag().unwrap();
    let artifacts = m.computing_pass(&options, &ctx).unwrap();
    assert_eq!(artifacts.plan.shape.equations, 2);
}
