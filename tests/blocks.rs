mod common;

use common::{assert_close, rbc, Point, RBC_PARAMS};
use dynmodel_core::analysis::{EquationKind, MfsPolicy, SimulationType};
use dynmodel_core::display::format_blocks;
use dynmodel_core::evaluator::TapeEvaluator;
use dynmodel_core::store::NodeEvaluator;
use dynmodel_core::{
    DynamicModel, EvalContext, EvalInputs, Evaluator, ExogenousMatrix, ModelError, PassOptions, SymbolType,
};
use rstest::rstest;

fn endogenous(m: &mut DynamicModel, names: &[&str], value: f64) -> EvalContext {
    let mut ctx = EvalContext::new();
    for name in names {
        m.declare(name, SymbolType::Endogenous).unwrap();
        ctx.set_by_name(&m.symbols, name, value).unwrap();
    }
    ctx
}

/// w = 2*y + x; x = 0.5*y + 1; y = 0.5*x
fn loop_model() -> (DynamicModel, EvalContext) {
    let mut m = DynamicModel::new();
    let ctx = endogenous(&mut m, &["w", "x", "y"], 1.0);
    let (w, x, y) = (m.var("w", 0).unwrap(), m.var("x", 0).unwrap(), m.var("y", 0).unwrap());
    let r = &mut m.registry;
    let (two, half, one) = (r.constant(2.0), r.constant(0.5), r.one());
    let two_y = r.mul(two, y);
    let rhs0 = r.add(two_y, x);
    let half_y = r.mul(half, y);
    let rhs1 = r.add(half_y, one);
    let rhs2 = r.mul(half, x);
    m.add_equation(w, rhs0);
    m.add_equation(x, rhs1);
    m.add_equation(y, rhs2);
    (m, ctx)
}

fn block_options(mfs: MfsPolicy) -> PassOptions {
    PassOptions { block: true, bytecode: true, mfs, ..Default::default() }
}

#[test]
fn test_loop_is_solved_before_its_dependent() {
    let (mut m, ctx) = loop_model();
    let artifacts = m.computing_pass(&block_options(MfsPolicy::NonNormalized), &ctx).unwrap();
    let blocks = artifacts.blocks.as_ref().unwrap();

    assert_eq!(blocks.nb_blocks(), 2);
    let mut simultaneous = blocks.block_equations(0).unwrap().to_vec();
    simultaneous.sort_unstable();
    assert_eq!(simultaneous, vec![1, 2]);
    assert_eq!(blocks.block(0).unwrap().recursive_size, 1);
    assert_eq!(blocks.block(0).unwrap().feedback_size(), 1);
    assert_eq!(blocks.block(1).unwrap().simulation_type, SimulationType::EvaluateForward);
    assert_eq!(blocks.block_equations(1).unwrap(), &[0]);
    assert_eq!(blocks.block_of_equation(0).unwrap(), 1);
    assert!(blocks.block(0).unwrap().linear);

    // Every equation appears exactly once, with its matched variable
    let mut all = blocks.equation_reordered.clone();
    all.sort_unstable();
    assert_eq!(all, vec![0, 1, 2]);
    for (position, &eq) in blocks.equation_reordered.iter().enumerate() {
        assert_eq!(blocks.inv_equation_reordered[eq], position);
    }

    // Contemporaneous dependencies never point to a later block
    for &(eq, var) in artifacts.incidence.contemporaneous.keys() {
        let source = blocks.equation_reordered[blocks.inv_variable_reordered[var]];
        assert!(blocks.block_of_equation(source).unwrap() <= blocks.block_of_equation(eq).unwrap());
    }

    let report = format_blocks(blocks, &m.symbols).unwrap();
    assert!(report.starts_with("BLOCK STRUCTURE (2 blocks):"));
    assert!(report.contains("eq 1 -> w (evaluate)"));
    assert!(report.contains("(feedback)"));
}

#[test]
fn test_chain_rule_through_recursive_variable() {
    let (mut m, ctx) = loop_model();
    let artifacts = m.computing_pass(&block_options(MfsPolicy::NonNormalized), &ctx).unwrap();
    assert_eq!(artifacts.tables.chain_rule.len(), 1);

    // Explicit equations keep their left-hand variable, so nothing is renormalized
    let blocks = artifacts.blocks.as_ref().unwrap();
    for eq in 0..3 {
        assert_eq!(blocks.variable_reordered[blocks.inv_equation_reordered[eq]], eq);
        assert_eq!(blocks.equation_kind(eq).unwrap(), EquationKind::Evaluate);
    }

    // Whichever equation is kept as feedback, substituting the other one gives 1 - 0.5*0.5
    let leaves = ctx.leaves(&m.symbols);
    let mut values = NodeEvaluator::new(&m.registry, &leaves);
    for &node in artifacts.tables.chain_rule.values() {
        assert!((values.value(node).unwrap() - 0.75).abs() < 1e-14);
    }

    let tape = m.tape_evaluator(&artifacts).unwrap();
    assert_eq!(tape.block_count(), 2);
    let x = ExogenousMatrix::zeros(1, 0);
    let y = [0.0, 4.0 / 3.0, 2.0 / 3.0];
    let inputs = EvalInputs { y: &y, x: &x, params: &[], steady_state: &[0.0; 3], it: 0 };
    let solved = tape.evaluate_block(0, &inputs).unwrap();
    assert_eq!(solved.feedback_size, 1);
    assert_eq!(solved.jacobian_cols, 1);
    assert!((solved.jacobian[0] - 0.75).abs() < 1e-14);
    assert!(solved.residual[0].abs() < 1e-14);

    let dependent = tape.evaluate_block(1, &EvalInputs { y: &solved.y, ..inputs }).unwrap();
    assert!((dependent.y[0] - 8.0 / 3.0).abs() < 1e-14);
    assert_eq!(dependent.feedback_size, 0);
    assert!(matches!(tape.evaluate_block(2, &inputs), Err(ModelError::UnknownBlock { block: 2 })));
}

/// a = exp(c); b = exp(c) * a; c = 0.5 * b + 0.1 * exp(c)
fn shared_subexpression_model() -> (DynamicModel, EvalContext) {
    let mut m = DynamicModel::new();
    let ctx = endogenous(&mut m, &["a", "b", "c"], 0.5);
    let (a, b, c) = (m.var("a", 0).unwrap(), m.var("b", 0).unwrap(), m.var("c", 0).unwrap());
    let r = &mut m.registry;
    let growth = r.exp(c);
    let scaled = r.mul(growth, a);
    let (half, tenth) = (r.constant(0.5), r.constant(0.1));
    let shrunk = r.mul(half, b);
    let drift = r.mul(tenth, growth);
    let feedback = r.add(shrunk, drift);
    m.add_equation(a, growth);
    m.add_equation(b, scaled);
    m.add_equation(c, feedback);
    (m, ctx)
}

#[test]
fn test_block_solver_matches_reference_evaluation() {
    let (mut m, ctx) = shared_subexpression_model();
    let artifacts = m.computing_pass(&block_options(MfsPolicy::NonNormalized), &ctx).unwrap();
    let blocks = artifacts.blocks.as_ref().unwrap();
    assert_eq!(blocks.nb_blocks(), 1);
    assert_eq!(blocks.recursive_equations(0).unwrap(), &[0, 1]);
    assert_eq!(blocks.feedback_equations(0).unwrap(), &[2]);

    // The recursive section reads y only
    let solver = &artifacts.plan.block_solvers[0].routine;
    assert!(solver.sections[0].temps.is_empty());
    assert!(solver.scopes[solver.sections[0].scope].is_empty());

    let tape = m.tape_evaluator(&artifacts).unwrap();
    let x = ExogenousMatrix::zeros(1, 0);
    let y = [0.3, 0.2, 0.1];
    let inputs = EvalInputs { y: &y, x: &x, params: &[], steady_state: &[0.0; 3], it: 0 };
    let solved = tape.evaluate_block(0, &inputs).unwrap();

    // Recursive right-hand sides evaluated one after the other
    let mut point = EvalContext::new();
    for (name, value) in ["a", "b", "c"].into_iter().zip(y) {
        point.set_by_name(&m.symbols, name, value).unwrap();
    }
    for (i, &eq) in blocks.recursive_equations(0).unwrap().iter().enumerate() {
        let tsid = blocks.block_variable_id(0, i).unwrap();
        let symbol = m.symbols.by_type_specific_id(SymbolType::Endogenous, tsid).unwrap();
        let expr = match blocks.equation_kind(eq).unwrap() {
            EquationKind::Evaluate => m.equations[eq].rhs,
            EquationKind::EvaluateRenormalized(node) => node,
            EquationKind::Solve => panic!("equation {} is not evaluable", eq),
        };
        let leaves = point.leaves(&m.symbols);
        let value = NodeEvaluator::new(&m.registry, &leaves).value(expr).unwrap();
        point.set(symbol, value);
    }
    let expected_y: Vec<f64> = ["a", "b", "c"].iter().map(|n| point.get(m.symbols.id(n).unwrap()).unwrap()).collect();
    assert_close(&solved.y, &expected_y, 1e-14);

    // Feedback residual and chain-rule Jacobian at the updated point
    let leaves = point.leaves(&m.symbols);
    let mut values = NodeEvaluator::new(&m.registry, &leaves);
    assert_close(&solved.residual, &[values.value(m.equations[2].residual).unwrap()], 1e-14);
    assert_eq!(artifacts.tables.chain_rule.len(), 1);
    let derivative = *artifacts.tables.chain_rule.values().next().unwrap();
    assert_close(&solved.jacobian, &[values.value(derivative).unwrap()], 1e-14);

    // With a and b substituted the residual is c - 0.5 exp(2c) - 0.1 exp(c)
    let c = y[2];
    assert!((solved.jacobian[0] - (1.0 - (2.0 * c).exp() - 0.1 * c.exp())).abs() < 1e-12);
}

#[test]
fn test_all_feedback_keeps_loop_simultaneous() {
    let (mut m, ctx) = loop_model();
    let artifacts = m.computing_pass(&block_options(MfsPolicy::AllFeedback), &ctx).unwrap();
    let blocks = artifacts.blocks.as_ref().unwrap();
    assert_eq!(blocks.block(0).unwrap().recursive_size, 0);
    assert_eq!(blocks.block(0).unwrap().feedback_size(), 2);
    assert!(artifacts.tables.chain_rule.is_empty());

    let tape = m.tape_evaluator(&artifacts).unwrap();
    let x = ExogenousMatrix::zeros(1, 0);
    let y = [0.0, 1.0, 1.0];
    let inputs = EvalInputs { y: &y, x: &x, params: &[], steady_state: &[0.0; 3], it: 0 };
    let solved = tape.evaluate_block(0, &inputs).unwrap();
    assert_eq!(solved.jacobian.len(), 4);
    // Feedback Jacobian entries are +-1 on the own variable and -0.5 on the other
    let mut entries = solved.jacobian.clone();
    entries.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(entries, vec![-0.5, -0.5, 1.0, 1.0]);
}

#[test]
fn test_recursive_rbc_block_structure() {
    let (mut m, ctx) = rbc();
    let artifacts = m.computing_pass(&block_options(MfsPolicy::AllFeedback), &ctx).unwrap();
    let blocks = artifacts.blocks.as_ref().unwrap();
    assert_eq!(blocks.nb_blocks(), 2);
    assert_eq!(blocks.block_equations(0).unwrap(), &[0]);
    assert_eq!(blocks.block(0).unwrap().simulation_type, SimulationType::EvaluateForward);
    assert_eq!(blocks.block(1).unwrap().simulation_type, SimulationType::SolveTwoBoundariesComplete);
    assert!(!blocks.block(1).unwrap().linear);

    // Block solver Jacobian spans the block's own lags and leads
    let tape: TapeEvaluator = m.tape_evaluator(&artifacts).unwrap();
    let point = Point::new(tape.shape(), &RBC_PARAMS);
    let solved = tape.evaluate_block(1, &point.inputs()).unwrap();
    assert_eq!(solved.feedback_size, 2);
    assert_eq!(solved.jacobian_cols, 6);
    assert_eq!(solved.jacobian.len(), 12);
}

fn singular(case: u8) -> (DynamicModel, EvalContext) {
    let mut m = DynamicModel::new();
    let ctx = match case {
        // b never appears in the current period
        0 => {
            let ctx = endogenous(&mut m, &["a", "b"], 1.0);
            let (a, b_lag) = (m.var("a", 0).unwrap(), m.var("b", -1).unwrap());
            let one = m.registry.one();
            let three = m.registry.constant(3.0);
            m.add_equation(a, one);
            let sum = m.registry.add(a, b_lag);
            m.add_equation(sum, three);
            ctx
        }
        // a + b = 1 and 2a + 2b = 3
        1 => {
            let ctx = endogenous(&mut m, &["a", "b"], 1.0);
            let (a, b) = (m.var("a", 0).unwrap(), m.var("b", 0).unwrap());
            let r = &mut m.registry;
            let (one, two, three) = (r.one(), r.constant(2.0), r.constant(3.0));
            let sum = r.add(a, b);
            let double = r.mul(two, sum);
            m.add_equation(sum, one);
            m.add_equation(double, three);
            ctx
        }
        _ => unreachable!(),
    };
    (m, ctx)
}

#[rstest]
#[case::unmatched(0)]
#[case::rank_deficient(1)]
fn test_singular_systems_are_rejected(#[case] case: u8) {
    let (mut m, ctx) = singular(case);
    let err = m.computing_pass(&block_options(MfsPolicy::AllFeedback), &ctx).unwrap_err();
    assert!(matches!(err, ModelError::StructuralSingularity { .. }), "{:?}", err);
}

#[test]
fn test_equation_count_must_match() {
    let mut m = DynamicModel::new();
    let ctx = endogenous(&mut m, &["a", "b"], 1.0);
    let a = m.var("a", 0).unwrap();
    let one = m.registry.one();
    m.add_equation(a, one);
    let err = m.computing_pass(&block_options(MfsPolicy::AllFeedback), &ctx).unwrap_err();
    assert!(matches!(err, ModelError::EquationCountMismatch { equations: 1, endogenous: 2 }));

    // Without blocks the pass does not need a square system
    assert!(m.computing_pass(&PassOptions::default(), &ctx).is_ok());
}
