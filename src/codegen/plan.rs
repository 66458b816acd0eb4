//! plan.rs
//! The emission plan: every value a generated evaluator computes, the buffer
//! slot it lands in and the temporary terms defined before it. The MATLAB,
//! C and tape emitters and the in-memory evaluator all walk the same plan,
//! which keeps the temporary-term order identical across forms.

use crate::analysis::temporary::extract;
use crate::analysis::{BlockDecomposition, EquationKind, TemporaryTermsMode};
use crate::config::PassOptions;
use crate::derive::DerivativeTables;
use crate::error::{ModelError, Result};
use crate::evaluator::EvaluatorShape;
use crate::model::{DerivId, DerivIdTable, Equation, SymbolTable};
use crate::store::{NodeId, NodeKind, Registry, SymbolType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Output {
    Residual,
    Jacobian,
    Hessian,
    Third,
    ParamResidual,
    ParamJacobian,
    ParamResidualSecond,
    ParamJacobianSecond,
    ParamHessian,
    BlockEvaluate,
    BlockResidual,
    BlockJacobian,
}

impl Output {
    /// Position in the routine's output list.
    pub fn position(self) -> u8 {
        match self {
            Output::Residual | Output::ParamResidual | Output::BlockEvaluate => 0,
            Output::Jacobian | Output::ParamJacobian | Output::BlockResidual => 1,
            Output::Hessian | Output::ParamResidualSecond | Output::BlockJacobian => 2,
            Output::Third | Output::ParamJacobianSecond => 3,
            Output::ParamHessian => 4,
        }
    }

    pub fn mask(self) -> u8 { 1 << self.position() }
}

/// How a leaf of an expression is read from the evaluator arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    /// `y[col]`
    Endogenous { col: usize },
    /// `x[it + lag, col]`
    Exogenous { col: usize, lag: i32 },
    Parameter { index: usize },
    SteadyState { index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Residual { row: usize },
    /// Column-major `g1[row + col * equations]`.
    Jacobian { row: usize, col: usize },
    /// Triplet `slot` of `g2` (`order` 2) or `g3` (`order` 3); row and col are 0-based.
    Sparse { order: u8, slot: usize, row: usize, col: usize },
    /// Writes `y[col]` during block-local evaluation.
    Endogenous { col: usize },
    BlockResidual { row: usize },
    BlockJacobian { row: usize, col: usize },
    ParamResidual { row: usize, param: usize },
    ParamJacobian { row: usize, col: usize, param: usize },
    /// Row `slot` of a list output: `[indices..., value]`.
    ParamList { slot: usize, indices: [usize; 4] },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub target: Target,
    pub expr: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub output: Output,
    pub block: Option<usize>,
    pub scope: usize,
    /// Temporaries defined at the start of the section, with their slots.
    pub temps: Vec<(NodeId, usize)>,
    pub assignments: Vec<Assignment>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Routine {
    pub sections: Vec<Section>,
    pub scopes: Vec<HashMap<NodeId, usize>>,
    pub temp_count: usize,
}

impl Routine {
    pub fn temp_slot(&self, scope: usize, node: NodeId) -> Option<usize> {
        self.scopes.get(scope).and_then(|s| s.get(&node)).copied()
    }

    /// Outputs whose computation needs the temporaries of section `s`.
    pub fn temps_needed_mask(&self, s: usize) -> u8 {
        self.sections[s..].iter().fold(0, |m, sec| m | sec.output.mask())
    }

    pub fn outputs_mask(&self) -> u8 { self.temps_needed_mask(0) }

    pub fn roots(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.sections
            .iter()
            .flat_map(|s| s.temps.iter().map(|t| t.0).chain(s.assignments.iter().map(|a| a.expr)))
    }
}

/// Block-local work for the block VM: evaluate the recursive variables,
/// then the feedback residuals and their Jacobian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSolver {
    pub block: usize,
    pub routine: Routine,
    pub feedback_size: usize,
    /// `feedback_size * (lag + lead + 1)` of the block's own variables.
    pub jacobian_cols: usize,
}

#[derive(Debug, Clone)]
pub struct EmissionPlan {
    pub model: Routine,
    pub block_solvers: Vec<BlockSolver>,
    pub params: Option<Routine>,
    pub shape: EvaluatorShape,
    pub operands: HashMap<NodeId, Operand>,
    pub block_mode: bool,
}

pub struct PlanInput<'a> {
    pub registry: &'a Registry,
    pub symbols: &'a SymbolTable,
    pub deriv_ids: &'a DerivIdTable,
    pub equations: &'a [Equation],
    pub tables: &'a DerivativeTables,
    pub blocks: Option<&'a BlockDecomposition>,
    pub options: &'a PassOptions,
}

/// Set of sections that never receive temporaries.
const NO_TEMPS: usize = usize::MAX;

struct SectionSpec {
    output: Output,
    block: Option<usize>,
    scope: usize,
    set: usize,
    assignments: Vec<Assignment>,
}

impl SectionSpec {
    fn new(output: Output, block: Option<usize>, scope: usize, set: usize, assignments: Vec<Assignment>) -> Self {
        Self { output, block, scope, set, assignments }
    }
}

/// Assigns temporaries to the sections, set by set, and numbers their slots.
fn finish(registry: &Registry, specs: Vec<SectionSpec>, with_temps: bool) -> Routine {
    let scope_count = specs.iter().map(|s| s.scope + 1).max().unwrap_or(0);
    let mut routine = Routine { scopes: vec![HashMap::new(); scope_count], ..Default::default() };
    let mut temps: Vec<Vec<(NodeId, usize)>> = vec![Vec::new(); specs.len()];

    if with_temps {
        let mut sets: Vec<usize> = specs.iter().map(|s| s.set).collect();
        sets.dedup();
        for set in sets.into_iter().filter(|&s| s != NO_TEMPS) {
            let members: Vec<usize> = (0..specs.len()).filter(|&i| specs[i].set == set).collect();
            let scope = specs[members[0]].scope;
            let groups: Vec<Vec<NodeId>> =
                members.iter().map(|&i| specs[i].assignments.iter().map(|a| a.expr).collect()).collect();
            let available: HashSet<NodeId> = routine.scopes[scope].keys().copied().collect();
            let extracted = extract(registry, &groups, &available);
            for (k, &i) in members.iter().enumerate() {
                for &node in &extracted.sections[k] {
                    let slot = routine.temp_count;
                    routine.temp_count += 1;
                    routine.scopes[scope].insert(node, slot);
                    temps[i].push((node, slot));
                }
            }
        }
    }

    routine.sections = specs
        .into_iter()
        .zip(temps)
        .map(|(spec, temps)| Section {
            output: spec.output,
            block: spec.block,
            scope: spec.scope,
            temps,
            assignments: spec.assignments,
        })
        .collect();
    routine
}

impl<'a> PlanInput<'a> {
    fn col(&self, id: DerivId) -> Result<usize> { self.deriv_ids.dyn_jacobian_col(id) }

    fn endo_tsid(&self, id: DerivId) -> Result<Option<usize>> {
        if self.deriv_ids.type_of(id)? != SymbolType::Endogenous {
            return Ok(None);
        }
        Ok(Some(self.symbols.type_specific_id(self.deriv_ids.lookup(id)?.0)?))
    }

    fn param_index(&self, id: DerivId) -> Result<usize> {
        self.symbols.type_specific_id(self.deriv_ids.lookup(id)?.0)
    }

    fn residuals(&self, eqs: &[usize]) -> Vec<Assignment> {
        eqs.iter().map(|&row| Assignment { target: Target::Residual { row }, expr: self.equations[row].residual }).collect()
    }

    fn jacobian(&self, filter: impl Fn(usize, DerivId) -> Result<bool>) -> Result<Vec<Assignment>> {
        let mut out = Vec::new();
        for (&(row, id), &expr) in &self.tables.emitted_first {
            if filter(row, id)? {
                out.push(Assignment { target: Target::Jacobian { row, col: self.col(id)? }, expr });
            }
        }
        Ok(out)
    }

    fn hessian(&self) -> Result<Vec<Assignment>> {
        let n = self.deriv_ids.dyn_jacobian_cols_nbr();
        let mut out = Vec::new();
        for (&(row, id1, id2), &expr) in &self.tables.second {
            let (c1, c2) = (self.col(id1)?, self.col(id2)?);
            let mut cols = vec![c1 * n + c2];
            if c1 != c2 {
                cols.push(c2 * n + c1);
            }
            for col in cols {
                out.push(Assignment { target: Target::Sparse { order: 2, slot: out.len(), row, col }, expr });
            }
        }
        Ok(out)
    }

    fn third(&self) -> Result<Vec<Assignment>> {
        let n = self.deriv_ids.dyn_jacobian_cols_nbr();
        let mut out = Vec::new();
        for (&(row, id1, id2, id3), &expr) in &self.tables.third {
            let c = [self.col(id1)?, self.col(id2)?, self.col(id3)?];
            let perms: BTreeSet<(usize, usize, usize)> = [
                (c[0], c[1], c[2]),
                (c[0], c[2], c[1]),
                (c[1], c[0], c[2]),
                (c[1], c[2], c[0]),
                (c[2], c[0], c[1]),
                (c[2], c[1], c[0]),
            ]
            .into_iter()
            .collect();
            for (a, b, d) in perms {
                out.push(Assignment { target: Target::Sparse { order: 3, slot: out.len(), row, col: (a * n + b) * n + d }, expr });
            }
        }
        Ok(out)
    }

    fn model_routine(&self) -> Result<Routine> {
        let scoped = self.options.temporary_terms == TemporaryTermsMode::BlockScoped;
        let mut specs = Vec::new();
        match self.blocks {
            None => {
                let all: Vec<usize> = (0..self.equations.len()).collect();
                specs.push(SectionSpec::new(Output::Residual, None, 0, 0, self.residuals(&all)));
                specs.push(SectionSpec::new(Output::Jacobian, None, 0, 0, self.jacobian(|_, _| Ok(true))?));
            }
            Some(blocks) => {
                for b in 0..blocks.nb_blocks() {
                    let eqs = blocks.block_equations(b)?;
                    let vars: HashSet<usize> = blocks.block_variables(b)?.iter().copied().collect();
                    let own_eqs: HashSet<usize> = eqs.iter().copied().collect();
                    let (scope, own_set, other_set) = if scoped { (b + 1, 2 * b + 1, 2 * b + 2) } else { (0, 0, 0) };
                    let own = self.jacobian(|row, id| {
                        Ok(own_eqs.contains(&row) && self.endo_tsid(id)?.map_or(false, |t| vars.contains(&t)))
                    })?;
                    let other = self.jacobian(|row, id| {
                        Ok(own_eqs.contains(&row) && !self.endo_tsid(id)?.map_or(false, |t| vars.contains(&t)))
                    })?;
                    specs.push(SectionSpec::new(Output::Residual, Some(b), scope, own_set, self.residuals(eqs)));
                    specs.push(SectionSpec::new(Output::Jacobian, Some(b), scope, own_set, own));
                    specs.push(SectionSpec::new(Output::Jacobian, Some(b), scope, other_set, other));
                }
            }
        }
        let (scope, set) = match (self.blocks, scoped) {
            (Some(blocks), true) => (blocks.nb_blocks() + 1, 2 * blocks.nb_blocks() + 1),
            _ => (0, 0),
        };
        if self.options.hessian {
            specs.push(SectionSpec::new(Output::Hessian, None, scope, set, self.hessian()?));
        }
        if self.options.third_derivatives {
            specs.push(SectionSpec::new(Output::Third, None, scope, set, self.third()?));
        }
        Ok(finish(self.registry, specs, !self.options.no_tmp_terms))
    }

    fn block_solver(&self, blocks: &BlockDecomposition, b: usize) -> Result<BlockSolver> {
        let block = blocks.block(b)?;
        let vars = blocks.block_variables(b)?;
        let fb = block.feedback_size();
        let lag = block.lag_lead.endo.lag;
        let width = (block.lag_lead.endo.lag + block.lag_lead.endo.lead + 1) as usize;

        let mut evaluate = Vec::new();
        for (i, &eq) in blocks.recursive_equations(b)?.iter().enumerate() {
            let symbol = self.symbols.by_type_specific_id(SymbolType::Endogenous, vars[i])?;
            let id = self.deriv_ids.require(self.symbols, symbol, 0)?;
            let expr = match blocks.equation_kind(eq)? {
                EquationKind::Evaluate => self.equations[eq].rhs,
                EquationKind::EvaluateRenormalized(node) => node,
                EquationKind::Solve => return Err(ModelError::NotNormalized { equation: eq }),
            };
            evaluate.push(Assignment { target: Target::Endogenous { col: self.col(id)? }, expr });
        }

        let feedback_eqs = blocks.feedback_equations(b)?;
        let feedback_vars = blocks.feedback_variables(b)?;
        let residual = feedback_eqs
            .iter()
            .enumerate()
            .map(|(row, &eq)| Assignment { target: Target::BlockResidual { row }, expr: self.equations[eq].residual })
            .collect();

        let local_col = |tsid: usize, lag_of: i32| -> Option<usize> {
            let j = feedback_vars.iter().position(|&v| v == tsid)?;
            Some((lag_of + lag) as usize * fb + j)
        };
        let mut jacobian = Vec::new();
        for (row, &eq) in feedback_eqs.iter().enumerate() {
            if block.recursive_size > 0 {
                for (&(e, symbol, l), &expr) in self.tables.chain_rule.range((eq, Default::default(), i32::MIN)..) {
                    if e != eq {
                        break;
                    }
                    if let Some(col) = local_col(self.symbols.type_specific_id(symbol)?, l) {
                        jacobian.push(Assignment { target: Target::BlockJacobian { row, col }, expr });
                    }
                }
            } else {
                for (&(e, id), &expr) in self.tables.first.range((eq, DerivId(0))..) {
                    if e != eq {
                        break;
                    }
                    let Some(tsid) = self.endo_tsid(id)? else { continue };
                    if let Some(col) = local_col(tsid, self.deriv_ids.lookup(id)?.1) {
                        jacobian.push(Assignment { target: Target::BlockJacobian { row, col }, expr });
                    }
                }
            }
        }

        // Recursive variables are written to y one after the other, so their
        // expressions read y directly. Scope 1 stays empty: the temporaries of
        // scope 0 are only defined after y has been updated
        let specs = vec![
            SectionSpec::new(Output::BlockEvaluate, Some(b), 1, NO_TEMPS, evaluate),
            SectionSpec::new(Output::BlockResidual, Some(b), 0, 0, residual),
            SectionSpec::new(Output::BlockJacobian, Some(b), 0, 0, jacobian),
        ];
        Ok(BlockSolver {
            block: b,
            routine: finish(self.registry, specs, !self.options.no_tmp_terms),
            feedback_size: fb,
            jacobian_cols: fb * width,
        })
    }

    fn params_routine(&self) -> Result<Routine> {
        let p = &self.tables.params;
        let mut rp = Vec::new();
        for (&(row, param), &expr) in &p.residuals {
            rp.push(Assignment { target: Target::ParamResidual { row, param: self.param_index(param)? }, expr });
        }
        let mut gp = Vec::new();
        for (&(row, var, param), &expr) in &p.jacobian {
            gp.push(Assignment {
                target: Target::ParamJacobian { row, col: self.col(var)?, param: self.param_index(param)? },
                expr,
            });
        }
        // List outputs carry both orderings of symmetric pairs
        let mut rpp = Vec::new();
        for (&(row, p1, p2), &expr) in &p.residuals_second {
            let (a, b) = (self.param_index(p1)?, self.param_index(p2)?);
            for (x, y) in symmetric(a, b) {
                rpp.push(Assignment { target: Target::ParamList { slot: rpp.len(), indices: [row, x, y, 0] }, expr });
            }
        }
        let mut gpp = Vec::new();
        for (&(row, var, p1, p2), &expr) in &p.jacobian_second {
            let col = self.col(var)?;
            let (a, b) = (self.param_index(p1)?, self.param_index(p2)?);
            for (x, y) in symmetric(a, b) {
                gpp.push(Assignment { target: Target::ParamList { slot: gpp.len(), indices: [row, col, x, y] }, expr });
            }
        }
        let mut hp = Vec::new();
        for (&(row, v1, v2, param), &expr) in &p.hessian {
            let (a, b) = (self.col(v1)?, self.col(v2)?);
            let k = self.param_index(param)?;
            for (x, y) in symmetric(a, b) {
                hp.push(Assignment { target: Target::ParamList { slot: hp.len(), indices: [row, x, y, k] }, expr });
            }
        }
        let specs = vec![
            SectionSpec::new(Output::ParamResidual, None, 0, 0, rp),
            SectionSpec::new(Output::ParamJacobian, None, 0, 0, gp),
            SectionSpec::new(Output::ParamResidualSecond, None, 0, 0, rpp),
            SectionSpec::new(Output::ParamJacobianSecond, None, 0, 0, gpp),
            SectionSpec::new(Output::ParamHessian, None, 0, 0, hp),
        ];
        Ok(finish(self.registry, specs, !self.options.no_tmp_terms))
    }

    fn operand(&self, kind: &NodeKind) -> Result<Option<Operand>> {
        Ok(match *kind {
            NodeKind::Variable { symbol, lag } => match self.symbols.symbol_type(symbol)? {
                SymbolType::Endogenous => {
                    let id = self.deriv_ids.get(symbol, lag).ok_or_else(|| ModelError::UnknownSymbol {
                        name: format!("{}({})", self.symbols.name(symbol).unwrap_or("?"), lag),
                    })?;
                    Some(Operand::Endogenous { col: self.col(id)? })
                }
                SymbolType::Exogenous => Some(Operand::Exogenous { col: self.symbols.type_specific_id(symbol)?, lag }),
                SymbolType::ExogenousDet => Some(Operand::Exogenous {
                    col: self.symbols.exo_nbr() + self.symbols.type_specific_id(symbol)?,
                    lag,
                }),
                SymbolType::Parameter => Some(Operand::Parameter { index: self.symbols.type_specific_id(symbol)? }),
            },
            NodeKind::Parameter(symbol) => Some(Operand::Parameter { index: self.symbols.type_specific_id(symbol)? }),
            NodeKind::SteadyState(symbol) => Some(Operand::SteadyState { index: self.symbols.type_specific_id(symbol)? }),
            _ => None,
        })
    }

    fn shape(&self, model: &Routine) -> Result<EvaluatorShape> {
        let count = |order: u8| {
            model
                .sections
                .iter()
                .flat_map(|s| &s.assignments)
                .filter(|a| matches!(a.target, Target::Sparse { order: o, .. } if o == order))
                .count()
        };
        let ids = self.deriv_ids;
        let mut y_index = vec![0; ids.endo_dynamic_nbr()];
        for id in ids.ids_of_type(SymbolType::Endogenous) {
            y_index[self.col(id)?] = self.symbols.type_specific_id(ids.lookup(id)?.0)?;
        }
        Ok(EvaluatorShape {
            equations: self.equations.len(),
            y_len: ids.endo_dynamic_nbr(),
            endo_nbr: self.symbols.endo_nbr(),
            exo_cols: self.symbols.exo_nbr() + self.symbols.exo_det_nbr(),
            param_nbr: self.symbols.param_nbr(),
            jacobian_cols: ids.dyn_jacobian_cols_nbr(),
            nnz_g2: count(2),
            nnz_g3: count(3),
            max_lag: ids.max_lag(),
            exo_lag: ids.exo.lag.max(ids.exo_det.lag),
            exo_lead: ids.exo.lead.max(ids.exo_det.lead),
            y_index,
        })
    }
}

fn symmetric(a: usize, b: usize) -> Vec<(usize, usize)> {
    if a == b { vec![(a, b)] } else { vec![(a, b), (b, a)] }
}

impl EmissionPlan {
    pub fn build(input: &PlanInput) -> Result<Self> {
        let model = input.model_routine()?;
        let mut block_solvers = Vec::new();
        if let Some(blocks) = input.blocks {
            for b in 0..blocks.nb_blocks() {
                block_solvers.push(input.block_solver(blocks, b)?);
            }
        }
        let params = if input.options.params_derivatives { Some(input.params_routine()?) } else { None };

        let mut operands = HashMap::new();
        let roots: Vec<NodeId> = model
            .roots()
            .chain(block_solvers.iter().flat_map(|s| s.routine.roots()))
            .chain(params.iter().flat_map(|r| r.roots()))
            .collect();
        for leaf in input.registry.leaves(roots) {
            if let Some(op) = input.operand(input.registry.kind(leaf))? {
                operands.insert(leaf, op);
            }
        }
        let shape = input.shape(&model)?;
        Ok(Self { model, block_solvers, params, shape, operands, block_mode: input.blocks.is_some() })
    }

    pub fn operand(&self, node: NodeId) -> Result<Operand> {
        self.operands.get(&node).copied().ok_or(ModelError::UnknownSymbol { name: format!("node {}", node.0) })
    }

    pub fn temp_count(&self) -> usize { self.model.temp_count }
}
