//! blocks.rs
//! Block-triangular decomposition of the contemporaneous system.
//!
//! Equations are matched to endogenous variables, grouped into strongly
//! connected components ordered dependency-first, classified by the lags and
//! leads of their own variables, and split into a recursive prefix and a
//! feedback set.

use super::feedback::{select_feedback, MfsPolicy};
use super::incidence::Incidence;
use super::normalize::{EquationKind, Normalization, Normalizer};
use crate::derive::{Differentiator, FirstDerivatives};
use crate::error::{ModelError, Result};
use crate::model::{DerivId, DerivIdTable, Equation, LagLead, SymbolTable};
use crate::store::{NodeKind, Registry, SymbolType};
use log::{debug, info};
use nalgebra::DMatrix;
use petgraph::algo::{maximum_matching, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex, UnGraph};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Backward,
    TwoBoundaries,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationType {
    EvaluateForward,
    EvaluateBackward,
    SolveForwardSimple,
    SolveBackwardSimple,
    SolveTwoBoundariesSimple,
    SolveForwardComplete,
    SolveBackwardComplete,
    SolveTwoBoundariesComplete,
}

impl SimulationType {
    fn classify(size: usize, evaluable: bool, direction: Direction) -> Self {
        match (size, evaluable, direction) {
            (1, true, Direction::Forward) => SimulationType::EvaluateForward,
            (1, true, Direction::Backward) => SimulationType::EvaluateBackward,
            (1, _, Direction::Forward) => SimulationType::SolveForwardSimple,
            (1, _, Direction::Backward) => SimulationType::SolveBackwardSimple,
            (1, _, Direction::TwoBoundaries) => SimulationType::SolveTwoBoundariesSimple,
            (_, _, Direction::Forward) => SimulationType::SolveForwardComplete,
            (_, _, Direction::Backward) => SimulationType::SolveBackwardComplete,
            (_, _, Direction::TwoBoundaries) => SimulationType::SolveTwoBoundariesComplete,
        }
    }

    pub fn is_evaluate(self) -> bool {
        matches!(self, SimulationType::EvaluateForward | SimulationType::EvaluateBackward)
    }

    pub fn direction(self) -> Direction {
        match self {
            SimulationType::EvaluateForward | SimulationType::SolveForwardSimple | SimulationType::SolveForwardComplete => Direction::Forward,
            SimulationType::EvaluateBackward | SimulationType::SolveBackwardSimple | SimulationType::SolveBackwardComplete => Direction::Backward,
            SimulationType::SolveTwoBoundariesSimple | SimulationType::SolveTwoBoundariesComplete => Direction::TwoBoundaries,
        }
    }

    /// Numeric code used in the binary block file (0 is reserved for unknown).
    pub fn code(self) -> u32 {
        match self {
            SimulationType::EvaluateForward => 1,
            SimulationType::EvaluateBackward => 2,
            SimulationType::SolveForwardSimple => 3,
            SimulationType::SolveBackwardSimple => 4,
            SimulationType::SolveTwoBoundariesSimple => 5,
            SimulationType::SolveForwardComplete => 6,
            SimulationType::SolveBackwardComplete => 7,
            SimulationType::SolveTwoBoundariesComplete => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SimulationType::EvaluateForward => "EVALUATE FORWARD",
            SimulationType::EvaluateBackward => "EVALUATE BACKWARD",
            SimulationType::SolveForwardSimple => "SOLVE FORWARD SIMPLE",
            SimulationType::SolveBackwardSimple => "SOLVE BACKWARD SIMPLE",
            SimulationType::SolveTwoBoundariesSimple => "SOLVE TWO BOUNDARIES SIMPLE",
            SimulationType::SolveForwardComplete => "SOLVE FORWARD COMPLETE",
            SimulationType::SolveBackwardComplete => "SOLVE BACKWARD COMPLETE",
            SimulationType::SolveTwoBoundariesComplete => "SOLVE TWO BOUNDARIES COMPLETE",
        }
    }
}

fn direction_of(own: LagLead) -> Direction {
    match (own.lag > 0, own.lead > 0) {
        (true, true) => Direction::TwoBoundaries,
        (false, true) => Direction::Backward,
        _ => Direction::Forward,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLagLead {
    pub endo: LagLead,
    pub other_endo: LagLead,
    pub exo: LagLead,
    pub exo_det: LagLead,
    pub max: LagLead,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub first: usize,
    pub size: usize,
    pub simulation_type: SimulationType,
    pub recursive_size: usize,
    pub linear: bool,
    pub lag_lead: BlockLagLead,
}

impl Block {
    pub fn feedback_size(&self) -> usize { self.size - self.recursive_size }
    pub fn range(&self) -> std::ops::Range<usize> { self.first..self.first + self.size }
}

#[derive(Debug, Clone, Default)]
pub struct BlockDecomposition {
    /// Original equation index at each position of the block ordering.
    pub equation_reordered: Vec<usize>,
    /// Endogenous type-specific id at each position.
    pub variable_reordered: Vec<usize>,
    pub inv_equation_reordered: Vec<usize>,
    pub inv_variable_reordered: Vec<usize>,
    pub blocks: Vec<Block>,
    /// Per original equation.
    pub normalizations: Vec<Normalization>,
    /// Block of each original equation.
    pub equation_block: Vec<usize>,
}

impl BlockDecomposition {
    pub fn nb_blocks(&self) -> usize { self.blocks.len() }

    pub fn block(&self, block: usize) -> Result<&Block> {
        self.blocks.get(block).ok_or(ModelError::UnknownBlock { block })
    }

    pub fn block_equations(&self, block: usize) -> Result<&[usize]> {
        let b = self.block(block)?;
        Ok(&self.equation_reordered[b.range()])
    }

    pub fn block_variables(&self, block: usize) -> Result<&[usize]> {
        let b = self.block(block)?;
        Ok(&self.variable_reordered[b.range()])
    }

    pub fn block_equation_id(&self, block: usize, i: usize) -> Result<usize> {
        self.block_equations(block)?.get(i).copied().ok_or(ModelError::UnknownBlockMember { block, position: i })
    }

    pub fn block_variable_id(&self, block: usize, i: usize) -> Result<usize> {
        self.block_variables(block)?.get(i).copied().ok_or(ModelError::UnknownBlockMember { block, position: i })
    }

    pub fn block_of_equation(&self, eq: usize) -> Result<usize> {
        self.equation_block.get(eq).copied().ok_or(ModelError::UnknownEquation { equation: eq })
    }

    pub fn equation_kind(&self, eq: usize) -> Result<EquationKind> {
        self.normalizations.get(eq).map(|n| n.kind).ok_or(ModelError::UnknownEquation { equation: eq })
    }

    /// Equations of the recursive prefix, in evaluation order.
    pub fn recursive_equations(&self, block: usize) -> Result<&[usize]> {
        let b = self.block(block)?;
        Ok(&self.equation_reordered[b.first..b.first + b.recursive_size])
    }

    pub fn feedback_equations(&self, block: usize) -> Result<&[usize]> {
        let b = self.block(block)?;
        Ok(&self.equation_reordered[b.first + b.recursive_size..b.first + b.size])
    }

    pub fn feedback_variables(&self, block: usize) -> Result<&[usize]> {
        let b = self.block(block)?;
        Ok(&self.variable_reordered[b.first + b.recursive_size..b.first + b.size])
    }
}

pub struct DecompositionInput<'a> {
    pub symbols: &'a SymbolTable,
    pub deriv_ids: &'a DerivIdTable,
    pub equations: &'a [Equation],
    pub first: &'a FirstDerivatives,
    pub incidence: &'a Incidence,
    pub mfs: MfsPolicy,
}

struct Draft {
    equations: Vec<usize>,
    recursive: usize,
    simulation_type: SimulationType,
    lag_lead: BlockLagLead,
}

struct Decomposer<'i, 'a, 'd, 'r> {
    input: &'i DecompositionInput<'a>,
    registry: &'i mut Registry,
    diff: &'d mut Differentiator<'r>,
    matched_var: Vec<usize>,
}

impl Decomposer<'_, '_, '_, '_> {
    fn endo_id(&self, tsid: usize) -> Result<Option<DerivId>> {
        let symbol = self.input.symbols.by_type_specific_id(SymbolType::Endogenous, tsid)?;
        Ok(self.input.deriv_ids.get(symbol, 0))
    }

    fn lag_lead(&mut self, equations: &[usize]) -> Result<BlockLagLead> {
        let own: BTreeSet<usize> = equations.iter().map(|&e| self.matched_var[e]).collect();
        let mut out = BlockLagLead::default();
        for &eq in equations {
            let residual = self.input.equations[eq].residual;
            let ids: Vec<DerivId> = self.diff.non_null(self.registry, residual).iter().copied().collect();
            for id in ids {
                let (symbol, lag) = self.input.deriv_ids.lookup(id)?;
                match self.input.deriv_ids.type_of(id)? {
                    SymbolType::Endogenous if own.contains(&self.input.symbols.type_specific_id(symbol)?) => out.endo.extend(lag),
                    SymbolType::Endogenous => out.other_endo.extend(lag),
                    SymbolType::Exogenous => out.exo.extend(lag),
                    SymbolType::ExogenousDet => out.exo_det.extend(lag),
                    SymbolType::Parameter => continue,
                }
                out.max.extend(lag);
            }
        }
        Ok(out)
    }

    /// True when no derivative w.r.t. a block variable depends on a block variable.
    fn is_linear(&mut self, equations: &[usize], block_ids: &BTreeSet<DerivId>) -> bool {
        equations.iter().all(|&eq| {
            block_ids.iter().all(|&id| match self.input.first.get(&(eq, id)) {
                Some(&d) => !self.diff.non_null(self.registry, d).iter().any(|x| block_ids.contains(x)),
                None => true,
            })
        })
    }

    fn block_ids(&self, equations: &[usize]) -> Result<BTreeSet<DerivId>> {
        let mut ids = BTreeSet::new();
        for &eq in equations {
            if let Some(id) = self.endo_id(self.matched_var[eq])? {
                ids.insert(id);
            }
        }
        Ok(ids)
    }
}

/// Moves each explicit equation onto its left-hand variable when an
/// alternating path lets the equation currently holding that variable take
/// another one. Variables already held by their explicit equation are never
/// taken back, and the matching stays perfect.
fn prefer_explicit(preferred: &[Option<usize>], adjacency: &[Vec<usize>], matched_var: &mut [usize], eq_of_var: &mut [usize]) {
    let n = matched_var.len();
    let mut pinned = vec![false; n];
    for (eq, lhs) in preferred.iter().enumerate() {
        if let Some(v) = *lhs {
            pinned[v] |= matched_var[eq] == v;
        }
    }
    for (eq, lhs) in preferred.iter().enumerate() {
        let Some(v) = *lhs else { continue };
        if matched_var[eq] == v {
            pinned[v] = true;
        }
        if pinned[v] {
            continue;
        }
        let saved = (matched_var.to_vec(), eq_of_var.to_vec());
        let holder = eq_of_var[v];
        eq_of_var[matched_var[eq]] = usize::MAX;
        matched_var[eq] = v;
        eq_of_var[v] = eq;
        matched_var[holder] = usize::MAX;

        let mut seen = pinned.clone();
        seen[v] = true;
        if augment(holder, adjacency, &mut seen, matched_var, eq_of_var) {
            pinned[v] = true;
        } else {
            matched_var.copy_from_slice(&saved.0);
            eq_of_var.copy_from_slice(&saved.1);
        }
    }
}

/// Finds an alternating path from the unmatched equation `eq` to a free
/// variable, skipping `seen` variables, and flips it.
fn augment(eq: usize, adjacency: &[Vec<usize>], seen: &mut [bool], matched_var: &mut [usize], eq_of_var: &mut [usize]) -> bool {
    for &v in &adjacency[eq] {
        if seen[v] {
            continue;
        }
        seen[v] = true;
        let holder = eq_of_var[v];
        if holder == usize::MAX || augment(holder, adjacency, seen, matched_var, eq_of_var) {
            matched_var[eq] = v;
            eq_of_var[v] = eq;
            return true;
        }
    }
    false
}

pub fn decompose(input: &DecompositionInput, registry: &mut Registry, diff: &mut Differentiator) -> Result<BlockDecomposition> {
    let n = input.equations.len();
    let endo_nbr = input.symbols.endo_nbr();
    if n != endo_nbr {
        return Err(ModelError::EquationCountMismatch { equations: n, endogenous: endo_nbr });
    }

    // 1. Maximum matching on the bipartite equation/variable graph
    let mut bipartite: UnGraph<(), ()> = UnGraph::with_capacity(2 * n, input.incidence.contemporaneous.len());
    for _ in 0..2 * n {
        bipartite.add_node(());
    }
    let mut preferred = Vec::with_capacity(n);
    let mut adjacency = Vec::with_capacity(n);
    for eq in 0..n {
        let lhs = match *registry.kind(input.equations[eq].lhs) {
            NodeKind::Variable { symbol, lag: 0 } if input.symbols.symbol_type(symbol)? == SymbolType::Endogenous => {
                Some(input.symbols.type_specific_id(symbol)?)
            }
            _ => None,
        };
        preferred.push(lhs.filter(|&v| input.incidence.get(eq, v).is_some()));
        let row: Vec<usize> = input.incidence.row(eq).map(|(v, _)| v).collect();
        for &v in &row {
            bipartite.add_edge(NodeIndex::new(eq), NodeIndex::new(n + v), ());
        }
        adjacency.push(row);
    }
    let matching = maximum_matching(&bipartite);
    let mut matched_var = vec![usize::MAX; n];
    let mut eq_of_var = vec![usize::MAX; n];
    for eq in 0..n {
        if let Some(v) = matching.mate(NodeIndex::new(eq)) {
            matched_var[eq] = v.index() - n;
            eq_of_var[v.index() - n] = eq;
        }
    }
    if !matching.is_perfect() {
        let equations: Vec<usize> = (0..n).filter(|&e| matched_var[e] == usize::MAX).collect();
        let variables = (0..n)
            .filter(|&v| eq_of_var[v] == usize::MAX)
            .map(|v| Ok(input.symbols.name(input.symbols.by_type_specific_id(SymbolType::Endogenous, v)?)?.to_string()))
            .collect::<Result<Vec<String>>>()?;
        return Err(ModelError::StructuralSingularity { equations, variables });
    }
    prefer_explicit(&preferred, &adjacency, &mut matched_var, &mut eq_of_var);

    // 2. Dependency graph: e -> f when e uses the variable matched to f
    let mut dependencies: DiGraph<(), ()> = DiGraph::with_capacity(n, input.incidence.contemporaneous.len());
    for _ in 0..n {
        dependencies.add_node(());
    }
    for &(e, v) in input.incidence.contemporaneous.keys() {
        let f = eq_of_var[v];
        if f != e {
            dependencies.add_edge(NodeIndex::new(e), NodeIndex::new(f), ());
        }
    }

    // 3. Strongly connected components, dependencies first
    let components = tarjan_scc(&dependencies);

    let mut dec = Decomposer { input, registry, diff, matched_var };
    let mut normalizations = vec![None; n];
    let mut drafts: Vec<Draft> = Vec::with_capacity(components.len());

    for component in components {
        let mut members: Vec<usize> = component.iter().map(|i| i.index()).collect();
        members.sort_unstable();
        let block_ids = dec.block_ids(&members)?;

        // 4. Normalization and linearity of each member
        for &eq in &members {
            let tsid = dec.matched_var[eq];
            let symbol = input.symbols.by_type_specific_id(SymbolType::Endogenous, tsid)?;
            let var = dec.registry.variable(symbol, 0);
            let var_id = input.deriv_ids.require(input.symbols, symbol, 0)?;
            let norm = Normalizer { registry: &mut *dec.registry, diff: &mut *dec.diff, first: input.first }
                .normalize(eq, &input.equations[eq], var, var_id, &block_ids)?;
            normalizations[eq] = Some(norm);
        }

        // 5. Recursive prefix and feedback set
        let (ordered, recursive) = if members.len() == 1 {
            let evaluable = normalizations[members[0]].map_or(false, |n| n.kind != EquationKind::Solve);
            (members.clone(), usize::from(evaluable))
        } else {
            let mut forced = Vec::with_capacity(members.len());
            for &eq in &members {
                let norm = normalizations[eq].ok_or(ModelError::UnknownEquation { equation: eq })?;
                let nonlinear = !dec.is_linear(&[eq], &block_ids);
                forced.push(norm.kind == EquationKind::Solve || input.mfs.forces_feedback(norm.is_normalized(), nonlinear));
            }
            let mut local_deps = Vec::new();
            for (i, &e) in members.iter().enumerate() {
                for (v, _) in input.incidence.row(e) {
                    if let Ok(j) = members.binary_search(&eq_of_var[v]) {
                        local_deps.push((i, j));
                    }
                }
            }
            let split = select_feedback(members.len(), &local_deps, &forced);
            debug!(
                "Block of {} equations: {} recursive, {} feedback",
                members.len(),
                split.recursive.len(),
                split.feedback.len()
            );
            let ordered: Vec<usize> = split.recursive.iter().chain(&split.feedback).map(|&i| members[i]).collect();
            (ordered, split.recursive.len())
        };

        // 6. Classification from the own-variable lags and leads
        let lag_lead = dec.lag_lead(&ordered)?;
        let direction = direction_of(lag_lead.endo);
        let evaluable = ordered.len() == 1 && recursive == 1 && direction != Direction::TwoBoundaries;
        let simulation_type = SimulationType::classify(ordered.len(), evaluable, direction);
        let recursive = if ordered.len() == 1 { usize::from(simulation_type.is_evaluate()) } else { recursive };

        // 7. Merge with the previous evaluate block when the direction is kept
        if simulation_type.is_evaluate() {
            if let Some(last) = drafts.last_mut().filter(|d| d.simulation_type == simulation_type) {
                let merged: Vec<usize> = last.equations.iter().chain(&ordered).copied().collect();
                let merged_lag_lead = dec.lag_lead(&merged)?;
                if direction_of(merged_lag_lead.endo) == simulation_type.direction() {
                    last.recursive = merged.len();
                    last.equations = merged;
                    last.lag_lead = merged_lag_lead;
                    continue;
                }
            }
        }
        drafts.push(Draft { equations: ordered, recursive, simulation_type, lag_lead });
    }

    // 8. Final layout, linearity and rank check
    let mut out = BlockDecomposition {
        normalizations: normalizations
            .into_iter()
            .enumerate()
            .map(|(eq, n)| n.ok_or(ModelError::UnknownEquation { equation: eq }))
            .collect::<Result<Vec<_>>>()?,
        equation_block: vec![0; n],
        ..Default::default()
    };
    for (b, draft) in drafts.into_iter().enumerate() {
        let block_ids = dec.block_ids(&draft.equations)?;
        let linear = dec.is_linear(&draft.equations, &block_ids);
        let first = out.equation_reordered.len();
        for &eq in &draft.equations {
            out.equation_reordered.push(eq);
            out.variable_reordered.push(dec.matched_var[eq]);
            out.equation_block[eq] = b;
        }
        let block = Block {
            first,
            size: draft.equations.len(),
            simulation_type: draft.simulation_type,
            recursive_size: draft.recursive,
            linear,
            lag_lead: draft.lag_lead,
        };
        if !block.simulation_type.is_evaluate() {
            check_rank(input, &draft.equations, &dec.matched_var)?;
        }
        out.blocks.push(block);
    }
    out.inv_equation_reordered = inverse(&out.equation_reordered);
    out.inv_variable_reordered = inverse(&out.variable_reordered);

    info!(
        "Block decomposition: {} equations in {} blocks, largest block has {} equations",
        n,
        out.blocks.len(),
        out.blocks.iter().map(|b| b.size).max().unwrap_or(0)
    );
    Ok(out)
}

fn inverse(permutation: &[usize]) -> Vec<usize> {
    let mut inv = vec![0; permutation.len()];
    for (i, &p) in permutation.iter().enumerate() {
        inv[p] = i;
    }
    inv
}

/// Rejects blocks whose contemporaneous Jacobian is numerically rank deficient.
fn check_rank(input: &DecompositionInput, equations: &[usize], matched_var: &[usize]) -> Result<()> {
    let size = equations.len();
    let matrix = DMatrix::from_fn(size, size, |i, j| input.incidence.get(equations[i], matched_var[equations[j]]).unwrap_or(0.0));
    let scale = matrix.iter().fold(0.0f64, |m, x| m.max(x.abs()));
    let rank = matrix.rank(1e-10 * scale.max(f64::MIN_POSITIVE));
    if rank < size {
        let variables = equations
            .iter()
            .map(|&eq| {
                let symbol = input.symbols.by_type_specific_id(SymbolType::Endogenous, matched_var[eq])?;
                Ok(input.symbols.name(symbol)?.to_string())
            })
            .collect::<Result<Vec<String>>>()?;
        return Err(ModelError::StructuralSingularity { equations: equations.to_vec(), variables });
    }
    Ok(())
}
