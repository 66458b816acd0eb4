//! info.rs
//! Side information: `<base>_dynamic.json` (model metadata) and
//! `<base>_dynamic.bin` (block records for the block solvers).

use super::plan::EmissionPlan;
use super::tape::{Reader, Tape, TapeRoutine};
use crate::analysis::{BlockDecomposition, BlockLagLead, SimulationType};
use crate::config::PassOptions;
use crate::error::{ModelError, Result};
use crate::evaluator::EvaluatorShape;
use crate::model::{AuxVariable, DerivIdTable, SymbolTable};
use crate::store::{Registry, SymbolType};
use serde::{Deserialize, Serialize};

const BLOCK_MAGIC: &[u8; 4] = b"DYNB";
const BLOCK_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub simulation_type: SimulationType,
    pub name: String,
    pub first: usize,
    pub size: usize,
    pub recursive_size: usize,
    pub linear: bool,
    pub equations: Vec<usize>,
    pub variables: Vec<usize>,
    pub lag_lead: BlockLagLead,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub basename: String,
    pub endogenous: Vec<String>,
    pub exogenous: Vec<String>,
    pub exogenous_det: Vec<String>,
    pub parameters: Vec<String>,
    pub predetermined: Vec<String>,
    pub aux_variables: Vec<AuxVariable>,
    pub max_endo_lag: i32,
    pub max_endo_lead: i32,
    pub max_exo_lag: i32,
    pub max_exo_lead: i32,
    pub max_exo_det_lag: i32,
    pub max_exo_det_lead: i32,
    /// Rows are endogenous variables, columns lags from `-max_endo_lag`; 1-based `y` index, 0 when absent.
    pub lead_lag_incidence: Vec<Vec<usize>>,
    /// Non-zero derivatives at orders 1, 2 and 3, before symmetric expansion.
    pub nnz_derivatives: [usize; 3],
    pub shape: EvaluatorShape,
    pub temporary_terms: usize,
    pub external_functions: Vec<String>,
    pub blocks: Option<Vec<BlockInfo>>,
    /// `[start, end)` instruction ranges of the tape routines, model first.
    pub tape_routines: Option<Vec<[u32; 2]>>,
    pub options: PassOptions,
}

pub struct InfoInput<'a> {
    pub basename: &'a str,
    pub registry: &'a Registry,
    pub symbols: &'a SymbolTable,
    pub deriv_ids: &'a DerivIdTable,
    pub plan: &'a EmissionPlan,
    pub blocks: Option<&'a BlockDecomposition>,
    pub tape: Option<&'a Tape>,
    pub nnz: [usize; 3],
    pub options: &'a PassOptions,
}

pub fn block_infos(blocks: &BlockDecomposition) -> Result<Vec<BlockInfo>> {
    (0..blocks.nb_blocks())
        .map(|b| {
            let block = blocks.block(b)?;
            Ok(BlockInfo {
                simulation_type: block.simulation_type,
                name: block.simulation_type.name().to_string(),
                first: block.first,
                size: block.size,
                recursive_size: block.recursive_size,
                linear: block.linear,
                equations: blocks.block_equations(b)?.to_vec(),
                variables: blocks.block_variables(b)?.to_vec(),
                lag_lead: block.lag_lead,
            })
        })
        .collect()
}

impl ModelInfo {
    pub fn build(input: &InfoInput) -> Result<Self> {
        let symbols = input.symbols;
        let ids = input.deriv_ids;
        let predetermined = symbols.predetermined().map(|s| symbols.name(s).map(str::to_string)).collect::<Result<_>>()?;
        Ok(Self {
            basename: input.basename.to_string(),
            endogenous: symbols.names_of_type(SymbolType::Endogenous),
            exogenous: symbols.names_of_type(SymbolType::Exogenous),
            exogenous_det: symbols.names_of_type(SymbolType::ExogenousDet),
            parameters: symbols.names_of_type(SymbolType::Parameter),
            predetermined,
            aux_variables: symbols.aux_variables().to_vec(),
            max_endo_lag: ids.endo.lag,
            max_endo_lead: ids.endo.lead,
            max_exo_lag: ids.exo.lag,
            max_exo_lead: ids.exo.lead,
            max_exo_det_lag: ids.exo_det.lag,
            max_exo_det_lead: ids.exo_det.lead,
            lead_lag_incidence: ids.lead_lag_incidence(symbols)?,
            nnz_derivatives: input.nnz,
            shape: input.plan.shape.clone(),
            temporary_terms: input.plan.temp_count(),
            external_functions: input.registry.externals.iter().map(|e| e.name.clone()).collect(),
            blocks: input.blocks.map(block_infos).transpose()?,
            tape_routines: input.tape.map(|t| t.routines.iter().map(|r: &TapeRoutine| [r.start, r.end]).collect()),
            options: input.options.clone(),
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ModelError::Config { msg: e.to_string() })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ModelError::Config { msg: e.to_string() })
    }
}

/// Fixed-layout block records, little-endian:
/// `"DYNB"`, version, count, then per block the simulation code, first, size,
/// recursive size, feedback size, endogenous lag, endogenous lead, linear flag
/// (one byte), and the equation and variable indices.
pub fn block_bytes(blocks: &BlockDecomposition) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let put = |out: &mut Vec<u8>, v: u32| out.extend_from_slice(&v.to_le_bytes());
    out.extend_from_slice(BLOCK_MAGIC);
    put(&mut out, BLOCK_VERSION);
    put(&mut out, blocks.nb_blocks() as u32);
    for b in 0..blocks.nb_blocks() {
        let block = blocks.block(b)?;
        put(&mut out, block.simulation_type.code());
        for v in [block.first, block.size, block.recursive_size, block.feedback_size()] {
            put(&mut out, v as u32);
        }
        out.extend_from_slice(&block.lag_lead.endo.lag.to_le_bytes());
        out.extend_from_slice(&block.lag_lead.endo.lead.to_le_bytes());
        out.push(block.linear as u8);
        for &eq in blocks.block_equations(b)? {
            put(&mut out, eq as u32);
        }
        for &var in blocks.block_variables(b)? {
            put(&mut out, var as u32);
        }
    }
    Ok(out)
}

/// One decoded block record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub code: u32,
    pub first: u32,
    pub size: u32,
    pub recursive_size: u32,
    pub feedback_size: u32,
    pub endo_lag: i32,
    pub endo_lead: i32,
    pub linear: bool,
    pub equations: Vec<u32>,
    pub variables: Vec<u32>,
}

pub fn read_block_bytes(bytes: &[u8]) -> Result<Vec<BlockRecord>> {
    let mut r = Reader::new(bytes);
    if r.take(4)? != BLOCK_MAGIC || r.u32()? != BLOCK_VERSION {
        return Err(ModelError::CorruptTape { msg: "not a block record file".into() });
    }
    let count = r.u32()?;
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let code = r.u32()?;
        let (first, size, recursive_size, feedback_size) = (r.u32()?, r.u32()?, r.u32()?, r.u32()?);
        let endo_lag = r.u32()? as i32;
        let endo_lead = r.u32()? as i32;
        let linear = r.take(1)?[0] != 0;
        let equations = (0..size).map(|_| r.u32()).collect::<Result<_>>()?;
        let variables = (0..size).map(|_| r.u32()).collect::<Result<_>>()?;
        records.push(BlockRecord {
            code,
            first,
            size,
            recursive_size,
            feedback_size,
            endo_lag,
            endo_lead,
            linear,
            equations,
            variables,
        });
    }
    r.finish()?;
    Ok(records)
}
