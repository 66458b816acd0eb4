//! report.rs
//! Plain-text listing of a block decomposition: one header per block, then
//! its equations with the variable each one determines.

use crate::analysis::{BlockDecomposition, EquationKind};
use crate::error::Result;
use crate::model::SymbolTable;
use crate::store::SymbolType;
use std::fmt::Write;

pub fn format_blocks(blocks: &BlockDecomposition, symbols: &SymbolTable) -> Result<String> {
    let mut output = String::new();
    let _ = writeln!(output, "BLOCK STRUCTURE ({} blocks):", blocks.nb_blocks());
    let _ = writeln!(output, "--------------------------------------------------");

    for b in 0..blocks.nb_blocks() {
        let block = blocks.block(b)?;
        let _ = writeln!(
            output,
            "[B{}] {} size={} recursive={}{} lag={} lead={}",
            b + 1,
            block.simulation_type.name(),
            block.size,
            block.recursive_size,
            if block.linear { " linear" } else { "" },
            block.lag_lead.endo.lag,
            block.lag_lead.endo.lead,
        );

        let equations = blocks.block_equations(b)?;
        for (i, &eq) in equations.iter().enumerate() {
            let connector = if i + 1 == equations.len() { "`--" } else { "|--" };
            let symbol = symbols.by_type_specific_id(SymbolType::Endogenous, blocks.block_variable_id(b, i)?)?;
            let role = if i < block.recursive_size {
                match blocks.equation_kind(eq)? {
                    EquationKind::EvaluateRenormalized(_) => "evaluate, renormalized",
                    _ => "evaluate",
                }
            } else {
                "feedback"
            };
            let _ = writeln!(output, "{}eq {} -> {} ({})", connector, eq + 1, symbols.name(symbol)?, role);
        }
    }
    Ok(output)
}
