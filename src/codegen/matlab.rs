//! matlab.rs
//! MATLAB text form: `<base>_dynamic.m` and `<base>_params_derivs.m`.

use super::expr::{Matlab, Renderer};
use super::plan::{EmissionPlan, Output, Routine, Target};
use crate::analysis::BlockDecomposition;
use crate::error::Result;
use crate::store::Registry;
use std::fmt::Write;

pub struct MatlabEmitter<'a> {
    pub registry: &'a Registry,
    pub plan: &'a EmissionPlan,
    pub blocks: Option<&'a BlockDecomposition>,
    pub basename: &'a str,
}

fn list_name(output: Output) -> &'static str {
    match output {
        Output::ParamResidualSecond => "rpp",
        Output::ParamJacobianSecond => "gpp",
        _ => "hp",
    }
}

fn target(output: Output, target: Target, value: &str) -> Option<String> {
    Some(match target {
        Target::Residual { row } => format!("residual({}) = {};", row + 1, value),
        Target::Jacobian { row, col } => format!("g1({}, {}) = {};", row + 1, col + 1, value),
        Target::Sparse { order, slot, row, col } => format!(
            "v{o}({s}, 1) = {}; v{o}({s}, 2) = {}; v{o}({s}, 3) = {};",
            row + 1,
            col + 1,
            value,
            o = order,
            s = slot + 1
        ),
        Target::ParamResidual { row, param } => format!("rp({}, {}) = {};", row + 1, param + 1, value),
        Target::ParamJacobian { row, col, param } => format!("gp({}, {}, {}) = {};", row + 1, col + 1, param + 1, value),
        Target::ParamList { slot, indices } => {
            let name = list_name(output);
            let arity = if output == Output::ParamResidualSecond { 3 } else { 4 };
            let mut line = String::new();
            for (k, idx) in indices[..arity].iter().enumerate() {
                let _ = write!(line, "{}({}, {}) = {}; ", name, slot + 1, k + 1, idx + 1);
            }
            let _ = write!(line, "{}({}, {}) = {};", name, slot + 1, arity + 1, value);
            line
        }
        Target::Endogenous { .. } | Target::BlockResidual { .. } | Target::BlockJacobian { .. } => return None,
    })
}

/// Lowest output position needed by sections `s..` of the routine.
fn first_position(routine: &Routine, s: usize) -> u8 {
    routine.sections[s..].iter().map(|sec| sec.output.position()).min().unwrap_or(0)
}

impl<'a> MatlabEmitter<'a> {
    /// Writes sections `range` of `routine`, gated on `nargout_var`.
    fn sections(&self, out: &mut String, routine: &Routine, range: std::ops::Range<usize>, nargout_var: &str) -> Result<()> {
        for s in range {
            let section = &routine.sections[s];
            let renderer = Renderer {
                registry: self.registry,
                plan: self.plan,
                dialect: &Matlab,
                temps: &routine.scopes[section.scope],
            };
            if !section.temps.is_empty() {
                let needed = first_position(routine, s);
                let guarded = needed > 0;
                if guarded {
                    let _ = writeln!(out, "if {} >= {}", nargout_var, needed + 1);
                }
                for &(node, slot) in &section.temps {
                    let _ = writeln!(out, "{}T({}) = {};", if guarded { "  " } else { "" }, slot + 1, renderer.definition(node)?);
                }
                if guarded {
                    let _ = writeln!(out, "end");
                }
            }
            if section.assignments.is_empty() {
                continue;
            }
            let position = section.output.position();
            if position > 0 {
                let _ = writeln!(out, "if {} >= {}", nargout_var, position + 1);
            }
            for a in &section.assignments {
                if let Some(line) = target(section.output, a.target, &renderer.expr(a.expr)?) {
                    let indent = if position > 0 { "  " } else { "" };
                    let _ = writeln!(out, "{}{}", indent, line);
                }
            }
            if position > 0 {
                let _ = writeln!(out, "end");
            }
        }
        Ok(())
    }

    pub fn dynamic(&self) -> Result<String> {
        let shape = &self.plan.shape;
        let routine = &self.plan.model;
        let name = format!("{}_dynamic", self.basename);
        let has = |o: Output| routine.sections.iter().any(|s| s.output == o);
        let mut outputs = vec!["residual", "g1"];
        if has(Output::Hessian) {
            outputs.push("g2");
        }
        if has(Output::Third) {
            outputs.push("g3");
        }

        let mut out = String::new();
        let _ = writeln!(out, "function [{}] = {}(y, x, params, steady_state, it_)", outputs.join(", "), name);
        let _ = writeln!(out, "%");
        let _ = writeln!(out, "% Status : Computes the dynamic model residuals and derivatives");
        let _ = writeln!(out, "%");
        let _ = writeln!(out, "% Inputs :");
        let _ = writeln!(out, "%   y            [{} by 1] endogenous variables in lead-lag incidence order", shape.y_len);
        let _ = writeln!(out, "%   x            [nperiods by {}] exogenous and deterministic exogenous variables", shape.exo_cols);
        let _ = writeln!(out, "%   params       [{} by 1] parameter values", shape.param_nbr);
        let _ = writeln!(out, "%   steady_state [{} by 1] steady state of the endogenous variables", shape.endo_nbr);
        let _ = writeln!(out, "%   it_          row of x holding the current period");
        let _ = writeln!(out, "%");
        let _ = writeln!(out, "% Warning : this file is generated automatically.");
        let _ = writeln!(out, "%");
        if let Some(blocks) = self.blocks {
            for (b, block) in blocks.blocks.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "% Block {}: {} size {} recursive {}",
                    b + 1,
                    block.simulation_type.name(),
                    block.size,
                    block.recursive_size
                );
            }
            let _ = writeln!(out, "%");
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "T = NaN({}, 1);", routine.temp_count);
        let _ = writeln!(out, "residual = zeros({}, 1);", shape.equations);
        let _ = writeln!(out, "g1 = [];");
        let _ = writeln!(out, "if nargout >= 2");
        let _ = writeln!(out, "  g1 = zeros({}, {});", shape.equations, shape.jacobian_cols);
        let _ = writeln!(out, "end");
        if has(Output::Hessian) {
            let _ = writeln!(out, "if nargout >= 3");
            let _ = writeln!(out, "  v2 = zeros({}, 3);", shape.nnz_g2);
            let _ = writeln!(out, "end");
        }
        if has(Output::Third) {
            let _ = writeln!(out, "if nargout >= 4");
            let _ = writeln!(out, "  v3 = zeros({}, 3);", shape.nnz_g3);
            let _ = writeln!(out, "end");
        }

        // Consecutive sections of one block go to one subfunction
        let mut subfunctions = Vec::new();
        let mut s = 0;
        while s < routine.sections.len() {
            let block = routine.sections[s].block;
            let mut end = s + 1;
            while end < routine.sections.len() && routine.sections[end].block == block && block.is_some() {
                end += 1;
            }
            match block {
                None => self.sections(&mut out, routine, s..end, "nargout")?,
                Some(b) => {
                    let sub = format!("{}_block_{}", name, b + 1);
                    let _ = writeln!(
                        out,
                        "[residual, g1, T] = {}(y, x, params, steady_state, it_, residual, g1, T, nargout);",
                        sub
                    );
                    subfunctions.push((sub, s..end));
                }
            }
            s = end;
        }

        let cols = shape.jacobian_cols;
        if has(Output::Hessian) {
            let _ = writeln!(out, "if nargout >= 3");
            let _ = writeln!(out, "  g2 = sparse(v2(:, 1), v2(:, 2), v2(:, 3), {}, {});", shape.equations, cols * cols);
            let _ = writeln!(out, "end");
        }
        if has(Output::Third) {
            let _ = writeln!(out, "if nargout >= 4");
            let _ = writeln!(out, "  g3 = sparse(v3(:, 1), v3(:, 2), v3(:, 3), {}, {});", shape.equations, cols * cols * cols);
            let _ = writeln!(out, "end");
        }
        let _ = writeln!(out, "end");

        for (sub, range) in subfunctions {
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "function [residual, g1, T] = {}(y, x, params, steady_state, it_, residual, g1, T, nargout_)",
                sub
            );
            self.sections(&mut out, routine, range, "nargout_")?;
            let _ = writeln!(out, "end");
        }
        Ok(out)
    }

    pub fn params_derivs(&self) -> Result<Option<String>> {
        let Some(routine) = &self.plan.params else { return Ok(None) };
        let shape = &self.plan.shape;
        let count = |o: Output| routine.sections.iter().filter(|s| s.output == o).map(|s| s.assignments.len()).sum::<usize>();

        let mut out = String::new();
        let _ = writeln!(
            out,
            "function [rp, gp, rpp, gpp, hp] = {}_params_derivs(y, x, params, steady_state, it_)",
            self.basename
        );
        let _ = writeln!(out, "%");
        let _ = writeln!(out, "% Status : Computes derivatives of the dynamic model with respect to the parameters");
        let _ = writeln!(out, "%   rp  : d residual / d params");
        let _ = writeln!(out, "%   gp  : d g1 / d params");
        let _ = writeln!(out, "%   rpp : rows [equation, param1, param2, value]");
        let _ = writeln!(out, "%   gpp : rows [equation, column, param1, param2, value]");
        let _ = writeln!(out, "%   hp  : rows [equation, column1, column2, param, value]");
        let _ = writeln!(out, "%");
        let _ = writeln!(out, "% Warning : this file is generated automatically.");
        let _ = writeln!(out, "%");
        let _ = writeln!(out);
        let _ = writeln!(out, "T = NaN({}, 1);", routine.temp_count);
        let _ = writeln!(out, "rp = zeros({}, {});", shape.equations, shape.param_nbr);
        let _ = writeln!(out, "if nargout >= 2");
        let _ = writeln!(out, "  gp = zeros({}, {}, {});", shape.equations, shape.jacobian_cols, shape.param_nbr);
        let _ = writeln!(out, "end");
        let _ = writeln!(out, "if nargout >= 3");
        let _ = writeln!(out, "  rpp = zeros({}, 4);", count(Output::ParamResidualSecond));
        let _ = writeln!(out, "end");
        let _ = writeln!(out, "if nargout >= 4");
        let _ = writeln!(out, "  gpp = zeros({}, 5);", count(Output::ParamJacobianSecond));
        let _ = writeln!(out, "end");
        let _ = writeln!(out, "if nargout >= 5");
        let _ = writeln!(out, "  hp = zeros({}, 5);", count(Output::ParamHessian));
        let _ = writeln!(out, "end");
        self.sections(&mut out, routine, 0..routine.sections.len(), "nargout")?;
        let _ = writeln!(out, "end");
        Ok(Some(out))
    }
}
