//! c.rs
//! C text form: `<base>_dynamic.c` exporting
//! `void Dynamic(y, x, nb_row_x, params, steady_state, it_, residual, g1, g2, g3)`.
//! Any output pointer may be NULL, in which case that output is skipped.

use super::expr::{Renderer, C};
use super::plan::{EmissionPlan, Routine, Target};
use crate::error::Result;
use crate::store::{NodeKind, Registry};
use std::collections::BTreeSet;
use std::fmt::Write;

const OUTPUTS: [&str; 4] = ["residual", "g1", "g2", "g3"];

const ARGS: &str = "const double *restrict y, const double *restrict x, int nb_row_x, \
                    const double *restrict params, const double *restrict steady_state, int it_";

const OUT_ARGS: &str = "double *restrict residual, double *restrict g1, double *restrict g2, double *restrict g3";

pub struct CEmitter<'a> {
    pub registry: &'a Registry,
    pub plan: &'a EmissionPlan,
    pub basename: &'a str,
}

fn target(target: Target, value: &str, shape_eqs: usize, nnz: [usize; 2]) -> Option<String> {
    Some(match target {
        Target::Residual { row } => format!("residual[{}] = {};", row, value),
        Target::Jacobian { row, col } => format!("g1[{}] = {};", row + col * shape_eqs, value),
        Target::Sparse { order, slot, row, col } => {
            let (name, n) = if order == 2 { ("g2", nnz[0]) } else { ("g3", nnz[1]) };
            format!(
                "{n}[{}] = {}; {n}[{}] = {}; {n}[{}] = {};",
                slot,
                row + 1,
                slot + n,
                col + 1,
                slot + 2 * n,
                value,
                n = name
            )
        }
        _ => return None,
    })
}

/// `residual != NULL || g1 != NULL` over the outputs of sections `s..`.
fn guard(routine: &Routine, s: usize) -> String {
    let positions: BTreeSet<u8> = routine.sections[s..].iter().map(|sec| sec.output.position()).collect();
    positions
        .iter()
        .map(|&p| format!("{} != NULL", OUTPUTS[p as usize]))
        .collect::<Vec<_>>()
        .join(" || ")
}

impl<'a> CEmitter<'a> {
    fn sections(&self, out: &mut String, routine: &Routine, range: std::ops::Range<usize>) -> Result<()> {
        let shape = &self.plan.shape;
        for s in range {
            let section = &routine.sections[s];
            let renderer = Renderer { registry: self.registry, plan: self.plan, dialect: &C, temps: &routine.scopes[section.scope] };
            if !section.temps.is_empty() {
                let _ = writeln!(out, "  if ({})", guard(routine, s));
                let _ = writeln!(out, "    {{");
                for &(node, slot) in &section.temps {
                    let _ = writeln!(out, "      T[{}] = {};", slot, renderer.definition(node)?);
                }
                let _ = writeln!(out, "    }}");
            }
            if section.assignments.is_empty() {
                continue;
            }
            let _ = writeln!(out, "  if ({} != NULL)", OUTPUTS[section.output.position() as usize]);
            let _ = writeln!(out, "    {{");
            for a in &section.assignments {
                let value = renderer.expr(a.expr)?;
                if let Some(line) = target(a.target, &value, shape.equations, [shape.nnz_g2, shape.nnz_g3]) {
                    let _ = writeln!(out, "      {}", line);
                }
            }
            let _ = writeln!(out, "    }}");
        }
        Ok(())
    }

    pub fn dynamic(&self) -> Result<String> {
        let routine = &self.plan.model;
        let shape = &self.plan.shape;
        let mut out = String::new();
        let _ = writeln!(out, "/*");
        let _ = writeln!(out, " * {}_dynamic.c : Computes the dynamic model residuals and derivatives", self.basename);
        let _ = writeln!(out, " *");
        let _ = writeln!(out, " * g1 is column-major [{} by {}].", shape.equations, shape.jacobian_cols);
        let _ = writeln!(out, " * g2 and g3 hold (row, column, value) triplets with 1-based indices,");
        let _ = writeln!(out, " * {} and {} entries.", shape.nnz_g2, shape.nnz_g3);
        let _ = writeln!(out, " *");
        let _ = writeln!(out, " * Warning : this file is generated automatically.");
        let _ = writeln!(out, " */");
        let _ = writeln!(out);
        let _ = writeln!(out, "#include <math.h>");
        let _ = writeln!(out, "#include <stddef.h>");
        let _ = writeln!(out, "#include <stdlib.h>");
        let _ = writeln!(out);

        let mut prototypes = BTreeSet::new();
        for kind in &self.registry.kinds {
            if let NodeKind::External { function, wrt } = kind {
                let ext = &self.registry.externals[*function as usize];
                prototypes.insert((ext.partial_name(wrt), ext.nargs));
            }
        }
        for (name, nargs) in &prototypes {
            let _ = writeln!(out, "extern double {}({});", name, vec!["double"; *nargs].join(", "));
        }
        if !prototypes.is_empty() {
            let _ = writeln!(out);
        }

        // Block sections become static functions sharing T
        let mut calls = Vec::new();
        let mut body = String::new();
        let mut s = 0;
        while s < routine.sections.len() {
            let block = routine.sections[s].block;
            let mut end = s + 1;
            while end < routine.sections.len() && routine.sections[end].block == block && block.is_some() {
                end += 1;
            }
            match block {
                None => self.sections(&mut body, routine, s..end)?,
                Some(b) => {
                    let _ = writeln!(out, "static void\nblock_{}({}, double *restrict T, {})\n{{", b + 1, ARGS, OUT_ARGS);
                    self.sections(&mut out, routine, s..end)?;
                    let _ = writeln!(out, "}}\n");
                    let call = format!(
                        "  block_{}(y, x, nb_row_x, params, steady_state, it_, T, residual, g1, g2, g3);",
                        b + 1
                    );
                    let _ = writeln!(body, "{}", call);
                    calls.push(b);
                }
            }
            s = end;
        }

        let _ = writeln!(out, "void\nDynamic({}, {})\n{{", ARGS, OUT_ARGS);
        let _ = writeln!(out, "  double *T = (double *) malloc(sizeof(double) * {});", routine.temp_count.max(1));
        let _ = writeln!(out, "  if (T == NULL)");
        let _ = writeln!(out, "    return;");
        out.push_str(&body);
        let _ = writeln!(out, "  free(T);");
        let _ = writeln!(out, "}}");
        log::debug!("C form: {} block functions, {} temporaries", calls.len(), routine.temp_count);
        Ok(out)
    }
}
