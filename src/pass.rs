//! pass.rs
//! The computing pass: derivatives, block decomposition, temporary terms and
//! the emission plan, then file generation from the immutable result.

use crate::analysis::{compute_incidence, decompose, BlockDecomposition, DecompositionInput, Incidence};
use crate::codegen::c::CEmitter;
use crate::codegen::info::{block_bytes, InfoInput, ModelInfo};
use crate::codegen::matlab::MatlabEmitter;
use crate::codegen::plan::{EmissionPlan, PlanInput};
use crate::codegen::{write_files, Compiler, GeneratedFile, Tape};
use crate::config::{OutputTarget, PassOptions};
use crate::display::format_blocks;
use crate::derive::{
    compute_chain_rule, compute_hessian, compute_jacobian, compute_params_derivatives, compute_third,
    DerivativeTables, Differentiator, ParamsDerivatives,
};
use crate::error::Result;
use crate::evaluator::{GraphEvaluator, TapeEvaluator};
use crate::model::{DerivId, DynamicModel, DynamicResolver, EvalContext};
use crate::store::SymbolType;
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Everything a computing pass produces. Emitters only read it.
#[derive(Debug, Clone)]
pub struct PassArtifacts {
    /// Options with implied switches applied.
    pub options: PassOptions,
    pub tables: DerivativeTables,
    pub incidence: Incidence,
    pub blocks: Option<BlockDecomposition>,
    pub plan: EmissionPlan,
}

impl DynamicModel {
    pub fn computing_pass(&mut self, options: &PassOptions, context: &EvalContext) -> Result<PassArtifacts> {
        options.validate()?;
        let options = options.effective();

        // 1. Derivation ids and Jacobian columns, frozen for the rest of the pass
        self.compute_deriv_ids()?;
        self.deriv_ids.compute_dyn_jacobian_cols(&self.symbols, options.jacobian_exo)?;
        self.deriv_ids.freeze();
        let context = self.fill_eval_context(context)?;

        let resolver = DynamicResolver::new(&self.symbols, &self.deriv_ids);
        let mut diff = Differentiator::new(&resolver);
        let mut vars: BTreeSet<DerivId> = self.deriv_ids.ids_of_type(SymbolType::Endogenous).into_iter().collect();
        if options.jacobian_exo {
            vars.extend(self.deriv_ids.ids_of_type(SymbolType::Exogenous));
            vars.extend(self.deriv_ids.ids_of_type(SymbolType::ExogenousDet));
        }

        // 2. First order and its numerical incidence
        let first = compute_jacobian(&mut diff, &mut self.registry, &self.equations, &vars)?;
        let incidence = if options.block || options.prune_emitted_jacobian {
            compute_incidence(&self.registry, &self.symbols, &self.deriv_ids, &first, &context, options.cutoff)?
        } else {
            Incidence::default()
        };
        let emitted_first = if options.prune_emitted_jacobian {
            if !incidence.pruned.is_empty() {
                warn!("Emitted Jacobian omits {} entries below cutoff {:e}", incidence.pruned.len(), options.cutoff);
            }
            first.iter().filter(|(k, _)| !incidence.pruned.contains(k)).map(|(&k, &v)| (k, v)).collect()
        } else {
            first.clone()
        };

        // 3. Higher orders, always from the unpruned first order
        let second =
            if options.hessian { compute_hessian(&mut diff, &mut self.registry, &first, &vars)? } else { Default::default() };
        let third = if options.third_derivatives {
            compute_third(&mut diff, &mut self.registry, &second, &vars)?
        } else {
            Default::default()
        };

        // 4. Parameter derivatives
        let params = if options.params_derivatives {
            let param_ids: BTreeSet<DerivId> = self.deriv_ids.ids_of_type(SymbolType::Parameter).into_iter().collect();
            let hessian = options.hessian.then_some(&second);
            compute_params_derivatives(&mut diff, &mut self.registry, &self.equations, &first, hessian, &param_ids)?
        } else {
            ParamsDerivatives::default()
        };

        // 5. Block decomposition and chain-rule derivatives
        let (blocks, chain_rule) = if options.block {
            let input = DecompositionInput {
                symbols: &self.symbols,
                deriv_ids: &self.deriv_ids,
                equations: &self.equations,
                first: &first,
                incidence: &incidence,
                mfs: options.mfs,
            };
            let blocks = decompose(&input, &mut self.registry, &mut diff)?;
            debug!("{}", format_blocks(&blocks, &self.symbols)?);
            let chain_rule = compute_chain_rule(
                &mut diff,
                &mut self.registry,
                &self.symbols,
                &self.deriv_ids,
                &self.equations,
                &blocks,
            )?;
            (Some(blocks), chain_rule)
        } else {
            (None, Default::default())
        };

        let tables = DerivativeTables { first, emitted_first, second, third, params, chain_rule };
        let [n1, n2, n3] = tables.nnz();
        info!("Derivatives: {} first order, {} second order, {} third order", n1, n2, n3);

        // 6. Temporary terms and the emission plan
        let plan = EmissionPlan::build(&PlanInput {
            registry: &self.registry,
            symbols: &self.symbols,
            deriv_ids: &self.deriv_ids,
            equations: &self.equations,
            tables: &tables,
            blocks: blocks.as_ref(),
            options: &options,
        })?;
        info!("Temporary terms: {}", plan.temp_count());

        Ok(PassArtifacts { options, tables, incidence, blocks, plan })
    }

    pub fn compile_tape(&self, artifacts: &PassArtifacts) -> Result<Tape> {
        Compiler::new(&self.registry, &artifacts.plan).compile()
    }

    pub fn graph_evaluator(&self, artifacts: &PassArtifacts) -> GraphEvaluator {
        GraphEvaluator::new(self.registry.clone(), self.symbols.clone(), self.deriv_ids.clone(), artifacts.plan.clone())
    }

    pub fn tape_evaluator(&self, artifacts: &PassArtifacts) -> Result<TapeEvaluator> {
        TapeEvaluator::new(self.compile_tape(artifacts)?, artifacts.plan.shape.clone(), self.registry.externals.clone())
    }

    /// Renders every requested form, then writes them all; nothing is
    /// written when rendering fails.
    pub fn write_dynamic_files(&self, artifacts: &PassArtifacts, target: &OutputTarget) -> Result<Vec<PathBuf>> {
        let options = &artifacts.options;
        let plan = &artifacts.plan;
        let blocks = artifacts.blocks.as_ref();
        let mut files = Vec::new();

        let matlab = MatlabEmitter { registry: &self.registry, plan, blocks, basename: &target.basename };
        files.push(GeneratedFile::new(target.path("_dynamic.m"), matlab.dynamic()?));
        if let Some(text) = matlab.params_derivs()? {
            files.push(GeneratedFile::new(target.path("_params_derivs.m"), text));
        }
        if options.use_dll {
            let c = CEmitter { registry: &self.registry, plan, basename: &target.basename };
            files.push(GeneratedFile::new(target.path("_dynamic.c"), c.dynamic()?));
        }
        let tape = if options.bytecode { Some(self.compile_tape(artifacts)?) } else { None };
        if let Some(tape) = &tape {
            files.push(GeneratedFile::new(target.path("_dynamic.cod"), tape.to_bytes()));
        }
        if let Some(blocks) = blocks {
            files.push(GeneratedFile::new(target.path("_dynamic.bin"), block_bytes(blocks)?));
        }
        let info = ModelInfo::build(&InfoInput {
            basename: &target.basename,
            registry: &self.registry,
            symbols: &self.symbols,
            deriv_ids: &self.deriv_ids,
            plan,
            blocks,
            tape: tape.as_ref(),
            nnz: artifacts.tables.nnz(),
            options,
        })?;
        files.push(GeneratedFile::new(target.path("_dynamic.json"), info.to_json()?));

        write_files(&target.directory, &files)
    }
}
