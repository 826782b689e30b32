//! Module-level wrappers for the graph transforms.

use std::sync::Arc;

use log::info;

use crate::autodiff::backward::{differentiate_with_config, require_grads_by_name, AutodiffConfig};
use crate::autodiff::error::AutodiffError;
use crate::env;
use crate::ir::spec::{Function, Module};
use crate::training::append_loss::append_loss;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the module.
    pub changed: bool,
    /// Functions inserted into the module. Replacements are not counted.
    pub functions_added: usize,
    /// Bindings the inserted functions carry beyond their inputs.
    pub bindings_emitted: usize,
}

impl PassResult {
    /// Merges two run results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            functions_added: self.functions_added + other.functions_added,
            bindings_emitted: self.bindings_emitted + other.bindings_emitted,
        }
    }
}

/// A transform that adds functions to a module.
///
/// Implementations either succeed and insert their output or fail without
/// touching the module.
pub trait ModulePass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, module: &mut Module) -> Result<PassResult, AutodiffError>;
}

/// Adds `<function>_adjoint` to the module.
#[derive(Debug, Clone)]
pub struct GradientPass {
    pub function: String,
    /// Parameter names to differentiate with respect to. All parameters when `None`.
    pub require_grads: Option<Vec<String>>,
    pub config: AutodiffConfig,
}

impl GradientPass {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            require_grads: None,
            config: AutodiffConfig::default(),
        }
    }

    pub fn with_require_grads<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.require_grads = Some(names.into_iter().map(Into::into).collect());
        self
    }
}

impl ModulePass for GradientPass {
    fn name(&self) -> &'static str {
        "gradient"
    }

    fn run(&self, module: &mut Module) -> Result<PassResult, AutodiffError> {
        let function = module
            .get(&self.function)
            .ok_or_else(|| AutodiffError::FunctionNotFound {
                name: self.function.clone(),
            })?;
        let require_grads = match &self.require_grads {
            Some(names) => {
                let names = names.iter().map(String::as_str).collect::<Vec<_>>();
                Some(require_grads_by_name(function, &names)?)
            }
            None => None,
        };
        let adjoint = differentiate_with_config(function, require_grads.as_deref(), &self.config)?;
        let bindings_emitted = added_bindings(&adjoint, function);
        let replaced = module.insert_output(adjoint);
        Ok(PassResult {
            changed: true,
            functions_added: usize::from(!replaced),
            bindings_emitted,
        })
    }
}

/// Adds the composition of a backbone with a loss function to the module.
#[derive(Debug, Clone)]
pub struct AppendLossPass {
    pub backbone: String,
    pub loss: Function,
    pub num_backbone_outputs: usize,
    /// Defaults to `<backbone>_loss`.
    pub new_name: Option<String>,
}

impl AppendLossPass {
    pub fn new(backbone: impl Into<String>, loss: Function) -> Self {
        Self {
            backbone: backbone.into(),
            loss,
            num_backbone_outputs: 1,
            new_name: None,
        }
    }

    pub fn with_num_backbone_outputs(mut self, num_backbone_outputs: usize) -> Self {
        self.num_backbone_outputs = num_backbone_outputs;
        self
    }

    pub fn with_name(mut self, new_name: impl Into<String>) -> Self {
        self.new_name = Some(new_name.into());
        self
    }
}

impl ModulePass for AppendLossPass {
    fn name(&self) -> &'static str {
        "append_loss"
    }

    fn run(&self, module: &mut Module) -> Result<PassResult, AutodiffError> {
        let composed = append_loss(
            module,
            &self.backbone,
            &self.loss,
            self.num_backbone_outputs,
            self.new_name.as_deref(),
        )?;
        let bindings_emitted = self.loss.bindings().count();
        let replaced = module.insert_output(composed);
        Ok(PassResult {
            changed: true,
            functions_added: usize::from(!replaced),
            bindings_emitted,
        })
    }
}

fn added_bindings(produced: &Function, source: &Function) -> usize {
    produced
        .bindings()
        .count()
        .saturating_sub(source.bindings().count())
}

/// Runs module passes in order, stopping at the first failure.
#[derive(Clone)]
pub struct PassManager {
    passes: Vec<Arc<dyn ModulePass>>,
    log_stats: bool,
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PassManager {
    pub fn new() -> Self {
        Self {
            passes: Vec::new(),
            log_stats: env::pass_stats_enabled(),
        }
    }

    pub fn pass(&mut self, pass: Arc<dyn ModulePass>) -> &mut Self {
        self.passes.push(pass);
        self
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn run(&self, module: &mut Module) -> Result<PassResult, AutodiffError> {
        let mut totals = PassResult::default();
        for pass in &self.passes {
            let stats = pass.run(module)?;
            if self.log_stats {
                info!(
                    "pass {}: changed={} functions_added={} bindings_emitted={} module_len={}",
                    pass.name(),
                    stats.changed,
                    stats.functions_added,
                    stats.bindings_emitted,
                    module.len()
                );
            }
            totals = totals.merge(stats);
        }
        Ok(totals)
    }
}
