//! Reverse-mode differentiation of single-region functions.
//!
//! The sweep visits bindings in reverse order and keeps one pending
//! [`GradExpr`] per value. A binding's adjoint is complete once the sweep
//! reaches it, because every consumer appears later in the forward order.

use std::collections::HashMap;

use log::{debug, trace};

use crate::autodiff::adjoint::GradExpr;
use crate::autodiff::error::AutodiffError;
use crate::autodiff::registry::{lookup_gradient_rule, CallSite};
use crate::env;
use crate::ir::builder::FunctionBuilder;
use crate::ir::index::FunctionIndices;
use crate::ir::shape::ShapeError;
use crate::ir::spec::{
    Binding, Expr, Function, Module, Operand, Operation, ReturnExpr, TensorSpec, TupleField,
    ValueId, ValueType,
};
use crate::ir::verify::{verify_function, VerifyError};

/// Knobs for [`differentiate_with_config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutodiffConfig {
    /// Re-verify the produced function. Defaults to `GRADGRAPH_VERIFY`.
    pub verify_output: bool,
    /// Appended to function and value names for adjoints.
    pub adjoint_suffix: &'static str,
    /// Name hint for intermediate adjoint temporaries.
    pub temp_prefix: &'static str,
}

impl Default for AutodiffConfig {
    fn default() -> Self {
        Self {
            verify_output: env::verify_enabled(),
            adjoint_suffix: "_adjoint",
            temp_prefix: "lv",
        }
    }
}

/// Differentiates the scalar returned by `function` with respect to
/// `require_grads` (all parameters when `None`).
///
/// The result is named `<name>_adjoint`, keeps the original parameters and
/// bindings, and returns `(original_return, (grads...))` with one gradient per
/// requested parameter in request order.
pub fn differentiate(
    function: &Function,
    require_grads: Option<&[ValueId]>,
) -> Result<Function, AutodiffError> {
    differentiate_with_config(function, require_grads, &AutodiffConfig::default())
}

pub fn differentiate_with_config(
    function: &Function,
    require_grads: Option<&[ValueId]>,
    config: &AutodiffConfig,
) -> Result<Function, AutodiffError> {
    let (target, target_spec) = check_preconditions(function)?;
    let requested = match require_grads {
        Some(ids) => {
            for &id in ids {
                if function.param(id).is_none() {
                    return Err(AutodiffError::InvalidRequireGrads {
                        function: function.name.clone(),
                        value: display_name(function, id),
                    });
                }
            }
            ids.to_vec()
        }
        None => function.param_ids(),
    };
    let indices = FunctionIndices::build(function).map_err(|err| AutodiffError::IllFormed {
        function: function.name.clone(),
        source: VerifyError::Index(err),
    })?;

    let name = format!("{}{}", function.name, config.adjoint_suffix);
    let mut sweep = BackwardSweep::new(function, &indices, config, &name);
    sweep.seed(target, target_spec);
    sweep.run()?;
    let grads = sweep.bind_gradients(&requested)?;
    let emitted = sweep.emitted();

    let mut outputs = function
        .regions
        .iter()
        .flat_map(|region| region.outputs.iter().copied())
        .collect::<Vec<_>>();
    for &grad in &grads {
        if !outputs.contains(&grad) {
            outputs.push(grad);
        }
    }
    let ret = ReturnExpr::Tuple(vec![
        ReturnExpr::Value(target),
        ReturnExpr::Tuple(grads.iter().copied().map(ReturnExpr::Value).collect()),
    ]);
    let result = sweep.builder.finish(outputs, ret);

    if config.verify_output {
        verify_function(&result).map_err(|source| AutodiffError::IllFormed {
            function: result.name.clone(),
            source,
        })?;
    }
    debug!(
        "differentiated @{} into @{}: {} adjoint bindings, {} gradients",
        function.name,
        result.name,
        emitted,
        grads.len()
    );
    Ok(result)
}

/// Differentiates `name` and inserts the result into `module`. Returns the name
/// of the inserted function.
pub fn differentiate_in_module(
    module: &mut Module,
    name: &str,
    require_grads: Option<&[ValueId]>,
) -> Result<String, AutodiffError> {
    let function = module
        .get(name)
        .ok_or_else(|| AutodiffError::FunctionNotFound {
            name: name.to_string(),
        })?;
    let adjoint = differentiate(function, require_grads)?;
    let adjoint_name = adjoint.name.clone();
    module.insert_output(adjoint);
    Ok(adjoint_name)
}

/// Resolves parameter names to ids, in the given order.
pub fn require_grads_by_name(
    function: &Function,
    names: &[&str],
) -> Result<Vec<ValueId>, AutodiffError> {
    names
        .iter()
        .map(|name| {
            function
                .params
                .iter()
                .find(|param| param.name == *name)
                .map(|param| param.id)
                .ok_or_else(|| AutodiffError::InvalidRequireGrads {
                    function: function.name.clone(),
                    value: name.to_string(),
                })
        })
        .collect()
}

fn check_preconditions(function: &Function) -> Result<(ValueId, TensorSpec), AutodiffError> {
    if function.regions.len() != 1 {
        return Err(AutodiffError::MultiRegionFunction {
            function: function.name.clone(),
            regions: function.regions.len(),
        });
    }
    verify_function(function).map_err(|err| match err {
        VerifyError::ReturnNotOutput { value } => AutodiffError::MalformedOutputSet {
            function: function.name.clone(),
            value: display_name(function, value),
        },
        source => AutodiffError::IllFormed {
            function: function.name.clone(),
            source,
        },
    })?;

    let non_scalar = |found: String| AutodiffError::NonScalarTarget {
        function: function.name.clone(),
        found,
    };
    match &function.ret {
        ReturnExpr::Value(id) => match function.value_type(*id) {
            Some(ValueType::Tensor(spec)) if spec.is_scalar() => Ok((*id, spec.clone())),
            Some(ty) => Err(non_scalar(ty.to_string())),
            None => Err(non_scalar("an undefined value".to_string())),
        },
        ReturnExpr::Tuple(_) => Err(non_scalar(
            function
                .return_type()
                .map(|ty| ty.to_string())
                .unwrap_or_else(|| "a tuple".to_string()),
        )),
    }
}

fn display_name(function: &Function, id: ValueId) -> String {
    function
        .value_name(id)
        .map(str::to_string)
        .unwrap_or_else(|| format!("%{}", id.0))
}

struct BackwardSweep<'a> {
    function: &'a Function,
    indices: &'a FunctionIndices,
    config: &'a AutodiffConfig,
    builder: FunctionBuilder,
    adjoints: HashMap<ValueId, GradExpr>,
    forward_bindings: usize,
}

impl<'a> BackwardSweep<'a> {
    fn new(
        function: &'a Function,
        indices: &'a FunctionIndices,
        config: &'a AutodiffConfig,
        name: &str,
    ) -> Self {
        let builder = FunctionBuilder::from_function(name, function);
        let forward_bindings = builder.binding_count();
        Self {
            function,
            indices,
            config,
            builder,
            adjoints: HashMap::new(),
            forward_bindings,
        }
    }

    fn emitted(&self) -> usize {
        self.builder.binding_count() - self.forward_bindings
    }

    fn seed(&mut self, target: ValueId, spec: TensorSpec) {
        self.adjoints.insert(target, GradExpr::ones(spec));
    }

    fn run(&mut self) -> Result<(), AutodiffError> {
        let function = self.function;
        let reversed = function
            .regions
            .iter()
            .rev()
            .flat_map(|region| region.bindings.iter().rev());
        for binding in reversed {
            let Some(adjoint) = self.adjoints.remove(&binding.id) else {
                trace!(
                    "skipping %{}: no adjoint reaches it ({} users)",
                    binding.name,
                    self.indices.users_of(binding.id).len()
                );
                continue;
            };
            trace!("visiting %{}", binding.name);
            let adjoint = match &binding.ty {
                ValueType::Tensor(_) => {
                    let hint = format!("{}{}", binding.name, self.config.adjoint_suffix);
                    self.materialize(&hint, adjoint)?
                }
                ValueType::Tuple(_) => adjoint,
            };
            match &binding.expr {
                Expr::Call { op, operands } => self.visit_call(binding, op, operands, adjoint)?,
                Expr::Tuple(fields) => self.route_fields(fields, adjoint)?,
                Expr::TupleGet { tuple, index } => self.accumulate(
                    &Operand::TupleElement {
                        tuple: *tuple,
                        index: *index,
                    },
                    adjoint,
                )?,
                Expr::Use(operand) => self.accumulate(operand, adjoint)?,
            }
        }
        Ok(())
    }

    fn visit_call(
        &mut self,
        binding: &Binding,
        op: &Operation,
        operands: &[Operand],
        adjoint: GradExpr,
    ) -> Result<(), AutodiffError> {
        let Some(spec) = binding.ty.as_tensor() else {
            return Err(self.rule_failed(op, "calls returning tuples cannot be differentiated"));
        };
        let rule =
            lookup_gradient_rule(op.name()).ok_or_else(|| AutodiffError::MissingGradientRule {
                function: self.function.name.clone(),
                op: op.name().to_string(),
            })?;
        let args = operands
            .iter()
            .map(|operand| self.operand_leaf(operand))
            .collect::<Result<Vec<_>, _>>()?;
        let result = GradExpr::leaf(Operand::Value(binding.id), spec.clone());
        let site = CallSite {
            op,
            args: &args,
            result: &result,
            spec,
        };
        let partials = rule(&site, &adjoint).map_err(|err| self.rule_failed(op, err))?;
        if partials.len() != operands.len() {
            return Err(self.rule_failed(
                op,
                format!(
                    "returned {} partials for {} operands",
                    partials.len(),
                    operands.len()
                ),
            ));
        }

        for ((operand, arg), partial) in operands.iter().zip(&args).zip(partials) {
            let Some(partial) = partial else {
                continue;
            };
            let partial = if op.broadcasts() && partial.spec() != arg.spec() {
                partial
                    .collapse_sum_like(arg.clone())
                    .map_err(|err| self.shape_mismatch(err))?
            } else {
                partial
            };
            if partial.spec() != arg.spec() {
                return Err(self.rule_failed(
                    op,
                    format!(
                        "partial has type {}, operand has type {}",
                        partial.ty(),
                        arg.ty()
                    ),
                ));
            }
            self.accumulate(operand, partial)?;
        }
        Ok(())
    }

    fn route_fields(
        &mut self,
        fields: &[TupleField],
        adjoint: GradExpr,
    ) -> Result<(), AutodiffError> {
        let GradExpr::Tuple(components) = adjoint else {
            return Err(AutodiffError::ShapeMismatch {
                function: self.function.name.clone(),
                message: "tensor adjoint routed to a tuple construction".to_string(),
            });
        };
        if components.len() != fields.len() {
            return Err(AutodiffError::ShapeMismatch {
                function: self.function.name.clone(),
                message: format!(
                    "tuple adjoint of arity {} routed to {} fields",
                    components.len(),
                    fields.len()
                ),
            });
        }
        for (field, component) in fields.iter().zip(components) {
            match field {
                TupleField::Operand(operand) => self.accumulate(operand, component)?,
                TupleField::Tuple(nested) => self.route_fields(nested, component)?,
            }
        }
        Ok(())
    }

    fn accumulate(&mut self, operand: &Operand, partial: GradExpr) -> Result<(), AutodiffError> {
        match operand {
            Operand::Literal(_) => Ok(()),
            Operand::Value(id) => {
                let updated = match self.adjoints.remove(id) {
                    None if partial.is_zero() => return Ok(()),
                    None => partial,
                    Some(existing) => existing
                        .add(partial)
                        .map_err(|err| self.shape_mismatch(err))?,
                };
                self.adjoints.insert(*id, updated);
                Ok(())
            }
            Operand::TupleElement { tuple, index } => {
                let existing = match self.adjoints.remove(tuple) {
                    Some(existing) => existing,
                    None if partial.is_zero() => return Ok(()),
                    None => {
                        let ty = self.indices.type_of(*tuple).ok_or_else(|| {
                            AutodiffError::ShapeMismatch {
                                function: self.function.name.clone(),
                                message: format!("tuple %{} has no type", tuple.0),
                            }
                        })?;
                        GradExpr::zeros_of(ty)
                    }
                };
                let updated = existing
                    .add_at(*index, partial)
                    .map_err(|err| self.shape_mismatch(err))?;
                self.adjoints.insert(*tuple, updated);
                Ok(())
            }
        }
    }

    /// Binds each requested parameter's adjoint. Parameters the sweep never
    /// reached get zeros.
    fn bind_gradients(&mut self, requested: &[ValueId]) -> Result<Vec<ValueId>, AutodiffError> {
        let function = self.function;
        let mut bound: HashMap<ValueId, ValueId> = HashMap::new();
        let mut grads = Vec::with_capacity(requested.len());
        for &id in requested {
            if let Some(&existing) = bound.get(&id) {
                grads.push(existing);
                continue;
            }
            let Some(param) = function.param(id) else {
                return Err(AutodiffError::InvalidRequireGrads {
                    function: function.name.clone(),
                    value: display_name(function, id),
                });
            };
            let adjoint = self
                .adjoints
                .remove(&id)
                .unwrap_or_else(|| GradExpr::zeros_of(&param.ty));
            let hint = format!("{}{}", param.name, self.config.adjoint_suffix);
            let grad = self.bind_gradient(&hint, adjoint, &param.ty)?;
            bound.insert(id, grad);
            grads.push(grad);
        }
        Ok(grads)
    }

    fn bind_gradient(
        &mut self,
        hint: &str,
        adjoint: GradExpr,
        ty: &ValueType,
    ) -> Result<ValueId, AutodiffError> {
        match adjoint {
            GradExpr::Leaf { operand, spec } => {
                let expr = match operand {
                    Operand::TupleElement { tuple, index } => Expr::TupleGet { tuple, index },
                    operand => Expr::Use(operand),
                };
                Ok(self.builder.bind(hint, expr, ValueType::Tensor(spec)))
            }
            GradExpr::Tuple(components) => {
                let fields = components
                    .into_iter()
                    .map(|component| self.tuple_field(component))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self.builder.bind(hint, Expr::Tuple(fields), ty.clone()))
            }
            pending => match self.materialize(hint, pending)? {
                GradExpr::Leaf {
                    operand: Operand::Value(id),
                    ..
                } => Ok(id),
                _ => Err(AutodiffError::ShapeMismatch {
                    function: self.function.name.clone(),
                    message: format!("could not bind gradient `{hint}`"),
                }),
            },
        }
    }

    fn tuple_field(&mut self, component: GradExpr) -> Result<TupleField, AutodiffError> {
        match component {
            GradExpr::Tuple(nested) => nested
                .into_iter()
                .map(|component| self.tuple_field(component))
                .collect::<Result<Vec<_>, _>>()
                .map(TupleField::Tuple),
            component => self.materialize_operand(component).map(TupleField::Operand),
        }
    }

    /// Emits bindings for a pending tensor adjoint and returns it as a leaf.
    /// Nested calls are bound first, depth-first and left to right.
    fn materialize(&mut self, hint: &str, adjoint: GradExpr) -> Result<GradExpr, AutodiffError> {
        match adjoint {
            GradExpr::Leaf { .. } | GradExpr::Tuple(_) => Ok(adjoint),
            GradExpr::Zeros(spec) => {
                let id = self.builder.bind(
                    hint,
                    Expr::Call {
                        op: Operation::Zeros,
                        operands: Vec::new(),
                    },
                    ValueType::Tensor(spec.clone()),
                );
                Ok(GradExpr::leaf(Operand::Value(id), spec))
            }
            GradExpr::Call { op, args, spec } => {
                let operands = args
                    .into_iter()
                    .map(|arg| self.materialize_operand(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                let id = self.builder.bind(
                    hint,
                    Expr::Call { op, operands },
                    ValueType::Tensor(spec.clone()),
                );
                Ok(GradExpr::leaf(Operand::Value(id), spec))
            }
        }
    }

    fn materialize_operand(&mut self, arg: GradExpr) -> Result<Operand, AutodiffError> {
        let prefix = self.config.temp_prefix;
        match self.materialize(prefix, arg)? {
            GradExpr::Leaf { operand, .. } => Ok(operand),
            _ => Err(AutodiffError::ShapeMismatch {
                function: self.function.name.clone(),
                message: "tuple adjoint used as a call operand".to_string(),
            }),
        }
    }

    fn operand_leaf(&self, operand: &Operand) -> Result<GradExpr, AutodiffError> {
        match self.indices.operand_type(operand) {
            Some(ValueType::Tensor(spec)) => Ok(GradExpr::leaf(operand.clone(), spec)),
            _ => Err(AutodiffError::ShapeMismatch {
                function: self.function.name.clone(),
                message: "call operand is not a tensor".to_string(),
            }),
        }
    }

    fn rule_failed(&self, op: &Operation, message: impl ToString) -> AutodiffError {
        AutodiffError::RuleFailed {
            function: self.function.name.clone(),
            op: op.name().to_string(),
            message: message.to_string(),
        }
    }

    fn shape_mismatch(&self, err: ShapeError) -> AutodiffError {
        AutodiffError::ShapeMismatch {
            function: self.function.name.clone(),
            message: err.to_string(),
        }
    }
}
