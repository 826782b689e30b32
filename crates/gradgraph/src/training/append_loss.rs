//! Splices a scalar loss onto the prediction outputs of a backbone function.

use log::debug;

use crate::autodiff::error::AutodiffError;
use crate::env;
use crate::ir::builder::{FunctionBuilder, NameSupply};
use crate::ir::rewriter::ValueRemap;
use crate::ir::spec::{Function, Module, ReturnExpr, ValueId, ValueType};
use crate::ir::verify::verify_function;

/// Suffix used for the composed function when no name is given.
pub const DEFAULT_LOSS_SUFFIX: &str = "_loss";

/// Builds `backbone ++ loss` as a single function.
///
/// The first `num_backbone_outputs` parameters of `loss` are replaced by the
/// backbone's leading return values. The remaining loss parameters are
/// appended after the backbone's parameters, and backbone return values past
/// the predictions are carried through as state outputs. The result returns the
/// bare loss when there are no states and `(loss, states...)` otherwise.
pub fn append_loss(
    module: &Module,
    backbone_name: &str,
    loss: &Function,
    num_backbone_outputs: usize,
    new_name: Option<&str>,
) -> Result<Function, AutodiffError> {
    let backbone = module
        .get(backbone_name)
        .ok_or_else(|| AutodiffError::FunctionNotFound {
            name: backbone_name.to_string(),
        })?;
    for function in [backbone, loss] {
        if function.regions.len() != 1 {
            return Err(AutodiffError::MultiRegionFunction {
                function: function.name.clone(),
                regions: function.regions.len(),
            });
        }
        verify_function(function).map_err(|source| AutodiffError::IllFormed {
            function: function.name.clone(),
            source,
        })?;
    }

    let backbone_outputs = flat_return_values(backbone)?;
    check_arity(backbone, loss, backbone_outputs.len(), num_backbone_outputs)?;
    for (index, (&output, param)) in backbone_outputs
        .iter()
        .zip(&loss.params)
        .take(num_backbone_outputs)
        .enumerate()
    {
        let output_ty = backbone.value_type(output);
        if output_ty != Some(&param.ty) {
            return Err(AutodiffError::ShapeMismatch {
                function: backbone.name.clone(),
                message: format!(
                    "prediction output {index} has type {} but loss parameter `{}` expects {}",
                    output_ty
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "<undefined>".to_string()),
                    param.name,
                    param.ty
                ),
            });
        }
    }
    let loss_value = scalar_return(loss)?;

    let name = new_name
        .map(str::to_string)
        .unwrap_or_else(|| format!("{backbone_name}{DEFAULT_LOSS_SUFFIX}"));

    // Backbone names win; loss names are made unique against them up front so
    // that parameters added first never displace a later backbone binding.
    let mut names = NameSupply::new();
    for param in &backbone.params {
        names.reserve(&param.name);
    }
    for binding in backbone.bindings() {
        names.reserve(&binding.name);
    }
    let extra_param_names = loss.params[num_backbone_outputs..]
        .iter()
        .map(|param| names.fresh(&param.name))
        .collect::<Vec<_>>();
    let loss_binding_names = loss
        .bindings()
        .map(|binding| names.fresh(&binding.name))
        .collect::<Vec<_>>();

    let mut builder = FunctionBuilder::new(name);
    let mut backbone_remap = ValueRemap::new();
    let mut loss_remap = ValueRemap::new();

    for param in &backbone.params {
        let id = builder.add_param(&param.name, param.ty.clone());
        backbone_remap.insert(param.id, id);
    }
    for (param, name) in loss.params[num_backbone_outputs..]
        .iter()
        .zip(&extra_param_names)
    {
        let id = builder.add_param(name, param.ty.clone());
        loss_remap.insert(param.id, id);
    }
    for binding in backbone.bindings() {
        let expr = backbone_remap.expr(&binding.expr);
        let id = builder.bind(&binding.name, expr, binding.ty.clone());
        backbone_remap.insert(binding.id, id);
    }
    for (param, &output) in loss.params.iter().zip(&backbone_outputs) {
        if loss_remap.get(param.id).is_none() {
            loss_remap.insert(param.id, backbone_remap.value(output));
        }
    }
    for (binding, name) in loss.bindings().zip(&loss_binding_names) {
        let expr = loss_remap.expr(&binding.expr);
        let id = builder.bind(name, expr, binding.ty.clone());
        loss_remap.insert(binding.id, id);
    }

    let loss_value = loss_remap.value(loss_value);
    let states = backbone_outputs[num_backbone_outputs..]
        .iter()
        .map(|&state| backbone_remap.value(state))
        .collect::<Vec<_>>();
    let mut outputs = vec![loss_value];
    for &state in &states {
        if !outputs.contains(&state) {
            outputs.push(state);
        }
    }
    let ret = if states.is_empty() {
        ReturnExpr::Value(loss_value)
    } else {
        ReturnExpr::Tuple(
            std::iter::once(loss_value)
                .chain(states.iter().copied())
                .map(ReturnExpr::Value)
                .collect(),
        )
    };
    let composed = builder.finish(outputs, ret);

    if env::verify_enabled() {
        verify_function(&composed).map_err(|source| AutodiffError::IllFormed {
            function: composed.name.clone(),
            source,
        })?;
    }
    debug!(
        "appended loss @{} to @{} as @{} ({} states)",
        loss.name,
        backbone.name,
        composed.name,
        states.len()
    );
    Ok(composed)
}

/// Runs [`append_loss`] and inserts the result into `module`, returning its name.
/// The module is untouched on error.
pub fn append_loss_in_module(
    module: &mut Module,
    backbone_name: &str,
    loss: &Function,
    num_backbone_outputs: usize,
    new_name: Option<&str>,
) -> Result<String, AutodiffError> {
    let composed = append_loss(module, backbone_name, loss, num_backbone_outputs, new_name)?;
    let name = composed.name.clone();
    module.insert_output(composed);
    Ok(name)
}

fn flat_return_values(backbone: &Function) -> Result<Vec<ValueId>, AutodiffError> {
    match &backbone.ret {
        ReturnExpr::Value(id) => Ok(vec![*id]),
        ReturnExpr::Tuple(elements) => elements
            .iter()
            .map(|element| match element {
                ReturnExpr::Value(id) => Ok(*id),
                ReturnExpr::Tuple(_) => Err(AutodiffError::ShapeMismatch {
                    function: backbone.name.clone(),
                    message: "backbone must return a value or a flat tuple of values".to_string(),
                }),
            })
            .collect(),
    }
}

fn check_arity(
    backbone: &Function,
    loss: &Function,
    available: usize,
    requested: usize,
) -> Result<(), AutodiffError> {
    if requested == 0 || requested > available {
        return Err(AutodiffError::ShapeMismatch {
            function: backbone.name.clone(),
            message: format!(
                "num_backbone_outputs is {requested} but the backbone returns {available} values"
            ),
        });
    }
    if loss.params.len() < requested {
        return Err(AutodiffError::ShapeMismatch {
            function: loss.name.clone(),
            message: format!(
                "loss takes {} parameters but {requested} prediction outputs are spliced in",
                loss.params.len()
            ),
        });
    }
    Ok(())
}

fn scalar_return(loss: &Function) -> Result<ValueId, AutodiffError> {
    match &loss.ret {
        ReturnExpr::Value(id) => match loss.value_type(*id) {
            Some(ValueType::Tensor(spec)) if spec.is_scalar() => Ok(*id),
            other => Err(AutodiffError::NonScalarTarget {
                function: loss.name.clone(),
                found: other
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "<undefined>".to_string()),
            }),
        },
        ReturnExpr::Tuple(_) => Err(AutodiffError::NonScalarTarget {
            function: loss.name.clone(),
            found: loss
                .return_type()
                .map(|ty| ty.to_string())
                .unwrap_or_else(|| "a tuple".to_string()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::text_ir::{parse_function, parse_module};

    const MODULE: &str = r#"
func @predict(%x: tensor<f32, 2x4>, %y: tensor<f32, 2x4>) -> tensor<f32, 2x4> {
  %out = add(%x, %y) -> tensor<f32, 2x4>
  return %out
}
"#;

    const LOSS: &str = r#"
func @loss(%predictions: tensor<f32, 2x4>, %labels: tensor<f32, 2x4>) -> tensor<f32> {
  %lv = subtract(%predictions, %labels) -> tensor<f32, 2x4>
  %lv1 = multiply(%lv, %lv) -> tensor<f32, 2x4>
  %gv = sum(%lv1) -> tensor<f32>
  return %gv
}
"#;

    #[test]
    fn splices_loss_after_backbone() {
        let module = parse_module(MODULE).expect("module");
        let loss = parse_function(LOSS).expect("loss");
        let composed = append_loss(&module, "predict", &loss, 1, None).expect("compose");
        let expected = parse_function(
            r#"
func @predict_loss(%x: tensor<f32, 2x4>, %y: tensor<f32, 2x4>, %labels: tensor<f32, 2x4>) -> tensor<f32> {
  %out = add(%x, %y) -> tensor<f32, 2x4>
  %lv = subtract(%out, %labels) -> tensor<f32, 2x4>
  %lv1 = multiply(%lv, %lv) -> tensor<f32, 2x4>
  %gv = sum(%lv1) -> tensor<f32>
  return %gv
}
"#,
        )
        .expect("expected");
        assert_eq!(composed, expected, "{composed}");
    }

    #[test]
    fn colliding_loss_names_are_renamed() {
        let module = parse_module(MODULE).expect("module");
        let loss = parse_function(
            r#"
func @loss(%p: tensor<f32, 2x4>, %x: tensor<f32, 2x4>) -> tensor<f32> {
  %out = multiply(%p, %x) -> tensor<f32, 2x4>
  %s = sum(%out) -> tensor<f32>
  return %s
}
"#,
        )
        .expect("loss");
        let composed = append_loss(&module, "predict", &loss, 1, Some("fused")).expect("compose");
        assert_eq!(composed.name, "fused");
        let names = composed
            .params
            .iter()
            .map(|param| param.name.as_str())
            .chain(composed.bindings().map(|binding| binding.name.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["x", "y", "x1", "out", "out1", "s"]);
    }

    #[test]
    fn rejects_mismatched_prediction_type() {
        let module = parse_module(MODULE).expect("module");
        let loss = parse_function(
            r#"
func @loss(%p: tensor<f32, 4x2>) -> tensor<f32> {
  %s = sum(%p) -> tensor<f32>
  return %s
}
"#,
        )
        .expect("loss");
        assert!(matches!(
            append_loss(&module, "predict", &loss, 1, None),
            Err(AutodiffError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            append_loss(&module, "missing", &loss, 1, None),
            Err(AutodiffError::FunctionNotFound { .. })
        ));
    }
}
