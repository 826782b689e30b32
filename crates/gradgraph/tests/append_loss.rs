mod numeric_support;

use anyhow::Result;
use gradgraph::ir::{ReturnExpr, ValueType};
use gradgraph::{append_loss, append_loss_in_module, graph_function, graph_module, AutodiffError};
use gradgraph_ref_cpu::{run_function, run_module_function, CpuValue};
use numeric_support::{check_gradients, init_logging, random_inputs};
use rand::rngs::StdRng;
use rand::SeedableRng;

const BACKBONE: &str = r#"
func @predict(%x: tensor<f32, 5x20>, %w: tensor<f32, 20x10>, %b: tensor<f32, 10>) -> tensor<f32, 5x10> {
  %xw = matmul(%x, %w) -> tensor<f32, 5x10>
  %pred = add(%xw, %b) -> tensor<f32, 5x10>
  return %pred
}
"#;

const SQUARED_ERROR: &str = r#"
func @squared_error(%pred: tensor<f32, 5x10>, %label: tensor<f32, 5x10>) -> tensor<f32> {
  %diff = subtract(%pred, %label) -> tensor<f32, 5x10>
  %sq = multiply(%diff, %diff) -> tensor<f32, 5x10>
  %loss = sum(%sq) -> tensor<f32>
  return %loss
}
"#;

#[test]
fn composed_loss_matches_manual_composition() -> Result<()> {
    init_logging();
    let module = graph_module!(BACKBONE);
    let loss = graph_function!(SQUARED_ERROR);
    let composed = append_loss(&module, "predict", &loss, 1, None)?;

    assert_eq!(composed.name, "predict_loss");
    let params = composed
        .params
        .iter()
        .map(|param| param.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(params, vec!["x", "w", "b", "label"]);
    assert_eq!(composed.regions.len(), 1);
    assert!(matches!(composed.ret, ReturnExpr::Value(_)));

    let mut rng = StdRng::seed_from_u64(42);
    let inputs = random_inputs(&composed, &mut rng, -1.0, 1.0);
    let prediction = run_module_function(&module, "predict", &inputs[..3])?;
    let manual = run_function(&loss, &[prediction, inputs[3].clone()])?;
    let fused = run_function(&composed, &inputs)?;
    assert_eq!(fused, manual);
    assert_eq!(run_function(&composed, &inputs)?, fused);
    Ok(())
}

#[test]
fn composed_loss_is_differentiable() -> Result<()> {
    init_logging();
    let module = graph_module!(
        r#"
func @predict(%x: tensor<f32, 3x4>, %w: tensor<f32, 4x2>, %b: tensor<f32, 2>) -> tensor<f32, 3x2> {
  %xw = matmul(%x, %w) -> tensor<f32, 3x2>
  %pred = add(%xw, %b) -> tensor<f32, 3x2>
  return %pred
}
"#
    );
    let loss = graph_function!(
        r#"
func @squared_error(%pred: tensor<f32, 3x2>, %label: tensor<f32, 3x2>) -> tensor<f32> {
  %diff = subtract(%pred, %label) -> tensor<f32, 3x2>
  %sq = multiply(%diff, %diff) -> tensor<f32, 3x2>
  %loss = sum(%sq) -> tensor<f32>
  return %loss
}
"#
    );
    let composed = append_loss(&module, "predict", &loss, 1, Some("train_step"))?;
    let mut rng = StdRng::seed_from_u64(1);
    let inputs = random_inputs(&composed, &mut rng, -1.0, 1.0);
    let weights = [composed.params[1].id, composed.params[2].id];
    check_gradients(&composed, Some(&weights), &inputs);
    check_gradients(&composed, None, &inputs);
    Ok(())
}

#[test]
fn state_outputs_follow_the_loss() -> Result<()> {
    let mut module = graph_module!(
        r#"
func @step(%x: tensor<f32, 2x3>, %state: tensor<f32, 3>) -> (tensor<f32, 2x3>, tensor<f32, 3>, tensor<f32, 3>) {
  %pred = add(%x, %state) -> tensor<f32, 2x3>
  %next = sum(%x) axes[0] -> tensor<f32, 3>
  %scaled = multiply(%next, %state) -> tensor<f32, 3>
  return (%pred, %next, %scaled)
}
"#
    );
    let loss = graph_function!(
        r#"
func @mean_loss(%pred: tensor<f32, 2x3>) -> tensor<f32> {
  %s = sum(%pred) -> tensor<f32>
  return %s
}
"#
    );
    let name = append_loss_in_module(&mut module, "step", &loss, 1, None)?;
    assert_eq!(name, "step_loss");
    let composed = module.get(&name).expect("inserted");
    assert_eq!(
        composed.return_type().map(|ty| ty.to_string()),
        Some("(tensor<f32>, tensor<f32, 3>, tensor<f32, 3>)".to_string())
    );
    let outputs = composed.regions[0]
        .outputs
        .iter()
        .map(|id| composed.value_name(*id).expect("named"))
        .collect::<Vec<_>>();
    assert_eq!(outputs, vec!["s", "next", "scaled"]);

    let mut rng = StdRng::seed_from_u64(2);
    let inputs = random_inputs(composed, &mut rng, -1.0, 1.0);
    let CpuValue::Tuple(parts) = run_function(composed, &inputs)? else {
        panic!("composed function returns a tuple");
    };
    let CpuValue::Tuple(original) = run_module_function(&module, "step", &inputs)? else {
        panic!("backbone returns a tuple");
    };
    assert_eq!(parts[1], original[1]);
    assert_eq!(parts[2], original[2]);
    Ok(())
}

#[test]
fn two_predictions_feed_the_loss() -> Result<()> {
    let module = graph_module!(
        r#"
func @heads(%x: tensor<f32, 4>) -> (tensor<f32, 4>, tensor<f32, 4>) {
  %a = exp(%x) -> tensor<f32, 4>
  %b = negative(%x) -> tensor<f32, 4>
  return (%a, %b)
}
"#
    );
    let loss = graph_function!(
        r#"
func @pair(%a: tensor<f32, 4>, %b: tensor<f32, 4>, %weight: tensor<f32, 4>) -> tensor<f32> {
  %m = multiply(%a, %b) -> tensor<f32, 4>
  %x = multiply(%m, %weight) -> tensor<f32, 4>
  %s = sum(%x) -> tensor<f32>
  return %s
}
"#
    );
    let composed = append_loss(&module, "heads", &loss, 2, None)?;
    let names = composed
        .params
        .iter()
        .map(|param| param.name.as_str())
        .chain(composed.bindings().map(|binding| binding.name.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["x", "weight", "a", "b", "m", "x1", "s"]);
    assert!(matches!(
        composed.return_type(),
        Some(ValueType::Tensor(spec)) if spec.is_scalar()
    ));
    Ok(())
}

#[test]
fn composition_preconditions() {
    let module = graph_module!(BACKBONE);
    let loss = graph_function!(SQUARED_ERROR);

    assert_eq!(
        append_loss(&module, "absent", &loss, 1, None),
        Err(AutodiffError::FunctionNotFound {
            name: "absent".to_string(),
        })
    );
    assert!(matches!(
        append_loss(&module, "predict", &loss, 2, None),
        Err(AutodiffError::ShapeMismatch { .. })
    ));
    assert!(matches!(
        append_loss(&module, "predict", &loss, 0, None),
        Err(AutodiffError::ShapeMismatch { .. })
    ));

    let vector_loss = graph_function!(
        r#"
func @vector(%pred: tensor<f32, 5x10>) -> tensor<f32, 5x10> {
  %e = exp(%pred) -> tensor<f32, 5x10>
  return %e
}
"#
    );
    assert!(matches!(
        append_loss(&module, "predict", &vector_loss, 1, None),
        Err(AutodiffError::NonScalarTarget { .. })
    ));

    let split_loss = graph_function!(
        r#"
func @split(%pred: tensor<f32, 5x10>) -> tensor<f32> {
  region {
    %e = exp(%pred) -> tensor<f32, 5x10>
    output %e
  }
  region {
    %s = sum(%pred) -> tensor<f32>
    output %s
  }
  return %s
}
"#
    );
    assert_eq!(
        append_loss(&module, "predict", &split_loss, 1, None),
        Err(AutodiffError::MultiRegionFunction {
            function: "split".to_string(),
            regions: 2,
        })
    );
}
