mod numeric_support;

use gradgraph::graph_function;
use gradgraph::ir::ValueType;
use gradgraph_ref_cpu::CpuValue;
use numeric_support::{check_gradients, init_logging, one_hot_labels, random_inputs};
use rand::rngs::StdRng;
use rand::SeedableRng;

#[test]
fn dense_layer_with_unary_chain() {
    init_logging();
    let function = graph_function!(
        r#"
func @dense(%x: tensor<f32, 3x4>, %w: tensor<f32, 4x2>, %b: tensor<f32, 2>) -> tensor<f32> {
  %h = matmul(%x, %w) -> tensor<f32, 3x2>
  %z = add(%h, %b) -> tensor<f32, 3x2>
  %e = exp(%z) -> tensor<f32, 3x2>
  %m = multiply(%e, %z) -> tensor<f32, 3x2>
  %n = negative(%m) -> tensor<f32, 3x2>
  %t = transpose(%n) -> tensor<f32, 2x3>
  %r = reshape(%t) -> tensor<f32, 6>
  %s = sum(%r) -> tensor<f32>
  return %s
}
"#
    );
    let mut rng = StdRng::seed_from_u64(7);
    let inputs = random_inputs(&function, &mut rng, -1.0, 1.0);
    check_gradients(&function, None, &inputs);
}

#[test]
fn divide_log_and_partial_sum() {
    init_logging();
    let function = graph_function!(
        r#"
func @ratio(%a: tensor<f32, 2x3>, %b: tensor<f32, 3>) -> tensor<f32> {
  %q = divide(%a, %b) -> tensor<f32, 2x3>
  %l = log(%b) -> tensor<f32, 3>
  %d = subtract(%q, %l) -> tensor<f32, 2x3>
  %s = sum(%d) axes[1] -> tensor<f32, 2>
  %sq = multiply(%s, %s) -> tensor<f32, 2>
  %t = sum(%sq) -> tensor<f32>
  return %t
}
"#
    );
    let mut rng = StdRng::seed_from_u64(11);
    let inputs = random_inputs(&function, &mut rng, 0.5, 2.0);
    check_gradients(&function, None, &inputs);
}

#[test]
fn keepdims_reduction_and_size_one_broadcast() {
    init_logging();
    let function = graph_function!(
        r#"
func @center(%x: tensor<f32, 2x3>, %g: tensor<f32, 2x1>) -> tensor<f32> {
  %r = sum(%x) axes[1] keepdims[true] -> tensor<f32, 2x1>
  %c = subtract(%x, %r) -> tensor<f32, 2x3>
  %sc = multiply(%c, %g) -> tensor<f32, 2x3>
  %sq = multiply(%sc, %sc) -> tensor<f32, 2x3>
  %s = sum(%sq) -> tensor<f32>
  return %s
}
"#
    );
    let mut rng = StdRng::seed_from_u64(13);
    let inputs = random_inputs(&function, &mut rng, -1.0, 1.0);
    check_gradients(&function, None, &inputs);
}

#[test]
fn softmax_cross_entropy_logits() {
    init_logging();
    let function = graph_function!(
        r#"
func @classify(%x: tensor<f32, 4x5>, %w: tensor<f32, 5x3>, %labels: tensor<f32, 4x3>) -> tensor<f32> {
  %logits = matmul(%x, %w) -> tensor<f32, 4x3>
  %loss = softmax_cross_entropy(%logits, %labels) -> tensor<f32>
  return %loss
}
"#
    );
    let mut rng = StdRng::seed_from_u64(17);
    let mut inputs = random_inputs(&function, &mut rng, -1.0, 1.0);
    let ValueType::Tensor(label_spec) = &function.params[2].ty else {
        panic!("labels are a tensor");
    };
    inputs[2] = CpuValue::Tensor(one_hot_labels(label_spec, &mut rng));
    let require = [function.params[0].id, function.params[1].id];
    check_gradients(&function, Some(&require), &inputs);
}

#[test]
fn shared_values_through_nested_tuples() {
    init_logging();
    let function = graph_function!(
        r#"
func @shared(%x: tensor<f32, 3>, %y: tensor<f32, 3>) -> tensor<f32> {
  %p = tuple(%x, (%y, %x)) -> (tensor<f32, 3>, (tensor<f32, 3>, tensor<f32, 3>))
  %inner = %p[1] -> (tensor<f32, 3>, tensor<f32, 3>)
  %m = multiply(%inner[0], %inner[1]) -> tensor<f32, 3>
  %a = add(%m, %p[0]) -> tensor<f32, 3>
  %e = exp(%a) -> tensor<f32, 3>
  %s = sum(%e) -> tensor<f32>
  return %s
}
"#
    );
    let mut rng = StdRng::seed_from_u64(19);
    let inputs = random_inputs(&function, &mut rng, -1.0, 1.0);
    check_gradients(&function, None, &inputs);
}

#[test]
fn constants_and_assignments_pass_gradients_through() {
    init_logging();
    let function = graph_function!(
        r#"
func @scaled(%x: tensor<f32, 2x2>) -> tensor<f32> {
  %k = 3.0 -> tensor<f32>
  %alias = %x -> tensor<f32, 2x2>
  %m = multiply(%alias, %k) -> tensor<f32, 2x2>
  %h = multiply(%m, 0.5) -> tensor<f32, 2x2>
  %sq = multiply(%h, %x) -> tensor<f32, 2x2>
  %s = sum(%sq) -> tensor<f32>
  return %s
}
"#
    );
    let mut rng = StdRng::seed_from_u64(23);
    let inputs = random_inputs(&function, &mut rng, -1.0, 1.0);
    check_gradients(&function, None, &inputs);
}
