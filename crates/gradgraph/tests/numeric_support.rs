use approx::assert_relative_eq;
use gradgraph::ir::{Function, TensorSpec, ValueId, ValueType};
use gradgraph::AutodiffConfig;
use gradgraph_ref_cpu::{CpuTensor, CpuValue};
use rand::rngs::StdRng;
use rand::Rng;

pub const STEP: f64 = 1e-6;
pub const TOLERANCE: f64 = 1e-4;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn verifying_config() -> AutodiffConfig {
    AutodiffConfig {
        verify_output: true,
        ..AutodiffConfig::default()
    }
}

pub fn random_tensor(spec: &TensorSpec, rng: &mut StdRng, low: f64, high: f64) -> CpuTensor {
    let values = (0..spec.element_count())
        .map(|_| rng.gen_range(low..high))
        .collect();
    CpuTensor::from_f64(spec.clone(), values).expect("random tensor")
}

pub fn random_value(ty: &ValueType, rng: &mut StdRng, low: f64, high: f64) -> CpuValue {
    match ty {
        ValueType::Tensor(spec) => CpuValue::Tensor(random_tensor(spec, rng, low, high)),
        ValueType::Tuple(elements) => CpuValue::Tuple(
            elements
                .iter()
                .map(|element| random_value(element, rng, low, high))
                .collect(),
        ),
    }
}

pub fn random_inputs(function: &Function, rng: &mut StdRng, low: f64, high: f64) -> Vec<CpuValue> {
    function
        .params
        .iter()
        .map(|param| random_value(&param.ty, rng, low, high))
        .collect()
}

/// One-hot rows, one hot class per row, for a `[rows, classes]` spec.
pub fn one_hot_labels(spec: &TensorSpec, rng: &mut StdRng) -> CpuTensor {
    let dims = spec.shape.dims();
    let (rows, classes) = (dims[0], dims[1]);
    let mut values = vec![0.0; rows * classes];
    for row in 0..rows {
        values[row * classes + rng.gen_range(0..classes)] = 1.0;
    }
    CpuTensor::from_f64(spec.clone(), values).expect("labels")
}

pub fn eval_scalar(function: &Function, inputs: &[CpuValue]) -> f64 {
    let output = gradgraph_ref_cpu::run_function(function, inputs).expect("forward run");
    output
        .tensor()
        .and_then(CpuTensor::item)
        .expect("scalar output")
}

/// Splits the `(loss, (grads...))` result of a differentiated function.
pub fn eval_adjoint(adjoint: &Function, inputs: &[CpuValue]) -> (f64, Vec<CpuValue>) {
    let output = gradgraph_ref_cpu::run_function(adjoint, inputs).expect("adjoint run");
    let CpuValue::Tuple(mut parts) = output else {
        panic!("adjoint must return a tuple");
    };
    assert_eq!(parts.len(), 2, "adjoint returns (loss, grads)");
    let grads = match parts.pop() {
        Some(CpuValue::Tuple(grads)) => grads,
        other => panic!("gradient slot is not a tuple: {other:?}"),
    };
    let loss = parts[0]
        .tensor()
        .and_then(CpuTensor::item)
        .expect("scalar loss");
    (loss, grads)
}

/// Central finite difference of `function` with respect to every element of
/// the tensor parameter at `param_index`.
pub fn numeric_gradient(function: &Function, inputs: &[CpuValue], param_index: usize) -> Vec<f64> {
    let base = inputs[param_index]
        .tensor()
        .expect("tensor parameter")
        .clone();
    (0..base.data.len())
        .map(|element| {
            let shifted = |delta: f64| {
                let mut values = base.to_vec();
                values[element] += delta;
                let mut perturbed = inputs.to_vec();
                perturbed[param_index] = CpuValue::Tensor(
                    CpuTensor::from_f64(base.spec.clone(), values).expect("perturbed"),
                );
                eval_scalar(function, &perturbed)
            };
            (shifted(STEP) - shifted(-STEP)) / (2.0 * STEP)
        })
        .collect()
}

/// Differentiates `function`, runs it on `inputs` and compares every requested
/// gradient with finite differences.
pub fn check_gradients(function: &Function, require_grads: Option<&[ValueId]>, inputs: &[CpuValue]) {
    let adjoint =
        gradgraph::autodiff::differentiate_with_config(function, require_grads, &verifying_config())
            .unwrap_or_else(|e| panic!("differentiate @{}: {e}", function.name));
    let (loss, grads) = eval_adjoint(&adjoint, inputs);
    assert_relative_eq!(loss, eval_scalar(function, inputs), epsilon = 1e-12);

    let requested = require_grads
        .map(<[ValueId]>::to_vec)
        .unwrap_or_else(|| function.param_ids());
    assert_eq!(grads.len(), requested.len());
    for (grad, id) in grads.iter().zip(&requested) {
        let index = function
            .params
            .iter()
            .position(|param| param.id == *id)
            .expect("requested parameter");
        let analytic = grad.tensor().expect("tensor gradient").to_vec();
        let numeric = numeric_gradient(function, inputs, index);
        assert_eq!(analytic.len(), numeric.len());
        for (a, n) in analytic.iter().zip(&numeric) {
            assert_relative_eq!(*a, *n, epsilon = TOLERANCE, max_relative = TOLERANCE);
        }
    }
}
