use std::collections::HashMap;
use std::sync::Arc;

use gradgraph::ir::spec::{
    Expr, Function, Module, Operand, Operation, ReturnExpr, SumSpec, TensorLiteral, TensorSpec,
    TupleField, ValueId, ValueType,
};
use log::trace;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("{op} is not implemented: {reason}")]
    Unimplemented { op: String, reason: String },
    #[error("backend execution failure: {message}")]
    Execution { message: String },
}

impl BackendError {
    pub fn unimplemented(op: impl Into<String>, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op: op.into(),
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Dense row-major tensor. Every float dtype is evaluated in f64.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuTensor {
    pub spec: TensorSpec,
    pub data: Arc<[f64]>,
}

impl CpuTensor {
    pub fn from_f64(spec: TensorSpec, values: Vec<f64>) -> BackendResult<Self> {
        if values.len() != spec.element_count() {
            return Err(BackendError::execution(format!(
                "{} values supplied for {}",
                values.len(),
                spec
            )));
        }
        Ok(Self {
            spec,
            data: Arc::from(values),
        })
    }

    /// Rank-0 f32 tensor.
    pub fn scalar(value: f64) -> Self {
        Self {
            spec: TensorSpec::scalar(gradgraph::ir::DType::F32),
            data: Arc::from(vec![value]),
        }
    }

    pub fn filled(spec: &TensorSpec, value: f64) -> Self {
        Self {
            spec: spec.clone(),
            data: Arc::from(vec![value; spec.element_count()]),
        }
    }

    pub fn from_literal(literal: &TensorLiteral) -> BackendResult<Self> {
        let values = literal.to_f64_vec().ok_or_else(|| {
            BackendError::unimplemented("literal", format!("dtype {}", literal.spec.dtype))
        })?;
        Self::from_f64(literal.spec.clone(), values)
    }

    pub fn dims(&self) -> &[usize] {
        self.spec.shape.dims()
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.data.to_vec()
    }

    /// Value of a single-element tensor.
    pub fn item(&self) -> BackendResult<f64> {
        match self.data.as_ref() {
            [value] => Ok(*value),
            _ => Err(BackendError::execution(format!(
                "item() on tensor {} with {} elements",
                self.spec,
                self.data.len()
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CpuValue {
    Tensor(CpuTensor),
    Tuple(Vec<CpuValue>),
}

impl CpuValue {
    pub fn as_tensor(&self) -> Option<&CpuTensor> {
        match self {
            CpuValue::Tensor(tensor) => Some(tensor),
            CpuValue::Tuple(_) => None,
        }
    }

    pub fn tensor(&self) -> BackendResult<&CpuTensor> {
        self.as_tensor()
            .ok_or_else(|| BackendError::execution("expected a tensor, found a tuple"))
    }

    pub fn element(&self, index: usize) -> BackendResult<&CpuValue> {
        match self {
            CpuValue::Tuple(elements) => elements.get(index).ok_or_else(|| {
                BackendError::execution(format!(
                    "tuple index {index} out of range for arity {}",
                    elements.len()
                ))
            }),
            CpuValue::Tensor(_) => Err(BackendError::execution(
                "tuple element read from a tensor",
            )),
        }
    }

    fn matches(&self, ty: &ValueType) -> bool {
        match (self, ty) {
            (CpuValue::Tensor(tensor), ValueType::Tensor(spec)) => tensor.spec == *spec,
            (CpuValue::Tuple(values), ValueType::Tuple(types)) => {
                values.len() == types.len()
                    && values.iter().zip(types).all(|(value, ty)| value.matches(ty))
            }
            _ => false,
        }
    }
}

impl From<CpuTensor> for CpuValue {
    fn from(tensor: CpuTensor) -> Self {
        CpuValue::Tensor(tensor)
    }
}

/// Supplies kernels for `custom_call` targets.
pub trait CpuKernelInterceptor: Send + Sync {
    fn try_execute(
        &self,
        target: &str,
        inputs: &[CpuTensor],
        output: &TensorSpec,
    ) -> Option<BackendResult<CpuTensor>>;
}

#[derive(Debug, Default)]
pub struct NoopInterceptor;

impl CpuKernelInterceptor for NoopInterceptor {
    fn try_execute(
        &self,
        _target: &str,
        _inputs: &[CpuTensor],
        _output: &TensorSpec,
    ) -> Option<BackendResult<CpuTensor>> {
        None
    }
}

#[derive(Clone)]
pub struct GenericCpuInterpreter<I: CpuKernelInterceptor> {
    interceptor: Arc<I>,
}

impl<I: CpuKernelInterceptor> GenericCpuInterpreter<I> {
    pub fn with_interceptor(interceptor: I) -> Self {
        Self {
            interceptor: Arc::new(interceptor),
        }
    }

    pub fn with_arc(interceptor: Arc<I>) -> Self {
        Self { interceptor }
    }

    pub fn interceptor(&self) -> &I {
        self.interceptor.as_ref()
    }

    /// Evaluates every binding of `function` in order and returns the value of
    /// its return expression.
    pub fn run_function(
        &self,
        function: &Function,
        inputs: &[CpuValue],
    ) -> BackendResult<CpuValue> {
        if function.params.len() != inputs.len() {
            return Err(BackendError::execution(format!(
                "@{} expects {} inputs, got {}",
                function.name,
                function.params.len(),
                inputs.len()
            )));
        }
        let mut env: HashMap<ValueId, CpuValue> = HashMap::new();
        for (param, input) in function.params.iter().zip(inputs) {
            if !input.matches(&param.ty) {
                return Err(BackendError::execution(format!(
                    "input for %{} does not match {}",
                    param.name, param.ty
                )));
            }
            env.insert(param.id, input.clone());
        }

        for binding in function.bindings() {
            trace!("eval %{} in @{}", binding.name, function.name);
            let value = match &binding.expr {
                Expr::Call { op, operands } => {
                    let output = binding.ty.as_tensor().ok_or_else(|| {
                        BackendError::unimplemented(
                            op.name().to_string(),
                            "calls with tuple results",
                        )
                    })?;
                    let inputs = operands
                        .iter()
                        .map(|operand| resolve_tensor(&env, operand))
                        .collect::<BackendResult<Vec<_>>>()?;
                    let result = execute_operation(self.interceptor.as_ref(), op, &inputs, output)
                        .map_err(|err| augment_error(err, &binding.name))?;
                    CpuValue::Tensor(result)
                }
                Expr::Tuple(fields) => build_tuple(&env, fields)?,
                Expr::TupleGet { tuple, index } => lookup(&env, *tuple)?.element(*index)?.clone(),
                Expr::Use(operand) => resolve_value(&env, operand)?,
            };
            if !value.matches(&binding.ty) {
                return Err(BackendError::execution(format!(
                    "%{} evaluated to a value not of type {}",
                    binding.name, binding.ty
                )));
            }
            env.insert(binding.id, value);
        }
        collect_return(&env, &function.ret)
    }

    pub fn run_module_function(
        &self,
        module: &Module,
        name: &str,
        inputs: &[CpuValue],
    ) -> BackendResult<CpuValue> {
        let function = module
            .get(name)
            .ok_or_else(|| BackendError::execution(format!("function @{name} not found")))?;
        self.run_function(function, inputs)
    }
}

impl GenericCpuInterpreter<NoopInterceptor> {
    pub fn new() -> Self {
        Self::with_interceptor(NoopInterceptor)
    }
}

impl Default for GenericCpuInterpreter<NoopInterceptor> {
    fn default() -> Self {
        Self::new()
    }
}

pub type CpuInterpreter = GenericCpuInterpreter<NoopInterceptor>;

pub fn run_function(function: &Function, inputs: &[CpuValue]) -> BackendResult<CpuValue> {
    CpuInterpreter::new().run_function(function, inputs)
}

pub fn run_module_function(
    module: &Module,
    name: &str,
    inputs: &[CpuValue],
) -> BackendResult<CpuValue> {
    CpuInterpreter::new().run_module_function(module, name, inputs)
}

fn lookup(env: &HashMap<ValueId, CpuValue>, id: ValueId) -> BackendResult<&CpuValue> {
    env.get(&id)
        .ok_or_else(|| BackendError::execution(format!("value %{} is not available", id.0)))
}

fn resolve_value(env: &HashMap<ValueId, CpuValue>, operand: &Operand) -> BackendResult<CpuValue> {
    match operand {
        Operand::Value(id) => lookup(env, *id).cloned(),
        Operand::TupleElement { tuple, index } => lookup(env, *tuple)?.element(*index).cloned(),
        Operand::Literal(literal) => CpuTensor::from_literal(literal).map(CpuValue::Tensor),
    }
}

fn resolve_tensor(env: &HashMap<ValueId, CpuValue>, operand: &Operand) -> BackendResult<CpuTensor> {
    match resolve_value(env, operand)? {
        CpuValue::Tensor(tensor) => Ok(tensor),
        CpuValue::Tuple(_) => Err(BackendError::execution("call operand is a tuple")),
    }
}

fn build_tuple(env: &HashMap<ValueId, CpuValue>, fields: &[TupleField]) -> BackendResult<CpuValue> {
    fields
        .iter()
        .map(|field| match field {
            TupleField::Operand(operand) => resolve_value(env, operand),
            TupleField::Tuple(nested) => build_tuple(env, nested),
        })
        .collect::<BackendResult<Vec<_>>>()
        .map(CpuValue::Tuple)
}

fn collect_return(env: &HashMap<ValueId, CpuValue>, ret: &ReturnExpr) -> BackendResult<CpuValue> {
    match ret {
        ReturnExpr::Value(id) => lookup(env, *id).cloned(),
        ReturnExpr::Tuple(elements) => elements
            .iter()
            .map(|element| collect_return(env, element))
            .collect::<BackendResult<Vec<_>>>()
            .map(CpuValue::Tuple),
    }
}

fn augment_error(err: BackendError, binding: &str) -> BackendError {
    match err {
        BackendError::Execution { message } => {
            BackendError::execution(format!("%{binding}: {message}"))
        }
        other => other,
    }
}

fn execute_operation<I: CpuKernelInterceptor + ?Sized>(
    interceptor: &I,
    op: &Operation,
    inputs: &[CpuTensor],
    output: &TensorSpec,
) -> BackendResult<CpuTensor> {
    match op {
        Operation::Add => op_binary(inputs, output, |a, b| a + b),
        Operation::Subtract => op_binary(inputs, output, |a, b| a - b),
        Operation::Multiply => op_binary(inputs, output, |a, b| a * b),
        Operation::Divide => op_binary(inputs, output, |a, b| a / b),
        Operation::Negative => op_unary(inputs, output, |x| -x),
        Operation::Exp => op_unary(inputs, output, f64::exp),
        Operation::Log => op_unary(inputs, output, f64::ln),
        Operation::Matmul => op_matmul(inputs, output),
        Operation::Transpose(spec) => op_transpose(inputs, output, &spec.perm),
        Operation::Reshape(_) => op_reshape(inputs, output),
        Operation::Sum(spec) => op_sum(inputs, output, spec),
        Operation::Softmax(spec) => op_softmax(inputs, output, spec.axis),
        Operation::SoftmaxCrossEntropy => op_softmax_cross_entropy(inputs, output),
        Operation::Ones => Ok(CpuTensor::filled(output, 1.0)),
        Operation::Zeros => Ok(CpuTensor::filled(output, 0.0)),
        Operation::OnesLike => {
            expect_single(inputs)?;
            Ok(CpuTensor::filled(output, 1.0))
        }
        Operation::ZerosLike => {
            expect_single(inputs)?;
            Ok(CpuTensor::filled(output, 0.0))
        }
        Operation::CollapseSumLike => op_collapse_sum_like(inputs, output),
        Operation::CustomCall(spec) => interceptor
            .try_execute(&spec.target, inputs, output)
            .unwrap_or_else(|| {
                Err(BackendError::unimplemented(
                    "custom_call",
                    format!("no kernel for target `{}`", spec.target),
                ))
            }),
    }
}

fn op_binary(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    f: impl Fn(f64, f64) -> f64,
) -> BackendResult<CpuTensor> {
    let [lhs, rhs] = expect_pair(inputs)?;
    let out_dims = output.shape.dims();
    let a = broadcast_to(&lhs.data, lhs.dims(), out_dims)?;
    let b = broadcast_to(&rhs.data, rhs.dims(), out_dims)?;
    let result = a.iter().zip(b.iter()).map(|(&x, &y)| f(x, y)).collect();
    CpuTensor::from_f64(output.clone(), result)
}

fn op_unary(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    f: impl Fn(f64) -> f64,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    CpuTensor::from_f64(output.clone(), input.data.iter().map(|&x| f(x)).collect())
}

fn op_matmul(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    let [lhs, rhs] = expect_pair(inputs)?;
    let (l, r) = (lhs.dims(), rhs.dims());
    if l.len() != 2 || r.len() != 2 || l[1] != r[0] {
        return Err(BackendError::execution(format!(
            "matmul shapes {} and {} do not contract",
            lhs.spec, rhs.spec
        )));
    }
    let (m, k, n) = (l[0], l[1], r[1]);
    let mut result = vec![0.0f64; m * n];
    for i in 0..m {
        for p in 0..k {
            let a = lhs.data[i * k + p];
            for j in 0..n {
                result[i * n + j] += a * rhs.data[p * n + j];
            }
        }
    }
    CpuTensor::from_f64(output.clone(), result)
}

fn op_transpose(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    perm: &[usize],
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let input_dims = input.dims();
    if perm.len() != input_dims.len() {
        return Err(BackendError::execution("transpose rank mismatch"));
    }
    let out_dims = output.shape.dims();
    let input_strides = compute_strides(input_dims);
    let mut result = vec![0.0f64; output.element_count()];
    for (idx, slot) in result.iter_mut().enumerate() {
        let out_coord = unravel_index(idx, out_dims);
        let mut in_index = 0usize;
        for (out_axis, &out_c) in out_coord.iter().enumerate() {
            in_index += out_c * input_strides[perm[out_axis]];
        }
        *slot = input.data[in_index];
    }
    CpuTensor::from_f64(output.clone(), result)
}

fn op_reshape(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    if input.data.len() != output.element_count() {
        return Err(BackendError::execution("reshape element count mismatch"));
    }
    Ok(CpuTensor {
        spec: output.clone(),
        data: input.data.clone(),
    })
}

fn op_sum(inputs: &[CpuTensor], output: &TensorSpec, spec: &SumSpec) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let dims = input.dims();
    let reduced = |axis: usize| spec.axes.as_ref().map_or(true, |axes| axes.contains(&axis));
    let kept_dims = dims
        .iter()
        .enumerate()
        .map(|(axis, &dim)| if reduced(axis) { 1 } else { dim })
        .collect::<Vec<_>>();
    let kept_strides = compute_strides(&kept_dims);
    let mut result = vec![0.0f64; kept_dims.iter().product()];
    for (idx, &value) in input.data.iter().enumerate() {
        let coord = unravel_index(idx, dims);
        let out_index = coord
            .iter()
            .enumerate()
            .filter(|(axis, _)| !reduced(*axis))
            .map(|(axis, &c)| c * kept_strides[axis])
            .sum::<usize>();
        result[out_index] += value;
    }
    CpuTensor::from_f64(output.clone(), result)
}

fn op_softmax(inputs: &[CpuTensor], output: &TensorSpec, axis: usize) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let dims = input.dims();
    if axis >= dims.len() {
        return Err(BackendError::execution("softmax axis out of range"));
    }
    let mut result = input.data.to_vec();
    for_each_lane(dims, axis, |indices| {
        let max = indices
            .iter()
            .map(|&i| input.data[i])
            .fold(f64::NEG_INFINITY, f64::max);
        let mut total = 0.0f64;
        for &i in indices {
            let e = (input.data[i] - max).exp();
            result[i] = e;
            total += e;
        }
        for &i in indices {
            result[i] /= total;
        }
    });
    CpuTensor::from_f64(output.clone(), result)
}

// -sum(labels * log_softmax(logits)) over every row of the last axis.
fn op_softmax_cross_entropy(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    let [logits, labels] = expect_pair(inputs)?;
    if logits.spec.shape != labels.spec.shape {
        return Err(BackendError::execution("logits and labels differ in shape"));
    }
    let dims = logits.dims();
    let axis = dims
        .len()
        .checked_sub(1)
        .ok_or_else(|| BackendError::execution("logits must have a class axis"))?;
    let mut loss = 0.0f64;
    for_each_lane(dims, axis, |indices| {
        let max = indices
            .iter()
            .map(|&i| logits.data[i])
            .fold(f64::NEG_INFINITY, f64::max);
        let log_sum = indices
            .iter()
            .map(|&i| (logits.data[i] - max).exp())
            .sum::<f64>()
            .ln();
        for &i in indices {
            loss -= labels.data[i] * (logits.data[i] - max - log_sum);
        }
    });
    CpuTensor::from_f64(output.clone(), vec![loss])
}

// Sums `data` down to the target shape: leading axes are dropped and axes
// where the target has extent 1 are reduced.
fn op_collapse_sum_like(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    let [data, _target] = expect_pair(inputs)?;
    let dims = data.dims();
    let out_dims = output.shape.dims();
    if out_dims.len() > dims.len() {
        return Err(BackendError::execution(
            "collapse_sum_like target rank exceeds data rank",
        ));
    }
    let rank_diff = dims.len() - out_dims.len();
    let out_strides = compute_strides(out_dims);
    let mut result = vec![0.0f64; output.element_count()];
    for (idx, &value) in data.data.iter().enumerate() {
        let coord = unravel_index(idx, dims);
        let mut out_index = 0usize;
        for (out_axis, &out_dim) in out_dims.iter().enumerate() {
            let c = coord[rank_diff + out_axis];
            if out_dim != 1 {
                if c >= out_dim {
                    return Err(BackendError::execution(
                        "collapse_sum_like target does not broadcast to data",
                    ));
                }
                out_index += c * out_strides[out_axis];
            }
        }
        result[out_index] += value;
    }
    CpuTensor::from_f64(output.clone(), result)
}

/// Calls `f` with the flat indices of every 1-D lane along `axis`.
fn for_each_lane(dims: &[usize], axis: usize, mut f: impl FnMut(&[usize])) {
    let strides = compute_strides(dims);
    let axis_len = dims[axis];
    let inner = strides[axis];
    let total: usize = dims.iter().product();
    if axis_len == 0 || total == 0 {
        return;
    }
    let outer = total / (axis_len * inner);
    let mut lane = Vec::with_capacity(axis_len);
    for outer_idx in 0..outer {
        for inner_idx in 0..inner {
            let base = outer_idx * axis_len * inner + inner_idx;
            lane.clear();
            lane.extend((0..axis_len).map(|a| base + a * inner));
            f(&lane);
        }
    }
}

fn broadcast_to(input: &[f64], input_dims: &[usize], out_dims: &[usize]) -> BackendResult<Vec<f64>> {
    let out_len: usize = out_dims.iter().product();
    if out_len == 0 {
        return Ok(Vec::new());
    }
    if input_dims == out_dims {
        return Ok(input.to_vec());
    }
    if out_dims.len() < input_dims.len() {
        return Err(BackendError::execution(
            "broadcast result rank must be >= operand rank",
        ));
    }
    let rank_diff = out_dims.len() - input_dims.len();
    let mut aligned_in_dims = vec![1usize; out_dims.len()];
    aligned_in_dims[rank_diff..].copy_from_slice(input_dims);
    for (&dim, &out_dim) in aligned_in_dims.iter().zip(out_dims) {
        if dim != 1 && dim != out_dim {
            return Err(BackendError::execution("broadcast dim mismatch"));
        }
    }
    let in_strides = compute_strides(&aligned_in_dims);
    let out_strides = compute_strides(out_dims);
    let mut out = vec![0.0f64; out_len];
    broadcast_rec(
        &mut out,
        input,
        0,
        0,
        0,
        out_dims,
        &aligned_in_dims,
        &out_strides,
        &in_strides,
    );
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn broadcast_rec(
    out: &mut [f64],
    input: &[f64],
    axis: usize,
    out_offset: usize,
    in_offset: usize,
    out_dims: &[usize],
    in_dims: &[usize],
    out_strides: &[usize],
    in_strides: &[usize],
) {
    let rank = out_dims.len();
    if axis >= rank {
        out[out_offset] = input[in_offset];
        return;
    }

    if in_dims[axis..] == out_dims[axis..] {
        let block_len: usize = out_dims[axis..].iter().product();
        out[out_offset..out_offset + block_len]
            .copy_from_slice(&input[in_offset..in_offset + block_len]);
        return;
    }

    if in_dims[axis..].iter().all(|&dim| dim == 1) {
        let block_len: usize = out_dims[axis..].iter().product();
        out[out_offset..out_offset + block_len].fill(input[in_offset]);
        return;
    }

    let in_step = if in_dims[axis] == 1 {
        0
    } else {
        in_strides[axis]
    };
    for i in 0..out_dims[axis] {
        broadcast_rec(
            out,
            input,
            axis + 1,
            out_offset + i * out_strides[axis],
            in_offset + i * in_step,
            out_dims,
            in_dims,
            out_strides,
            in_strides,
        );
    }
}

fn expect_single(inputs: &[CpuTensor]) -> BackendResult<&CpuTensor> {
    match inputs {
        [input] => Ok(input),
        _ => Err(BackendError::execution("operation expects single input")),
    }
}

fn expect_pair(inputs: &[CpuTensor]) -> BackendResult<[&CpuTensor; 2]> {
    match inputs {
        [lhs, rhs] => Ok([lhs, rhs]),
        _ => Err(BackendError::execution("operation expects two inputs")),
    }
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use gradgraph::ir::{DType, Shape};

    fn spec(dims: &[usize]) -> TensorSpec {
        TensorSpec::new(DType::F32, Shape::new(dims.to_vec()))
    }

    fn tensor(dims: &[usize], values: &[f64]) -> CpuTensor {
        CpuTensor::from_f64(spec(dims), values.to_vec()).expect("tensor")
    }

    #[test]
    fn binary_ops_broadcast_trailing_axes() {
        let a = tensor(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = tensor(&[3], &[10.0, 20.0, 30.0]);
        let out = execute_operation(&NoopInterceptor, &Operation::Add, &[a, b], &spec(&[2, 3]))
            .expect("add");
        assert_eq!(out.to_vec(), vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn collapse_sum_like_reduces_broadcast_axes() {
        let data = tensor(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let row = tensor(&[3], &[0.0; 3]);
        let out = op_collapse_sum_like(&[data.clone(), row], &spec(&[3])).expect("collapse");
        assert_eq!(out.to_vec(), vec![5.0, 7.0, 9.0]);
        let col = tensor(&[2, 1], &[0.0; 2]);
        let out = op_collapse_sum_like(&[data, col], &spec(&[2, 1])).expect("collapse");
        assert_eq!(out.to_vec(), vec![6.0, 15.0]);
    }

    #[test]
    fn sum_over_selected_axes() {
        let x = tensor(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let spec_rows = SumSpec {
            axes: Some(vec![1]),
            keepdims: false,
        };
        let out = op_sum(&[x.clone()], &spec(&[2]), &spec_rows).expect("sum");
        assert_eq!(out.to_vec(), vec![6.0, 15.0]);
        let all = SumSpec {
            axes: None,
            keepdims: false,
        };
        let out = op_sum(&[x], &spec(&[]), &all).expect("sum");
        assert_eq!(out.item().expect("scalar"), 21.0);
    }

    #[test]
    fn matmul_and_transpose() {
        let a = tensor(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = tensor(&[3, 1], &[1.0, 0.0, -1.0]);
        let out = op_matmul(&[a.clone(), b], &spec(&[2, 1])).expect("matmul");
        assert_eq!(out.to_vec(), vec![-2.0, -2.0]);
        let t = op_transpose(&[a], &spec(&[3, 2]), &[1, 0]).expect("transpose");
        assert_eq!(t.to_vec(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn softmax_cross_entropy_matches_closed_form() {
        let logits = tensor(&[1, 2], &[0.0, 0.0]);
        let labels = tensor(&[1, 2], &[1.0, 0.0]);
        let out = op_softmax_cross_entropy(&[logits.clone(), labels], &spec(&[])).expect("sce");
        assert_relative_eq!(out.item().expect("scalar"), std::f64::consts::LN_2, epsilon = 1e-12);
        let probs = op_softmax(&[logits], &spec(&[1, 2]), 1).expect("softmax");
        assert_eq!(probs.to_vec(), vec![0.5, 0.5]);
    }

    #[test]
    fn unknown_custom_call_is_unimplemented() {
        let op = Operation::CustomCall(gradgraph::ir::spec::CustomCallSpec {
            target: "mystery".to_string(),
        });
        let err = execute_operation(&NoopInterceptor, &op, &[], &spec(&[])).unwrap_err();
        assert!(matches!(err, BackendError::Unimplemented { .. }));
    }
}
