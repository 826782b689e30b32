use std::{fmt, fs, io, path::Path, sync::Arc};

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use thiserror::Error;

/// Graph IR version stamped into serialized modules.
pub const IR_VERSION: &str = "gradgraph.v1";

fn default_ir_version() -> String {
    IR_VERSION.to_string()
}

/// Scalar element types understood by the graph IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum DType {
    I1,
    Si32,
    Si64,
    F16,
    Bf16,
    F32,
    F64,
}

impl DType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::I1 => 1,
            DType::F16 | DType::Bf16 => 2,
            DType::Si32 | DType::F32 => 4,
            DType::Si64 | DType::F64 => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::I1 => "i1",
            DType::Si32 => "si32",
            DType::Si64 => "si64",
            DType::F16 => "f16",
            DType::Bf16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static tensor shape. A rank-0 shape describes a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims = self
            .dims
            .iter()
            .map(|dim| dim.to_string())
            .collect::<Vec<_>>();
        f.write_str(&dims.join("x"))
    }
}

/// Tensor metadata coupling dtype and shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    pub fn scalar(dtype: DType) -> Self {
        Self::new(dtype, Shape::scalar())
    }

    pub fn element_count(&self) -> usize {
        self.shape.element_count()
    }

    pub fn byte_len(&self) -> usize {
        self.element_count() * self.dtype.size_in_bytes()
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_scalar()
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.shape.is_scalar() {
            write!(f, "tensor<{}>", self.dtype)
        } else {
            write!(f, "tensor<{}, {}>", self.dtype, self.shape)
        }
    }
}

/// Dense literal tensor payload stored little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorLiteral {
    pub spec: TensorSpec,
    pub bytes: Arc<[u8]>,
}

impl TensorLiteral {
    pub fn new(spec: TensorSpec, bytes: Arc<[u8]>) -> Self {
        Self { spec, bytes }
    }

    pub fn scalar_f32(value: f32) -> Self {
        Self::new(
            TensorSpec::scalar(DType::F32),
            Arc::from(value.to_le_bytes().as_slice()),
        )
    }

    pub fn scalar_f64(value: f64) -> Self {
        Self::new(
            TensorSpec::scalar(DType::F64),
            Arc::from(value.to_le_bytes().as_slice()),
        )
    }

    /// Decodes float payloads into `f64`. Returns `None` for non-float literals or
    /// truncated payloads.
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        if self.bytes.len() != self.spec.byte_len() {
            return None;
        }
        match self.spec.dtype {
            DType::F32 => Some(
                self.bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
                    .collect(),
            ),
            DType::F64 => Some(
                self.bytes
                    .chunks_exact(8)
                    .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Returns the value of a rank-0 `f32` literal.
    pub fn as_scalar_f32(&self) -> Option<f32> {
        if self.spec.dtype != DType::F32 || !self.spec.is_scalar() || self.bytes.len() != 4 {
            return None;
        }
        Some(f32::from_le_bytes([
            self.bytes[0],
            self.bytes[1],
            self.bytes[2],
            self.bytes[3],
        ]))
    }
}

impl Serialize for TensorLiteral {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("TensorLiteral", 2)?;
        state.serialize_field("spec", &self.spec)?;
        state.serialize_field("bytes", &self.bytes.as_ref())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for TensorLiteral {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct TensorLiteralHelper {
            spec: TensorSpec,
            bytes: Vec<u8>,
        }

        let helper = TensorLiteralHelper::deserialize(deserializer)?;
        Ok(TensorLiteral {
            spec: helper.spec,
            bytes: Arc::<[u8]>::from(helper.bytes),
        })
    }
}

/// Per-function identity of a value. Parameters and bindings share one id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Typing information for values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Tensor(TensorSpec),
    Tuple(Vec<ValueType>),
}

impl ValueType {
    pub fn as_tensor(&self) -> Option<&TensorSpec> {
        match self {
            ValueType::Tensor(spec) => Some(spec),
            ValueType::Tuple(_) => None,
        }
    }

    pub fn is_scalar_tensor(&self) -> bool {
        self.as_tensor().is_some_and(TensorSpec::is_scalar)
    }

    pub fn tuple_element(&self, index: usize) -> Option<&ValueType> {
        match self {
            ValueType::Tuple(elements) => elements.get(index),
            ValueType::Tensor(_) => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Tensor(spec) => write!(f, "{spec}"),
            ValueType::Tuple(elements) => {
                let inner = elements
                    .iter()
                    .map(|element| element.to_string())
                    .collect::<Vec<_>>();
                write!(f, "({})", inner.join(", "))
            }
        }
    }
}

/// Argument reference inside an expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    Value(ValueId),
    TupleElement { tuple: ValueId, index: usize },
    Literal(TensorLiteral),
}

impl Operand {
    /// Value this operand reads, if any.
    pub fn value(&self) -> Option<ValueId> {
        match self {
            Operand::Value(id) => Some(*id),
            Operand::TupleElement { tuple, .. } => Some(*tuple),
            Operand::Literal(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransposeSpec {
    pub perm: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReshapeSpec {
    pub shape: Vec<usize>,
}

/// Sum reduction. `axes: None` reduces every axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SumSpec {
    pub axes: Option<Vec<usize>>,
    pub keepdims: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SoftmaxSpec {
    pub axis: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CustomCallSpec {
    pub target: String,
}

/// Operators a call expression may apply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Add,
    Subtract,
    Multiply,
    Divide,
    Negative,
    Exp,
    Log,
    Matmul,
    Transpose(TransposeSpec),
    Reshape(ReshapeSpec),
    Sum(SumSpec),
    Softmax(SoftmaxSpec),
    SoftmaxCrossEntropy,
    Ones,
    Zeros,
    OnesLike,
    ZerosLike,
    CollapseSumLike,
    CustomCall(CustomCallSpec),
}

impl Operation {
    /// Operator identity. Custom calls are identified by their target.
    pub fn name(&self) -> &str {
        match self {
            Operation::Add => "add",
            Operation::Subtract => "subtract",
            Operation::Multiply => "multiply",
            Operation::Divide => "divide",
            Operation::Negative => "negative",
            Operation::Exp => "exp",
            Operation::Log => "log",
            Operation::Matmul => "matmul",
            Operation::Transpose(_) => "transpose",
            Operation::Reshape(_) => "reshape",
            Operation::Sum(_) => "sum",
            Operation::Softmax(_) => "softmax",
            Operation::SoftmaxCrossEntropy => "softmax_cross_entropy",
            Operation::Ones => "ones",
            Operation::Zeros => "zeros",
            Operation::OnesLike => "ones_like",
            Operation::ZerosLike => "zeros_like",
            Operation::CollapseSumLike => "collapse_sum_like",
            Operation::CustomCall(spec) => &spec.target,
        }
    }

    /// Returns `true` when operand shapes are broadcast against each other.
    pub fn broadcasts(&self) -> bool {
        matches!(
            self,
            Operation::Add | Operation::Subtract | Operation::Multiply | Operation::Divide
        )
    }
}

/// Right-hand side of a binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expr {
    Call {
        op: Operation,
        operands: Vec<Operand>,
    },
    Tuple(Vec<TupleField>),
    TupleGet {
        tuple: ValueId,
        index: usize,
    },
    /// Direct reference to a value or constant.
    Use(Operand),
}

/// Element of a tuple construction. Nested tuples may be built inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TupleField {
    Operand(Operand),
    Tuple(Vec<TupleField>),
}

impl Expr {
    /// Values read by the expression, in operand order.
    pub fn used_values(&self) -> Vec<ValueId> {
        let mut out = Vec::new();
        match self {
            Expr::Call { operands, .. } => out.extend(operands.iter().filter_map(Operand::value)),
            Expr::Tuple(fields) => collect_field_values(fields, &mut out),
            Expr::TupleGet { tuple, .. } => out.push(*tuple),
            Expr::Use(operand) => out.extend(operand.value()),
        }
        out
    }
}

fn collect_field_values(fields: &[TupleField], out: &mut Vec<ValueId>) {
    for field in fields {
        match field {
            TupleField::Operand(operand) => out.extend(operand.value()),
            TupleField::Tuple(inner) => collect_field_values(inner, out),
        }
    }
}

/// Function parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub id: ValueId,
    pub name: String,
    pub ty: ValueType,
}

/// `name := expr` with the declared result type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub id: ValueId,
    pub name: String,
    pub expr: Expr,
    pub ty: ValueType,
}

/// Ordered bindings plus the values exposed downstream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Region {
    pub bindings: Vec<Binding>,
    pub outputs: Vec<ValueId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnExpr {
    Value(ValueId),
    Tuple(Vec<ReturnExpr>),
}

impl ReturnExpr {
    pub fn values(&self) -> Vec<ValueId> {
        match self {
            ReturnExpr::Value(id) => vec![*id],
            ReturnExpr::Tuple(elements) => elements.iter().flat_map(ReturnExpr::values).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub regions: Vec<Region>,
    pub ret: ReturnExpr,
}

impl Function {
    pub fn param_ids(&self) -> Vec<ValueId> {
        self.params.iter().map(|param| param.id).collect()
    }

    pub fn param(&self, id: ValueId) -> Option<&Param> {
        self.params.iter().find(|param| param.id == id)
    }

    pub fn bindings(&self) -> impl Iterator<Item = &Binding> {
        self.regions.iter().flat_map(|region| region.bindings.iter())
    }

    pub fn binding(&self, id: ValueId) -> Option<&Binding> {
        self.bindings().find(|binding| binding.id == id)
    }

    /// Looks a value up by its textual name.
    pub fn value_id(&self, name: &str) -> Option<ValueId> {
        self.params
            .iter()
            .find(|param| param.name == name)
            .map(|param| param.id)
            .or_else(|| {
                self.bindings()
                    .find(|binding| binding.name == name)
                    .map(|binding| binding.id)
            })
    }

    pub fn value_name(&self, id: ValueId) -> Option<&str> {
        self.param(id)
            .map(|param| param.name.as_str())
            .or_else(|| self.binding(id).map(|binding| binding.name.as_str()))
    }

    pub fn value_type(&self, id: ValueId) -> Option<&ValueType> {
        self.param(id)
            .map(|param| &param.ty)
            .or_else(|| self.binding(id).map(|binding| &binding.ty))
    }

    /// Type of the return expression, if every referenced value is defined.
    pub fn return_type(&self) -> Option<ValueType> {
        fn build(function: &Function, ret: &ReturnExpr) -> Option<ValueType> {
            match ret {
                ReturnExpr::Value(id) => function.value_type(*id).cloned(),
                ReturnExpr::Tuple(elements) => elements
                    .iter()
                    .map(|element| build(function, element))
                    .collect::<Option<Vec<_>>>()
                    .map(ValueType::Tuple),
            }
        }
        build(self, &self.ret)
    }

    pub fn to_text(&self) -> String {
        format!("{self}")
    }
}

/// Insertion-ordered collection of functions keyed by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    #[serde(default = "default_ir_version")]
    pub ir_version: String,
    pub functions: Vec<Function>,
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum ModuleSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("module ir version '{found}' does not match expected '{expected}'")]
    VersionMismatch {
        found: String,
        expected: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum ModuleIoError {
    #[error(transparent)]
    Serialization(#[from] ModuleSerdeError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Module {
    pub fn new() -> Self {
        Self {
            ir_version: IR_VERSION.to_string(),
            functions: Vec::new(),
        }
    }

    pub fn with_functions(mut self, functions: Vec<Function>) -> Self {
        for function in functions {
            self.insert(function);
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|function| function.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Inserts `function`, replacing a same-named function in place. Returns the
    /// replaced function.
    pub fn insert(&mut self, function: Function) -> Option<Function> {
        match self
            .functions
            .iter_mut()
            .find(|existing| existing.name == function.name)
        {
            Some(slot) => Some(std::mem::replace(slot, function)),
            None => {
                self.functions.push(function);
                None
            }
        }
    }

    /// Inserts a transform result. Replacing a function of the same name is
    /// logged; returns `true` in that case.
    pub(crate) fn insert_output(&mut self, function: Function) -> bool {
        let name = function.name.clone();
        let replaced = self.insert(function).is_some();
        if replaced {
            log::warn!("replaced existing function @{name}");
        }
        replaced
    }

    pub fn names(&self) -> Vec<&str> {
        self.functions
            .iter()
            .map(|function| function.name.as_str())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn to_json_string(&self) -> Result<String, ModuleSerdeError> {
        serde_json::to_string_pretty(self).map_err(ModuleSerdeError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Self, ModuleSerdeError> {
        let mut module: Module = serde_json::from_str(src).map_err(ModuleSerdeError::from)?;
        module.ir_version = normalize_ir_version(module.ir_version)?;
        Ok(module)
    }

    pub fn to_bincode_bytes(&self) -> Result<Vec<u8>, ModuleSerdeError> {
        bincode::serialize(self).map_err(ModuleSerdeError::from)
    }

    pub fn from_bincode_slice(bytes: &[u8]) -> Result<Self, ModuleSerdeError> {
        let mut module: Module = bincode::deserialize(bytes).map_err(ModuleSerdeError::from)?;
        module.ir_version = normalize_ir_version(module.ir_version)?;
        Ok(module)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), ModuleIoError> {
        let contents = self.to_json_string()?;
        fs::write(path, contents).map_err(ModuleIoError::from)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, ModuleIoError> {
        let contents = fs::read_to_string(path).map_err(ModuleIoError::from)?;
        Module::from_json_str(&contents).map_err(ModuleIoError::from)
    }

    pub fn to_text(&self) -> String {
        format!("{self}")
    }
}

fn normalize_ir_version(version: String) -> Result<String, ModuleSerdeError> {
    if version.is_empty() {
        return Ok(IR_VERSION.to_string());
    }
    if version == IR_VERSION {
        Ok(version)
    } else {
        Err(ModuleSerdeError::VersionMismatch {
            found: version,
            expected: IR_VERSION,
        })
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, function) in self.functions.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            fmt_function(function, 0, f)?;
        }
        Ok(())
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_function(self, 0, f)
    }
}

fn fmt_function(function: &Function, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let params = function
        .params
        .iter()
        .map(|param| format!("%{}: {}", param.name, param.ty))
        .collect::<Vec<_>>()
        .join(", ");
    let ret_ty = function
        .return_type()
        .map(|ty| ty.to_string())
        .unwrap_or_else(|| "?".to_string());
    write_line(
        f,
        indent,
        &format!("func @{}({}) -> {} {{", function.name, params, ret_ty),
    )?;
    let explicit_regions = function.regions.len() != 1;
    for region in &function.regions {
        let body_indent = if explicit_regions {
            write_line(f, indent + 1, "region {")?;
            indent + 2
        } else {
            indent + 1
        };
        for binding in &region.bindings {
            fmt_binding(function, binding, body_indent, f)?;
        }
        if !region.outputs.is_empty() {
            let outputs = region
                .outputs
                .iter()
                .map(|id| value_ref(function, *id))
                .collect::<Vec<_>>()
                .join(", ");
            write_line(f, body_indent, &format!("output {outputs}"))?;
        }
        if explicit_regions {
            write_line(f, indent + 1, "}")?;
        }
    }
    write_line(
        f,
        indent + 1,
        &format!("return {}", format_return(function, &function.ret)),
    )?;
    write_line(f, indent, "}")
}

fn fmt_binding(
    function: &Function,
    binding: &Binding,
    indent: usize,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    let rhs = match &binding.expr {
        Expr::Call { op, operands } => {
            let operands = operands
                .iter()
                .map(|operand| format_operand(function, operand))
                .collect::<Vec<_>>()
                .join(", ");
            let attrs = format_attributes(op);
            let name = match op {
                Operation::CustomCall(_) => "custom_call",
                other => other.name(),
            };
            if attrs.is_empty() {
                format!("{name}({operands})")
            } else {
                format!("{name}({operands}) {attrs}")
            }
        }
        Expr::Tuple(fields) => format!("tuple{}", format_fields(function, fields)),
        Expr::TupleGet { tuple, index } => format!("{}[{}]", value_ref(function, *tuple), index),
        Expr::Use(operand) => format_operand(function, operand),
    };
    write_line(
        f,
        indent,
        &format!("%{} = {} -> {}", binding.name, rhs, binding.ty),
    )
}

fn format_attributes(op: &Operation) -> String {
    let list = |values: &[usize]| {
        values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    match op {
        Operation::Transpose(spec) => format!("perm[{}]", list(&spec.perm)),
        Operation::Reshape(spec) => format!("shape[{}]", list(&spec.shape)),
        Operation::Sum(spec) => {
            let mut attrs = Vec::new();
            if let Some(axes) = &spec.axes {
                attrs.push(format!("axes[{}]", list(axes)));
            }
            if spec.keepdims {
                attrs.push("keepdims[true]".to_string());
            }
            attrs.join(" ")
        }
        Operation::Softmax(spec) => format!("axis[{}]", spec.axis),
        Operation::CustomCall(spec) => format!("target[{}]", spec.target),
        _ => String::new(),
    }
}

fn format_fields(function: &Function, fields: &[TupleField]) -> String {
    let inner = fields
        .iter()
        .map(|field| match field {
            TupleField::Operand(operand) => format_operand(function, operand),
            TupleField::Tuple(nested) => format_fields(function, nested),
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("({inner})")
}

fn format_return(function: &Function, ret: &ReturnExpr) -> String {
    match ret {
        ReturnExpr::Value(id) => value_ref(function, *id),
        ReturnExpr::Tuple(elements) => {
            let inner = elements
                .iter()
                .map(|element| format_return(function, element))
                .collect::<Vec<_>>()
                .join(", ");
            format!("({inner})")
        }
    }
}

fn format_operand(function: &Function, operand: &Operand) -> String {
    match operand {
        Operand::Value(id) => value_ref(function, *id),
        Operand::TupleElement { tuple, index } => {
            format!("{}[{}]", value_ref(function, *tuple), index)
        }
        Operand::Literal(literal) => match literal.as_scalar_f32() {
            Some(value) => format!("{value:?}"),
            None => format!("literal<{}>", literal.spec),
        },
    }
}

fn value_ref(function: &Function, id: ValueId) -> String {
    match function.value_name(id) {
        Some(name) => format!("%{name}"),
        None => format!("%<{}>", id.0),
    }
}

fn write_line(f: &mut fmt::Formatter<'_>, indent: usize, line: &str) -> fmt::Result {
    for _ in 0..indent {
        f.write_str("  ")?;
    }
    writeln!(f, "{line}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_tensor(dims: &[usize]) -> ValueType {
        ValueType::Tensor(TensorSpec::new(DType::F32, Shape::new(dims.to_vec())))
    }

    #[test]
    fn value_type_display_matches_text_syntax() {
        assert_eq!(f32_tensor(&[5, 20]).to_string(), "tensor<f32, 5x20>");
        assert_eq!(f32_tensor(&[]).to_string(), "tensor<f32>");
        let nested = ValueType::Tuple(vec![
            f32_tensor(&[2]),
            ValueType::Tuple(vec![f32_tensor(&[]), f32_tensor(&[3, 1])]),
        ]);
        assert_eq!(
            nested.to_string(),
            "(tensor<f32, 2>, (tensor<f32>, tensor<f32, 3x1>))"
        );
    }

    #[test]
    fn module_insert_replaces_in_place() {
        let make = |name: &str, arity: usize| Function {
            name: name.to_string(),
            params: (0..arity)
                .map(|i| Param {
                    id: ValueId(i as u32),
                    name: format!("p{i}"),
                    ty: f32_tensor(&[]),
                })
                .collect(),
            regions: vec![Region::default()],
            ret: ReturnExpr::Value(ValueId(0)),
        };
        let mut module = Module::new().with_functions(vec![make("a", 1), make("b", 1)]);
        let replaced = module.insert(make("a", 2));
        assert_eq!(replaced.map(|f| f.params.len()), Some(1));
        assert_eq!(module.names(), vec!["a", "b"]);
        assert_eq!(module.get("a").map(|f| f.params.len()), Some(2));
    }

    #[test]
    fn scalar_literal_roundtrips_through_bytes() {
        let lit = TensorLiteral::scalar_f32(0.25);
        assert_eq!(lit.as_scalar_f32(), Some(0.25));
        assert_eq!(lit.to_f64_vec(), Some(vec![0.25]));
        assert_eq!(TensorLiteral::scalar_f64(1.5).as_scalar_f32(), None);

        let truncated = TensorLiteral::new(
            TensorSpec::new(DType::F32, Shape::new(vec![2])),
            Arc::from(0.5f32.to_le_bytes().as_slice()),
        );
        assert_eq!(truncated.to_f64_vec(), None);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut module = Module::new();
        module.ir_version = "gradgraph.v0".to_string();
        let json = module.to_json_string().expect("serialize");
        let err = Module::from_json_str(&json).expect_err("version mismatch");
        assert!(matches!(err, ModuleSerdeError::VersionMismatch { .. }));
    }
}
