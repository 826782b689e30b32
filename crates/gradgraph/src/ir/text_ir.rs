use std::collections::HashMap;

use thiserror::Error;

use crate::ir::spec::{
    Binding, CustomCallSpec, DType, Expr, Function, Module, Operand, Operation, Param, Region,
    ReshapeSpec, ReturnExpr, Shape, SoftmaxSpec, SumSpec, TensorLiteral, TensorSpec,
    TransposeSpec, TupleField, ValueId, ValueType,
};

/// Errors raised while parsing the text form of the graph IR.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TextIrError {
    #[error("{0}")]
    Message(String),
}

impl TextIrError {
    fn new(msg: impl Into<String>) -> Self {
        TextIrError::Message(msg.into())
    }

    fn in_function(self, function: &str) -> Self {
        match self {
            TextIrError::Message(msg) => TextIrError::new(format!("in @{function}: {msg}")),
        }
    }
}

/// Parses one or more functions written in the compact MLIR-like syntax.
///
/// # Example
/// ```
/// use gradgraph::ir::text_ir::parse_module;
///
/// let module = parse_module(r#"
/// func @loss(%x: tensor<f32, 2x2>) -> tensor<f32> {
///   %sq = multiply(%x, %x) -> tensor<f32, 2x2>
///   %s = sum(%sq) -> tensor<f32>
///   return %s
/// }
/// "#).expect("valid module");
/// assert_eq!(module.names(), vec!["loss"]);
/// assert_eq!(module.functions[0].regions[0].bindings.len(), 2);
/// ```
pub fn parse_module(src: &str) -> Result<Module, TextIrError> {
    parse_module_with_symbols(src).map(|parsed| parsed.module)
}

/// Parses source holding exactly one function.
pub fn parse_function(src: &str) -> Result<Function, TextIrError> {
    let mut module = parse_module(src)?;
    if module.functions.len() != 1 {
        return Err(TextIrError::new(format!(
            "expected exactly one function, found {}",
            module.functions.len()
        )));
    }
    module
        .functions
        .pop()
        .ok_or_else(|| TextIrError::new("input is empty"))
}

/// Parses a module and keeps the per-function mapping from value names to ids.
pub fn parse_module_with_symbols(src: &str) -> Result<ParsedModule, TextIrError> {
    let mut module = Module::new();
    let mut value_names = HashMap::new();
    for chunk in split_functions(src)? {
        let parsed = FunctionParser::new(chunk).parse()?;
        if module.contains(&parsed.function.name) {
            return Err(TextIrError::new(format!(
                "function @{} is defined more than once",
                parsed.function.name
            )));
        }
        value_names.insert(parsed.function.name.clone(), parsed.value_names);
        module.insert(parsed.function);
    }
    Ok(ParsedModule {
        module,
        value_names,
    })
}

/// Module paired with the mapping from textual value names to ids, per function.
#[derive(Debug, Clone)]
pub struct ParsedModule {
    pub module: Module,
    pub value_names: HashMap<String, HashMap<String, ValueId>>,
}

impl ParsedModule {
    pub fn value(&self, function: &str, name: &str) -> Option<ValueId> {
        self.value_names.get(function)?.get(name).copied()
    }
}

fn split_functions(src: &str) -> Result<Vec<&str>, TextIrError> {
    let mut chunks = Vec::new();
    let mut rest = src;
    loop {
        let trimmed = rest.trim_start();
        if trimmed.is_empty() {
            break;
        }
        let offset = rest.len() - trimmed.len();
        let open = trimmed
            .find('{')
            .ok_or_else(|| TextIrError::new("missing `{` to start function body"))?;
        let close = find_matching(trimmed, open, '{', '}')
            .ok_or_else(|| TextIrError::new("missing `}` to end function body"))?;
        chunks.push(&rest[offset..offset + close + 1]);
        rest = &trimmed[close + 1..];
    }
    if chunks.is_empty() {
        return Err(TextIrError::new("input is empty"));
    }
    Ok(chunks)
}

struct ParsedFunction {
    function: Function,
    value_names: HashMap<String, ValueId>,
}

struct FunctionParser<'a> {
    source: &'a str,
    next_value_id: u32,
    value_map: HashMap<String, ValueId>,
    value_types: HashMap<ValueId, ValueType>,
}

impl<'a> FunctionParser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            next_value_id: 0,
            value_map: HashMap::new(),
            value_types: HashMap::new(),
        }
    }

    fn parse(mut self) -> Result<ParsedFunction, TextIrError> {
        let trimmed = self.source.trim();
        let header_end = trimmed
            .find('{')
            .ok_or_else(|| TextIrError::new("missing `{` to start function body"))?;
        let header = trimmed[..header_end].trim();
        let body_end = trimmed
            .rfind('}')
            .ok_or_else(|| TextIrError::new("missing `}` to end function body"))?;
        let body = trimmed[header_end + 1..body_end].trim();

        let (name, params, result_ty) = parse_function_header(header)?;
        let params = params
            .into_iter()
            .map(|Parameter { name, ty }| {
                let ty = parse_type(&ty)?;
                let id = self.define(&name, ty.clone())?;
                Ok(Param { id, name, ty })
            })
            .collect::<Result<Vec<_>, TextIrError>>()
            .map_err(|err| err.in_function(&name))?;

        let (regions, ret) = self.parse_body(body).map_err(|err| err.in_function(&name))?;
        let function = Function {
            name: name.clone(),
            params,
            regions,
            ret,
        };

        let expected = parse_type(&result_ty).map_err(|err| err.in_function(&name))?;
        if function.return_type().as_ref() != Some(&expected) {
            return Err(TextIrError::new(
                "declared result type does not match returned value type",
            )
            .in_function(&name));
        }

        Ok(ParsedFunction {
            function,
            value_names: self.value_map,
        })
    }

    fn parse_body(&mut self, body: &str) -> Result<(Vec<Region>, ReturnExpr), TextIrError> {
        let mut regions: Vec<Region> = Vec::new();
        let mut declared_outputs: Vec<Option<Vec<ValueId>>> = Vec::new();
        let mut current: Option<(Region, Option<Vec<ValueId>>)> = None;
        let mut implicit: Option<(Region, Option<Vec<ValueId>>)> = None;
        let mut ret: Option<ReturnExpr> = None;

        for line in body.lines() {
            let statement = strip_comment(line).trim();
            if statement.is_empty() {
                continue;
            }
            if ret.is_some() {
                return Err(TextIrError::new("statements after `return` are not allowed"));
            }
            if statement == "region {" || statement == "region{" {
                if current.is_some() {
                    return Err(TextIrError::new("regions cannot be nested"));
                }
                if implicit.is_some() {
                    return Err(TextIrError::new(
                        "bindings outside `region { ... }` cannot be mixed with explicit regions",
                    ));
                }
                current = Some((Region::default(), None));
                continue;
            }
            if statement == "}" {
                let (region, outputs) = current
                    .take()
                    .ok_or_else(|| TextIrError::new("unmatched `}` in function body"))?;
                regions.push(region);
                declared_outputs.push(outputs);
                continue;
            }
            if let Some(rest) = statement.strip_prefix("return") {
                if current.is_some() {
                    return Err(TextIrError::new("`return` inside a region"));
                }
                let rest = rest.trim().trim_end_matches(';');
                if rest.is_empty() {
                    return Err(TextIrError::new("`return` must reference a value"));
                }
                ret = Some(self.parse_return(rest)?);
                continue;
            }

            let slot = match current.as_mut() {
                Some(slot) => slot,
                None => {
                    if !regions.is_empty() {
                        return Err(TextIrError::new(
                            "bindings outside `region { ... }` cannot be mixed with explicit regions",
                        ));
                    }
                    implicit.get_or_insert_with(|| (Region::default(), None))
                }
            };
            if let Some(rest) = statement.strip_prefix("output ") {
                if slot.1.is_some() {
                    return Err(TextIrError::new("region declares `output` more than once"));
                }
                let outputs = split_top_level(rest.trim(), ',')
                    .into_iter()
                    .map(|name| self.lookup(&normalize_value_name(name)))
                    .collect::<Result<Vec<_>, _>>()?;
                slot.1 = Some(outputs);
                continue;
            }
            let binding = self.parse_statement(statement)?;
            slot.0.bindings.push(binding);
        }

        if current.is_some() {
            return Err(TextIrError::new("unterminated `region {`"));
        }
        let ret = ret.ok_or_else(|| {
            TextIrError::new("function body must end with a `return` statement")
        })?;
        if let Some((region, outputs)) = implicit {
            regions.push(region);
            declared_outputs.push(outputs);
        }
        if regions.is_empty() {
            regions.push(Region::default());
            declared_outputs.push(None);
        }

        let returned = ret.values();
        for (region, outputs) in regions.iter_mut().zip(declared_outputs) {
            region.outputs = match outputs {
                Some(outputs) => outputs,
                None => {
                    let mut defaults = Vec::new();
                    for id in &returned {
                        let bound_here = region.bindings.iter().any(|b| b.id == *id);
                        if bound_here && !defaults.contains(id) {
                            defaults.push(*id);
                        }
                    }
                    defaults
                }
            };
        }
        Ok((regions, ret))
    }

    fn parse_return(&self, src: &str) -> Result<ReturnExpr, TextIrError> {
        let src = src.trim();
        if src.starts_with('(') {
            let close = find_matching(src, 0, '(', ')')
                .ok_or_else(|| TextIrError::new("unmatched `(` in return"))?;
            if close != src.len() - 1 {
                return Err(TextIrError::new("trailing tokens after return tuple"));
            }
            let elements = split_top_level(&src[1..close], ',')
                .into_iter()
                .map(|element| self.parse_return(element))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(ReturnExpr::Tuple(elements));
        }
        Ok(ReturnExpr::Value(self.lookup(&normalize_value_name(src))?))
    }

    fn parse_statement(&mut self, statement: &str) -> Result<Binding, TextIrError> {
        let (result_name_raw, rest) = statement
            .split_once('=')
            .ok_or_else(|| TextIrError::new("statements must be of the form `%result = ...`"))?;
        let result_name = normalize_value_name(result_name_raw.trim());
        if result_name.is_empty() {
            return Err(TextIrError::new("result identifier cannot be empty"));
        }
        let (rhs, type_section) = rest
            .rsplit_once("->")
            .ok_or_else(|| TextIrError::new("bindings must specify result type with `->`"))?;
        let ty = parse_type(type_section)?;
        let expr = self.parse_rhs(rhs.trim(), &ty)?;
        let id = self.define(&result_name, ty.clone())?;
        Ok(Binding {
            id,
            name: result_name,
            expr,
            ty,
        })
    }

    fn parse_rhs(&self, rhs: &str, result_type: &ValueType) -> Result<Expr, TextIrError> {
        let first = rhs
            .chars()
            .next()
            .ok_or_else(|| TextIrError::new("binding right-hand side is empty"))?;
        if first == '%' || first == '-' || first.is_ascii_digit() {
            return match parse_operand_expr(rhs)? {
                OperandExpr::TupleElement { tuple, index } => Ok(Expr::TupleGet {
                    tuple: self.lookup(&tuple)?,
                    index,
                }),
                other => Ok(Expr::Use(self.convert_operand(other)?)),
            };
        }

        let (op_name, remainder) = parse_op_name(rhs)?;
        if op_name == "tuple" {
            let remainder = remainder.trim();
            if !remainder.starts_with('(') {
                return Err(TextIrError::new("`tuple` expects a parenthesized field list"));
            }
            return Ok(Expr::Tuple(self.parse_fields(remainder)?));
        }

        let (operand_tokens, attributes) = parse_operands_and_attributes(remainder)?;
        let operands = operand_tokens
            .iter()
            .map(|token| parse_operand_expr(token).and_then(|expr| self.convert_operand(expr)))
            .collect::<Result<Vec<_>, _>>()?;
        let operation = self.build_operation(&op_name, &operands, result_type, &attributes)?;
        Ok(Expr::Call {
            op: operation,
            operands,
        })
    }

    fn parse_fields(&self, src: &str) -> Result<Vec<TupleField>, TextIrError> {
        let close = find_matching(src, 0, '(', ')')
            .ok_or_else(|| TextIrError::new("unmatched `(` in tuple"))?;
        if close != src.len() - 1 {
            return Err(TextIrError::new("trailing tokens after tuple fields"));
        }
        split_top_level(&src[1..close], ',')
            .into_iter()
            .map(|field| {
                if field.starts_with('(') {
                    Ok(TupleField::Tuple(self.parse_fields(field)?))
                } else {
                    let operand = self.convert_operand(parse_operand_expr(field)?)?;
                    Ok(TupleField::Operand(operand))
                }
            })
            .collect()
    }

    fn build_operation(
        &self,
        name: &str,
        operands: &[Operand],
        result_type: &ValueType,
        attrs: &[AttributeExpr],
    ) -> Result<Operation, TextIrError> {
        let attr_map: HashMap<&str, &str> = attrs
            .iter()
            .map(|attr| (attr.name.as_str(), attr.value.as_str()))
            .collect();
        let first_rank = || -> Result<usize, TextIrError> {
            let operand = operands
                .first()
                .ok_or_else(|| TextIrError::new(format!("{name} expects an operand")))?;
            self.operand_type(operand)?
                .as_tensor()
                .map(|spec| spec.shape.rank())
                .ok_or_else(|| TextIrError::new(format!("{name} operand must be a tensor")))
        };
        let op = match name {
            "add" => Operation::Add,
            "subtract" => Operation::Subtract,
            "multiply" => Operation::Multiply,
            "divide" => Operation::Divide,
            "negative" => Operation::Negative,
            "exp" => Operation::Exp,
            "log" => Operation::Log,
            "matmul" => Operation::Matmul,
            "softmax_cross_entropy" => Operation::SoftmaxCrossEntropy,
            "ones" => Operation::Ones,
            "zeros" => Operation::Zeros,
            "ones_like" => Operation::OnesLike,
            "zeros_like" => Operation::ZerosLike,
            "collapse_sum_like" => Operation::CollapseSumLike,
            "transpose" => {
                let perm = match attr_map.get("perm") {
                    Some(value) => parse_usize_list(value)?,
                    None => (0..first_rank()?).rev().collect(),
                };
                Operation::Transpose(TransposeSpec { perm })
            }
            "reshape" => {
                let shape = match attr_map.get("shape") {
                    Some(value) => parse_usize_list(value)?,
                    None => result_type
                        .as_tensor()
                        .map(|spec| spec.shape.dims().to_vec())
                        .ok_or_else(|| TextIrError::new("reshape result must be a tensor"))?,
                };
                Operation::Reshape(ReshapeSpec { shape })
            }
            "sum" => {
                let axes = attr_map
                    .get("axes")
                    .map(|value| parse_usize_list(value))
                    .transpose()?;
                let keepdims = attr_map
                    .get("keepdims")
                    .map(|value| parse_bool(value))
                    .transpose()?
                    .unwrap_or(false);
                Operation::Sum(SumSpec { axes, keepdims })
            }
            "softmax" => {
                let axis = match attr_map.get("axis") {
                    Some(value) => parse_usize(value)?,
                    None => first_rank()?.checked_sub(1).ok_or_else(|| {
                        TextIrError::new("softmax needs an operand of rank >= 1")
                    })?,
                };
                Operation::Softmax(SoftmaxSpec { axis })
            }
            "custom_call" => {
                let target = attr_map
                    .get("target")
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
                    .ok_or_else(|| TextIrError::new("custom_call requires `target[...]`"))?;
                Operation::CustomCall(CustomCallSpec { target })
            }
            other => {
                return Err(TextIrError::new(format!(
                    "unsupported operation `{other}` in graph text"
                )))
            }
        };
        Ok(op)
    }

    fn define(&mut self, name: &str, ty: ValueType) -> Result<ValueId, TextIrError> {
        if name.is_empty() {
            return Err(TextIrError::new("value name cannot be empty"));
        }
        if self.value_map.contains_key(name) {
            return Err(TextIrError::new(format!(
                "value `%{name}` is defined more than once"
            )));
        }
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        self.value_map.insert(name.to_string(), id);
        self.value_types.insert(id, ty);
        Ok(id)
    }

    fn lookup(&self, name: &str) -> Result<ValueId, TextIrError> {
        self.value_map
            .get(name)
            .copied()
            .ok_or_else(|| TextIrError::new(format!("unknown value `%{name}`")))
    }

    fn operand_type(&self, operand: &Operand) -> Result<ValueType, TextIrError> {
        match operand {
            Operand::Value(id) => self.value_types.get(id).cloned(),
            Operand::TupleElement { tuple, index } => self
                .value_types
                .get(tuple)
                .and_then(|ty| ty.tuple_element(*index))
                .cloned(),
            Operand::Literal(literal) => Some(ValueType::Tensor(literal.spec.clone())),
        }
        .ok_or_else(|| TextIrError::new("operand type is unknown"))
    }

    fn convert_operand(&self, expr: OperandExpr) -> Result<Operand, TextIrError> {
        match expr {
            OperandExpr::Value(name) => self.lookup(&name).map(Operand::Value),
            OperandExpr::TupleElement { tuple, index } => self
                .lookup(&tuple)
                .map(|id| Operand::TupleElement { tuple: id, index }),
            OperandExpr::Float(value) => Ok(Operand::Literal(TensorLiteral::scalar_f32(value))),
        }
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find("//") {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn parse_function_header(header: &str) -> Result<(String, Vec<Parameter>, String), TextIrError> {
    let header = header.trim();
    let header = header
        .strip_prefix("func")
        .or_else(|| header.strip_prefix("function"))
        .ok_or_else(|| TextIrError::new("function header must start with `func`"))?
        .trim_start();
    let open_paren = header
        .find('(')
        .ok_or_else(|| TextIrError::new("missing `(` in function header"))?;
    let close_paren = find_matching(header, open_paren, '(', ')')
        .ok_or_else(|| TextIrError::new("missing `)` to close parameter list"))?;

    let name_section = header[..open_paren].trim();
    let name = name_section
        .strip_prefix('@')
        .unwrap_or(name_section)
        .trim();
    if name.is_empty() {
        return Err(TextIrError::new("function name cannot be empty"));
    }
    let params = parse_parameters(&header[open_paren + 1..close_paren])?;

    let result_ty = header[close_paren + 1..]
        .trim()
        .strip_prefix("->")
        .ok_or_else(|| TextIrError::new("missing `->` and return type in header"))?
        .trim()
        .to_string();

    Ok((name.to_string(), params, result_ty))
}

fn parse_parameters(params: &str) -> Result<Vec<Parameter>, TextIrError> {
    let params = params.trim();
    if params.is_empty() {
        return Ok(Vec::new());
    }
    split_top_level(params, ',')
        .into_iter()
        .map(|raw| {
            let (name, ty) = raw
                .split_once(':')
                .ok_or_else(|| TextIrError::new("parameter must be `name: type`"))?;
            let name = normalize_value_name(name.trim());
            if name.is_empty() {
                return Err(TextIrError::new("parameter name cannot be empty"));
            }
            let ty = ty.trim();
            if ty.is_empty() {
                return Err(TextIrError::new("parameter type cannot be empty"));
            }
            Ok(Parameter {
                name,
                ty: ty.to_string(),
            })
        })
        .collect()
}

fn normalize_value_name(name: &str) -> String {
    name.trim().trim_start_matches('%').to_string()
}

struct Parameter {
    name: String,
    ty: String,
}

/// Parses `tensor<dtype, AxBxC>`, `tensor<dtype>` for scalars, or a parenthesized
/// tuple of types.
pub fn parse_type(src: &str) -> Result<ValueType, TextIrError> {
    let trimmed = src.trim();
    if trimmed.starts_with('(') {
        let close = find_matching(trimmed, 0, '(', ')')
            .ok_or_else(|| TextIrError::new("unmatched `(` in tuple type"))?;
        if close != trimmed.len() - 1 {
            return Err(TextIrError::new(format!("malformed tuple type `{trimmed}`")));
        }
        let inner = trimmed[1..close].trim();
        if inner.is_empty() {
            return Ok(ValueType::Tuple(Vec::new()));
        }
        let elements = split_top_level(inner, ',')
            .into_iter()
            .map(parse_type)
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(ValueType::Tuple(elements));
    }
    if let Some(body) = trimmed
        .strip_prefix("tensor<")
        .and_then(|s| s.strip_suffix('>'))
    {
        return parse_tensor_type(body);
    }
    Err(TextIrError::new(format!(
        "unsupported type `{trimmed}`; expected `tensor<...>` or a tuple"
    )))
}

fn parse_tensor_type(body: &str) -> Result<ValueType, TextIrError> {
    let mut parts = body.split(',');
    let dtype_str = parts
        .next()
        .ok_or_else(|| TextIrError::new("tensor type must specify a dtype"))?
        .trim();
    let dtype = parse_dtype(dtype_str)?;
    let dims_str = parts.next().unwrap_or("").trim();
    let dims = if dims_str.is_empty() {
        Vec::new()
    } else {
        parse_dimensions(dims_str)?
    };
    if parts.next().is_some() {
        return Err(TextIrError::new(
            "tensor type accepts only `tensor<dtype, dims>` form",
        ));
    }
    Ok(ValueType::Tensor(TensorSpec::new(dtype, Shape::new(dims))))
}

fn parse_dtype(src: &str) -> Result<DType, TextIrError> {
    match src.trim().to_ascii_lowercase().as_str() {
        "i1" => Ok(DType::I1),
        "si32" => Ok(DType::Si32),
        "si64" => Ok(DType::Si64),
        "f16" => Ok(DType::F16),
        "bf16" => Ok(DType::Bf16),
        "f32" => Ok(DType::F32),
        "f64" => Ok(DType::F64),
        other => Err(TextIrError::new(format!("unsupported dtype `{other}`"))),
    }
}

fn parse_dimensions(src: &str) -> Result<Vec<usize>, TextIrError> {
    src.split('x')
        .map(|dim| {
            let dim = dim.trim();
            if dim.is_empty() {
                return Err(TextIrError::new("dimension sizes cannot be empty"));
            }
            dim.parse::<usize>()
                .map_err(|_| TextIrError::new(format!("invalid dimension `{dim}`")))
        })
        .collect()
}

fn split_top_level(input: &str, delimiter: char) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (idx, ch) in input.char_indices() {
        match ch {
            '<' | '(' | '[' => depth += 1,
            '>' | ')' | ']' => {
                depth = depth.saturating_sub(1);
            }
            c if c == delimiter && depth == 0 => {
                if start != idx {
                    pieces.push(input[start..idx].trim());
                }
                start = idx + c.len_utf8();
            }
            _ => {}
        }
    }
    if start < input.len() && !input[start..].trim().is_empty() {
        pieces.push(input[start..].trim());
    }
    pieces
}

fn parse_op_name(src: &str) -> Result<(String, &str), TextIrError> {
    let trimmed = src.trim_start();
    if trimmed.is_empty() {
        return Err(TextIrError::new("operation name is missing"));
    }
    let mut end = trimmed.len();
    for (idx, ch) in trimmed.char_indices() {
        if ch.is_whitespace() || ch == '(' || ch == '%' {
            end = idx;
            break;
        }
    }
    let name = trimmed[..end].trim();
    if name.is_empty() {
        return Err(TextIrError::new("operation name cannot be empty"));
    }
    Ok((name.to_string(), trimmed[end..].trim_start()))
}

#[derive(Debug, Clone)]
struct AttributeExpr {
    name: String,
    value: String,
}

fn parse_operands_and_attributes(
    section: &str,
) -> Result<(Vec<String>, Vec<AttributeExpr>), TextIrError> {
    let mut operands = Vec::new();
    let mut attrs = Vec::new();
    let chars = section.trim();
    let bytes = chars.as_bytes();
    let len = bytes.len();
    let mut idx = 0usize;

    while idx < len {
        while idx < len && bytes[idx].is_ascii_whitespace() {
            idx += 1;
        }
        if idx >= len {
            break;
        }
        match bytes[idx] {
            b'(' => {
                let end = find_matching(chars, idx, '(', ')')
                    .ok_or_else(|| TextIrError::new("unmatched `(` in operand list"))?;
                for token in split_top_level(&chars[idx + 1..end], ',') {
                    if !token.is_empty() {
                        operands.push(token.to_string());
                    }
                }
                idx = end + 1;
            }
            b',' => {
                idx += 1;
            }
            _ => {
                let attr_start = idx;
                while idx < len && (bytes[idx].is_ascii_alphabetic() || bytes[idx] == b'_') {
                    idx += 1;
                }
                if idx >= len || bytes[idx] != b'[' {
                    return Err(TextIrError::new(format!(
                        "unexpected token starting at `{}`",
                        &chars[attr_start..]
                    )));
                }
                let name = chars[attr_start..idx].trim().to_string();
                let end = find_matching(chars, idx, '[', ']')
                    .ok_or_else(|| TextIrError::new("unmatched `[` in attribute"))?;
                let value = chars[idx + 1..end].trim().to_string();
                attrs.push(AttributeExpr { name, value });
                idx = end + 1;
            }
        }
    }

    Ok((operands, attrs))
}

fn find_matching(src: &str, start: usize, open: char, close: char) -> Option<usize> {
    let mut depth = 0isize;
    let bytes = src.as_bytes();
    for (idx, &byte) in bytes.iter().enumerate().skip(start) {
        if byte == open as u8 {
            depth += 1;
        } else if byte == close as u8 {
            depth -= 1;
            if depth == 0 {
                return Some(idx);
            }
        }
    }
    None
}

enum OperandExpr {
    Value(String),
    TupleElement { tuple: String, index: usize },
    Float(f32),
}

fn parse_operand_expr(src: &str) -> Result<OperandExpr, TextIrError> {
    let trimmed = src.trim();
    if trimmed.is_empty() {
        return Err(TextIrError::new("operand cannot be empty"));
    }
    let Some(without_percent) = trimmed.strip_prefix('%') else {
        return trimmed
            .parse::<f32>()
            .map(OperandExpr::Float)
            .map_err(|_| TextIrError::new(format!("invalid operand `{trimmed}`")));
    };
    if without_percent.is_empty() {
        return Err(TextIrError::new("operand name cannot be empty"));
    }
    if let Some(open) = without_percent.find('[') {
        let close = without_percent
            .rfind(']')
            .ok_or_else(|| TextIrError::new("tuple element operand missing `]`"))?;
        if close <= open || close != without_percent.len() - 1 {
            return Err(TextIrError::new("tuple element operand malformed"));
        }
        let name = without_percent[..open].trim();
        if name.is_empty() {
            return Err(TextIrError::new("tuple element base value cannot be empty"));
        }
        let index_str = without_percent[open + 1..close].trim();
        let index = index_str
            .parse::<usize>()
            .map_err(|_| TextIrError::new(format!("invalid tuple index `{index_str}`")))?;
        Ok(OperandExpr::TupleElement {
            tuple: name.to_string(),
            index,
        })
    } else {
        Ok(OperandExpr::Value(without_percent.trim().to_string()))
    }
}

fn parse_usize_list(value: &str) -> Result<Vec<usize>, TextIrError> {
    let inner = value.trim();
    if inner.is_empty() {
        return Ok(Vec::new());
    }
    inner.split(',').map(parse_usize).collect()
}

fn parse_usize(token: &str) -> Result<usize, TextIrError> {
    let tok = token.trim();
    if tok.is_empty() {
        return Err(TextIrError::new("empty entry in integer list"));
    }
    tok.parse::<usize>()
        .map_err(|_| TextIrError::new(format!("invalid integer `{tok}`")))
}

fn parse_bool(value: &str) -> Result<bool, TextIrError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(TextIrError::new(format!(
            "invalid boolean literal `{other}`"
        ))),
    }
}

/// Parses a graph module from text, panicking on malformed input. Intended for tests.
#[macro_export]
macro_rules! graph_module {
    ($src:expr) => {{
        $crate::ir::text_ir::parse_module($src).expect("failed to parse graph module text")
    }};
}

/// Parses a single graph function from text, panicking on malformed input.
#[macro_export]
macro_rules! graph_function {
    ($src:expr) => {{
        $crate::ir::text_ir::parse_function($src).expect("failed to parse graph function text")
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_nested_fields_at_top_level() {
        assert_eq!(
            split_top_level("%a, (%b, %c), tensor<f32, 2>", ','),
            vec!["%a", "(%b, %c)", "tensor<f32, 2>"]
        );
    }

    #[test]
    fn scalar_literal_operands_parse() {
        let function = parse_function(
            r#"
func @scale(%x: tensor<f32, 3>) -> tensor<f32, 3> {
  %y = multiply(%x, 0.5) -> tensor<f32, 3>
  %z = add(%y, -1.0) -> tensor<f32, 3>
  return %z
}
"#,
        )
        .expect("parse");
        let Expr::Call { operands, .. } = &function.regions[0].bindings[1].expr else {
            panic!("expected call");
        };
        assert_eq!(
            operands[1],
            Operand::Literal(TensorLiteral::scalar_f32(-1.0))
        );
    }

    #[test]
    fn default_outputs_follow_return() {
        let function = parse_function(
            r#"
func @f(%x: tensor<f32, 2>) -> (tensor<f32, 2>, tensor<f32, 2>) {
  %a = exp(%x) -> tensor<f32, 2>
  %b = negative(%a) -> tensor<f32, 2>
  return (%b, %x)
}
"#,
        )
        .expect("parse");
        assert_eq!(function.regions[0].outputs, vec![ValueId(2)]);
    }

    #[test]
    fn explicit_regions_are_kept_apart() {
        let function = parse_function(
            r#"
func @two(%x: tensor<f32>) -> tensor<f32> {
  region {
    %a = exp(%x) -> tensor<f32>
    output %a
  }
  region {
    %b = log(%a) -> tensor<f32>
    output %b
  }
  return %b
}
"#,
        )
        .expect("parse");
        assert_eq!(function.regions.len(), 2);
        assert_eq!(function.regions[1].outputs, vec![ValueId(2)]);
    }

    #[test]
    fn rejects_duplicate_names_and_unknown_values() {
        let dup = parse_function(
            r#"
func @f(%x: tensor<f32>) -> tensor<f32> {
  %x = exp(%x) -> tensor<f32>
  return %x
}
"#,
        );
        assert!(dup.is_err());
        let unknown = parse_function(
            r#"
func @f(%x: tensor<f32>) -> tensor<f32> {
  %y = exp(%z) -> tensor<f32>
  return %y
}
"#,
        );
        assert_eq!(
            unknown.unwrap_err(),
            TextIrError::Message("in @f: unknown value `%z`".to_string())
        );
    }

    #[test]
    fn declared_result_type_is_checked() {
        let err = parse_function(
            r#"
func @f(%x: tensor<f32, 2>) -> tensor<f32> {
  return %x
}
"#,
        );
        assert!(err.is_err());
    }
}
