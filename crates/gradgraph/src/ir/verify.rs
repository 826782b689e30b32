//! Well-formedness checks for functions and modules.

use std::collections::HashSet;

use thiserror::Error;

use crate::ir::index::{DefId, FunctionIndexError, FunctionIndices};
use crate::ir::shape::{infer_call_type, ShapeError};
use crate::ir::spec::{
    Binding, Expr, Function, Module, Operand, ReturnExpr, TupleField, ValueId, ValueType,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Index(#[from] FunctionIndexError),
    #[error("value name `%{name}` is defined more than once")]
    DuplicateName { name: String },
    #[error("binding `%{binding}`: value %{} is not a tuple", .value.0)]
    NotATuple { binding: String, value: ValueId },
    #[error("binding `%{binding}`: tuple index {index} out of range for arity {arity}")]
    TupleIndex {
        binding: String,
        index: usize,
        arity: usize,
    },
    #[error("binding `%{binding}`: {source}")]
    Shape {
        binding: String,
        #[source]
        source: ShapeError,
    },
    #[error("binding `%{binding}` declares {declared} but its expression has type {inferred}")]
    TypeMismatch {
        binding: String,
        declared: ValueType,
        inferred: ValueType,
    },
    #[error("region {region} output %{} is not bound in that region or a parameter", .value.0)]
    OutputNotInRegion { region: usize, value: ValueId },
    #[error("return references %{} which is neither a region output nor a parameter", .value.0)]
    ReturnNotOutput { value: ValueId },
    #[error("function @{name} is defined more than once")]
    DuplicateFunction { name: String },
}

/// Checks single assignment, definition order, operand typing, declared result
/// types, region outputs, and that the return only reads outputs or parameters.
pub fn verify_function(function: &Function) -> Result<(), VerifyError> {
    let indices = FunctionIndices::build(function)?;

    let mut names = HashSet::new();
    let all_names = function
        .params
        .iter()
        .map(|param| param.name.as_str())
        .chain(function.bindings().map(|binding| binding.name.as_str()));
    for name in all_names {
        if !names.insert(name) {
            return Err(VerifyError::DuplicateName {
                name: name.to_string(),
            });
        }
    }

    for binding in function.bindings() {
        let inferred = infer_binding_type(&indices, binding)?;
        if inferred != binding.ty {
            return Err(VerifyError::TypeMismatch {
                binding: binding.name.clone(),
                declared: binding.ty.clone(),
                inferred,
            });
        }
    }

    let mut exposed: HashSet<ValueId> = function.params.iter().map(|param| param.id).collect();
    for (region_index, region) in function.regions.iter().enumerate() {
        for &output in &region.outputs {
            let in_region = match indices.def_of(output) {
                Some(DefId::Param { .. }) => true,
                Some(DefId::Binding(pos)) => pos.region == region_index,
                None => false,
            };
            if !in_region {
                return Err(VerifyError::OutputNotInRegion {
                    region: region_index,
                    value: output,
                });
            }
            exposed.insert(output);
        }
    }
    verify_return(&function.ret, &exposed)
}

/// Verifies every function and requires unique function names.
pub fn verify_module(module: &Module) -> Result<(), VerifyError> {
    let mut names = HashSet::new();
    for function in module.iter() {
        if !names.insert(function.name.as_str()) {
            return Err(VerifyError::DuplicateFunction {
                name: function.name.clone(),
            });
        }
        verify_function(function)?;
    }
    Ok(())
}

fn verify_return(ret: &ReturnExpr, exposed: &HashSet<ValueId>) -> Result<(), VerifyError> {
    match ret {
        ReturnExpr::Value(id) if exposed.contains(id) => Ok(()),
        ReturnExpr::Value(id) => Err(VerifyError::ReturnNotOutput { value: *id }),
        ReturnExpr::Tuple(elements) => elements
            .iter()
            .try_for_each(|element| verify_return(element, exposed)),
    }
}

fn infer_binding_type(
    indices: &FunctionIndices,
    binding: &Binding,
) -> Result<ValueType, VerifyError> {
    match &binding.expr {
        Expr::Call { op, operands } => {
            let operand_types = operands
                .iter()
                .map(|operand| operand_type(indices, binding, operand))
                .collect::<Result<Vec<_>, _>>()?;
            infer_call_type(op, &operand_types, Some(&binding.ty)).map_err(|source| {
                VerifyError::Shape {
                    binding: binding.name.clone(),
                    source,
                }
            })
        }
        Expr::Tuple(fields) => field_types(indices, binding, fields),
        Expr::TupleGet { tuple, index } => operand_type(
            indices,
            binding,
            &Operand::TupleElement {
                tuple: *tuple,
                index: *index,
            },
        ),
        Expr::Use(operand) => operand_type(indices, binding, operand),
    }
}

fn field_types(
    indices: &FunctionIndices,
    binding: &Binding,
    fields: &[TupleField],
) -> Result<ValueType, VerifyError> {
    fields
        .iter()
        .map(|field| match field {
            TupleField::Operand(operand) => operand_type(indices, binding, operand),
            TupleField::Tuple(nested) => field_types(indices, binding, nested),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(ValueType::Tuple)
}

fn operand_type(
    indices: &FunctionIndices,
    binding: &Binding,
    operand: &Operand,
) -> Result<ValueType, VerifyError> {
    if let Operand::TupleElement { tuple, index } = operand {
        let Some(ValueType::Tuple(elements)) = indices.type_of(*tuple) else {
            return Err(VerifyError::NotATuple {
                binding: binding.name.clone(),
                value: *tuple,
            });
        };
        if *index >= elements.len() {
            return Err(VerifyError::TupleIndex {
                binding: binding.name.clone(),
                index: *index,
                arity: elements.len(),
            });
        }
    }
    indices
        .operand_type(operand)
        .ok_or(VerifyError::Index(FunctionIndexError::MissingValueDefinition {
            value: operand.value().unwrap_or(ValueId(u32::MAX)),
        }))
}
