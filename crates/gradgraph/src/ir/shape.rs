//! Shape inference for the operator set.

use thiserror::Error;

use crate::ir::spec::{Operation, Shape, TensorSpec, ValueType};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("{op} expects {expected} operands, got {found}")]
    Arity {
        op: String,
        expected: usize,
        found: usize,
    },
    #[error("{op} operand {index} must be a tensor")]
    TupleOperand { op: String, index: usize },
    #[error("shapes [{lhs}] and [{rhs}] cannot be broadcast together")]
    Incompatible { lhs: Shape, rhs: Shape },
    #[error("{op} mixes dtypes {lhs} and {rhs}")]
    DTypeMismatch {
        op: String,
        lhs: crate::ir::spec::DType,
        rhs: crate::ir::spec::DType,
    },
    #[error("{op}: {message}")]
    Invalid { op: String, message: String },
    #[error("{op} needs a declared tensor result type")]
    MissingDeclaredType { op: String },
}

impl ShapeError {
    fn invalid(op: &Operation, message: impl Into<String>) -> Self {
        ShapeError::Invalid {
            op: op.name().to_string(),
            message: message.into(),
        }
    }
}

/// Numpy-style broadcast of two shapes, aligned from the trailing axis.
pub fn broadcast_shapes(lhs: &Shape, rhs: &Shape) -> Result<Shape, ShapeError> {
    let rank = lhs.rank().max(rhs.rank());
    let mut dims = vec![0usize; rank];
    for axis in 0..rank {
        let l = dim_from_end(lhs, rank - 1 - axis);
        let r = dim_from_end(rhs, rank - 1 - axis);
        dims[axis] = match (l, r) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => {
                return Err(ShapeError::Incompatible {
                    lhs: lhs.clone(),
                    rhs: rhs.clone(),
                })
            }
        };
    }
    Ok(Shape::new(dims))
}

fn dim_from_end(shape: &Shape, offset: usize) -> usize {
    let rank = shape.rank();
    if offset < rank {
        shape.dims()[rank - 1 - offset]
    } else {
        1
    }
}

/// Infers the result type of `op` applied to operands of the given types.
///
/// `declared` is consulted only by operators whose result cannot be derived from
/// their operands (`ones`, `zeros`, custom calls).
pub fn infer_call_type(
    op: &Operation,
    operands: &[ValueType],
    declared: Option<&ValueType>,
) -> Result<ValueType, ShapeError> {
    let tensors = operands
        .iter()
        .enumerate()
        .map(|(index, ty)| {
            ty.as_tensor().ok_or_else(|| ShapeError::TupleOperand {
                op: op.name().to_string(),
                index,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let spec = match op {
        Operation::Add | Operation::Subtract | Operation::Multiply | Operation::Divide => {
            let [lhs, rhs] = expect_arity::<2>(op, &tensors)?;
            same_dtype(op, lhs, rhs)?;
            TensorSpec::new(lhs.dtype, broadcast_shapes(&lhs.shape, &rhs.shape)?)
        }
        Operation::Negative
        | Operation::Exp
        | Operation::Log
        | Operation::OnesLike
        | Operation::ZerosLike => {
            let [input] = expect_arity::<1>(op, &tensors)?;
            input.clone()
        }
        Operation::Matmul => {
            let [lhs, rhs] = expect_arity::<2>(op, &tensors)?;
            same_dtype(op, lhs, rhs)?;
            let (l, r) = (lhs.shape.dims(), rhs.shape.dims());
            if l.len() != 2 || r.len() != 2 {
                return Err(ShapeError::invalid(op, "operands must be rank 2"));
            }
            if l[1] != r[0] {
                return Err(ShapeError::invalid(
                    op,
                    format!("contracting dims differ: {} vs {}", l[1], r[0]),
                ));
            }
            TensorSpec::new(lhs.dtype, Shape::new(vec![l[0], r[1]]))
        }
        Operation::Transpose(spec) => {
            let [input] = expect_arity::<1>(op, &tensors)?;
            let dims = input.shape.dims();
            if !is_permutation(&spec.perm, dims.len()) {
                return Err(ShapeError::invalid(
                    op,
                    format!("{:?} is not a permutation of rank {}", spec.perm, dims.len()),
                ));
            }
            let permuted = spec.perm.iter().map(|&axis| dims[axis]).collect::<Vec<_>>();
            TensorSpec::new(input.dtype, Shape::new(permuted))
        }
        Operation::Reshape(spec) => {
            let [input] = expect_arity::<1>(op, &tensors)?;
            let target = Shape::new(spec.shape.clone());
            if target.element_count() != input.element_count() {
                return Err(ShapeError::invalid(
                    op,
                    format!(
                        "cannot reshape {} elements into [{}]",
                        input.element_count(),
                        target
                    ),
                ));
            }
            TensorSpec::new(input.dtype, target)
        }
        Operation::Sum(spec) => {
            let [input] = expect_arity::<1>(op, &tensors)?;
            let rank = input.shape.rank();
            let axes = match &spec.axes {
                Some(axes) => axes.clone(),
                None => (0..rank).collect(),
            };
            let mut reduced = vec![false; rank];
            for &axis in &axes {
                if axis >= rank || reduced[axis] {
                    return Err(ShapeError::invalid(
                        op,
                        format!("invalid reduction axes {axes:?} for rank {rank}"),
                    ));
                }
                reduced[axis] = true;
            }
            let dims = input
                .shape
                .dims()
                .iter()
                .zip(reduced.iter())
                .filter_map(|(&dim, &is_reduced)| match (is_reduced, spec.keepdims) {
                    (false, _) => Some(dim),
                    (true, true) => Some(1),
                    (true, false) => None,
                })
                .collect::<Vec<_>>();
            TensorSpec::new(input.dtype, Shape::new(dims))
        }
        Operation::Softmax(spec) => {
            let [input] = expect_arity::<1>(op, &tensors)?;
            if spec.axis >= input.shape.rank() {
                return Err(ShapeError::invalid(
                    op,
                    format!("axis {} out of range for rank {}", spec.axis, input.shape.rank()),
                ));
            }
            input.clone()
        }
        Operation::SoftmaxCrossEntropy => {
            let [logits, labels] = expect_arity::<2>(op, &tensors)?;
            same_dtype(op, logits, labels)?;
            if logits.shape != labels.shape {
                return Err(ShapeError::invalid(
                    op,
                    format!("logits [{}] and labels [{}] differ", logits.shape, labels.shape),
                ));
            }
            if logits.shape.rank() == 0 {
                return Err(ShapeError::invalid(op, "logits must have a class axis"));
            }
            TensorSpec::scalar(logits.dtype)
        }
        Operation::Ones | Operation::Zeros => {
            expect_arity::<0>(op, &tensors)?;
            declared_tensor(op, declared)?.clone()
        }
        Operation::CollapseSumLike => {
            let [data, target] = expect_arity::<2>(op, &tensors)?;
            same_dtype(op, data, target)?;
            let widened = broadcast_shapes(&data.shape, &target.shape)?;
            if widened != data.shape {
                return Err(ShapeError::invalid(
                    op,
                    format!("[{}] does not broadcast to [{}]", target.shape, data.shape),
                ));
            }
            target.clone()
        }
        Operation::CustomCall(_) => {
            return declared
                .cloned()
                .ok_or_else(|| ShapeError::MissingDeclaredType {
                    op: op.name().to_string(),
                })
        }
    };
    Ok(ValueType::Tensor(spec))
}

fn expect_arity<'a, const N: usize>(
    op: &Operation,
    tensors: &[&'a TensorSpec],
) -> Result<[&'a TensorSpec; N], ShapeError> {
    <[&TensorSpec; N]>::try_from(tensors).map_err(|_| ShapeError::Arity {
        op: op.name().to_string(),
        expected: N,
        found: tensors.len(),
    })
}

fn same_dtype(op: &Operation, lhs: &TensorSpec, rhs: &TensorSpec) -> Result<(), ShapeError> {
    if lhs.dtype != rhs.dtype {
        return Err(ShapeError::DTypeMismatch {
            op: op.name().to_string(),
            lhs: lhs.dtype,
            rhs: rhs.dtype,
        });
    }
    Ok(())
}

fn declared_tensor<'a>(
    op: &Operation,
    declared: Option<&'a ValueType>,
) -> Result<&'a TensorSpec, ShapeError> {
    declared
        .and_then(ValueType::as_tensor)
        .ok_or_else(|| ShapeError::MissingDeclaredType {
            op: op.name().to_string(),
        })
}

fn is_permutation(perm: &[usize], rank: usize) -> bool {
    if perm.len() != rank {
        return false;
    }
    let mut seen = vec![false; rank];
    for &axis in perm {
        if axis >= rank || seen[axis] {
            return false;
        }
        seen[axis] = true;
    }
    true
}

/// Inverse of a permutation: `inverse[perm[i]] == i`.
pub fn inverse_permutation(perm: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0usize; perm.len()];
    for (index, &axis) in perm.iter().enumerate() {
        inverse[axis] = index;
    }
    inverse
}
