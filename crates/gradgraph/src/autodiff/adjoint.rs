//! Lazy adjoint expressions.
//!
//! Gradient rules build [`GradExpr`] trees instead of emitting bindings directly.
//! The backward sweep binds a tree only when the value it belongs to is visited,
//! so fan-in contributions are summed before anything is emitted.

use crate::ir::shape::{infer_call_type, ShapeError};
use crate::ir::spec::{
    Operand, Operation, ReshapeSpec, Shape, SoftmaxSpec, TensorSpec, TransposeSpec, ValueType,
};

/// Adjoint of a value, mirroring the value's tuple structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GradExpr {
    /// Tensor already available as an operand of the function being built.
    Leaf { operand: Operand, spec: TensorSpec },
    /// Operator application that has not been bound yet.
    Call {
        op: Operation,
        args: Vec<GradExpr>,
        spec: TensorSpec,
    },
    /// Known-zero tensor. Absorbed by addition.
    Zeros(TensorSpec),
    Tuple(Vec<GradExpr>),
}

impl GradExpr {
    pub fn leaf(operand: Operand, spec: TensorSpec) -> Self {
        GradExpr::Leaf { operand, spec }
    }

    /// Zero adjoint shaped like `ty`, nested for tuples.
    pub fn zeros_of(ty: &ValueType) -> Self {
        match ty {
            ValueType::Tensor(spec) => GradExpr::Zeros(spec.clone()),
            ValueType::Tuple(elements) => {
                GradExpr::Tuple(elements.iter().map(GradExpr::zeros_of).collect())
            }
        }
    }

    /// `ones` of the given spec, used to seed the sweep.
    pub fn ones(spec: TensorSpec) -> Self {
        GradExpr::Call {
            op: Operation::Ones,
            args: Vec::new(),
            spec,
        }
    }

    pub fn spec(&self) -> Option<&TensorSpec> {
        match self {
            GradExpr::Leaf { spec, .. } | GradExpr::Call { spec, .. } | GradExpr::Zeros(spec) => {
                Some(spec)
            }
            GradExpr::Tuple(_) => None,
        }
    }

    pub fn ty(&self) -> ValueType {
        match self {
            GradExpr::Tuple(elements) => {
                ValueType::Tuple(elements.iter().map(GradExpr::ty).collect())
            }
            GradExpr::Leaf { spec, .. } | GradExpr::Call { spec, .. } | GradExpr::Zeros(spec) => {
                ValueType::Tensor(spec.clone())
            }
        }
    }

    /// `true` for zeros and for tuples whose every component is zero.
    pub fn is_zero(&self) -> bool {
        match self {
            GradExpr::Zeros(_) => true,
            GradExpr::Tuple(elements) => elements.iter().all(GradExpr::is_zero),
            GradExpr::Leaf { .. } | GradExpr::Call { .. } => false,
        }
    }

    /// Applies `op`, inferring the result spec from the arguments.
    pub fn call(op: Operation, args: Vec<GradExpr>) -> Result<Self, ShapeError> {
        let arg_types = args.iter().map(GradExpr::ty).collect::<Vec<_>>();
        let ValueType::Tensor(spec) = infer_call_type(&op, &arg_types, None)? else {
            return Err(ShapeError::Invalid {
                op: op.name().to_string(),
                message: "gradient expressions must be tensors".to_string(),
            });
        };
        Ok(GradExpr::Call { op, args, spec })
    }

    /// Sums two adjoints. Zeros are absorbed and tuples add positionally.
    pub fn add(self, other: GradExpr) -> Result<Self, ShapeError> {
        match (self, other) {
            (GradExpr::Zeros(_), other) => Ok(other),
            (this, GradExpr::Zeros(_)) => Ok(this),
            (GradExpr::Tuple(lhs), GradExpr::Tuple(rhs)) => {
                if lhs.len() != rhs.len() {
                    return Err(ShapeError::Invalid {
                        op: "add".to_string(),
                        message: format!(
                            "tuple adjoints of arity {} and {} cannot be added",
                            lhs.len(),
                            rhs.len()
                        ),
                    });
                }
                lhs.into_iter()
                    .zip(rhs)
                    .map(|(l, r)| l.add(r))
                    .collect::<Result<Vec<_>, _>>()
                    .map(GradExpr::Tuple)
            }
            (lhs, rhs) => GradExpr::call(Operation::Add, vec![lhs, rhs]),
        }
    }

    /// Adds `partial` into component `index` of a tuple adjoint.
    pub fn add_at(self, index: usize, partial: GradExpr) -> Result<Self, ShapeError> {
        let GradExpr::Tuple(mut elements) = self else {
            return Err(ShapeError::Invalid {
                op: "tuple_get".to_string(),
                message: "adjoint placeholder is not a tuple".to_string(),
            });
        };
        let arity = elements.len();
        let slot = elements.get_mut(index).ok_or_else(|| ShapeError::Invalid {
            op: "tuple_get".to_string(),
            message: format!("index {index} out of range for arity {arity}"),
        })?;
        let current = std::mem::replace(slot, GradExpr::Tuple(Vec::new()));
        *slot = current.add(partial)?;
        Ok(GradExpr::Tuple(elements))
    }

    pub fn negative(self) -> Result<Self, ShapeError> {
        GradExpr::call(Operation::Negative, vec![self])
    }

    pub fn exp(self) -> Result<Self, ShapeError> {
        GradExpr::call(Operation::Exp, vec![self])
    }

    pub fn multiply(self, rhs: GradExpr) -> Result<Self, ShapeError> {
        GradExpr::call(Operation::Multiply, vec![self, rhs])
    }

    pub fn divide(self, rhs: GradExpr) -> Result<Self, ShapeError> {
        GradExpr::call(Operation::Divide, vec![self, rhs])
    }

    pub fn subtract(self, rhs: GradExpr) -> Result<Self, ShapeError> {
        GradExpr::call(Operation::Subtract, vec![self, rhs])
    }

    pub fn matmul(self, rhs: GradExpr) -> Result<Self, ShapeError> {
        GradExpr::call(Operation::Matmul, vec![self, rhs])
    }

    pub fn transpose(self, perm: Vec<usize>) -> Result<Self, ShapeError> {
        GradExpr::call(Operation::Transpose(TransposeSpec { perm }), vec![self])
    }

    /// Rank-2 transpose.
    pub fn t(self) -> Result<Self, ShapeError> {
        self.transpose(vec![1, 0])
    }

    pub fn reshape(self, shape: &Shape) -> Result<Self, ShapeError> {
        GradExpr::call(
            Operation::Reshape(ReshapeSpec {
                shape: shape.dims().to_vec(),
            }),
            vec![self],
        )
    }

    pub fn softmax(self, axis: usize) -> Result<Self, ShapeError> {
        GradExpr::call(Operation::Softmax(SoftmaxSpec { axis }), vec![self])
    }

    pub fn ones_like(self) -> Result<Self, ShapeError> {
        GradExpr::call(Operation::OnesLike, vec![self])
    }

    /// Sums `self` over the axes that were broadcast to reach its shape from
    /// `target`'s shape.
    pub fn collapse_sum_like(self, target: GradExpr) -> Result<Self, ShapeError> {
        GradExpr::call(Operation::CollapseSumLike, vec![self, target])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::spec::{DType, ValueId};

    fn spec(dims: &[usize]) -> TensorSpec {
        TensorSpec::new(DType::F32, Shape::new(dims.to_vec()))
    }

    fn leaf(id: u32, dims: &[usize]) -> GradExpr {
        GradExpr::leaf(Operand::Value(ValueId(id)), spec(dims))
    }

    #[test]
    fn zeros_are_absorbed_by_add() {
        let x = leaf(0, &[2]);
        assert_eq!(GradExpr::Zeros(spec(&[2])).add(x.clone()).unwrap(), x);
        assert_eq!(x.clone().add(GradExpr::Zeros(spec(&[2]))).unwrap(), x);
    }

    #[test]
    fn tensors_add_lazily() {
        let sum = leaf(0, &[2]).add(leaf(1, &[2])).unwrap();
        assert_eq!(
            sum,
            GradExpr::Call {
                op: Operation::Add,
                args: vec![leaf(0, &[2]), leaf(1, &[2])],
                spec: spec(&[2]),
            }
        );
    }

    #[test]
    fn tuple_placeholder_accumulates_positionally() {
        let ty = ValueType::Tuple(vec![
            ValueType::Tensor(spec(&[2])),
            ValueType::Tensor(spec(&[3])),
        ]);
        let placeholder = GradExpr::zeros_of(&ty);
        assert!(placeholder.is_zero());
        let once = placeholder.add_at(1, leaf(4, &[3])).unwrap();
        assert!(!once.is_zero());
        let twice = once.add_at(1, leaf(5, &[3])).unwrap();
        let GradExpr::Tuple(elements) = twice else {
            panic!("expected tuple");
        };
        assert_eq!(elements[0], GradExpr::Zeros(spec(&[2])));
        assert!(matches!(
            &elements[1],
            GradExpr::Call {
                op: Operation::Add,
                ..
            }
        ));
    }

    #[test]
    fn mismatched_tuple_arity_is_an_error() {
        let a = GradExpr::Tuple(vec![leaf(0, &[1])]);
        let b = GradExpr::Tuple(vec![leaf(1, &[1]), leaf(2, &[1])]);
        assert!(a.add(b).is_err());
    }
}
