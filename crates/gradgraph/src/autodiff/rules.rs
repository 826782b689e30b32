//! Built-in gradient rules.

use crate::autodiff::adjoint::GradExpr;
use crate::autodiff::registry::{CallSite, GradientRuleDef, RuleError, GRADIENT_RULES};
use crate::ir::shape::inverse_permutation;
use crate::ir::spec::{Operation, Shape};

type Partials = Result<Vec<Option<GradExpr>>, RuleError>;

macro_rules! gradient_rule {
    ($name:ident, $op:literal, $rule:path) => {
        #[linkme::distributed_slice(GRADIENT_RULES)]
        static $name: GradientRuleDef = GradientRuleDef {
            op: $op,
            rule: $rule,
        };
    };
}

gradient_rule!(ADD_RULE, "add", add);
gradient_rule!(SUBTRACT_RULE, "subtract", subtract);
gradient_rule!(MULTIPLY_RULE, "multiply", multiply);
gradient_rule!(DIVIDE_RULE, "divide", divide);
gradient_rule!(NEGATIVE_RULE, "negative", negative);
gradient_rule!(EXP_RULE, "exp", exp);
gradient_rule!(LOG_RULE, "log", log);
gradient_rule!(MATMUL_RULE, "matmul", matmul);
gradient_rule!(TRANSPOSE_RULE, "transpose", transpose);
gradient_rule!(RESHAPE_RULE, "reshape", reshape);
gradient_rule!(SUM_RULE, "sum", sum);
gradient_rule!(SCE_RULE, "softmax_cross_entropy", softmax_cross_entropy);
gradient_rule!(ONES_RULE, "ones", constant);
gradient_rule!(ZEROS_RULE, "zeros", constant);
gradient_rule!(ONES_LIKE_RULE, "ones_like", constant);
gradient_rule!(ZEROS_LIKE_RULE, "zeros_like", constant);
gradient_rule!(COLLAPSE_SUM_LIKE_RULE, "collapse_sum_like", collapse_sum_like);

fn add(site: &CallSite<'_>, adj: &GradExpr) -> Partials {
    site.operands::<2>()?;
    Ok(vec![Some(adj.clone()), Some(adj.clone())])
}

fn subtract(site: &CallSite<'_>, adj: &GradExpr) -> Partials {
    site.operands::<2>()?;
    Ok(vec![Some(adj.clone()), Some(adj.clone().negative()?)])
}

fn multiply(site: &CallSite<'_>, adj: &GradExpr) -> Partials {
    let [a, b] = site.operands::<2>()?;
    Ok(vec![
        Some(adj.clone().multiply(b.clone())?),
        Some(adj.clone().multiply(a.clone())?),
    ])
}

// d(a/b)/db = -(a/b)/b, reusing the forward quotient.
fn divide(site: &CallSite<'_>, adj: &GradExpr) -> Partials {
    let [_, b] = site.operands::<2>()?;
    let lhs = adj.clone().divide(b.clone())?;
    let rhs = adj
        .clone()
        .multiply(site.result.clone())?
        .divide(b.clone())?
        .negative()?;
    Ok(vec![Some(lhs), Some(rhs)])
}

fn negative(site: &CallSite<'_>, adj: &GradExpr) -> Partials {
    site.operands::<1>()?;
    Ok(vec![Some(adj.clone().negative()?)])
}

fn exp(site: &CallSite<'_>, adj: &GradExpr) -> Partials {
    site.operands::<1>()?;
    Ok(vec![Some(adj.clone().multiply(site.result.clone())?)])
}

fn log(site: &CallSite<'_>, adj: &GradExpr) -> Partials {
    let [x] = site.operands::<1>()?;
    Ok(vec![Some(adj.clone().divide(x.clone())?)])
}

fn matmul(site: &CallSite<'_>, adj: &GradExpr) -> Partials {
    let [a, b] = site.operands::<2>()?;
    Ok(vec![
        Some(adj.clone().matmul(b.clone().t()?)?),
        Some(a.clone().t()?.matmul(adj.clone())?),
    ])
}

fn transpose(site: &CallSite<'_>, adj: &GradExpr) -> Partials {
    site.operands::<1>()?;
    let Operation::Transpose(spec) = site.op else {
        return Err(unexpected_op(site));
    };
    Ok(vec![Some(
        adj.clone().transpose(inverse_permutation(&spec.perm))?,
    )])
}

fn reshape(site: &CallSite<'_>, adj: &GradExpr) -> Partials {
    site.operands::<1>()?;
    let input = site.arg_spec(0)?;
    Ok(vec![Some(adj.clone().reshape(&input.shape)?)])
}

// The adjoint is first brought back to keepdims layout so it broadcasts
// against the input.
fn sum(site: &CallSite<'_>, adj: &GradExpr) -> Partials {
    let [x] = site.operands::<1>()?;
    let Operation::Sum(spec) = site.op else {
        return Err(unexpected_op(site));
    };
    let input = site.arg_spec(0)?;
    let rank = input.shape.rank();
    let kept = Shape::new(
        input
            .shape
            .dims()
            .iter()
            .enumerate()
            .map(|(axis, &dim)| match &spec.axes {
                Some(axes) if !axes.contains(&axis) => dim,
                _ => 1,
            })
            .collect::<Vec<_>>(),
    );
    let adj_rank = site.spec.shape.rank();
    let adj = if adj_rank != 0 && adj_rank != rank {
        adj.clone().reshape(&kept)?
    } else {
        adj.clone()
    };
    Ok(vec![Some(adj.multiply(x.clone().ones_like()?)?)])
}

// Labels are treated as constants. Assumes each label row sums to one.
fn softmax_cross_entropy(site: &CallSite<'_>, adj: &GradExpr) -> Partials {
    let [logits, labels] = site.operands::<2>()?;
    let axis = site.arg_spec(0)?.shape.rank().saturating_sub(1);
    let grad = logits
        .clone()
        .softmax(axis)?
        .subtract(labels.clone())?
        .multiply(adj.clone())?;
    Ok(vec![Some(grad), None])
}

fn collapse_sum_like(site: &CallSite<'_>, adj: &GradExpr) -> Partials {
    let [data, _] = site.operands::<2>()?;
    Ok(vec![Some(adj.clone().multiply(data.clone().ones_like()?)?), None])
}

fn constant(site: &CallSite<'_>, _adj: &GradExpr) -> Partials {
    Ok(vec![None; site.args.len()])
}

fn unexpected_op(site: &CallSite<'_>) -> RuleError {
    RuleError::Unsupported {
        op: site.op.name().to_string(),
        reason: "rule registered for a different operator".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::registry::lookup_gradient_rule;
    use crate::ir::spec::{DType, Operand, SumSpec, TensorSpec, ValueId};

    fn leaf(id: u32, dims: &[usize]) -> GradExpr {
        GradExpr::leaf(
            Operand::Value(ValueId(id)),
            TensorSpec::new(DType::F32, Shape::new(dims.to_vec())),
        )
    }

    fn run(op: Operation, args: Vec<GradExpr>, result: GradExpr) -> Vec<Option<GradExpr>> {
        let rule = lookup_gradient_rule(op.name()).expect("rule");
        let spec = result.spec().cloned().expect("tensor result");
        let site = CallSite {
            op: &op,
            args: &args,
            result: &result,
            spec: &spec,
        };
        rule(&site, &result).expect("rule succeeds")
    }

    #[test]
    fn matmul_partials_match_operand_shapes() {
        let partials = run(
            Operation::Matmul,
            vec![leaf(0, &[5, 20]), leaf(1, &[20, 10])],
            leaf(2, &[5, 10]),
        );
        let shapes: Vec<_> = partials
            .iter()
            .map(|p| p.as_ref().and_then(GradExpr::spec).map(|s| s.shape.clone()))
            .collect();
        assert_eq!(
            shapes,
            vec![
                Some(Shape::new(vec![5, 20])),
                Some(Shape::new(vec![20, 10]))
            ]
        );
    }

    #[test]
    fn partial_sum_is_reshaped_to_keepdims() {
        let op = Operation::Sum(SumSpec {
            axes: Some(vec![1]),
            keepdims: false,
        });
        let partials = run(op, vec![leaf(0, &[5, 10])], leaf(1, &[5]));
        let GradExpr::Call { op, args, spec } = partials[0].clone().expect("partial") else {
            panic!("expected call");
        };
        assert_eq!(op, Operation::Multiply);
        assert_eq!(spec.shape, Shape::new(vec![5, 10]));
        assert_eq!(
            args[0].spec().map(|s| s.shape.clone()),
            Some(Shape::new(vec![5, 1]))
        );
    }

    #[test]
    fn labels_get_no_gradient() {
        let partials = run(
            Operation::SoftmaxCrossEntropy,
            vec![leaf(0, &[4, 3]), leaf(1, &[4, 3])],
            leaf(2, &[]),
        );
        assert!(partials[0].is_some());
        assert!(partials[1].is_none());
    }

    #[test]
    fn arity_is_checked() {
        let rule = lookup_gradient_rule("add").expect("rule");
        let args = vec![leaf(0, &[2])];
        let result = leaf(1, &[2]);
        let spec = result.spec().cloned().expect("spec");
        let site = CallSite {
            op: &Operation::Add,
            args: &args,
            result: &result,
            spec: &spec,
        };
        assert!(matches!(
            rule(&site, &result),
            Err(RuleError::Arity { expected: 2, found: 1, .. })
        ));
    }
}
