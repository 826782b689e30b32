//! Gradient rule registry.
//!
//! Built-in rules are collected at link time through [`GRADIENT_RULES`]. Rules
//! registered at runtime with [`register_gradient_rule`] take precedence, which
//! is how custom calls (keyed by their target) and overrides are supplied.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use thiserror::Error;

use crate::autodiff::adjoint::GradExpr;
use crate::ir::shape::ShapeError;
use crate::ir::spec::{Operation, TensorSpec};

/// Failure inside a gradient rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error("{op}: {reason}")]
    Unsupported { op: String, reason: String },
    #[error("{op} expects {expected} operands, got {found}")]
    Arity {
        op: String,
        expected: usize,
        found: usize,
    },
}

/// The call a rule is asked to differentiate.
///
/// `args` holds one leaf per operand and `result` is the leaf of the call's own
/// value, so rules can reuse forward values without recomputing them.
#[derive(Debug, Clone, Copy)]
pub struct CallSite<'a> {
    pub op: &'a Operation,
    pub args: &'a [GradExpr],
    pub result: &'a GradExpr,
    pub spec: &'a TensorSpec,
}

impl<'a> CallSite<'a> {
    /// Checks the operand count and returns the operands as an array.
    pub fn operands<const N: usize>(&self) -> Result<&'a [GradExpr; N], RuleError> {
        <&[GradExpr; N]>::try_from(self.args).map_err(|_| RuleError::Arity {
            op: self.op.name().to_string(),
            expected: N,
            found: self.args.len(),
        })
    }

    pub fn arg_spec(&self, index: usize) -> Result<&'a TensorSpec, RuleError> {
        self.args
            .get(index)
            .and_then(GradExpr::spec)
            .ok_or_else(|| RuleError::Unsupported {
                op: self.op.name().to_string(),
                reason: format!("operand {index} is not a tensor"),
            })
    }
}

/// Maps the adjoint of a call's result to one partial per operand.
///
/// `None` marks an operand that does not receive a gradient. Partials may have
/// the broadcast result shape; the sweep collapses them onto the operand shape.
pub type GradientRuleFn = fn(&CallSite<'_>, &GradExpr) -> Result<Vec<Option<GradExpr>>, RuleError>;

pub struct GradientRuleDef {
    pub op: &'static str,
    pub rule: GradientRuleFn,
}

#[linkme::distributed_slice]
pub static GRADIENT_RULES: [GradientRuleDef] = [..];

struct RuleOverrides {
    rules: RwLock<HashMap<String, GradientRuleFn>>,
}

impl RuleOverrides {
    fn new() -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
        }
    }
}

static OVERRIDES: OnceLock<RuleOverrides> = OnceLock::new();

fn overrides() -> &'static RuleOverrides {
    OVERRIDES.get_or_init(RuleOverrides::new)
}

/// Registers `rule` for operator (or custom-call target) `op`, replacing any
/// previous runtime registration and shadowing a built-in rule of that name.
pub fn register_gradient_rule(op: impl Into<String>, rule: GradientRuleFn) {
    let op = op.into();
    log::debug!("registering gradient rule for `{op}`");
    overrides()
        .rules
        .write()
        .expect("gradient rule registry poisoned")
        .insert(op, rule);
}

/// Removes a runtime registration. Built-in rules are unaffected.
pub fn unregister_gradient_rule(op: &str) -> Option<GradientRuleFn> {
    overrides()
        .rules
        .write()
        .expect("gradient rule registry poisoned")
        .remove(op)
}

pub fn lookup_gradient_rule(op: &str) -> Option<GradientRuleFn> {
    let runtime = overrides()
        .rules
        .read()
        .expect("gradient rule registry poisoned")
        .get(op)
        .copied();
    runtime.or_else(|| {
        GRADIENT_RULES
            .iter()
            .find(|def| def.op == op)
            .map(|def| def.rule)
    })
}

pub fn has_gradient_rule(op: &str) -> bool {
    lookup_gradient_rule(op).is_some()
}

/// Sorted, deduplicated names of every operator with a rule.
pub fn registered_ops() -> Vec<String> {
    let mut ops: Vec<String> = GRADIENT_RULES
        .iter()
        .map(|def| def.op.to_string())
        .chain(
            overrides()
                .rules
                .read()
                .expect("gradient rule registry poisoned")
                .keys()
                .cloned(),
        )
        .collect();
    ops.sort();
    ops.dedup();
    ops
}
