//! Reverse-mode automatic differentiation over the graph IR.

pub mod adjoint;
pub mod backward;
pub mod error;
pub mod registry;
mod rules;

pub use adjoint::GradExpr;
pub use backward::{
    differentiate, differentiate_in_module, differentiate_with_config, require_grads_by_name,
    AutodiffConfig,
};
pub use error::AutodiffError;
pub use registry::{
    has_gradient_rule, lookup_gradient_rule, register_gradient_rule, registered_ops,
    unregister_gradient_rule, CallSite, GradientRuleDef, GradientRuleFn, RuleError,
    GRADIENT_RULES,
};
