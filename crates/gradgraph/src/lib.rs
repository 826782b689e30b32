extern crate self as gradgraph;

pub use linkme;

pub mod autodiff;
mod env;
pub mod ir;
pub mod passes;
pub mod training;

pub use autodiff::{
    differentiate, differentiate_in_module, register_gradient_rule, AutodiffConfig, AutodiffError,
};
pub use ir::{Function, Module};
pub use passes::{AppendLossPass, GradientPass, ModulePass, PassManager, PassResult};
pub use training::{append_loss, append_loss_in_module};
