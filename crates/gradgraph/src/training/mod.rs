//! Training-graph construction helpers.

pub mod append_loss;

pub use append_loss::{append_loss, append_loss_in_module, DEFAULT_LOSS_SUFFIX};
