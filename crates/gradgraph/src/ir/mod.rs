//! Static dataflow graph IR: data model, text form, shape inference and validation.

pub mod builder;
pub mod index;
pub mod rewriter;
pub mod shape;
pub mod spec;
pub mod text_ir;
pub mod verify;

pub use builder::{FunctionBuilder, NameSupply};
pub use spec::{
    Binding, DType, Expr, Function, Module, Operand, Operation, Param, Region, ReturnExpr, Shape,
    TensorLiteral, TensorSpec, TupleField, ValueId, ValueType,
};
pub use verify::{verify_function, verify_module, VerifyError};
