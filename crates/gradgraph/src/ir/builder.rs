use std::collections::HashSet;

use crate::ir::spec::{Binding, Expr, Function, Param, Region, ReturnExpr, ValueId, ValueType};

/// Hands out value names that are unique within one function.
#[derive(Debug, Clone, Default)]
pub struct NameSupply {
    taken: HashSet<String>,
}

impl NameSupply {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `name` as used. Returns `false` if it was already taken.
    pub fn reserve(&mut self, name: &str) -> bool {
        self.taken.insert(name.to_string())
    }

    /// Returns `hint` when unused, otherwise the first free `hint1`, `hint2`, ...
    pub fn fresh(&mut self, hint: &str) -> String {
        if self.reserve(hint) {
            return hint.to_string();
        }
        let mut suffix = 1usize;
        loop {
            let candidate = format!("{hint}{suffix}");
            if self.reserve(&candidate) {
                return candidate;
            }
            suffix += 1;
        }
    }
}

/// Append-only builder for single-region functions.
///
/// Ids are allocated in call order, so a function built parameters-first and then
/// bindings-in-order prints and reparses to the same ids.
#[derive(Debug, Clone)]
pub struct FunctionBuilder {
    name: String,
    next_value_id: u32,
    params: Vec<Param>,
    bindings: Vec<Binding>,
    names: NameSupply,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            next_value_id: 0,
            params: Vec::new(),
            bindings: Vec::new(),
            names: NameSupply::new(),
        }
    }

    /// Seeds a builder with the parameters and bindings of `function`, keeping
    /// their ids and names. New values are numbered after the largest existing id.
    pub fn from_function(name: impl Into<String>, function: &Function) -> Self {
        let mut builder = Self::new(name);
        for param in &function.params {
            builder.push_param(param.clone());
        }
        for binding in function.bindings() {
            builder.push_binding(binding.clone());
        }
        builder
    }

    pub fn add_param(&mut self, name_hint: &str, ty: ValueType) -> ValueId {
        let id = self.allocate();
        let name = self.names.fresh(name_hint);
        self.params.push(Param { id, name, ty });
        id
    }

    /// Appends a binding and returns its id. The name is `name_hint` unless that
    /// is taken.
    pub fn bind(&mut self, name_hint: &str, expr: Expr, ty: ValueType) -> ValueId {
        let id = self.allocate();
        let name = self.names.fresh(name_hint);
        self.bindings.push(Binding { id, name, expr, ty });
        id
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn finish(self, outputs: Vec<ValueId>, ret: ReturnExpr) -> Function {
        Function {
            name: self.name,
            params: self.params,
            regions: vec![Region {
                bindings: self.bindings,
                outputs,
            }],
            ret,
        }
    }

    fn push_param(&mut self, param: Param) {
        self.track(param.id, &param.name);
        self.params.push(param);
    }

    fn push_binding(&mut self, binding: Binding) {
        self.track(binding.id, &binding.name);
        self.bindings.push(binding);
    }

    fn track(&mut self, id: ValueId, name: &str) {
        self.names.reserve(name);
        self.next_value_id = self.next_value_id.max(id.0 + 1);
    }

    fn allocate(&mut self) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::spec::{DType, Operand, Operation, TensorSpec};

    fn scalar() -> ValueType {
        ValueType::Tensor(TensorSpec::scalar(DType::F32))
    }

    #[test]
    fn fresh_skips_taken_suffixes() {
        let mut names = NameSupply::new();
        assert_eq!(names.fresh("lv"), "lv");
        assert_eq!(names.fresh("lv"), "lv1");
        names.reserve("lv2");
        assert_eq!(names.fresh("lv"), "lv3");
        assert_eq!(names.fresh("x_adjoint"), "x_adjoint");
    }

    #[test]
    fn builder_allocates_after_seeded_ids() {
        let mut seed = FunctionBuilder::new("f");
        let x = seed.add_param("x", scalar());
        let y = seed.bind(
            "y",
            Expr::Call {
                op: Operation::Negative,
                operands: vec![Operand::Value(x)],
            },
            scalar(),
        );
        let function = seed.finish(vec![y], ReturnExpr::Value(y));

        let mut builder = FunctionBuilder::from_function("g", &function);
        let z = builder.bind("y", Expr::Use(Operand::Value(y)), scalar());
        assert_eq!(z, ValueId(2));
        let built = builder.finish(vec![z], ReturnExpr::Value(z));
        assert_eq!(built.name, "g");
        assert_eq!(built.regions[0].bindings.len(), 2);
        assert_eq!(built.value_name(z), Some("y1"));
    }
}
