use std::collections::{HashMap, HashSet};

use smallvec::SmallVec;
use thiserror::Error;

use crate::ir::spec::{Function, Operand, ValueId, ValueType};

/// Position of a binding: region index and offset within that region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingPos {
    pub region: usize,
    pub index: usize,
}

/// Where a value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefId {
    /// Function parameter at the given index.
    Param { index: u32 },
    Binding(BindingPos),
}

/// Structural indices for a single function body.
#[derive(Debug, Clone)]
pub struct FunctionIndices {
    value_types: HashMap<ValueId, ValueType>,
    defs: HashMap<ValueId, DefId>,
    users: HashMap<ValueId, SmallVec<[BindingPos; 4]>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FunctionIndexError {
    #[error("value %{} is defined more than once", .value.0)]
    DuplicateValue { value: ValueId },
    #[error("value %{} is used before it is defined", .value.0)]
    MissingValueDefinition { value: ValueId },
}

impl FunctionIndices {
    /// Builds indices for `function`, checking single assignment and that every
    /// use follows its definition.
    pub fn build(function: &Function) -> Result<Self, FunctionIndexError> {
        let mut seen: HashSet<ValueId> = HashSet::new();
        let mut value_types = HashMap::new();
        let mut defs = HashMap::new();
        let mut users: HashMap<ValueId, SmallVec<[BindingPos; 4]>> = HashMap::new();

        for (index, param) in function.params.iter().enumerate() {
            if !seen.insert(param.id) {
                return Err(FunctionIndexError::DuplicateValue { value: param.id });
            }
            value_types.insert(param.id, param.ty.clone());
            defs.insert(
                param.id,
                DefId::Param {
                    index: index as u32,
                },
            );
        }

        for (region_index, region) in function.regions.iter().enumerate() {
            for (index, binding) in region.bindings.iter().enumerate() {
                let pos = BindingPos {
                    region: region_index,
                    index,
                };
                for used in binding.expr.used_values() {
                    if !value_types.contains_key(&used) {
                        return Err(FunctionIndexError::MissingValueDefinition { value: used });
                    }
                    let entry = users.entry(used).or_default();
                    if entry.last() != Some(&pos) {
                        entry.push(pos);
                    }
                }
                if !seen.insert(binding.id) {
                    return Err(FunctionIndexError::DuplicateValue { value: binding.id });
                }
                value_types.insert(binding.id, binding.ty.clone());
                defs.insert(binding.id, DefId::Binding(pos));
            }
        }

        Ok(FunctionIndices {
            value_types,
            defs,
            users,
        })
    }

    pub fn type_of(&self, value: ValueId) -> Option<&ValueType> {
        self.value_types.get(&value)
    }

    pub fn def_of(&self, value: ValueId) -> Option<DefId> {
        self.defs.get(&value).copied()
    }

    pub fn users_of(&self, value: ValueId) -> &[BindingPos] {
        self.users
            .get(&value)
            .map(|users| users.as_slice())
            .unwrap_or(&[])
    }

    /// Resolves the type an operand reads.
    pub fn operand_type(&self, operand: &Operand) -> Option<ValueType> {
        match operand {
            Operand::Value(id) => self.type_of(*id).cloned(),
            Operand::TupleElement { tuple, index } => {
                self.type_of(*tuple)?.tuple_element(*index).cloned()
            }
            Operand::Literal(literal) => Some(ValueType::Tensor(literal.spec.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::text_ir::parse_function;

    #[test]
    fn records_users_and_definitions() {
        let function = parse_function(
            r#"
func @f(%x: tensor<f32, 2>) -> tensor<f32, 2> {
  %a = add(%x, %x) -> tensor<f32, 2>
  %b = multiply(%a, %x) -> tensor<f32, 2>
  return %b
}
"#,
        )
        .expect("parse");
        let indices = FunctionIndices::build(&function).expect("index");
        let x = function.value_id("x").expect("x");
        let a = function.value_id("a").expect("a");
        assert_eq!(indices.def_of(x), Some(DefId::Param { index: 0 }));
        assert_eq!(indices.users_of(x).len(), 2);
        assert_eq!(
            indices.def_of(a),
            Some(DefId::Binding(BindingPos {
                region: 0,
                index: 0
            }))
        );
        assert!(indices.users_of(function.value_id("b").expect("b")).is_empty());
    }
}
