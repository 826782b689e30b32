use std::collections::HashMap;

use crate::ir::spec::{Expr, Operand, TupleField, ValueId};

/// Value substitution applied while copying expressions between functions.
///
/// Ids without an entry map to themselves.
#[derive(Debug, Clone, Default)]
pub struct ValueRemap {
    map: HashMap<ValueId, ValueId>,
}

impl ValueRemap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, from: ValueId, to: ValueId) {
        self.map.insert(from, to);
    }

    pub fn get(&self, from: ValueId) -> Option<ValueId> {
        self.map.get(&from).copied()
    }

    pub fn value(&self, id: ValueId) -> ValueId {
        self.get(id).unwrap_or(id)
    }

    pub fn operand(&self, operand: &Operand) -> Operand {
        match operand {
            Operand::Value(id) => Operand::Value(self.value(*id)),
            Operand::TupleElement { tuple, index } => Operand::TupleElement {
                tuple: self.value(*tuple),
                index: *index,
            },
            Operand::Literal(literal) => Operand::Literal(literal.clone()),
        }
    }

    pub fn expr(&self, expr: &Expr) -> Expr {
        match expr {
            Expr::Call { op, operands } => Expr::Call {
                op: op.clone(),
                operands: operands.iter().map(|operand| self.operand(operand)).collect(),
            },
            Expr::Tuple(fields) => Expr::Tuple(self.fields(fields)),
            Expr::TupleGet { tuple, index } => Expr::TupleGet {
                tuple: self.value(*tuple),
                index: *index,
            },
            Expr::Use(operand) => Expr::Use(self.operand(operand)),
        }
    }

    fn fields(&self, fields: &[TupleField]) -> Vec<TupleField> {
        fields
            .iter()
            .map(|field| match field {
                TupleField::Operand(operand) => TupleField::Operand(self.operand(operand)),
                TupleField::Tuple(nested) => TupleField::Tuple(self.fields(nested)),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::spec::Operation;

    #[test]
    fn substitutes_nested_tuple_fields() {
        let mut remap = ValueRemap::new();
        remap.insert(ValueId(0), ValueId(7));
        let expr = Expr::Tuple(vec![
            TupleField::Operand(Operand::Value(ValueId(1))),
            TupleField::Tuple(vec![TupleField::Operand(Operand::TupleElement {
                tuple: ValueId(0),
                index: 2,
            })]),
        ]);
        let expected = Expr::Tuple(vec![
            TupleField::Operand(Operand::Value(ValueId(1))),
            TupleField::Tuple(vec![TupleField::Operand(Operand::TupleElement {
                tuple: ValueId(7),
                index: 2,
            })]),
        ]);
        assert_eq!(remap.expr(&expr), expected);

        let call = Expr::Call {
            op: Operation::Add,
            operands: vec![Operand::Value(ValueId(0)), Operand::Value(ValueId(0))],
        };
        assert_eq!(
            remap.expr(&call).used_values(),
            vec![ValueId(7), ValueId(7)]
        );
    }
}
