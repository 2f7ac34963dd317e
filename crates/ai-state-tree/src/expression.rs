//! Bracketed AND/OR folding shared by conditions (booleans) and considerations (scores).
//!
//! Each term carries a `delta_indent`: a positive value opens that many parentheses before the
//! term, a negative value closes that many after it. The first term's operand is ignored.

use crate::types::{Operand, MAX_EXPRESSION_INDENT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ExpressionTerm {
    pub operand: Operand,
    pub delta_indent: i8,
}

impl ExpressionTerm {
    pub const fn new(operand: Operand, delta_indent: i8) -> Self {
        Self {
            operand,
            delta_indent,
        }
    }

    pub const fn and() -> Self {
        Self::new(Operand::And, 0)
    }

    pub const fn or() -> Self {
        Self::new(Operand::Or, 0)
    }
}

/// Values that can be folded by an expression.
pub trait Foldable: Copy {
    fn and(self, rhs: Self) -> Self;
    fn or(self, rhs: Self) -> Self;
}

impl Foldable for bool {
    fn and(self, rhs: Self) -> Self {
        self && rhs
    }

    fn or(self, rhs: Self) -> Self {
        self || rhs
    }
}

impl Foldable for f32 {
    fn and(self, rhs: Self) -> Self {
        self.min(rhs)
    }

    fn or(self, rhs: Self) -> Self {
        self.max(rhs)
    }
}

const STACK: usize = MAX_EXPRESSION_INDENT + 1;

/// Incremental folder; feed terms in declaration order, then read [`ExpressionFolder::value`].
#[derive(Debug, Clone)]
pub struct ExpressionFolder<T: Foldable> {
    values: [T; STACK],
    operands: [Operand; STACK],
    level: usize,
    first: bool,
}

impl<T: Foldable> ExpressionFolder<T> {
    /// `empty` is the result of an expression without terms.
    pub fn new(empty: T) -> Self {
        Self {
            values: [empty; STACK],
            operands: [Operand::Copy; STACK],
            level: 0,
            first: true,
        }
    }

    pub fn push(&mut self, term: ExpressionTerm, value: T) {
        let delta = i32::from(term.delta_indent);
        let open = delta.max(0) as usize + 1;
        let close = (-delta).max(0) as usize + 1;

        let operand = if self.first { Operand::Copy } else { term.operand };
        self.first = false;

        self.operands[self.level] = operand;
        self.level = (self.level + open).min(STACK - 1);
        self.values[self.level] = value;

        for _ in 0..close {
            if self.level == 0 {
                break;
            }
            self.level -= 1;
            let rhs = self.values[self.level + 1];
            self.values[self.level] = match self.operands[self.level] {
                Operand::Copy => rhs,
                Operand::And => self.values[self.level].and(rhs),
                Operand::Or => self.values[self.level].or(rhs),
            };
            self.operands[self.level] = Operand::Copy;
        }
    }

    pub fn value(&self) -> T {
        self.values[0]
    }
}

/// Folds a complete term sequence.
pub fn evaluate<T: Foldable>(empty: T, terms: impl IntoIterator<Item = (ExpressionTerm, T)>) -> T {
    let mut folder = ExpressionFolder::new(empty);
    for (term, value) in terms {
        folder.push(term, value);
    }
    folder.value()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(operand: Operand, n: i8) -> ExpressionTerm {
        ExpressionTerm::new(operand, n)
    }

    #[test]
    fn and_then_or_grouping() {
        // (A && B) || C
        for bits in 0..8u8 {
            let (a, b, c) = (bits & 1 != 0, bits & 2 != 0, bits & 4 != 0);
            let terms = [
                (open(Operand::Copy, 1), a),
                (open(Operand::And, -1), b),
                (open(Operand::Or, 0), c),
            ];
            assert_eq!(evaluate(true, terms), (a && b) || c, "a={a} b={b} c={c}");
        }
    }

    #[test]
    fn or_inside_and() {
        // A && (B || C)
        for bits in 0..8u8 {
            let (a, b, c) = (bits & 1 != 0, bits & 2 != 0, bits & 4 != 0);
            let terms = [
                (open(Operand::Copy, 0), a),
                (open(Operand::And, 1), b),
                (open(Operand::Or, -1), c),
            ];
            assert_eq!(evaluate(true, terms), a && (b || c), "a={a} b={b} c={c}");
        }
    }

    #[test]
    fn empty_expression_uses_default() {
        assert!(evaluate::<bool>(true, []));
        assert_eq!(evaluate::<f32>(0.0, []), 0.0);
    }

    #[test]
    fn scores_fold_with_min_max() {
        let terms = [
            (open(Operand::Copy, 1), 0.8f32),
            (open(Operand::And, -1), 0.3),
            (open(Operand::Or, 0), 0.5),
        ];
        assert_eq!(evaluate(0.0, terms), 0.5);
    }
}
