//! Built-in conditions comparing bound values.
//!
//! Operands live in the condition's instance data (`left`, `right`) so they can be bound to
//! parameters, evaluator outputs or event payloads.

use ai_core::PropertyBag;

use crate::node::{Condition, NodeContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Comparison {
    #[default]
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl Comparison {
    pub fn compare<T: PartialOrd>(self, left: T, right: T) -> bool {
        match self {
            Comparison::Equal => left == right,
            Comparison::NotEqual => left != right,
            Comparison::Less => left < right,
            Comparison::LessOrEqual => left <= right,
            Comparison::Greater => left > right,
            Comparison::GreaterOrEqual => left >= right,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompareInt {
    pub comparison: Comparison,
    pub invert: bool,
    pub left: i64,
    pub right: i64,
}

impl CompareInt {
    pub fn new(comparison: Comparison) -> Self {
        Self {
            comparison,
            ..Self::default()
        }
    }

    /// Unbound operand defaults.
    pub fn with_operands(mut self, left: i64, right: i64) -> Self {
        self.left = left;
        self.right = right;
        self
    }

    pub fn inverted(mut self) -> Self {
        self.invert = true;
        self
    }
}

impl Condition for CompareInt {
    fn instance_template(&self) -> PropertyBag {
        PropertyBag::new()
            .with("left", self.left)
            .with("right", self.right)
    }

    fn test_condition(&self, ctx: &NodeContext<'_>) -> bool {
        let data = ctx.data();
        match (data.int("left"), data.int("right")) {
            (Some(left), Some(right)) => self.comparison.compare(left, right) ^ self.invert,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompareFloat {
    pub comparison: Comparison,
    pub invert: bool,
    pub left: f32,
    pub right: f32,
}

impl CompareFloat {
    pub fn new(comparison: Comparison) -> Self {
        Self {
            comparison,
            ..Self::default()
        }
    }

    pub fn with_operands(mut self, left: f32, right: f32) -> Self {
        self.left = left;
        self.right = right;
        self
    }

    pub fn inverted(mut self) -> Self {
        self.invert = true;
        self
    }
}

impl Condition for CompareFloat {
    fn instance_template(&self) -> PropertyBag {
        PropertyBag::new()
            .with("left", self.left)
            .with("right", self.right)
    }

    fn test_condition(&self, ctx: &NodeContext<'_>) -> bool {
        let data = ctx.data();
        match (data.float("left"), data.float("right")) {
            (Some(left), Some(right)) => self.comparison.compare(left, right) ^ self.invert,
            _ => false,
        }
    }
}

/// True when `left == right`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompareBool {
    pub invert: bool,
    pub left: bool,
    pub right: bool,
}

impl CompareBool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tests a single bound flag: `left` against `true`.
    pub fn is_set() -> Self {
        Self {
            right: true,
            ..Self::default()
        }
    }

    pub fn inverted(mut self) -> Self {
        self.invert = true;
        self
    }
}

impl Condition for CompareBool {
    fn instance_template(&self) -> PropertyBag {
        PropertyBag::new()
            .with("left", self.left)
            .with("right", self.right)
    }

    fn test_condition(&self, ctx: &NodeContext<'_>) -> bool {
        let data = ctx.data();
        match (data.bool("left"), data.bool("right")) {
            (Some(left), Some(right)) => (left == right) ^ self.invert,
            _ => false,
        }
    }
}

/// Always returns its value.
#[derive(Debug, Clone, Copy)]
pub struct ConstantBool(pub bool);

impl Condition for ConstantBool {
    fn test_condition(&self, _ctx: &NodeContext<'_>) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::Comparison;

    #[test]
    fn comparisons() {
        assert!(Comparison::Equal.compare(3, 3));
        assert!(Comparison::NotEqual.compare(3, 4));
        assert!(Comparison::Less.compare(1.0, 2.0));
        assert!(!Comparison::Greater.compare(1, 1));
        assert!(Comparison::GreaterOrEqual.compare(1, 1));
        assert!(Comparison::LessOrEqual.compare(-2, 1));
    }
}
