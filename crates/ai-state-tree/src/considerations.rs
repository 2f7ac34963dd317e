//! Built-in utility considerations.

use ai_core::PropertyBag;

use crate::node::{Consideration, NodeContext};

/// A fixed score.
#[derive(Debug, Clone, Copy)]
pub struct ConstantConsideration(pub f32);

impl Consideration for ConstantConsideration {
    fn score(&self, _ctx: &NodeContext<'_>) -> f32 {
        self.0
    }
}

/// Maps the bound `input` linearly from `[min, max]` to `[0, 1]`.
#[derive(Debug, Clone, Copy)]
pub struct FloatInputConsideration {
    pub min: f32,
    pub max: f32,
    pub input: f32,
}

impl FloatInputConsideration {
    pub fn new(min: f32, max: f32) -> Self {
        Self {
            min,
            max,
            input: min,
        }
    }

    pub fn with_input(mut self, input: f32) -> Self {
        self.input = input;
        self
    }

    pub fn normalize(&self, input: f32) -> f32 {
        let span = self.max - self.min;
        if span.abs() <= f32::EPSILON {
            return if input >= self.max { 1.0 } else { 0.0 };
        }
        ((input - self.min) / span).clamp(0.0, 1.0)
    }
}

impl Consideration for FloatInputConsideration {
    fn instance_template(&self) -> PropertyBag {
        PropertyBag::new().with("input", self.input)
    }

    fn score(&self, ctx: &NodeContext<'_>) -> f32 {
        ctx.data()
            .float("input")
            .map_or(0.0, |input| self.normalize(input))
    }
}
