//! Local gradient rules used during backprop
//!
//! Each rule takes the inputs of an operation and its output, and accumulates
//! `d out / d input * out.grad` into every input.

use crate::values::Value;

/// The operation that produced a derived node in the computation graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpropFunc {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Neg,
    ReLU,
    Exp,
    Ln,
}

impl BackpropFunc {
    pub fn n_operands(&self) -> usize {
        match self {
            BackpropFunc::Add
            | BackpropFunc::Sub
            | BackpropFunc::Mul
            | BackpropFunc::Div
            | BackpropFunc::Pow => 2,
            BackpropFunc::Neg | BackpropFunc::ReLU | BackpropFunc::Exp | BackpropFunc::Ln => 1,
        }
    }

    /// Accumulates gradients into `operands`, which must have `n_operands()` entries
    pub fn apply(&self, operands: &[Value], out: &Value) {
        debug_assert_eq!(operands.len(), self.n_operands());
        let grad = out.grad();
        match self {
            BackpropFunc::Add => {
                operands[0].add_grad(grad);
                operands[1].add_grad(grad);
            }
            BackpropFunc::Sub => {
                operands[0].add_grad(grad);
                operands[1].add_grad(-grad);
            }
            BackpropFunc::Mul => {
                let (a, b) = (operands[0].data(), operands[1].data());
                operands[0].add_grad(b * grad);
                operands[1].add_grad(a * grad);
            }
            BackpropFunc::Div => {
                let (a, b) = (operands[0].data(), operands[1].data());
                operands[0].add_grad(grad / b);
                operands[1].add_grad(-a * grad / (b * b));
            }
            // only the base receives a gradient, exponents are treated as constants
            BackpropFunc::Pow => {
                let (base, exponent) = (operands[0].data(), operands[1].data());
                operands[0].add_grad(exponent * base.powf(exponent - 1.0) * grad);
            }
            BackpropFunc::Neg => operands[0].add_grad(-grad),
            BackpropFunc::ReLU => {
                if operands[0].data() > 0.0 {
                    operands[0].add_grad(grad);
                }
            }
            // d exp(x) / dx = exp(x), which is the output itself
            BackpropFunc::Exp => operands[0].add_grad(out.data() * grad),
            BackpropFunc::Ln => operands[0].add_grad(grad / operands[0].data()),
        }
    }
}
