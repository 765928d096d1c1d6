//! Optimizers

use crate::values::Value;

/// Common interface for optimizers
/// Analogous to the torch.optim.Optimizer interface
/// <https://pytorch.org/docs/stable/optim.html#base-class>
pub trait Optim {
    /// Performs a single optimization step with accumulated gradients
    fn step(&mut self);
    /// Zeros gradients for all parameters
    fn zero_grad(&mut self);
}

/// SGD with momentum
pub struct SGD {
    params: Vec<Value>,
    lr: f32,
    momentum: f32,
    // velocity per parameter
    velocity: Vec<f32>,
}

impl SGD {
    pub fn new(params: Vec<Value>, lr: f32, momentum: f32) -> Self {
        let velocity = vec![0.0; params.len()];
        Self {
            params,
            lr,
            momentum,
            velocity,
        }
    }

    #[cfg(test)]
    fn velocities(&self) -> &[f32] {
        &self.velocity
    }
}

impl Optim for SGD {
    fn step(&mut self) {
        for (param, velocity) in self.params.iter_mut().zip(self.velocity.iter_mut()) {
            *velocity = self.momentum * *velocity - self.lr * param.grad();
            let new_val = param.data() + *velocity;
            param.set_data(new_val);
        }
    }

    fn zero_grad(&mut self) {
        for param in self.params.iter_mut() {
            param.zero_grad();
        }
    }
}

/// Adam with bias-corrected moment estimates
/// <https://pytorch.org/docs/stable/generated/torch.optim.Adam.html>
pub struct Adam {
    params: Vec<Value>,
    lr: f32,
    betas: (f32, f32),
    eps: f32,
    // first and second moment per parameter
    m: Vec<f32>,
    v: Vec<f32>,
    t: i32,
}

impl Adam {
    pub fn new(params: Vec<Value>, lr: f32) -> Self {
        Self::with_betas(params, lr, (0.9, 0.999), 1e-8)
    }

    pub fn with_betas(params: Vec<Value>, lr: f32, betas: (f32, f32), eps: f32) -> Self {
        let n = params.len();
        Self {
            params,
            lr,
            betas,
            eps,
            m: vec![0.0; n],
            v: vec![0.0; n],
            t: 0,
        }
    }
}

impl Optim for Adam {
    fn step(&mut self) {
        self.t += 1;
        let (beta1, beta2) = self.betas;
        let bias_correction1 = 1.0 - beta1.powi(self.t);
        let bias_correction2 = 1.0 - beta2.powi(self.t);
        for ((param, m), v) in self
            .params
            .iter_mut()
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            let grad = param.grad();
            *m = beta1 * *m + (1.0 - beta1) * grad;
            *v = beta2 * *v + (1.0 - beta2) * grad * grad;
            let m_hat = *m / bias_correction1;
            let v_hat = *v / bias_correction2;
            let new_val = param.data() - self.lr * m_hat / (v_hat.sqrt() + self.eps);
            param.set_data(new_val);
        }
    }

    fn zero_grad(&mut self) {
        for param in self.params.iter_mut() {
            param.zero_grad();
        }
    }
}
