//! AdamW optimizer over named parameters.
//!
//! Moment buffers are keyed by parameter name and live in full precision on
//! the parameter's device. The optimizer owns this state exclusively; it is
//! recreated at process start and never checkpointed.

use anyhow::Result;
use candle_core::{DType, Tensor, Var};
use std::collections::HashMap;

pub struct AdamW {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,

    m: HashMap<String, Tensor>,
    v: HashMap<String, Tensor>,
    step: usize,
}

impl AdamW {
    pub fn new(learning_rate: f64, beta1: f64, beta2: f64, eps: f64, weight_decay: f64) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            eps,
            weight_decay,
            m: HashMap::new(),
            v: HashMap::new(),
            step: 0,
        }
    }

    /// Advance the shared step counter; call once per optimization step,
    /// before the per-parameter updates.
    pub fn step(&mut self) {
        self.step += 1;
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    pub fn lr(&self) -> f64 {
        self.learning_rate
    }

    /// Apply one AdamW update to a single parameter.
    pub fn update(&mut self, name: &str, param: &Var, grad: &Tensor) -> Result<()> {
        let grad = grad.to_dtype(DType::F32)?;

        if !self.m.contains_key(name) {
            self.m.insert(name.to_string(), grad.zeros_like()?);
            self.v.insert(name.to_string(), grad.zeros_like()?);
        }

        let m = &self.m[name];
        let v = &self.v[name];
        let m_new = ((m * self.beta1)? + (&grad * (1.0 - self.beta1))?)?;
        let v_new = ((v * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;

        let step = self.step.max(1) as i32;
        let m_hat = (&m_new / (1.0 - self.beta1.powi(step)))?;
        let v_hat = (&v_new / (1.0 - self.beta2.powi(step)))?;

        self.m.insert(name.to_string(), m_new);
        self.v.insert(name.to_string(), v_new);

        let update = (m_hat / (v_hat.sqrt()? + self.eps)?)?;
        let mut new_value = (param.as_tensor().to_dtype(DType::F32)?
            - (update * self.learning_rate)?)?;

        // Decoupled weight decay, applied to the parameter directly rather
        // than folded into the gradient.
        if self.weight_decay > 0.0 {
            new_value = (&new_value
                - (param.as_tensor().to_dtype(DType::F32)?
                    * (self.learning_rate * self.weight_decay))?)?;
        }

        param.set(&new_value.to_dtype(param.dtype())?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_converges_on_quadratic() {
        let device = Device::Cpu;
        let w = Var::from_tensor(&Tensor::from_vec(vec![0.0f32], &[1], &device).unwrap()).unwrap();
        let mut opt = AdamW::new(0.1, 0.9, 0.999, 1e-8, 0.0);

        // Minimize (w - 3)^2 with the analytic gradient 2 (w - 3).
        for _ in 0..200 {
            let wv = w.as_tensor().to_vec1::<f32>().unwrap()[0];
            let grad = Tensor::from_vec(vec![2.0 * (wv - 3.0)], &[1], &device).unwrap();
            opt.step();
            opt.update("w", &w, &grad).unwrap();
        }

        let wv = w.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((wv - 3.0).abs() < 0.1, "w = {wv}");
    }

    #[test]
    fn test_weight_decay_shrinks_params_without_gradient_signal() {
        let device = Device::Cpu;
        let w = Var::from_tensor(&Tensor::from_vec(vec![10.0f32], &[1], &device).unwrap()).unwrap();
        let mut opt = AdamW::new(0.01, 0.9, 0.999, 1e-8, 0.1);

        let zero_grad = Tensor::from_vec(vec![0.0f32], &[1], &device).unwrap();
        for _ in 0..10 {
            opt.step();
            opt.update("w", &w, &zero_grad).unwrap();
        }

        let wv = w.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!(wv < 10.0 && wv > 9.0, "w = {wv}");
    }

    #[test]
    fn test_set_lr_takes_effect() {
        let mut opt = AdamW::new(1e-4, 0.9, 0.999, 1e-8, 0.0);
        opt.set_lr(5e-5);
        assert_eq!(opt.lr(), 5e-5);
    }
}
