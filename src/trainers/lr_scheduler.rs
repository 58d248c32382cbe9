//! Learning-rate schedules, stepped once per optimizer step.

use anyhow::{bail, Result};

pub trait LrScheduler: Send {
    fn get_lr(&self, step: usize) -> f64;
}

pub fn create_scheduler(
    kind: &str,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
) -> Result<Box<dyn LrScheduler>> {
    match kind {
        "constant" => Ok(Box::new(ConstantSchedule { base_lr, warmup_steps })),
        "linear" => Ok(Box::new(LinearSchedule { base_lr, warmup_steps, total_steps })),
        "cosine" => Ok(Box::new(CosineSchedule { base_lr, warmup_steps, total_steps })),
        other => bail!("unknown lr scheduler `{other}` (expected constant, linear or cosine)"),
    }
}

fn warmup_factor(step: usize, warmup_steps: usize) -> f64 {
    if warmup_steps == 0 || step >= warmup_steps {
        1.0
    } else {
        step as f64 / warmup_steps as f64
    }
}

fn progress(step: usize, warmup_steps: usize, total_steps: usize) -> f64 {
    let span = total_steps.saturating_sub(warmup_steps).max(1);
    let done = step.saturating_sub(warmup_steps).min(span);
    done as f64 / span as f64
}

struct ConstantSchedule {
    base_lr: f64,
    warmup_steps: usize,
}

impl LrScheduler for ConstantSchedule {
    fn get_lr(&self, step: usize) -> f64 {
        self.base_lr * warmup_factor(step, self.warmup_steps)
    }
}

struct LinearSchedule {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl LrScheduler for LinearSchedule {
    fn get_lr(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * warmup_factor(step, self.warmup_steps);
        }
        self.base_lr * (1.0 - progress(step, self.warmup_steps, self.total_steps))
    }
}

struct CosineSchedule {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl LrScheduler for CosineSchedule {
    fn get_lr(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * warmup_factor(step, self.warmup_steps);
        }
        let p = progress(step, self.warmup_steps, self.total_steps);
        self.base_lr * ((p * std::f64::consts::PI).cos() + 1.0) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_ignores_progress() {
        let s = create_scheduler("constant", 1e-4, 0, 1000).unwrap();
        assert_eq!(s.get_lr(0), 1e-4);
        assert_eq!(s.get_lr(999), 1e-4);
    }

    #[test]
    fn test_warmup_ramps_from_zero() {
        let s = create_scheduler("linear", 1.0, 10, 100).unwrap();
        assert_eq!(s.get_lr(0), 0.0);
        assert!((s.get_lr(5) - 0.5).abs() < 1e-9);
        assert!((s.get_lr(10) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_linear_decays_to_zero() {
        let s = create_scheduler("linear", 1.0, 0, 100).unwrap();
        assert!((s.get_lr(50) - 0.5).abs() < 1e-9);
        assert_eq!(s.get_lr(100), 0.0);
        // Past the end the schedule stays clamped at zero.
        assert_eq!(s.get_lr(500), 0.0);
    }

    #[test]
    fn test_cosine_halfway_point() {
        let s = create_scheduler("cosine", 1.0, 0, 100).unwrap();
        assert!((s.get_lr(0) - 1.0).abs() < 1e-9);
        assert!((s.get_lr(50) - 0.5).abs() < 1e-9);
        assert!(s.get_lr(100) < 1e-9);
    }

    #[test]
    fn test_unknown_scheduler_is_rejected() {
        assert!(create_scheduler("polynomial", 1.0, 0, 100).is_err());
    }
}
