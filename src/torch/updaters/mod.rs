//! Policy updaters and the hooks they run around each optimizer step.
mod ppo;
mod stats;

pub use ppo::{MinibatchLosses, PpoConfig, UpdateError, WaypointPpo};
pub use stats::UpdateStats;

use tch::{Kind, Tensor};

/// Extension points invoked around backpropagation and every optimizer step.
///
/// For each minibatch the update calls, in order:
/// `before_backward`, (backward), `after_backward`, `before_step`, (step), `after_step`.
/// Every hook is called for every minibatch.
pub trait UpdateHooks {
    /// Called with the total loss after the gradients are zeroed.
    fn before_backward(&mut self, _loss: &Tensor) {}
    /// Called with the total loss after its gradients are computed.
    fn after_backward(&mut self, _loss: &Tensor) {}
    fn before_step(&mut self) {}
    fn after_step(&mut self) {}
}

/// No hooks
impl UpdateHooks for () {}

/// Run both hooks, the first before the second.
impl<A: UpdateHooks, B: UpdateHooks> UpdateHooks for (A, B) {
    fn before_backward(&mut self, loss: &Tensor) {
        self.0.before_backward(loss);
        self.1.before_backward(loss);
    }
    fn after_backward(&mut self, loss: &Tensor) {
        self.0.after_backward(loss);
        self.1.after_backward(loss);
    }
    fn before_step(&mut self) {
        self.0.before_step();
        self.1.before_step();
    }
    fn after_step(&mut self) {
        self.0.after_step();
        self.1.after_step();
    }
}

impl<T: UpdateHooks> UpdateHooks for Option<T> {
    fn before_backward(&mut self, loss: &Tensor) {
        if let Some(hooks) = self {
            hooks.before_backward(loss)
        }
    }
    fn after_backward(&mut self, loss: &Tensor) {
        if let Some(hooks) = self {
            hooks.after_backward(loss)
        }
    }
    fn before_step(&mut self) {
        if let Some(hooks) = self {
            hooks.before_step()
        }
    }
    fn after_step(&mut self) {
        if let Some(hooks) = self {
            hooks.after_step()
        }
    }
}

impl<T: UpdateHooks + ?Sized> UpdateHooks for &'_ mut T {
    fn before_backward(&mut self, loss: &Tensor) {
        T::before_backward(self, loss)
    }
    fn after_backward(&mut self, loss: &Tensor) {
        T::after_backward(self, loss)
    }
    fn before_step(&mut self) {
        T::before_step(self)
    }
    fn after_step(&mut self) {
        T::after_step(self)
    }
}

/// Rescale gradients so that their global L2 norm is at most `max_norm`.
///
/// Applied in [`UpdateHooks::before_step`].
#[derive(Debug)]
pub struct ClipGradNorm {
    parameters: Vec<Tensor>,
    max_norm: f64,
    last_norm: Option<f64>,
}

impl ClipGradNorm {
    pub fn new(parameters: Vec<Tensor>, max_norm: f64) -> Self {
        Self {
            parameters,
            max_norm,
            last_norm: None,
        }
    }

    /// Gradient norm measured before the most recent clipping.
    pub const fn last_norm(&self) -> Option<f64> {
        self.last_norm
    }

    /// Clip the current gradients and return their norm before clipping.
    pub fn clip(&mut self) -> f64 {
        let _no_grad = tch::no_grad_guard();
        let grads: Vec<Tensor> = self
            .parameters
            .iter()
            .map(Tensor::grad)
            .filter(Tensor::defined)
            .collect();
        let total_norm = grads
            .iter()
            .map(|g| f64::from(g.square().sum(Kind::Double)))
            .sum::<f64>()
            .sqrt();
        let clip_coef = self.max_norm / (total_norm + 1e-6);
        if clip_coef < 1.0 {
            for mut grad in grads {
                let scaled = &grad * clip_coef;
                grad.copy_(&scaled);
            }
        }
        self.last_norm = Some(total_norm);
        total_norm
    }
}

impl UpdateHooks for ClipGradNorm {
    fn before_step(&mut self) {
        self.clip();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn::VarStore, Device};

    #[derive(Debug, Default)]
    struct Record(Vec<&'static str>);

    impl UpdateHooks for Record {
        fn before_backward(&mut self, _loss: &Tensor) {
            self.0.push("before_backward")
        }
        fn after_backward(&mut self, _loss: &Tensor) {
            self.0.push("after_backward")
        }
        fn before_step(&mut self) {
            self.0.push("before_step")
        }
        fn after_step(&mut self) {
            self.0.push("after_step")
        }
    }

    #[test]
    fn pair_runs_both_in_order() {
        let mut hooks = (Record::default(), Some(Record::default()));
        let loss = Tensor::of_slice(&[1.0_f32]);
        hooks.before_backward(&loss);
        hooks.after_backward(&loss);
        hooks.before_step();
        hooks.after_step();
        let expected = ["before_backward", "after_backward", "before_step", "after_step"];
        assert_eq!(hooks.0 .0, expected);
        assert_eq!(hooks.1.unwrap().0, expected);
    }

    fn grad_setup(scale: f64) -> (VarStore, Tensor) {
        let vs = VarStore::new(Device::Cpu);
        let x = vs.root().ones("x", &[4]);
        // d/dx sum(scale * x) = scale
        (&x * scale).sum(Kind::Float).backward();
        (vs, x)
    }

    #[test]
    fn clips_large_gradients() {
        let (vs, x) = grad_setup(3.0);
        let mut clip = ClipGradNorm::new(vs.trainable_variables(), 0.5);
        clip.before_step();
        assert!((clip.last_norm().unwrap() - 6.0).abs() < 1e-6);
        let clipped_norm = f64::from(x.grad().norm());
        assert!((clipped_norm - 0.5).abs() < 1e-4);
    }

    #[test]
    fn small_gradients_are_untouched() {
        let (vs, x) = grad_setup(0.1);
        let mut clip = ClipGradNorm::new(vs.trainable_variables(), 0.5);
        clip.before_step();
        assert!((x.grad().double_value(&[0]) - 0.1).abs() < 1e-6);
    }
}
