//! Finite-difference gradients over adapter-selected parameter subsets.

use super::mh::TargetDensity;
use crate::utils::usize_to_f64;

/// Exposes a scalar-parameter view of a model so gradient and HMC code
/// stays independent of the concrete parameter layout.
pub trait ParameterAdapter<M> {
    fn size(&self, model: &M) -> usize;
    fn get(&self, model: &M, index: usize) -> f64;
    fn set(&self, model: &mut M, index: usize, value: f64);

    /// Bring derived state up to date after a batch of `set` calls.
    fn prepare(&self, _model: &mut M) {}
}

/// Gradient of a log target density with respect to adapter parameters.
pub trait GradientEstimator<M> {
    fn gradient(&self, model: &M) -> Vec<f64>;
}

/// Per-parameter finite-difference step sizes: `max(floor, |value| / 100)`.
#[must_use]
pub fn estimated_step_sizes<M, A>(model: &M, adapter: &A, floor: f64) -> Vec<f64>
where
    A: ParameterAdapter<M>,
{
    (0..adapter.size(model))
        .map(|index| (adapter.get(model, index).abs() / 100.0).max(floor))
        .collect()
}

/// Central finite differences over every adapter parameter.
///
/// `threads > 1` partitions the parameter index range into contiguous
/// per-thread slices; partial derivatives are assembled in index order, so
/// the result is identical for any thread count.
pub struct FiniteDifferenceGradient<'a, T, A> {
    target: &'a T,
    adapter: &'a A,
    step_sizes: Vec<f64>,
    estimate_steps: bool,
    threads: usize,
}

impl<'a, T, A> FiniteDifferenceGradient<'a, T, A> {
    #[must_use]
    pub const fn new(target: &'a T, adapter: &'a A, step_sizes: Vec<f64>) -> Self {
        Self {
            target,
            adapter,
            step_sizes,
            estimate_steps: false,
            threads: 1,
        }
    }

    /// Derive step sizes from current parameter magnitudes on each call.
    #[must_use]
    pub const fn with_estimated_steps(mut self, estimate: bool) -> Self {
        self.estimate_steps = estimate;
        self
    }

    #[must_use]
    pub const fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    fn partial<M>(&self, model: &M, index: usize, step: f64) -> f64
    where
        M: Clone,
        T: TargetDensity<M>,
        A: ParameterAdapter<M>,
    {
        let value = self.adapter.get(model, index);

        let mut upper = model.clone();
        self.adapter.set(&mut upper, index, value + step);
        self.adapter.prepare(&mut upper);

        let mut lower = model.clone();
        self.adapter.set(&mut lower, index, value - step);
        self.adapter.prepare(&mut lower);

        (self.target.log_density(&upper) - self.target.log_density(&lower)) / (2.0 * step)
    }
}

impl<M, T, A> GradientEstimator<M> for FiniteDifferenceGradient<'_, T, A>
where
    M: Clone + Sync,
    T: TargetDensity<M> + Sync,
    A: ParameterAdapter<M> + Sync,
{
    fn gradient(&self, model: &M) -> Vec<f64> {
        let size = self.adapter.size(model);
        let steps: Vec<f64> = if self.estimate_steps {
            let floor = self.step_sizes.first().copied().unwrap_or(1.0e-6);
            estimated_step_sizes(model, self.adapter, floor)
        } else {
            debug_assert_eq!(self.step_sizes.len(), size);
            self.step_sizes.clone()
        };

        if self.threads <= 1 || size < 2 {
            return (0..size)
                .map(|index| self.partial(model, index, steps[index]))
                .collect();
        }

        let threads = self.threads.min(size);
        let chunk = size.div_ceil(threads);
        let mut parts: Vec<(usize, Vec<f64>)> = Vec::with_capacity(threads);
        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(threads);
            let mut start = 0;
            while start < size {
                let end = (start + chunk).min(size);
                let steps = &steps;
                handles.push(scope.spawn(move || {
                    let values: Vec<f64> = (start..end)
                        .map(|index| self.partial(model, index, steps[index]))
                        .collect();
                    (start, values)
                }));
                start = end;
            }
            for handle in handles {
                if let Ok(part) = handle.join() {
                    parts.push(part);
                }
            }
        });

        let mut gradient = vec![0.0; size];
        for (start, values) in parts {
            gradient[start..start + values.len()].copy_from_slice(&values);
        }
        gradient
    }
}

/// Simple quadratic-magnitude guard used by tests and seeding.
#[must_use]
pub fn gradient_norm(gradient: &[f64]) -> f64 {
    (gradient.iter().map(|g| g * g).sum::<f64>() / usize_to_f64(gradient.len()).max(1.0)).sqrt()
}
