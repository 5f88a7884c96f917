//! Sampler interface shared by scheduler variants

use burn::prelude::*;

/// A diffusion sampling scheduler.
///
/// Drives iterative denoising: each [`step`](DiffusionSampler::step) consumes
/// the network's prediction for the current timestep and produces the sample
/// at the previous (less noisy) timestep. Implementations own their multistep
/// state; one instance serves exactly one sampling run at a time, and
/// concurrent runs require independent instances.
pub trait DiffusionSampler<B: Backend, const D: usize> {
    /// Number of timesteps the underlying model was trained with.
    fn train_step_count(&self) -> usize;

    /// Number of denoising iterations the schedule was built for.
    fn inference_step_count(&self) -> usize;

    /// Timestep sequence, consumed highest (noisiest) first.
    fn timesteps(&self) -> &[usize];

    /// Scale of the initial noise latent.
    fn init_noise_sigma(&self) -> f32;

    /// Hook for variants that rescale the denoising input per timestep.
    fn scale_model_input(&self, sample: Tensor<B, D>, _timestep: usize) -> Tensor<B, D> {
        sample
    }

    /// Advance the sample one step along the denoising trajectory.
    ///
    /// Calls must follow the order of [`timesteps`](DiffusionSampler::timesteps);
    /// out-of-order or repeated calls silently corrupt multistep state.
    fn step(
        &mut self,
        model_output: Tensor<B, D>,
        timestep: usize,
        sample: Tensor<B, D>,
    ) -> Tensor<B, D>;

    /// Noise the original sample up to the trajectory point selected by
    /// `strength`, once per provided noise tensor.
    fn add_noise(
        &self,
        original: &Tensor<B, D>,
        noise: Vec<Tensor<B, D>>,
        strength: f32,
    ) -> Vec<Tensor<B, D>>;

    /// Timesteps for a partial run covering the final `strength` fraction of
    /// the trajectory; the full sequence when `strength` is `None`.
    fn calculate_timesteps(&self, strength: Option<f32>) -> Vec<usize>;
}
