//! PLMS (pseudo linear multistep) sampler
//!
//! Integrates the reverse diffusion ODE with Adams-Bashforth style
//! combinations of past noise predictions, bootstrapped by an extra
//! correction step across the duplicated boundary timestep.

use std::collections::VecDeque;

use burn::prelude::*;

use crate::ops::weighted_sum;
use crate::sampler::DiffusionSampler;
use crate::scheduler::{plms_timesteps, NoiseSchedule, ScheduleError};

/// History entries kept for the multistep formulas.
const HISTORY_CAPACITY: usize = 4;

/// Model prediction type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PredictionType {
    /// Model predicts the noise added to the sample
    #[default]
    Epsilon,
    /// Model predicts the velocity v = αₜ·ε - σₜ·x₀
    VPrediction,
}

/// Configuration for the PLMS sampler
#[derive(Debug, Clone)]
pub struct PlmsConfig {
    /// Number of inference steps
    pub num_inference_steps: usize,
    /// Quantity the model was trained to predict
    pub prediction_type: PredictionType,
}

impl Default for PlmsConfig {
    fn default() -> Self {
        Self {
            num_inference_steps: 50,
            prediction_type: PredictionType::Epsilon,
        }
    }
}

/// PLMS sampler
///
/// Pseudo linear multistep solver for the reverse diffusion process. Keeps a
/// bounded history of noise predictions and selects a first- through
/// fourth-order update from it; the first two calls share one transition
/// (seed, then averaged correction) because no history exists yet to
/// bootstrap the multistep formulas.
pub struct PlmsSampler<B: Backend, const D: usize = 4> {
    config: PlmsConfig,
    schedule: NoiseSchedule,
    timesteps: Vec<usize>,
    init_noise_sigma: f32,
    /// Step calls made since construction or the last reset.
    counter: usize,
    /// Past noise predictions, newest first.
    ets: VecDeque<Tensor<B, D>>,
    /// Sample held over while the boundary correction step replays it.
    cur_sample: Option<Tensor<B, D>>,
    /// Converted denoised-sample estimates, one per step call.
    model_outputs: Vec<Tensor<B, D>>,
}

impl<B: Backend, const D: usize> PlmsSampler<B, D> {
    /// Create a new PLMS sampler over a precomputed schedule.
    pub fn new(schedule: NoiseSchedule, config: PlmsConfig) -> Result<Self, ScheduleError> {
        if config.num_inference_steps == 0 {
            return Err(ScheduleError::InvalidStepCount(config.num_inference_steps));
        }
        if config.num_inference_steps > schedule.num_train_steps() {
            return Err(ScheduleError::TooManySteps {
                inference: config.num_inference_steps,
                train: schedule.num_train_steps(),
            });
        }

        let timesteps = plms_timesteps(config.num_inference_steps, schedule.num_train_steps());
        Ok(Self {
            config,
            schedule,
            timesteps,
            init_noise_sigma: 1.0,
            counter: 0,
            ets: VecDeque::with_capacity(HISTORY_CAPACITY),
            cur_sample: None,
            model_outputs: Vec::new(),
        })
    }

    /// Schedule tables backing this sampler.
    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    /// Converted denoised-sample estimates, one per `step` call.
    pub fn model_outputs(&self) -> &[Tensor<B, D>] {
        &self.model_outputs
    }

    /// Step calls made since construction or the last reset.
    pub fn counter(&self) -> usize {
        self.counter
    }

    /// Clear multistep state so the instance can serve a fresh run.
    pub fn reset(&mut self) {
        self.counter = 0;
        self.ets.clear();
        self.cur_sample = None;
        self.model_outputs.clear();
    }

    /// History entry `n` steps back from the most recent prediction.
    fn ets_back(&self, n: usize) -> &Tensor<B, D> {
        &self.ets[n - 1]
    }

    /// First index of the timestep suffix covering `strength` of the run.
    fn start_step(&self, strength: f32) -> usize {
        let steps = self.config.num_inference_steps;
        let skipped = (steps as f32 * strength).round() as isize;
        (steps as isize - skipped).max(0) as usize
    }

    /// Denoised-sample estimate recovered from a raw model prediction.
    fn convert_model_output(
        &self,
        model_output: &Tensor<B, D>,
        timestep: usize,
        sample: &Tensor<B, D>,
    ) -> Tensor<B, D> {
        assert!(
            timestep < self.schedule.num_train_steps(),
            "timestep {timestep} outside the training schedule"
        );
        assert_eq!(
            model_output.dims(),
            sample.dims(),
            "prediction and sample shapes differ"
        );

        let alpha_t = self.schedule.alpha_t()[timestep];
        let sigma_t = self.schedule.sigma_t()[timestep];
        match self.config.prediction_type {
            PredictionType::Epsilon => {
                (sample.clone() - model_output.clone() * sigma_t) / alpha_t
            }
            PredictionType::VPrediction => sample.clone() * alpha_t - model_output.clone() * sigma_t,
        }
    }

    /// Closed-form previous-step sample, formula (9) of the PNDM paper.
    fn previous_sample(
        &self,
        sample: &Tensor<B, D>,
        timestep: usize,
        prev_step: isize,
        denoised: &Tensor<B, D>,
    ) -> Tensor<B, D> {
        let alphas_cumprod = self.schedule.alphas_cumprod();
        let alpha_prod_t = alphas_cumprod[timestep];
        // the final transition steps past index zero; clamp the lookup
        let alpha_prod_prev = alphas_cumprod[prev_step.max(0) as usize];

        let sample_coeff = (alpha_prod_prev / alpha_prod_t).sqrt();
        let denom = alpha_prod_t * (1.0 - alpha_prod_prev).sqrt()
            + (alpha_prod_t * (1.0 - alpha_prod_t) * alpha_prod_prev).sqrt();
        let model_coeff = -(alpha_prod_prev - alpha_prod_t) / denom;

        weighted_sum(
            &[sample_coeff, model_coeff],
            &[sample.clone(), denoised.clone()],
        )
    }
}

impl<B: Backend, const D: usize> DiffusionSampler<B, D> for PlmsSampler<B, D> {
    fn train_step_count(&self) -> usize {
        self.schedule.num_train_steps()
    }

    fn inference_step_count(&self) -> usize {
        self.config.num_inference_steps
    }

    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f32 {
        self.init_noise_sigma
    }

    fn step(
        &mut self,
        model_output: Tensor<B, D>,
        timestep: usize,
        sample: Tensor<B, D>,
    ) -> Tensor<B, D> {
        let step_delta = self.schedule.num_train_steps() / self.config.num_inference_steps;
        let mut timestep = timestep;
        let mut prev_step = timestep as isize - step_delta as isize;
        let mut sample = sample;

        if self.counter != 1 {
            // keep the three most recent predictions, then record the new one
            self.ets.truncate(HISTORY_CAPACITY - 1);
            self.ets.push_front(model_output.clone());
        } else {
            // the second call replays the first transition one step later;
            // the history already holds the seed prediction
            prev_step = timestep as isize;
            timestep += step_delta;
        }

        let effective = match (self.ets.len(), self.counter) {
            (1, 0) => {
                // no history yet; hold the sample for the correction replay
                self.cur_sample = Some(sample.clone());
                model_output
            }
            (1, 1) => {
                let effective =
                    weighted_sum(&[0.5, 0.5], &[model_output, self.ets_back(1).clone()]);
                sample = self
                    .cur_sample
                    .take()
                    .expect("sample cached by the first step");
                effective
            }
            (2, _) => weighted_sum(
                &[3.0 / 2.0, -1.0 / 2.0],
                &[self.ets_back(1).clone(), self.ets_back(2).clone()],
            ),
            (3, _) => weighted_sum(
                &[23.0 / 12.0, -16.0 / 12.0, 5.0 / 12.0],
                &[
                    self.ets_back(1).clone(),
                    self.ets_back(2).clone(),
                    self.ets_back(3).clone(),
                ],
            ),
            _ => weighted_sum(
                &[55.0 / 24.0, -59.0 / 24.0, 37.0 / 24.0, -9.0 / 24.0],
                &[
                    self.ets_back(1).clone(),
                    self.ets_back(2).clone(),
                    self.ets_back(3).clone(),
                    self.ets_back(4).clone(),
                ],
            ),
        };

        let denoised = self.convert_model_output(&effective, timestep, &sample);
        self.model_outputs.push(denoised.clone());

        let prev_sample = self.previous_sample(&sample, timestep, prev_step, &denoised);
        self.counter += 1;
        prev_sample
    }

    fn add_noise(
        &self,
        original: &Tensor<B, D>,
        noise: Vec<Tensor<B, D>>,
        strength: f32,
    ) -> Vec<Tensor<B, D>> {
        let timestep = self.timesteps[self.start_step(strength)];
        let alpha_prod = self.schedule.alphas_cumprod()[timestep];
        let signal = alpha_prod.sqrt();
        let spread = (1.0 - alpha_prod).sqrt();

        noise
            .into_iter()
            .map(|noise| weighted_sum(&[signal, spread], &[original.clone(), noise]))
            .collect()
    }

    fn calculate_timesteps(&self, strength: Option<f32>) -> Vec<usize> {
        match strength {
            None => self.timesteps.clone(),
            Some(strength) => self.timesteps[self.start_step(strength)..].to_vec(),
        }
    }
}
