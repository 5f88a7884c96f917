//! Noise schedules for diffusion sampling
//!
//! Precomputed beta/alpha tables, the inference timestep sequence, and
//! sigma-space schedule conversions shared across samplers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("train step count must be at least 2, got {0}")]
    InvalidTrainSteps(usize),

    #[error("inference step count must be at least 1, got {0}")]
    InvalidStepCount(usize),

    #[error("inference steps ({inference}) exceed train steps ({train})")]
    TooManySteps { inference: usize, train: usize },

    #[error("beta range must be positive, got {start}..{end}")]
    InvalidBetaRange { start: f64, end: f64 },

    #[error("karras remap requires at least 2 steps, got {0}")]
    InvalidKarrasSteps(usize),

    #[error("sigma sequence is empty")]
    EmptySigmas,
}

/// Evenly spaced values over an inclusive range.
///
/// Requires at least two points so both endpoints are representable.
pub fn linspace(start: f64, end: f64, count: usize) -> Vec<f64> {
    assert!(count >= 2, "linspace requires at least 2 points, got {count}");
    let scale = (end - start) / (count - 1) as f64;
    (0..count).map(|i| start + scale * i as f64).collect()
}

// ============================================================================
// Schedule Configuration
// ============================================================================

/// How beta ranges from its minimum to its maximum over training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BetaSchedule {
    /// Linear interpolation between the endpoints.
    Linear,
    /// Linear interpolation in sqrt space, squared elementwise (SD 1.x).
    #[default]
    ScaledLinear,
}

/// Noise schedule configuration
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Number of training timesteps
    pub num_train_steps: usize,
    /// Beta interpolation used during training
    pub beta_schedule: BetaSchedule,
    /// Value of beta at the start of training
    pub beta_start: f64,
    /// Value of beta at the end of training
    pub beta_end: f64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            num_train_steps: 1000,
            beta_schedule: BetaSchedule::ScaledLinear,
            beta_start: 0.00085,
            beta_end: 0.012,
        }
    }
}

/// Precomputed noise schedule values
///
/// All tables have length `num_train_steps` and are indexed by training
/// timestep. Derivation runs in f64; tables are stored as f32 to match the
/// tensor payloads they scale.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    num_train_steps: usize,
    betas: Vec<f32>,
    alphas: Vec<f32>,
    alphas_cumprod: Vec<f32>,
    alpha_t: Vec<f32>,
    sigma_t: Vec<f32>,
    lambda_t: Vec<f32>,
}

impl NoiseSchedule {
    /// Build the schedule tables from a configuration.
    pub fn new(config: ScheduleConfig) -> Result<Self, ScheduleError> {
        if config.num_train_steps < 2 {
            return Err(ScheduleError::InvalidTrainSteps(config.num_train_steps));
        }
        if config.beta_start <= 0.0 || config.beta_end <= 0.0 {
            return Err(ScheduleError::InvalidBetaRange {
                start: config.beta_start,
                end: config.beta_end,
            });
        }

        let n = config.num_train_steps;
        let betas: Vec<f64> = match config.beta_schedule {
            BetaSchedule::Linear => linspace(config.beta_start, config.beta_end, n),
            BetaSchedule::ScaledLinear => {
                linspace(config.beta_start.sqrt(), config.beta_end.sqrt(), n)
                    .into_iter()
                    .map(|b| b * b)
                    .collect()
            }
        };
        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();

        // Cumulative product
        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut cumprod = 1.0f64;
        for alpha in &alphas {
            cumprod *= alpha;
            alphas_cumprod.push(cumprod);
        }

        let alpha_t: Vec<f64> = alphas_cumprod.iter().map(|c| c.sqrt()).collect();
        let sigma_t: Vec<f64> = alphas_cumprod.iter().map(|c| (1.0 - c).sqrt()).collect();
        let lambda_t: Vec<f64> = alpha_t
            .iter()
            .zip(&sigma_t)
            .map(|(a, s)| a.ln() - s.ln())
            .collect();

        let narrow = |values: Vec<f64>| values.into_iter().map(|v| v as f32).collect();
        Ok(Self {
            num_train_steps: n,
            betas: narrow(betas),
            alphas: narrow(alphas),
            alphas_cumprod: narrow(alphas_cumprod),
            alpha_t: narrow(alpha_t),
            sigma_t: narrow(sigma_t),
            lambda_t: narrow(lambda_t),
        })
    }

    /// Number of training timesteps the tables cover.
    pub fn num_train_steps(&self) -> usize {
        self.num_train_steps
    }

    /// Per-timestep noise variances.
    pub fn betas(&self) -> &[f32] {
        &self.betas
    }

    /// Per-timestep signal retention: 1 - beta.
    pub fn alphas(&self) -> &[f32] {
        &self.alphas
    }

    /// Cumulative product of alphas: ᾱₜ, strictly decreasing.
    pub fn alphas_cumprod(&self) -> &[f32] {
        &self.alphas_cumprod
    }

    /// sqrt(ᾱₜ), the cumulative signal scale.
    pub fn alpha_t(&self) -> &[f32] {
        &self.alpha_t
    }

    /// sqrt(1 - ᾱₜ), the cumulative noise scale.
    pub fn sigma_t(&self) -> &[f32] {
        &self.sigma_t
    }

    /// Log signal-to-noise ratio: ln αₜ - ln σₜ.
    pub fn lambda_t(&self) -> &[f32] {
        &self.lambda_t
    }

    /// ln σₜ, the table expected by [`convert_to_timesteps`].
    pub fn log_sigmas(&self) -> Vec<f32> {
        self.sigma_t.iter().map(|s| s.ln()).collect()
    }
}

/// Inference timestep sequence for pseudo linear multistep sampling.
///
/// Forward indices sample the training range uniformly (rounded, offset by
/// one); the penultimate entry is duplicated before reversal so the solver
/// can run one extra correction step at the boundary. Length is
/// `num_inference_steps + 1`, consumed highest timestep first.
pub fn plms_timesteps(num_inference_steps: usize, num_train_steps: usize) -> Vec<usize> {
    let ratio = num_train_steps as f64 / num_inference_steps as f64;
    let forward: Vec<usize> = (0..num_inference_steps)
        .map(|i| (i as f64 * ratio).round() as usize + 1)
        .collect();

    let mut steps = if forward.len() > 1 {
        let mut steps = forward[..forward.len() - 1].to_vec();
        let boundary = steps[steps.len() - 1];
        steps.push(boundary);
        steps.push(forward[forward.len() - 1]);
        steps
    } else {
        vec![forward[0], forward[0]]
    };
    steps.reverse();
    steps
}

// ============================================================================
// Sigma Conversions
// ============================================================================

/// Remap a sigma sequence onto the Karras spacing (rho = 7).
///
/// Concentrates steps near small sigma. The input may be ascending or
/// descending; endpoints are taken from its extrema.
pub fn convert_to_karras(sigmas: &[f32], step_count: usize) -> Result<Vec<f32>, ScheduleError> {
    const RHO: f32 = 7.0;

    if step_count < 2 {
        return Err(ScheduleError::InvalidKarrasSteps(step_count));
    }
    if sigmas.is_empty() {
        return Err(ScheduleError::EmptySigmas);
    }

    let sigma_min = sigmas.iter().copied().fold(f32::INFINITY, f32::min);
    let sigma_max = sigmas.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let min_inv_rho = sigma_min.powf(1.0 / RHO);
    let max_inv_rho = sigma_max.powf(1.0 / RHO);

    Ok(linspace(0.0, 1.0, step_count)
        .into_iter()
        .map(|ramp| (max_inv_rho + ramp as f32 * (min_inv_rho - max_inv_rho)).powf(RHO))
        .collect())
}

/// Interpolate continuous pseudo-timesteps for a sigma sequence.
///
/// Each sigma's log is bracketed by the highest `log_sigmas` entry it meets
/// or exceeds (clamped to the table) and mapped to a fractional index by
/// linear interpolation. Used by samplers parameterized in sigma rather than
/// discrete timestep.
pub fn convert_to_timesteps(sigmas: &[f32], log_sigmas: &[f32]) -> Vec<f32> {
    assert!(
        log_sigmas.len() >= 2,
        "timestep interpolation requires at least 2 log-sigmas, got {}",
        log_sigmas.len()
    );
    sigmas
        .iter()
        .map(|&sigma| {
            let log_sigma = sigma.ln();
            let mut low_idx = 0;
            for (i, &log_entry) in log_sigmas[..log_sigmas.len() - 1].iter().enumerate() {
                if log_sigma >= log_entry {
                    low_idx = i;
                }
            }
            let high_idx = low_idx + 1;

            let low = log_sigmas[low_idx];
            let high = log_sigmas[high_idx];
            let weight = ((low - log_sigma) / (low - high)).clamp(0.0, 1.0);
            (1.0 - weight) * low_idx as f32 + weight * high_idx as f32
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linspace_endpoints() {
        let values = linspace(0.1, 0.2, 10);
        assert_eq!(values.len(), 10);
        assert!((values[0] - 0.1).abs() < 1e-12);
        assert!((values[9] - 0.2).abs() < 1e-12);
        for pair in values.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    #[should_panic]
    fn test_linspace_rejects_single_point() {
        linspace(0.0, 1.0, 1);
    }

    #[test]
    fn test_scaled_linear_is_squared_sqrt_space() {
        let schedule = NoiseSchedule::new(ScheduleConfig {
            num_train_steps: 100,
            ..ScheduleConfig::default()
        })
        .unwrap();
        let sqrt_space = linspace(0.00085f64.sqrt(), 0.012f64.sqrt(), 100);
        for (beta, value) in schedule.betas().iter().zip(sqrt_space) {
            assert!((*beta as f64 - value * value).abs() < 1e-9);
        }
    }

    #[test]
    fn test_cumprod_strictly_decreasing() {
        let schedule = NoiseSchedule::new(ScheduleConfig::default()).unwrap();
        let cumprod = schedule.alphas_cumprod();
        assert_eq!(cumprod[0], schedule.alphas()[0]);
        for pair in cumprod.windows(2) {
            assert!(pair[1] < pair[0]);
        }
    }

    #[test]
    fn test_plms_timesteps_default_shape() {
        let steps = plms_timesteps(50, 1000);
        assert_eq!(steps.len(), 51);
        assert_eq!(&steps[..4], &[981, 961, 961, 941]);
        assert_eq!(&steps[48..], &[41, 21, 1]);
        assert!(steps.iter().all(|&t| (1..=1000).contains(&t)));
    }

    #[test]
    fn test_plms_timesteps_duplicated_boundary() {
        let steps = plms_timesteps(2, 10);
        assert_eq!(steps, vec![6, 1, 1]);
        let reversed: Vec<usize> = steps.iter().rev().copied().collect();
        assert_eq!(reversed[0], reversed[1]);
    }

    #[test]
    fn test_plms_timesteps_single_step() {
        assert_eq!(plms_timesteps(1, 10), vec![1, 1]);
    }

    #[test]
    fn test_schedule_rejects_bad_config() {
        let degenerate = NoiseSchedule::new(ScheduleConfig {
            num_train_steps: 1,
            ..ScheduleConfig::default()
        });
        assert!(matches!(degenerate, Err(ScheduleError::InvalidTrainSteps(1))));

        let negative = NoiseSchedule::new(ScheduleConfig {
            beta_start: 0.0,
            ..ScheduleConfig::default()
        });
        assert!(matches!(negative, Err(ScheduleError::InvalidBetaRange { .. })));
    }

    #[test]
    fn test_karras_endpoints_and_order() {
        let sigmas = convert_to_karras(&[0.0292, 14.6146], 5).unwrap();
        assert_eq!(sigmas.len(), 5);
        assert!((sigmas[0] - 14.6146).abs() < 1e-3);
        assert!((sigmas[4] - 0.0292).abs() < 1e-5);
        for pair in sigmas.windows(2) {
            assert!(pair[1] < pair[0]);
        }
    }

    #[test]
    fn test_karras_rejects_degenerate_input() {
        assert!(matches!(
            convert_to_karras(&[1.0, 2.0], 1),
            Err(ScheduleError::InvalidKarrasSteps(1))
        ));
        assert!(matches!(
            convert_to_karras(&[], 5),
            Err(ScheduleError::EmptySigmas)
        ));
    }

    #[test]
    fn test_convert_to_timesteps_grid_and_clamping() {
        let schedule = NoiseSchedule::new(ScheduleConfig {
            num_train_steps: 10,
            beta_schedule: BetaSchedule::Linear,
            beta_start: 0.1,
            beta_end: 0.2,
        })
        .unwrap();
        let log_sigmas = schedule.log_sigmas();

        // grid points map to whole indices
        let on_grid = convert_to_timesteps(&[schedule.sigma_t()[3]], &log_sigmas);
        assert!((on_grid[0] - 3.0).abs() < 1e-4);

        // values outside the table clamp to the ends
        let clamped = convert_to_timesteps(
            &[schedule.sigma_t()[0] * 0.5, schedule.sigma_t()[9] * 2.0],
            &log_sigmas,
        );
        assert!((clamped[0] - 0.0).abs() < 1e-6);
        assert!((clamped[1] - 9.0).abs() < 1e-6);
    }
}
