pub mod scheduler;
pub mod ops;
pub mod sampler;
pub mod plms;

pub use scheduler::{
    convert_to_karras, convert_to_timesteps, linspace, plms_timesteps, BetaSchedule, NoiseSchedule,
    ScheduleConfig, ScheduleError,
};
pub use ops::weighted_sum;
pub use sampler::DiffusionSampler;
pub use plms::{PlmsConfig, PlmsSampler, PredictionType};
