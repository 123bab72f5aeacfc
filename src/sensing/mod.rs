pub mod cadence;
pub mod controller;
pub mod encode;
pub mod frame;
pub mod loop_worker;
pub mod phash;
pub mod thermal;

pub use cadence::{CadenceController, CadenceState, Decision, SkipReason};
pub use controller::{CaptureContext, CaptureStream, SensingController};
pub use encode::RasterEncoder;
pub use frame::{Completion, Frame, InFlightFrame};
pub use loop_worker::{AdmittedFrame, FrameOutcome, FrameProcessor};
pub use phash::{PerceptualHash, PerceptualHasher};
pub use thermal::{CooldownGate, LevelChange, SysinfoThermalSource, ThermalGovernor, ThermalLevel};
