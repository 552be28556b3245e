//! Test lifecycle orchestration and synthetic signal generation.

pub mod generator;
pub mod orchestrator;

pub use generator::{
    GenerationOutcome, GenerationReport, GeneratorError, RecordFactory, SignalGenerator,
};
pub use orchestrator::{RecoverySummary, TaskKind, TestOrchestrator};
