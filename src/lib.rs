//! Core library for the lab_sequencer application.
//!
//! This library runs ordered sequences of measurement procedures against a
//! pool of shared laboratory instruments. A [`sequence::SequenceSpec`] is
//! expanded into a [`sequence::RunPlan`] of concrete procedure instances
//! (overrides applied, sweeps unrolled), and the [`sequence::SequenceEngine`]
//! executes them one at a time. Each step acquires its instruments from the
//! [`instrument::InstrumentManager`], which opens every physical resource once
//! per run and keeps it open across steps until the run ends.
//!
//! Results leave the engine as a stream of [`sequence::SequenceEvent`]s that a
//! [`storage::ResultSink`] turns into files or keeps in memory.

pub mod config;
pub mod error;
pub mod error_recovery;
pub mod instrument;
pub mod logging;
pub mod parameter;
pub mod procedure;
pub mod procedures;
pub mod sequence;
pub mod storage;

pub use error::{AppResult, DaqError};
pub use sequence::{SequenceEngine, SequenceSpec, StepTemplate};
