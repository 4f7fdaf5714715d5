//! Offloads patch-wise layout model training for music documents to an
//! HPC worker pool over the job broker.
//!
//! [`FastTrainer`] reads the task's input files, submits them through a
//! [`hpc_dispatch::JobRunner`] and writes the returned models to the
//! requested output paths.

pub mod error;
pub mod files;
pub mod settings;
pub mod task;

pub use error::TrainerError;
pub use settings::TrainingSettings;
pub use task::{output_paths_in, FastTrainer, InputPort, INPUT_PORTS, OUTPUT_PORTS};
