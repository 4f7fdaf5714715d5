//! The "Training model for Patchwise Analysis of Music Document" task.
//!
//! Reads one image and five layer masks, offloads training to the HPC
//! worker pool and writes back one model per layer class.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use hpc_core::NamedBlobs;
use hpc_dispatch::JobRunner;
use validator::Validate;

use crate::error::TrainerError;
use crate::files;
use crate::settings::TrainingSettings;

/// An input port and the envelope key its file travels under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputPort {
    pub name: &'static str,
    pub wire_key: &'static str,
}

pub const INPUT_PORTS: [InputPort; 6] = [
    InputPort {
        name: "Image",
        wire_key: "Image",
    },
    InputPort {
        name: "rgba PNG - Background layer",
        wire_key: "Background",
    },
    InputPort {
        name: "rgba PNG - Music symbol layer",
        wire_key: "Music Layer",
    },
    InputPort {
        name: "rgba PNG - Staff lines layer",
        wire_key: "Staff Layer",
    },
    InputPort {
        name: "rgba PNG - Text",
        wire_key: "Text",
    },
    InputPort {
        name: "rgba PNG - Selected regions",
        wire_key: "Selected Regions",
    },
];

/// Output ports. Each name is also the response field holding the model.
pub const OUTPUT_PORTS: [&str; 4] = [
    "Background Model",
    "Music Symbol Model",
    "Staff Lines Model",
    "Text Model",
];

/// File name used for an output port when writing into a directory,
/// e.g. `"Staff Lines Model"` becomes `staff_lines_model.hdf5`.
pub fn output_file_name(port: &str) -> String {
    format!("{}.hdf5", port.to_ascii_lowercase().replace(' ', "_"))
}

/// Map every output port to a file inside `dir`.
pub fn output_paths_in(dir: &Path) -> BTreeMap<String, PathBuf> {
    OUTPUT_PORTS
        .iter()
        .map(|port| (port.to_string(), dir.join(output_file_name(port))))
        .collect()
}

pub struct FastTrainer {
    runner: JobRunner,
}

impl FastTrainer {
    pub fn new(runner: JobRunner) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    /// Run one training job.
    ///
    /// `inputs` and `outputs` map port names to file paths. Every port must
    /// be present; this is checked, along with the settings, before any
    /// file is read or anything is published. Output files are written only
    /// once the full response has been received and decoded.
    pub async fn run(
        &self,
        inputs: &BTreeMap<String, PathBuf>,
        settings: &TrainingSettings,
        outputs: &BTreeMap<String, PathBuf>,
    ) -> Result<(), TrainerError> {
        settings.validate()?;

        let input_paths = INPUT_PORTS
            .iter()
            .map(|port| require_port(inputs, port.name).map(|path| (port.wire_key, path)))
            .collect::<Result<Vec<_>, TrainerError>>()?;
        let output_paths = OUTPUT_PORTS
            .iter()
            .map(|port| require_port(outputs, port).map(|path| (*port, path)))
            .collect::<Result<Vec<_>, TrainerError>>()?;

        let mut blobs = NamedBlobs::new();
        for (wire_key, path) in input_paths {
            blobs.insert(wire_key.to_string(), files::read_blob(path).await?);
        }
        let input_bytes: usize = blobs.values().map(Vec::len).sum();
        tracing::info!(inputs = blobs.len(), input_bytes, "Submitting training job");

        let mut models = self
            .runner
            .run_job(&blobs, &settings.to_wire(), &OUTPUT_PORTS)
            .await?;

        for (port, path) in output_paths {
            let bytes = models
                .remove(port)
                .ok_or_else(|| TrainerError::MissingPort(port.to_string()))?;
            files::write_blob(path, &bytes).await?;
            tracing::info!(port, path = %path.display(), bytes = bytes.len(), "Model written");
        }

        Ok(())
    }
}

fn require_port<'a>(
    paths: &'a BTreeMap<String, PathBuf>,
    port: &str,
) -> Result<&'a Path, TrainerError> {
    paths
        .get(port)
        .map(PathBuf::as_path)
        .ok_or_else(|| TrainerError::MissingPort(port.to_string()))
}
