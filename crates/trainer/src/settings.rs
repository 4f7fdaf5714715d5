//! Training parameters for the patch-wise fast trainer.
//!
//! Field names on the wire are the human-readable labels the remote worker
//! expects, e.g. `"Patch height"`. Any field omitted from a JSON settings
//! document takes its default.

use hpc_core::{SettingValue, Settings};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::TrainerError;

pub const DEFAULT_MAX_EPOCHS: i64 = 10;
pub const DEFAULT_PATCH_SIZE: i64 = 256;
pub const DEFAULT_MAX_TIME: &str = "0-03:00";
pub const DEFAULT_MAX_MEMORY_MB: i64 = 3072;
pub const DEFAULT_CPUS: i64 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TrainingSettings {
    #[serde(rename = "Maximum number of training epochs")]
    #[validate(range(min = 1))]
    pub max_epochs: i64,

    #[serde(rename = "Patch height")]
    #[validate(range(min = 64))]
    pub patch_height: i64,

    #[serde(rename = "Patch width")]
    #[validate(range(min = 64))]
    pub patch_width: i64,

    /// Wall-clock limit for the remote job, formatted `D-HH:MM`.
    #[serde(rename = "Maximum time (D-HH:MM)")]
    #[validate(custom(function = "validate_time_limit"))]
    pub max_time: String,

    #[serde(rename = "Maximum memory (MB)")]
    #[validate(range(min = 1024))]
    pub max_memory_mb: i64,

    #[serde(rename = "CPUs")]
    #[validate(range(min = 1))]
    pub cpus: i64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            max_epochs: DEFAULT_MAX_EPOCHS,
            patch_height: DEFAULT_PATCH_SIZE,
            patch_width: DEFAULT_PATCH_SIZE,
            max_time: DEFAULT_MAX_TIME.to_string(),
            max_memory_mb: DEFAULT_MAX_MEMORY_MB,
            cpus: DEFAULT_CPUS,
        }
    }
}

impl TrainingSettings {
    /// Validate and return `self`, so construction can be chained.
    pub fn checked(self) -> Result<Self, TrainerError> {
        self.validate()?;
        Ok(self)
    }

    /// The settings object sent in the request envelope.
    pub fn to_wire(&self) -> Settings {
        Settings::from([
            (
                "Maximum number of training epochs".to_string(),
                SettingValue::from(self.max_epochs),
            ),
            ("Patch height".to_string(), SettingValue::from(self.patch_height)),
            ("Patch width".to_string(), SettingValue::from(self.patch_width)),
            (
                "Maximum time (D-HH:MM)".to_string(),
                SettingValue::from(self.max_time.as_str()),
            ),
            (
                "Maximum memory (MB)".to_string(),
                SettingValue::from(self.max_memory_mb),
            ),
            ("CPUs".to_string(), SettingValue::from(self.cpus)),
        ])
    }
}

/// Accepts `D-HH:MM` with any number of day digits, hours below 24 and
/// minutes below 60.
fn validate_time_limit(value: &str) -> Result<(), ValidationError> {
    if parse_time_limit(value).is_some() {
        Ok(())
    } else {
        let mut error = ValidationError::new("time_limit");
        error.message = Some("expected D-HH:MM".into());
        Err(error)
    }
}

/// Split a `D-HH:MM` limit into days, hours and minutes.
fn parse_time_limit(value: &str) -> Option<(u32, u32, u32)> {
    let (days, clock) = value.split_once('-')?;
    let (hours, minutes) = clock.split_once(':')?;

    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(days) || hours.len() != 2 || minutes.len() != 2 {
        return None;
    }
    if !all_digits(hours) || !all_digits(minutes) {
        return None;
    }

    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    if hours >= 24 || minutes >= 60 {
        return None;
    }
    Some((days.parse().ok()?, hours, minutes))
}
