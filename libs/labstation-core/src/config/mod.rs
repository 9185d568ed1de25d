//! Configuration loader/validator.
//!
//! Contract: `load(path) -> ValidatedConfig`, `dump(&ValidatedConfig, path)`,
//! `validate(raw) -> Result<ValidatedConfig, Vec<ValidationError>>`. Every
//! load/dump round-trips through `validate`.

mod env_expand;
mod schema;

pub use schema::{
    GlobalConfig, LocalModuleDescriptor, ModuleDescriptorRaw, ModuleKind, NormalizedModule,
    RawConfig, RemoteModuleDescriptor, ValidatedConfig,
};

use crate::error::ValidationError;
use std::path::Path;

/// Loads, env-expands and validates a single YAML configuration document.
///
/// # Errors
/// Returns [`ValidationError`] if the file cannot be read, is not valid
/// YAML, or fails schema validation.
pub fn load(path: &Path) -> Result<ValidatedConfig, Vec<ValidationError>> {
    let text = std::fs::read_to_string(path).map_err(|source| {
        vec![ValidationError::Io {
            path: path.display().to_string(),
            source,
        }]
    })?;
    let expanded = env_expand::expand(&text);
    let raw: RawConfig = serde_saphyr::from_str(&expanded)
        .map_err(|e| vec![ValidationError::Yaml(e.to_string())])?;
    validate(raw)
}

/// Serializes a validated config back to YAML and atomically writes it to
/// `path` (write-to-temp + rename, same discipline used for status files).
///
/// # Errors
/// Returns [`ValidationError`] if serialization or the filesystem write
/// fails.
pub fn dump(cfg: &ValidatedConfig, path: &Path) -> Result<(), Vec<ValidationError>> {
    let raw = cfg.to_raw();
    let text = serde_yaml::to_string(&raw).map_err(|e| vec![ValidationError::Yaml(e.to_string())])?;
    crate::paths::atomic_write(path, text.as_bytes()).map_err(|source| {
        vec![ValidationError::Io {
            path: path.display().to_string(),
            source,
        }]
    })
}

/// Validates a raw, already-deserialized configuration document.
///
/// # Errors
/// Returns the full list of structural problems found, not just the first one.
pub fn validate(raw: RawConfig) -> Result<ValidatedConfig, Vec<ValidationError>> {
    schema::validate(raw)
}
