//! `Option` descriptors: class-level declarations that become
//! frozen per-instance data at construction time.

use crate::error::DescriptorError;
use crate::module::ModuleLogger;
use serde_json::Value;

/// How a missing option (no config entry, but a default exists) is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingPolicy {
    Silent,
    Info,
    Warn,
    Error,
}

impl MissingPolicy {
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "info" => MissingPolicy::Info,
            "warn" => MissingPolicy::Warn,
            "error" => MissingPolicy::Error,
            _ => MissingPolicy::Silent,
        }
    }
}

/// Static description of one declared option, independent of any instance.
#[derive(Debug, Clone)]
pub struct OptionSpec {
    pub name: &'static str,
    pub required: bool,
    pub missing: MissingPolicy,
}

/// A function pointer type for user-provided option checkers/constructors.
/// Kept as plain `fn` (not closures) so the generated descriptor table can
/// be `'static` and built once per type, matching the "class-level
/// declaration" contract.
pub type OptionChecker = fn(&Value) -> bool;
pub type OptionConstructor = fn(Value) -> Result<Value, String>;

/// Resolves the raw config value for one option at construction time:
/// config lookup, else default (with a log record at `missing`), else
/// construction fails.
///
/// # Errors
/// Returns [`DescriptorError::MissingOption`], [`DescriptorError::CheckerFailed`]
/// or [`DescriptorError::ConstructorFailed`] per the failure mode hit.
pub fn materialize_one(
    module: &str,
    spec: &OptionSpec,
    raw: &serde_json::Map<String, Value>,
    default: Option<&Value>,
    checker: Option<OptionChecker>,
    constructor: Option<OptionConstructor>,
    logger: &ModuleLogger,
) -> Result<Value, DescriptorError> {
    let mut value = match raw.get(spec.name) {
        Some(v) => v.clone(),
        None => match default {
            Some(d) => {
                log_missing(module, spec, logger);
                d.clone()
            }
            None => {
                return Err(DescriptorError::MissingOption {
                    module: module.to_string(),
                    option: spec.name.to_string(),
                });
            }
        },
    };

    if let Some(ctor) = constructor {
        value = ctor(value).map_err(|reason| DescriptorError::ConstructorFailed {
            module: module.to_string(),
            option: spec.name.to_string(),
            reason,
        })?;
    }

    if let Some(chk) = checker {
        if !chk(&value) {
            return Err(DescriptorError::CheckerFailed {
                module: module.to_string(),
                option: spec.name.to_string(),
            });
        }
    }

    Ok(value)
}

fn log_missing(module: &str, spec: &OptionSpec, logger: &ModuleLogger) {
    match spec.missing {
        MissingPolicy::Silent => {}
        MissingPolicy::Info => logger.info(&format!(
            "option '{}' missing, using default",
            spec.name
        )),
        MissingPolicy::Warn => logger.warn(&format!(
            "option '{}' missing, using default",
            spec.name
        )),
        MissingPolicy::Error => logger.error(&format!(
            "option '{}' missing, using default",
            spec.name
        )),
    }
    let _ = module;
}

/// Implemented by the per-module options struct generated through
/// `#[derive(Options)]` in `labstation-macros`.
pub trait OptionsSet: Sized + Send + Sync + 'static {
    fn describe() -> &'static [OptionSpec];

    /// # Errors
    /// Propagates [`DescriptorError`] from [`materialize_one`].
    fn materialize(
        module: &str,
        raw: &serde_json::Map<String, Value>,
        logger: &ModuleLogger,
    ) -> Result<Self, DescriptorError>;
}
