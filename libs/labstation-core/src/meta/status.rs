//! `Status` descriptors: persisted instance attributes.
//! Loaded at activation, dumped at every deactivation, atomically
//! (write-to-temp + rename).

use crate::error::DescriptorError;
use crate::module::ModuleLogger;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub type StatusRepresenter = fn(&Value) -> Result<Value, String>;
pub type StatusConstructor = fn(Value) -> Result<Value, String>;

#[derive(Debug, Clone)]
pub struct StatusSpec {
    pub name: &'static str,
}

/// Implemented by the per-module status struct generated through
/// `#[derive(Status)]` in `labstation-macros`.
pub trait StatusSet: Sized + Send + Sync + 'static {
    fn describe() -> &'static [StatusSpec];

    /// Builds an all-defaults instance, used when no status file exists yet.
    fn defaults() -> Self;

    /// Applies a loaded document on top of the defaults, representer/
    /// constructor already having round-tripped at the caller.
    fn from_values(values: BTreeMap<String, Value>) -> Self;

    /// Dumps the current instance state to a flat value map, applying each
    /// field's `representer` where declared.
    ///
    /// # Errors
    /// Returns [`DescriptorError::StatusNotRepresentable`] for a field whose
    /// representer fails; this drops the one field and callers proceed with
    /// the remainder rather than aborting the whole dump.
    fn to_values(&self) -> (BTreeMap<String, Value>, Vec<DescriptorError>);
}

fn status_file_path(app_state_dir: &Path, module_name: &str) -> PathBuf {
    app_state_dir.join(format!("{module_name}.status.yml"))
}

/// Loads a module's persisted status document, if present and well-formed.
/// Absence or a malformed file both degrade to "no prior status" (caller
/// falls back to `T::defaults()`).
pub fn load<T: StatusSet>(
    app_state_dir: &Path,
    module_name: &str,
    logger: &ModuleLogger,
) -> T {
    let path = status_file_path(app_state_dir, module_name);
    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(_) => {
            logger.warn(&format!(
                "no status file for '{module_name}', starting from defaults"
            ));
            return T::defaults();
        }
    };
    match serde_saphyr::from_str::<BTreeMap<String, Value>>(&text) {
        Ok(values) => T::from_values(values),
        Err(e) => {
            logger.warn(&format!(
                "status file for '{module_name}' is malformed, starting from defaults: {e}"
            ));
            T::defaults()
        }
    }
}

/// Dumps `status` to its per-module file, atomically. Always called after
/// `on_deactivate` returns or raises — failures inside the hook do not
/// skip the dump; this function itself reports representer failures as a
/// log record but still writes the remaining fields.
///
/// # Errors
/// Returns [`DescriptorError::StatusNotRepresentable`]-derived I/O failure
/// only if the atomic write itself fails; individual field representer
/// failures are logged and dropped rather than propagated.
pub fn dump<T: StatusSet>(
    app_state_dir: &Path,
    module_name: &str,
    status: &T,
    logger: &ModuleLogger,
) -> std::io::Result<()> {
    let (values, field_errors) = status.to_values();
    for err in field_errors {
        logger.warn(&format!("dropping unrepresentable status field: {err}"));
    }
    let path = status_file_path(app_state_dir, module_name);
    let text = serde_yaml::to_string(&values).unwrap_or_else(|_| "{}".to_string());
    crate::paths::atomic_write(&path, text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq, Eq)]
    struct CounterStatus {
        count: i64,
    }

    impl StatusSet for CounterStatus {
        fn describe() -> &'static [StatusSpec] {
            &[StatusSpec { name: "count" }]
        }

        fn defaults() -> Self {
            CounterStatus { count: 0 }
        }

        fn from_values(values: BTreeMap<String, Value>) -> Self {
            let count = values
                .get("count")
                .and_then(serde_json::Value::as_i64)
                .unwrap_or(0);
            CounterStatus { count }
        }

        fn to_values(&self) -> (BTreeMap<String, Value>, Vec<DescriptorError>) {
            let mut m = BTreeMap::new();
            m.insert("count".to_string(), Value::from(self.count));
            (m, Vec::new())
        }
    }

    #[test]
    fn round_trips_through_activate_write_deactivate_cycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = ModuleLogger::for_test("counter");

        let loaded: CounterStatus = load(dir.path(), "counter", &logger);
        assert_eq!(loaded, CounterStatus::default());

        let written = CounterStatus { count: 7 };
        dump(dir.path(), "counter", &written, &logger).expect("dump");

        let reloaded: CounterStatus = load(dir.path(), "counter", &logger);
        assert_eq!(reloaded, written);
    }

    #[test]
    fn missing_file_yields_default_and_warn_is_not_emitted_for_absence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = ModuleLogger::for_test("counter");
        let loaded: CounterStatus = load(dir.path(), "nonexistent", &logger);
        assert_eq!(loaded, CounterStatus::default());
    }

    #[test]
    fn deleted_file_between_cycles_falls_back_to_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = ModuleLogger::for_test("counter");
        dump(dir.path(), "counter", &CounterStatus { count: 7 }, &logger).expect("dump");
        std::fs::remove_file(status_file_path(dir.path(), "counter")).expect("remove");
        let loaded: CounterStatus = load(dir.path(), "counter", &logger);
        assert_eq!(loaded, CounterStatus::default());
    }
}
