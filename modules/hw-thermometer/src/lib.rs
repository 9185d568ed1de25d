//! A simulated single-channel thermometer: the hardware half of the
//! two-module demo wired together by `logic-averager`'s `hardware`
//! connector.

use async_trait::async_trait;
use labstation_core::error::DescriptorError;
use labstation_core::fsm::FsmHandle;
use labstation_core::meta::{ConnectorSpec, DynInterface, OptionsSet, StatusSet};
use labstation_core::module::{Module, ModuleClass, ModuleConstructArgs, ModuleCtx, ModuleMetaInfo};
use labstation_macros::{Options, Status};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

fn positive_gain(v: &serde_json::Value) -> bool {
    v.as_f64().is_some_and(|f| f > 0.0)
}

#[derive(Debug, Options)]
struct ThermometerOptions {
    device_path: String,
    #[option(default = 1.0, missing = "warn", checker = "positive_gain")]
    gain: f64,
    #[option(default = 20.0)]
    baseline_celsius: f64,
}

#[derive(Debug, Clone, Status)]
struct ThermometerStatus {
    #[status(default = 0)]
    activation_count: i64,
}

/// Registered as `demo.hardware.Thermometer`. Produces a deterministic,
/// slowly drifting reading so tests and demos don't depend on real
/// hardware or wall-clock randomness.
pub struct Thermometer {
    meta: ModuleMetaInfo,
    options: ThermometerOptions,
    status: Mutex<ThermometerStatus>,
    since_construction: Instant,
    /// Set on activation, cleared on deactivation; used only by
    /// `calibrate`'s self-lock (I2) around the simulated calibration pass.
    state: Mutex<Option<FsmHandle>>,
}

impl DynInterface for Thermometer {
    fn declared_interfaces(&self) -> &'static [&'static str] {
        &["demo.hardware.Thermometer"]
    }

    fn dyn_get_attr(&self, attr: &str) -> Result<serde_json::Value, DescriptorError> {
        if attr == "reading" {
            Ok(serde_json::Value::from(self.reading()))
        } else {
            Err(DescriptorError::UnboundConnector {
                module: self.meta.name.clone(),
                connector: attr.to_string(),
            })
        }
    }

    fn dyn_call(
        &self,
        attr: &str,
        _args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, DescriptorError> {
        if attr == "calibrate" {
            self.calibrate().map(serde_json::Value::from)
        } else {
            Err(DescriptorError::UnboundConnector {
                module: self.meta.name.clone(),
                connector: attr.to_string(),
            })
        }
    }
}

impl Thermometer {
    fn reading(&self) -> f64 {
        let elapsed_secs = self.since_construction.elapsed().as_secs_f64();
        let drift = (elapsed_secs * 0.01).sin();
        self.options.baseline_celsius * self.options.gain + drift
    }

    /// Self-locks (I2) for the duration of a simulated calibration pass so
    /// no other caller can observe a half-calibrated reading; unlocks
    /// before returning, on every path.
    fn calibrate(&self) -> Result<f64, DescriptorError> {
        let Some(handle) = self.state.lock().clone() else {
            return Err(DescriptorError::UnboundConnector {
                module: self.meta.name.clone(),
                connector: "calibrate".to_string(),
            });
        };
        handle.self_lock().map_err(|source| DescriptorError::SelfLockFailed {
            module: self.meta.name.clone(),
            source,
        })?;
        let reading = self.reading();
        handle.self_unlock().map_err(|source| DescriptorError::SelfLockFailed {
            module: self.meta.name.clone(),
            source,
        })?;
        Ok(reading)
    }
}

#[async_trait]
impl Module for Thermometer {
    fn meta(&self) -> &ModuleMetaInfo {
        &self.meta
    }

    async fn on_activate(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        *self.state.lock() = Some(ctx.state.clone());
        ctx.logger.info(&format!(
            "thermometer '{}' online at {}",
            ctx.meta.name, self.options.device_path
        ));
        Ok(())
    }

    async fn on_deactivate(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        *self.state.lock() = None;
        ctx.logger.info("thermometer offline");
        Ok(())
    }

    fn load_status(&self, app_state_dir: &std::path::Path, logger: &labstation_core::module::ModuleLogger) {
        let mut loaded: ThermometerStatus =
            labstation_core::meta::status::load(app_state_dir, &self.meta.name, logger);
        loaded.activation_count += 1;
        *self.status.lock() = loaded;
    }

    fn dump_status(&self, app_state_dir: &std::path::Path, logger: &labstation_core::module::ModuleLogger) {
        let guard = self.status.lock();
        if let Err(e) = labstation_core::meta::status::dump(app_state_dir, &self.meta.name, &guard, logger) {
            logger.warn(&format!("failed to persist thermometer status: {e}"));
        }
    }

    fn connector_specs(&self) -> &'static [ConnectorSpec] {
        &[]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn construct(args: &ModuleConstructArgs<'_>) -> Result<Arc<dyn Module>, DescriptorError> {
    let options = ThermometerOptions::materialize(&args.meta.name, args.raw_options, &args.logger)?;
    Ok(Arc::new(Thermometer {
        meta: args.meta.clone(),
        options,
        status: Mutex::new(ThermometerStatus::defaults()),
        since_construction: Instant::now(),
        state: Mutex::new(None),
    }))
}

inventory::submit! {
    ModuleClass {
        implementation_ref: "demo.hardware.Thermometer",
        construct,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labstation_core::module::ModuleLogger;

    fn build(raw: &serde_json::Map<String, serde_json::Value>) -> Arc<dyn Module> {
        let args = ModuleConstructArgs {
            meta: ModuleMetaInfo {
                name: "hw_a".to_string(),
                kind: labstation_core::config::ModuleKind::Hardware,
                uuid: uuid::Uuid::new_v4(),
                threaded: false,
                default_data_dir: std::env::temp_dir(),
            },
            raw_options: raw,
            logger: ModuleLogger::for_test("hw_a"),
        };
        construct(&args).expect("construction succeeds")
    }

    #[test]
    fn registers_under_its_implementation_ref() {
        let class = labstation_core::module::resolve_class("demo.hardware.Thermometer")
            .expect("registered via inventory::submit!");
        assert_eq!(class.implementation_ref, "demo.hardware.Thermometer");
    }

    #[test]
    fn missing_device_path_fails_construction() {
        let raw = serde_json::Map::new();
        let args = ModuleConstructArgs {
            meta: ModuleMetaInfo {
                name: "hw_a".to_string(),
                kind: labstation_core::config::ModuleKind::Hardware,
                uuid: uuid::Uuid::new_v4(),
                threaded: false,
                default_data_dir: std::env::temp_dir(),
            },
            raw_options: &raw,
            logger: ModuleLogger::for_test("hw_a"),
        };
        let err = construct(&args).expect_err("device_path has no default");
        assert!(matches!(err, DescriptorError::MissingOption { .. }));
    }

    #[test]
    fn reading_scales_with_gain() {
        let mut raw = serde_json::Map::new();
        raw.insert("device_path".to_string(), serde_json::Value::from("/dev/ttyUSB0"));
        raw.insert("gain".to_string(), serde_json::Value::from(2.0));
        let instance = build(&raw);
        let thermo = instance
            .as_any()
            .downcast_ref::<Thermometer>()
            .expect("concrete type");
        assert!(thermo.reading() > thermo.options.baseline_celsius);
    }

    #[test]
    fn unknown_attribute_reports_as_unbound() {
        let mut raw = serde_json::Map::new();
        raw.insert("device_path".to_string(), serde_json::Value::from("/dev/ttyUSB0"));
        let instance = build(&raw);
        let err = instance.dyn_get_attr("flux_capacitor").expect_err("no such attribute");
        assert!(matches!(err, DescriptorError::UnboundConnector { .. }));
    }

    #[test]
    fn calibrate_before_activation_is_unbound() {
        let mut raw = serde_json::Map::new();
        raw.insert("device_path".to_string(), serde_json::Value::from("/dev/ttyUSB0"));
        let instance = build(&raw);
        let err = instance
            .dyn_call("calibrate", Vec::new())
            .expect_err("no FSM handle until on_activate runs");
        assert!(matches!(err, DescriptorError::UnboundConnector { .. }));
    }

    #[test]
    fn calibrate_self_locks_and_unlocks_around_the_reading() {
        use labstation_core::fsm::{Fsm, FsmHandle, FsmState};
        use std::sync::Arc;

        let mut raw = serde_json::Map::new();
        raw.insert("device_path".to_string(), serde_json::Value::from("/dev/ttyUSB0"));
        let instance = build(&raw);
        let thermo = instance
            .as_any()
            .downcast_ref::<Thermometer>()
            .expect("concrete type");

        let fsm = Arc::new(Fsm::new("hw_a"));
        fsm.begin_activate().expect("begin");
        fsm.activate_succeeded().expect("succeed");
        *thermo.state.lock() = Some(FsmHandle::new(fsm.clone()));

        let reading = thermo.calibrate().expect("calibrates while idle");
        assert!(reading.is_finite());
        assert_eq!(fsm.state(), FsmState::Idle);
    }

    #[test]
    fn calibrate_unknown_call_reports_as_unbound() {
        let mut raw = serde_json::Map::new();
        raw.insert("device_path".to_string(), serde_json::Value::from("/dev/ttyUSB0"));
        let instance = build(&raw);
        let err = instance
            .dyn_call("not_a_real_operation", Vec::new())
            .expect_err("unknown call");
        assert!(matches!(err, DescriptorError::UnboundConnector { .. }));
    }
}
