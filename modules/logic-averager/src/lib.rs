//! A running-average consumer wired to a thermometer through its
//! optional `hardware` connector: omit the connector from config and the
//! module still activates, only attribute access on it fails.

use async_trait::async_trait;
use labstation_core::error::DescriptorError;
use labstation_core::meta::{ConnectorProxy, ConnectorSpec, DynInterface, OptionsSet, StatusSet};
use labstation_core::module::{Module, ModuleClass, ModuleConstructArgs, ModuleCtx, ModuleLogger, ModuleMetaInfo};
use labstation_macros::{Options, Status};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;

#[derive(Debug, Options)]
struct AveragerOptions {
    #[option(default = 1000)]
    sample_history_limit: i64,
}

#[derive(Debug, Clone, Status)]
struct AveragerStatus {
    #[status(default = 0)]
    sample_count: i32,
    #[status(default = 0.0)]
    running_average: f64,
}

static CONNECTOR_SPECS: &[ConnectorSpec] = &[ConnectorSpec {
    name: "hardware",
    interface: "demo.hardware.Thermometer",
    optional: true,
}];

/// Registered as `demo.logic.Averager`. Pulls `reading` off its bound
/// `hardware` connector on every `average` access and folds it into a
/// running mean; the connector is optional, so construction and
/// activation never depend on a thermometer being configured.
pub struct Averager {
    meta: ModuleMetaInfo,
    options: AveragerOptions,
    status: Mutex<AveragerStatus>,
    hardware: Mutex<Option<ConnectorProxy>>,
}

impl DynInterface for Averager {
    fn declared_interfaces(&self) -> &'static [&'static str] {
        &["demo.logic.Averager"]
    }

    fn dyn_get_attr(&self, attr: &str) -> Result<serde_json::Value, DescriptorError> {
        if attr == "average" {
            self.sample().map(serde_json::Value::from)
        } else {
            Err(DescriptorError::UnboundConnector {
                module: self.meta.name.clone(),
                connector: attr.to_string(),
            })
        }
    }
}

impl Averager {
    fn sample(&self) -> Result<f64, DescriptorError> {
        let proxy = self.hardware.lock().clone().ok_or_else(|| DescriptorError::UnboundConnector {
            module: self.meta.name.clone(),
            connector: "hardware".to_string(),
        })?;
        let reading = proxy
            .get_attr("reading")?
            .as_f64()
            .ok_or_else(|| DescriptorError::UnboundConnector {
                module: self.meta.name.clone(),
                connector: "hardware".to_string(),
            })?;

        let mut status = self.status.lock();
        status.sample_count += 1;
        let count = f64::from(status.sample_count);
        status.running_average += (reading - status.running_average) / count;

        // Once the configured window is full, halve the count so a long-lived
        // averager keeps giving recent readings real weight instead of being
        // drowned out by years of history.
        if i64::from(status.sample_count) >= self.options.sample_history_limit {
            status.sample_count = i32::try_from(self.options.sample_history_limit / 2)
                .unwrap_or(i32::MAX / 2);
        }

        Ok(status.running_average)
    }
}

#[async_trait]
impl Module for Averager {
    fn meta(&self) -> &ModuleMetaInfo {
        &self.meta
    }

    async fn on_activate(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        *self.hardware.lock() = ctx.connectors.get("hardware").cloned();
        ctx.logger.info("averager ready");
        Ok(())
    }

    async fn on_deactivate(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        *self.hardware.lock() = None;
        ctx.logger.info("averager stopped");
        Ok(())
    }

    fn load_status(&self, app_state_dir: &std::path::Path, logger: &ModuleLogger) {
        *self.status.lock() = labstation_core::meta::status::load(app_state_dir, &self.meta.name, logger);
    }

    fn dump_status(&self, app_state_dir: &std::path::Path, logger: &ModuleLogger) {
        let guard = self.status.lock();
        if let Err(e) = labstation_core::meta::status::dump(app_state_dir, &self.meta.name, &guard, logger) {
            logger.warn(&format!("failed to persist averager status: {e}"));
        }
    }

    fn connector_specs(&self) -> &'static [ConnectorSpec] {
        CONNECTOR_SPECS
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn construct(args: &ModuleConstructArgs<'_>) -> Result<Arc<dyn Module>, DescriptorError> {
    let options = AveragerOptions::materialize(&args.meta.name, args.raw_options, &args.logger)?;
    Ok(Arc::new(Averager {
        meta: args.meta.clone(),
        options,
        status: Mutex::new(AveragerStatus::defaults()),
        hardware: Mutex::new(None),
    }))
}

inventory::submit! {
    ModuleClass {
        implementation_ref: "demo.logic.Averager",
        construct,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labstation_core::meta::ConnectorBinding;
    use std::sync::Weak;

    struct FakeThermometer;
    impl DynInterface for FakeThermometer {
        fn declared_interfaces(&self) -> &'static [&'static str] {
            &["demo.hardware.Thermometer"]
        }
        fn dyn_get_attr(&self, attr: &str) -> Result<serde_json::Value, DescriptorError> {
            if attr == "reading" {
                Ok(serde_json::Value::from(10.0))
            } else {
                Err(DescriptorError::UnboundConnector {
                    module: "hw_a".to_string(),
                    connector: attr.to_string(),
                })
            }
        }
    }

    fn build() -> Arc<Averager> {
        let logger = ModuleLogger::for_test("lg_b");
        let options = AveragerOptions::materialize("lg_b", &serde_json::Map::new(), &logger)
            .expect("defaults materialize");
        Arc::new(Averager {
            meta: ModuleMetaInfo {
                name: "lg_b".to_string(),
                kind: labstation_core::config::ModuleKind::Logic,
                uuid: uuid::Uuid::new_v4(),
                threaded: true,
                default_data_dir: std::env::temp_dir(),
            },
            options,
            status: Mutex::new(AveragerStatus::defaults()),
            hardware: Mutex::new(None),
        })
    }

    #[test]
    fn construct_registers_a_working_instance() {
        let args = ModuleConstructArgs {
            meta: ModuleMetaInfo {
                name: "lg_b".to_string(),
                kind: labstation_core::config::ModuleKind::Logic,
                uuid: uuid::Uuid::new_v4(),
                threaded: true,
                default_data_dir: std::env::temp_dir(),
            },
            raw_options: &serde_json::Map::new(),
            logger: ModuleLogger::for_test("lg_b"),
        };
        let instance = construct(&args).expect("construction succeeds");
        assert!(instance.as_any().downcast_ref::<Averager>().is_some());
    }

    #[test]
    fn registers_under_its_implementation_ref() {
        let class = labstation_core::module::resolve_class("demo.logic.Averager")
            .expect("registered via inventory::submit!");
        assert_eq!(class.implementation_ref, "demo.logic.Averager");
    }

    #[test]
    fn unbound_connector_fails_average_with_defined_error() {
        let averager = build();
        let err = averager.sample().expect_err("hardware never bound");
        assert!(matches!(err, DescriptorError::UnboundConnector { .. }));
    }

    #[test]
    fn bound_connector_feeds_running_average() {
        let averager = build();
        let target: Arc<dyn DynInterface> = Arc::new(FakeThermometer);
        let weak: Weak<dyn DynInterface> = Arc::downgrade(&target);
        *averager.hardware.lock() = Some(ConnectorProxy::new(
            "lg_b".to_string(),
            "hardware".to_string(),
            ConnectorBinding::Local(weak),
        ));
        let avg = averager.sample().expect("bound connector answers");
        assert!((avg - 10.0).abs() < f64::EPSILON);
        let avg2 = averager.sample().expect("second sample");
        assert!((avg2 - 10.0).abs() < f64::EPSILON);
        assert_eq!(averager.status.lock().sample_count, 2);
    }

    #[test]
    fn connector_spec_marks_hardware_optional() {
        let specs = CONNECTOR_SPECS;
        assert_eq!(specs.len(), 1);
        assert!(specs[0].optional);
    }
}
