use labstation_core::meta::OptionsSet;
use labstation_core::module::ModuleLogger;
use labstation_macros::Options;

fn positive_gain(v: &serde_json::Value) -> bool {
    v.as_f64().is_some_and(|f| f > 0.0)
}

fn to_upper(v: serde_json::Value) -> Result<serde_json::Value, String> {
    match v.as_str() {
        Some(s) => Ok(serde_json::Value::from(s.to_uppercase())),
        None => Err("expected a string".to_string()),
    }
}

#[derive(Debug, PartialEq, Options)]
#[allow(dead_code)]
struct ThermometerOptions {
    device_path: String,
    #[option(default = 1.0, missing = "warn", checker = "positive_gain")]
    gain: f64,
    #[option(default = "demo", constructor = "to_upper")]
    label: String,
}

#[test]
fn describes_required_and_defaulted_fields() {
    let specs = ThermometerOptions::describe();
    assert_eq!(specs.len(), 3);
    assert!(specs[0].required);
    assert!(!specs[1].required);
    assert!(!specs[2].required);
}

#[test]
fn materializes_with_defaults_and_constructor() {
    let mut raw = serde_json::Map::new();
    raw.insert("device_path".to_string(), serde_json::Value::from("/dev/ttyUSB0"));
    let logger = ModuleLogger::for_test("thermo");

    let opts = ThermometerOptions::materialize("thermo", &raw, &logger).expect("materializes");
    assert_eq!(opts.device_path, "/dev/ttyUSB0");
    assert!((opts.gain - 1.0).abs() < f64::EPSILON);
    assert_eq!(opts.label, "DEMO");
}

#[test]
fn missing_required_option_fails() {
    let raw = serde_json::Map::new();
    let logger = ModuleLogger::for_test("thermo");
    let err = ThermometerOptions::materialize("thermo", &raw, &logger)
        .expect_err("device_path has no default");
    assert!(matches!(
        err,
        labstation_core::error::DescriptorError::MissingOption { .. }
    ));
}

#[test]
fn checker_rejects_non_positive_gain() {
    let mut raw = serde_json::Map::new();
    raw.insert("device_path".to_string(), serde_json::Value::from("/dev/ttyUSB0"));
    raw.insert("gain".to_string(), serde_json::Value::from(-2.0));
    let logger = ModuleLogger::for_test("thermo");
    let err = ThermometerOptions::materialize("thermo", &raw, &logger)
        .expect_err("negative gain must be rejected");
    assert!(matches!(
        err,
        labstation_core::error::DescriptorError::CheckerFailed { .. }
    ));
}
