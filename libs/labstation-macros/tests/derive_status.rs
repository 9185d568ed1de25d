use labstation_core::meta::StatusSet;
use labstation_macros::Status;

fn halve(v: &serde_json::Value) -> Result<serde_json::Value, String> {
    v.as_i64()
        .map(|n| serde_json::Value::from(n / 2))
        .ok_or_else(|| "expected an integer".to_string())
}

fn double(v: serde_json::Value) -> Result<serde_json::Value, String> {
    v.as_i64()
        .map(|n| serde_json::Value::from(n * 2))
        .ok_or_else(|| "expected an integer".to_string())
}

#[derive(Debug, PartialEq, Status)]
#[allow(dead_code)]
struct AveragerStatus {
    #[status(default = 0)]
    sample_count: i64,
    #[status(default = 0, representer = "halve", constructor = "double")]
    half_stored: i64,
}

#[test]
fn defaults_match_declared_values() {
    let status = AveragerStatus::defaults();
    assert_eq!(status.sample_count, 0);
    assert_eq!(status.half_stored, 0);
}

#[test]
fn round_trips_through_to_values_and_from_values() {
    let status = AveragerStatus {
        sample_count: 42,
        half_stored: 8,
    };
    let (values, errors) = status.to_values();
    assert!(errors.is_empty());
    assert_eq!(values.get("sample_count").and_then(serde_json::Value::as_i64), Some(42));
    // representer halves on the way out...
    assert_eq!(values.get("half_stored").and_then(serde_json::Value::as_i64), Some(4));

    // ...and the constructor doubles it back on the way in.
    let reloaded = AveragerStatus::from_values(values);
    assert_eq!(reloaded, status);
}

#[test]
fn unknown_field_falls_back_to_default() {
    let values = std::collections::BTreeMap::new();
    let status = AveragerStatus::from_values(values);
    assert_eq!(status, AveragerStatus::defaults());
}
