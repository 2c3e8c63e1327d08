//! Tests for read and bridge configuration.

use std::time::Duration;

use partiflow::{BridgeConfig, ReadConfig, ReadError};


#[test]
fn test_default_config_is_valid() {
    let config = ReadConfig::default();
    assert!(config.validate().is_ok());
    assert!(config.max_workers >= 2);
    assert_eq!(config.queue_capacity, 10_000);
    assert_eq!(config.stall_timeout, Duration::from_secs(900));
    assert!(config.read_timeout.is_none());
}

#[test]
fn test_derived_limits() {
    let config = ReadConfig::default().with_max_workers(8);
    assert_eq!(config.generator_limit(), 4);
    assert_eq!(config.in_flight_limit(), 16);

    let single = ReadConfig::default().with_max_workers(1);
    assert_eq!(single.generator_limit(), 1);
    assert_eq!(single.in_flight_limit(), 2);

    let explicit = ReadConfig {
        max_concurrent_generators: Some(3),
        max_in_flight_partitions: Some(5),
        ..ReadConfig::default()
    };
    assert_eq!(explicit.generator_limit(), 3);
    assert_eq!(explicit.in_flight_limit(), 5);
}

#[test]
fn test_invalid_fields_are_rejected() {
    let cases = [
        ReadConfig {
            max_workers: 0,
            ..ReadConfig::default()
        },
        ReadConfig {
            queue_capacity: 0,
            ..ReadConfig::default()
        },
        ReadConfig::default().with_stall_timeout(Duration::ZERO),
        ReadConfig::default().with_read_timeout(Duration::ZERO),
        ReadConfig {
            max_concurrent_generators: Some(0),
            ..ReadConfig::default()
        },
        ReadConfig {
            max_in_flight_partitions: Some(0),
            ..ReadConfig::default()
        },
    ];
    for config in cases {
        let err = config.validate().err();
        assert!(err.is_some(), "{config:?} should be invalid");
        assert_read_error!(err.unwrap(), ReadError::Config(_));
    }
}

#[test]
fn test_from_json_takes_seconds() -> anyhow::Result<()> {
    let config = ReadConfig::from_json(
        r#"{ "max_workers": 3, "stall_timeout_secs": 1.5, "read_timeout_secs": 60 }"#,
    )?;
    assert_eq!(config.max_workers, 3);
    assert_eq!(config.stall_timeout, Duration::from_millis(1500));
    assert_eq!(config.read_timeout, Some(Duration::from_secs(60)));
    assert_eq!(config.queue_capacity, ReadConfig::default().queue_capacity);
    Ok(())
}

#[test]
fn test_from_json_rejects_unknown_fields() {
    let err = ReadConfig::from_json(r#"{ "workers": 3 }"#).err();
    assert!(err.is_some());
    let err = err.unwrap();
    assert!(err.to_string().contains("workers"), "{err}");
    assert_read_error!(err, ReadError::Config(_));
}

#[test]
fn test_from_json_rejects_negative_timeout() {
    let err = ReadConfig::from_json(r#"{ "stall_timeout_secs": -1 }"#).err();
    assert!(err.is_some());
}

#[test]
fn test_bridge_config_validation() {
    assert!(BridgeConfig::default().validate().is_ok());
    let config = BridgeConfig {
        max_concurrent_streams: 0,
        ..BridgeConfig::default()
    };
    assert_read_error!(config.validate().unwrap_err(), ReadError::Config(_));
}

#[test]
fn test_bridge_config_from_json() -> anyhow::Result<()> {
    let config: BridgeConfig = serde_json::from_str(r#"{ "max_concurrent_streams": 2 }"#)?;
    assert_eq!(config.max_concurrent_streams, 2);
    assert_eq!(config.stall_timeout, BridgeConfig::default().stall_timeout);
    Ok(())
}
