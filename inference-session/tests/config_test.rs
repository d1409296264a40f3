//! Config loading and defaults integration tests

use std::time::Duration;

use inference_session::{ChargePolicy, ConfigError, EngineConfig, ExchangeKind, RateCategory};

#[test]
fn test_default_config_values() {
    let config = EngineConfig::default();

    assert_eq!(config.image.default_size, "1024x1024");
    assert_eq!(config.channels.encrypted_default_steps, 4);
    assert_eq!(config.channels.http_default_steps, 20);
    assert_eq!(config.rate_limits.charge_policy, ChargePolicy::OnSuccess);
    assert_eq!(
        config.timeouts.for_kind(ExchangeKind::ImageGeneration),
        Duration::from_secs(180)
    );
    assert!(config.validate().is_ok());
}

#[test]
fn test_partial_yaml_keeps_defaults() {
    let yaml = r#"
rate_limits:
  image:
    capacity: 2
    window_ms: 10000
  charge_policy: on_send
timeouts:
  chat_ms: 5000
"#;

    let config = EngineConfig::from_yaml(yaml).expect("valid YAML");

    let image = config.rate_limits.bucket(RateCategory::Image).unwrap();
    assert_eq!(image.capacity, 2);
    assert_eq!(image.window(), Duration::from_secs(10));
    assert_eq!(config.rate_limits.charge_policy, ChargePolicy::OnSend);
    assert_eq!(config.timeouts.for_kind(ExchangeKind::ChatStream), Duration::from_secs(5));

    // Untouched sections
    assert_eq!(config.rate_limits.chat.capacity, 30);
    assert_eq!(config.chat.max_prompt_length, 32_000);
    assert!(config.rate_limits.bucket(RateCategory::Remote).is_none());
}

#[test]
fn test_yaml_round_trip() {
    let mut config = EngineConfig::default();
    config.retry.max_delay_ms = Some(30_000);
    config.http.image_path = "/api/generate".into();

    let yaml = config.to_yaml().unwrap();
    let loaded = EngineConfig::from_yaml(&yaml).unwrap();

    assert_eq!(loaded.retry.max_delay_ms, Some(30_000));
    assert_eq!(loaded.http.path_for(ExchangeKind::ImageGeneration), "/api/generate");
}

#[test]
fn test_invalid_config_rejected() {
    let yaml = r#"
image:
  min_steps: 10
  max_steps: 5
"#;
    assert!(matches!(
        EngineConfig::from_yaml(yaml),
        Err(ConfigError::Invalid(_))
    ));

    assert!(matches!(
        EngineConfig::from_yaml("rate_limits: [not, a, map]"),
        Err(ConfigError::Yaml(_))
    ));
}
