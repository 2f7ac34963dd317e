#![cfg(feature = "serde")]

use ai_state_tree::ExecutionConfig;

#[test]
fn yaml_overrides_only_the_given_fields() {
    let config = ExecutionConfig::from_yaml_str("max_transition_iterations: 3\n").expect("valid yaml");
    assert_eq!(config.max_transition_iterations, 3);
    assert_eq!(config.max_events, ExecutionConfig::default().max_events);
    assert_eq!(config.default_seed, ExecutionConfig::default().default_seed);
}

#[test]
fn empty_document_yields_defaults() {
    let config = ExecutionConfig::from_yaml_str("{}").expect("valid yaml");
    assert_eq!(config, ExecutionConfig::default());
}

#[test]
fn invalid_yaml_is_an_error() {
    assert!(ExecutionConfig::from_yaml_str("max_events: [1, 2]").is_err());
}

#[test]
fn missing_file_yields_defaults() {
    let path = std::path::Path::new("/nonexistent/state-tree.yaml");
    let config = ExecutionConfig::load(path).expect("defaults");
    assert_eq!(config, ExecutionConfig::default());
}

#[test]
fn json_roundtrip() {
    let config = ExecutionConfig {
        max_follow_depth: 4,
        ..ExecutionConfig::default()
    };
    let json = serde_json::to_string(&config).expect("serialize");
    let back: ExecutionConfig = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, config);
}
