use std::io::Write;
use std::time::Duration;

use splitmerge::cli::{CommonArgs, parse_activity_type};
use splitmerge::config::HarnessConfig;
use splitmerge::runtime::task::ActivityType;
use tempfile::NamedTempFile;

fn write_config(yaml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(yaml.as_bytes()).unwrap();
    file
}

#[test]
fn test_defaults_are_valid() {
    let config = HarnessConfig::default();
    config.validate().expect("defaults must validate");
    assert_eq!(config.divide_task, ActivityType::new("divide", "1"));
    assert_eq!(config.blob.shard_extension, "txt");
    assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
    assert_eq!(config.namespace(), "splitmerge:local");
}

#[test]
fn test_load_partial_yaml_keeps_defaults() {
    let file = write_config(
        r#"
domain: sorting
task_list: dictionaries
policy:
  fan_out: 8
  max_depth: 2
merge_task:
  name: merge
  version: "3"
worker:
  heartbeat_interval_ms: 5000
"#,
    );
    let config = HarnessConfig::load(file.path()).expect("load failed");

    assert_eq!(config.domain, "sorting");
    assert_eq!(config.task_list, "dictionaries");
    assert_eq!(config.policy.fan_out, 8);
    assert_eq!(config.policy.max_depth, 2);
    assert_eq!(config.policy.min_shard_bytes, 1 << 20);
    assert_eq!(config.merge_task, ActivityType::new("merge", "3"));
    assert_eq!(config.heartbeat_interval(), Duration::from_millis(5000));
    assert_eq!(config.worker.poll_timeout_ms, 20_000);
    assert_eq!(config.decider.max_activity_attempts, 3);
}

#[test]
fn test_invalid_fan_out_is_rejected() {
    let file = write_config("policy:\n  fan_out: 1\n");
    let err = HarnessConfig::load(file.path()).unwrap_err();
    assert!(err.to_string().contains("fan_out"));
}

#[test]
fn test_same_divide_and_merge_type_is_rejected() {
    let mut config = HarnessConfig::default();
    config.merge_task = config.divide_task.clone();
    assert!(config.validate().is_err());
}

#[test]
fn test_build_type_must_differ_from_merge() {
    let mut config = HarnessConfig::default();
    config.build_task = ActivityType::new("merge", "1");
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("distinct"));
}

#[test]
fn test_missing_file_reports_path() {
    let err = HarnessConfig::load("/definitely/not/here.yaml").unwrap_err();
    assert!(format!("{:#}", err).contains("/definitely/not/here.yaml"));
}

#[test]
fn test_flags_override_file() {
    let file = write_config("domain: from-file\nregion: eu\n");
    let args = CommonArgs {
        config: Some(file.path().to_path_buf()),
        domain: Some("from-flag".to_string()),
        div_task: Some("split:2".to_string()),
        identity: Some("box-7".to_string()),
        build: true,
        ..CommonArgs::default()
    };
    let config = args.resolve().unwrap();

    assert_eq!(config.domain, "from-flag");
    assert_eq!(config.region, "eu");
    assert_eq!(config.divide_task, ActivityType::new("split", "2"));
    assert_eq!(config.identity(), "box-7");
    assert!(config.policy.build);
}

#[test]
fn test_parse_activity_type() {
    assert_eq!(parse_activity_type("merge").unwrap(), ActivityType::new("merge", "1"));
    assert_eq!(parse_activity_type("merge:4").unwrap(), ActivityType::new("merge", "4"));
    assert!(parse_activity_type(":4").is_err());
    assert!(parse_activity_type("merge:").is_err());
}
