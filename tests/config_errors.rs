// tests/config_errors.rs

use std::io::Write;
use std::time::Duration;

use tempfile::NamedTempFile;

use datamill::catalog::Catalog;
use datamill::config::{ConfigFile, load_and_validate};
use datamill::errors::DatamillError;
use datamill_test_utils::builders::{ConfigFileBuilder, OperatorConfigBuilder};

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

fn expect_config_error(contents: &str, needle: &str) {
    let file = write_config(contents);
    match load_and_validate(file.path()) {
        Err(DatamillError::ConfigError(msg)) => {
            assert!(msg.contains(needle), "message '{msg}' should mention '{needle}'")
        }
        Err(e) => panic!("Expected ConfigError, got: {e:?}"),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[tokio::test]
async fn full_config_loads_into_catalog_and_options() {
    let file = write_config(
        r#"
[config]
poll_interval_ms = 250
max_passes = 20

[config.retry]
max_attempts = 7
jitter = false

[datakind.numbers]
display_name = "Numbers"

[datakind.total]

[operator.sum]
image = "registry.local/sum:1"
command = "cat \"$A\" > \"$DATAMILL_OUTPUT_DIR/total\""
inputs = { A = "numbers" }
possible_output_kinds = ["total"]
constant_env = { MODE = "strict" }
configurable_env = { PRECISION = "2" }
"#,
    );

    let cfg = load_and_validate(file.path()).unwrap();

    let options = cfg.engine_options();
    assert_eq!(options.dispatcher.poll_interval, Duration::from_millis(250));
    assert_eq!(options.limits.max_passes, 20);
    assert_eq!(options.limits.max_bindings_per_pass, 10_000);

    let retry = cfg.config.retry.policy();
    assert_eq!(retry.max_attempts, 7);
    assert_eq!(retry.initial_delay, Duration::from_millis(100));
    assert!(!retry.jitter);

    let visibility = cfg.config.step_visibility();
    assert_eq!(visibility.retries, 30);
    assert_eq!(visibility.delay, Duration::from_secs(1));

    let catalog = Catalog::fetch(&cfg.catalog()).await.unwrap();
    assert!(catalog.has_data_kind("numbers"));
    let kinds: Vec<_> = catalog.data_kinds().map(|k| k.display_name.as_str()).collect();
    assert_eq!(kinds, vec!["Numbers", "total"]);

    let sum = catalog.operator("sum").unwrap();
    assert_eq!(sum.inputs.len(), 1);
    assert_eq!(sum.inputs[0].name, "A");
    assert_eq!(sum.constant_env[0].name, "MODE");
    assert_eq!(sum.configurable_env[0].default_value, "2");
    assert!(sum.command.is_some());
}

#[test]
fn missing_data_kinds_is_an_error() {
    expect_config_error(
        r#"
[config]
poll_interval_ms = 100
"#,
        "at least one [datakind",
    );
}

#[test]
fn unknown_input_kind_is_an_error() {
    expect_config_error(
        r#"
[datakind.numbers]

[operator.sum]
image = "sum:1"
inputs = { A = "pictures" }
"#,
        "unknown data kind 'pictures'",
    );
}

#[test]
fn unknown_output_kind_is_an_error() {
    expect_config_error(
        r#"
[datakind.numbers]

[operator.sum]
image = "sum:1"
inputs = { A = "numbers" }
possible_output_kinds = ["total"]
"#,
        "may produce unknown data kind 'total'",
    );
}

#[test]
fn resource_names_must_be_lowercase_labels() {
    expect_config_error(
        r#"
[datakind.Numbers]
"#,
        "data kind name 'Numbers'",
    );
    expect_config_error(
        r#"
[datakind.numbers]

[operator.sum_all]
image = "sum:1"
"#,
        "operator name 'sum_all'",
    );
}

#[test]
fn slot_names_must_be_env_vars() {
    expect_config_error(
        r#"
[datakind.numbers]

[operator.sum]
image = "sum:1"
inputs = { "in-put" = "numbers" }
"#,
        "not a valid environment variable name",
    );
}

#[test]
fn env_collisions_are_errors() {
    expect_config_error(
        r#"
[datakind.numbers]

[operator.sum]
image = "sum:1"
inputs = { A = "numbers" }
configurable_env = { A = "1" }
"#,
        "declares 'A' more than once",
    );
    expect_config_error(
        r#"
[datakind.numbers]

[operator.sum]
image = "sum:1"
constant_env = { DATAMILL_OUTPUT_DIR = "/tmp" }
"#,
        "reserved env var",
    );
}

#[test]
fn zero_limits_are_rejected() {
    expect_config_error(
        r#"
[config]
max_passes = 0

[datakind.numbers]
"#,
        "max_passes",
    );
    expect_config_error(
        r#"
[config.retry]
max_attempts = 0

[datakind.numbers]
"#,
        "max_attempts",
    );
}

#[test]
fn unknown_keys_fail_to_parse() {
    let file = write_config(
        r#"
[datakind.numbers]
colour = "blue"
"#,
    );
    assert!(matches!(
        load_and_validate(file.path()),
        Err(DatamillError::TomlError(_))
    ));
}

#[test]
fn missing_file_is_an_io_error() {
    assert!(matches!(
        load_and_validate("/definitely/not/here/Datamill.toml"),
        Err(DatamillError::IoError(_))
    ));
}

#[test]
fn builder_produces_valid_config() {
    let cfg: ConfigFile = ConfigFileBuilder::new()
        .with_kind("numbers")
        .with_kind("total")
        .with_operator(
            "sum",
            OperatorConfigBuilder::new("sum:1")
                .input("A", "numbers")
                .output("total")
                .param("PRECISION", "2")
                .build(),
        )
        .build();

    let ops = cfg.operators();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].possible_output_kinds, vec!["total".to_string()]);

    let raw = ConfigFileBuilder::new()
        .with_kind("numbers")
        .with_poll_interval_ms(0)
        .raw();
    assert!(matches!(
        ConfigFile::try_from(raw),
        Err(DatamillError::ConfigError(_))
    ));
}
