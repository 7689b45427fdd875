//! End-to-end tests for the `tfstage validate` command.

#[allow(dead_code)]
mod common;
use common::prelude::*;

#[test]
fn test_validate_success() {
    TestFixture::new()
        .with_root_config(configs::WITH_TEXT_ENV)
        .with_dir("network", "")
        .with_dir("app", &module("../network"))
        .command()
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Found 2 directories with 1 dependencies"))
        .stdout(predicate::str::contains("Validation passed"));
}

#[test]
fn test_validate_unknown_field() {
    TestFixture::new()
        .with_root_config(configs::UNKNOWN_FIELD)
        .with_dir("network", "")
        .command()
        .arg("validate")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Configuration error"));
}

#[test]
fn test_validate_invalid_yaml() {
    TestFixture::new()
        .with_root_config(configs::INVALID_YAML)
        .with_dir("network", "")
        .command()
        .arg("validate")
        .assert()
        .code(1);
}

#[test]
fn test_validate_missing_backend() {
    TestFixture::new()
        .with_dir("network", "")
        .command()
        .arg("validate")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("network"))
        .stdout(predicate::str::contains("no backend block declared"));
}

#[test]
fn test_validate_backend_declared() {
    TestFixture::new()
        .with_root_config(
            "backends:\n  s3:\n    region: us-east-1\n    bucket: state\n    dynamodb_table: locks\n",
        )
        .with_dir("network", "terraform {\n  backend \"s3\" {}\n}\n")
        .command()
        .arg("validate")
        .assert()
        .success();
}

#[test]
fn test_validate_cycle() {
    TestFixture::new()
        .with_root_config(configs::NO_BACKEND)
        .with_dir("a", &module("../b"))
        .with_dir("b", &module("../a"))
        .command()
        .arg("validate")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Cycle detected"));
}
