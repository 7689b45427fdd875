//! Access to the remote lock/state-tracking table.
//!
//! The S3 backend keeps a digest of every state file in a DynamoDB table next
//! to the lock entries. When that digest drifts from the stored state the
//! runner rewrites or removes the record through the [`LockTable`] trait.

use std::process::Command;

use log::debug;

use crate::error::{Error, Result};

/// Primary key attribute of the lock table
pub const LOCK_KEY_ATTRIBUTE: &str = "LockID";

/// Attribute holding the state digest
pub const DIGEST_ATTRIBUTE: &str = "Digest";

/// Record key under which the backend tracks the digest of a state file.
pub fn digest_record_key(bucket: &str, state_key: &str) -> String {
    format!("{}/{}-md5", bucket, state_key)
}

/// Write access to the lock table. Both operations are idempotent.
pub trait LockTable: Send + Sync {
    fn upsert(&self, table: &str, record_key: &str, field: &str, value: &str) -> Result<()>;

    fn delete(&self, table: &str, record_key: &str) -> Result<()>;
}

/// Lock table backed by the `aws dynamodb` CLI.
pub struct AwsDynamoLockTable {
    region: Option<String>,
}

impl AwsDynamoLockTable {
    pub fn new(region: Option<String>) -> Self {
        Self { region }
    }

    fn run(&self, table: &str, record_key: &str, args: Vec<String>) -> Result<()> {
        let mut command = Command::new("aws");
        command.arg("dynamodb").args(&args);
        if let Some(region) = &self.region {
            command.args(["--region", region]);
        }
        debug!("aws dynamodb {}", args.join(" "));

        let output = command.output().map_err(|e| Error::LockTable {
            table: table.to_string(),
            record: record_key.to_string(),
            message: e.to_string(),
        })?;

        if !output.status.success() {
            return Err(Error::LockTable {
                table: table.to_string(),
                record: record_key.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

fn key_json(record_key: &str) -> String {
    serde_json::json!({ LOCK_KEY_ATTRIBUTE: { "S": record_key } }).to_string()
}

impl LockTable for AwsDynamoLockTable {
    fn upsert(&self, table: &str, record_key: &str, field: &str, value: &str) -> Result<()> {
        let values = serde_json::json!({ ":d": { "S": value } }).to_string();
        self.run(
            table,
            record_key,
            vec![
                "update-item".to_string(),
                "--table-name".to_string(),
                table.to_string(),
                "--key".to_string(),
                key_json(record_key),
                "--update-expression".to_string(),
                format!("SET {} = :d", field),
                "--expression-attribute-values".to_string(),
                values,
            ],
        )
    }

    fn delete(&self, table: &str, record_key: &str) -> Result<()> {
        self.run(
            table,
            record_key,
            vec![
                "delete-item".to_string(),
                "--table-name".to_string(),
                table.to_string(),
                "--key".to_string(),
                key_json(record_key),
            ],
        )
    }
}
