//! Resilient execution of one tool command in one directory.
//!
//! The runner invokes the tool, classifies the captured output and, for a
//! small set of remote-state failures, repairs the backend and retries:
//!
//! - **lock held**: a lock older than the lock timeout is force-unlocked.
//!   A younger lock is never stolen.
//! - **digest mismatch**: the digest record in the lock table is rewritten
//!   (or deleted when the message carries no digest).
//! - **persist failed**: a saved `errored.tfstate` is pushed back.
//!
//! Transient network errors are retried without repair after a jittered
//! exponential backoff. All retries share the same budget of [`MAX_ATTEMPTS`]
//! invocations.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use regex::Regex;
use serde::Serialize;

use crate::backend::StateLocation;
use crate::defaults;
use crate::error::{Error, Result};
use crate::lock_table::{digest_record_key, LockTable, DIGEST_ATTRIBUTE};
use crate::tool::{ToolInvoker, ToolOutput};

/// Maximum number of invocations per directory and command
pub const MAX_ATTEMPTS: u32 = 5;

/// Local state snapshot written by the tool when it fails to persist state
pub const ERRORED_STATE_FILE: &str = "errored.tfstate";

/// Backoff before the first retry of a transient error
pub const RETRY_BASE_DELAY: StdDuration = StdDuration::from_secs(2);

/// Upper bound of any single backoff
pub const RETRY_MAX_DELAY: StdDuration = StdDuration::from_secs(30);

const LOCK_HELD: &str = "Error acquiring the state lock";
const DIGEST_MISMATCH: &str = "does not have the expected content";
const PERSIST_FAILED: &str = "Failed to persist state to backend";

/// Output fragments of network failures worth retrying as-is
pub const TRANSIENT_ERRORS: &[&str] = &[
    "RequestError: send request failed",
    "unexpected EOF",
    "Throttling",
    "timeout while waiting for state",
    "ServiceUnavailable: Service Unavailable",
    "failed to decode query XML error response",
    "connection reset by peer",
    "Please try again.",
    "Client.Timeout exceeded",
    "Request limit for operation",
];

/// Outcome of one directory's command, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Success,
    DiffPresent,
    IamChange,
    ToolFailure,
}

impl Classification {
    /// Process exit code for a batch whose worst outcome is `self`
    pub fn exit_code(self) -> i32 {
        match self {
            Classification::Success | Classification::DiffPresent => 0,
            Classification::IamChange => 2,
            Classification::ToolFailure => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Classification::Success => "success",
            Classification::DiffPresent => "changes",
            Classification::IamChange => "iam changes",
            Classification::ToolFailure => "failed",
        }
    }
}

/// Repair to perform before retrying a failed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairAction {
    StealLock {
        id: String,
        created: DateTime<Utc>,
    },
    RepairDigest {
        digest: Option<String>,
    },
    RepushState,
    None,
}

// Diagnostics may be drawn inside a box: `│   ID:  ...`
fn lock_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[\s│]*ID:\s*(\S+)").expect("valid regex"))
}

fn lock_created_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^[\s│]*Created:\s*(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}(?:\.\d+)?) ([+-]\d{4})")
            .expect("valid regex")
    })
}

fn digest_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([0-9a-fA-F]{32})\b").expect("valid regex"))
}

fn iam_change_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*#\s+(\S+)\s+(?:will|must) be\b").expect("valid regex"))
}

fn index_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[[^\]]*\]").expect("valid regex"))
}

fn parse_lock_created(text: &str) -> Option<DateTime<Utc>> {
    let captures = lock_created_regex().captures(text)?;
    let stamp = format!("{} {}", &captures[1], &captures[2]);
    DateTime::parse_from_str(&stamp, "%Y-%m-%d %H:%M:%S%.f %z")
        .ok()
        .map(|created| created.with_timezone(&Utc))
}

/// Map captured output to the repair that would let a retry succeed.
///
/// A lock message without a parseable ID or creation time is not repairable.
pub fn classify(lines: &[String]) -> RepairAction {
    let text = lines.join("\n");

    if text.contains(LOCK_HELD) {
        let id = lock_id_regex()
            .captures(&text)
            .map(|captures| captures[1].to_string());
        return match (id, parse_lock_created(&text)) {
            (Some(id), Some(created)) => RepairAction::StealLock { id, created },
            _ => RepairAction::None,
        };
    }

    if text.contains(DIGEST_MISMATCH) {
        let digest = digest_regex()
            .captures(&text)
            .map(|captures| captures[1].to_lowercase());
        return RepairAction::RepairDigest { digest };
    }

    if text.contains(PERSIST_FAILED) {
        return RepairAction::RepushState;
    }

    RepairAction::None
}

/// Lines of `lines` that report a transient network error.
pub fn transient_errors(lines: &[String]) -> Vec<&str> {
    lines
        .iter()
        .filter(|line| TRANSIENT_ERRORS.iter().any(|error| line.contains(error)))
        .map(String::as_str)
        .collect()
}

/// Addresses of planned changes to IAM resources.
///
/// Matches plan lines such as `# aws_iam_role.deploy will be created`; the
/// resource type is the second to last segment of the address.
pub fn detect_iam_changes(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| iam_change_regex().captures(line))
        .map(|captures| captures[1].to_string())
        .filter(|address| {
            let plain = index_regex().replace_all(address, "");
            let segments: Vec<&str> = plain.split('.').collect();
            segments.len() >= 2 && segments[segments.len() - 2].contains("iam")
        })
        .collect()
}

/// Classify the final exit code of `command`.
pub fn classify_exit(command: &str, exit_code: i32, lines: &[String]) -> Classification {
    match (command, exit_code) {
        (_, 0) => Classification::Success,
        ("plan", 2) => {
            if detect_iam_changes(lines).is_empty() {
                Classification::DiffPresent
            } else {
                Classification::IamChange
            }
        }
        _ => Classification::ToolFailure,
    }
}

/// Delay before retry number `retry` (1-based) of a transient error.
///
/// Doubles from [`RETRY_BASE_DELAY`] up to [`RETRY_MAX_DELAY`]; `jitter` in
/// `[0, 1]` picks a point in the upper half of that ceiling.
pub fn backoff_delay(retry: u32, jitter: f64) -> StdDuration {
    let exponent = retry.saturating_sub(1).min(16);
    let ceiling = RETRY_BASE_DELAY
        .saturating_mul(1u32 << exponent)
        .min(RETRY_MAX_DELAY);
    ceiling.mul_f64(0.5 + 0.5 * jitter.clamp(0.0, 1.0))
}

/// Source of the current time for lock-age checks, and of retry delays
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn sleep(&self, duration: StdDuration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: StdDuration) {
        std::thread::sleep(duration);
    }
}

/// One command to run in one directory
#[derive(Debug, Clone, Copy)]
pub struct RunRequest<'a> {
    pub directory: &'a Path,
    pub command: &'a str,
    pub args: &'a [String],
    pub env: &'a BTreeMap<String, String>,
    pub state: Option<&'a StateLocation>,
}

/// Final result of a [`RunRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub classification: Classification,
    pub exit_code: i32,
    pub lines: Vec<String>,
    pub attempts: u32,
}

impl RunOutcome {
    fn terminal(command: &str, output: ToolOutput, attempts: u32) -> Self {
        Self {
            classification: classify_exit(command, output.exit_code, &output.lines),
            exit_code: output.exit_code,
            lines: output.lines,
            attempts,
        }
    }

    fn launch_failure(err: &Error, attempts: u32) -> Self {
        Self {
            classification: Classification::ToolFailure,
            exit_code: 1,
            lines: vec![err.to_string()],
            attempts,
        }
    }
}

/// What to do after a failed attempt
enum Retry {
    No,
    Now,
    Backoff,
}

/// Runs tool commands with classification-driven repair and retry
pub struct ResilientRunner {
    tool: Arc<dyn ToolInvoker>,
    lock_table: Arc<dyn LockTable>,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
}

impl ResilientRunner {
    pub fn new(tool: Arc<dyn ToolInvoker>, lock_table: Arc<dyn LockTable>) -> Self {
        Self {
            tool,
            lock_table,
            clock: Arc::new(SystemClock),
            lock_timeout: Duration::minutes(defaults::LOCK_TIMEOUT_MINUTES),
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn tool(&self) -> &dyn ToolInvoker {
        self.tool.as_ref()
    }

    /// Run `request` to completion. Failures are reported in the outcome,
    /// never as an error.
    pub fn run(&self, request: &RunRequest) -> RunOutcome {
        let mut args = vec![request.command.to_string()];
        if request.command == "plan" {
            args.push("-detailed-exitcode".to_string());
        }
        args.extend(request.args.iter().cloned());

        let mut attempt = 0;
        let mut transient_retries = 0;
        loop {
            attempt += 1;
            let output = match self.tool.invoke(&args, request.directory, request.env) {
                Ok(output) => output,
                Err(e) => return RunOutcome::launch_failure(&e, attempt),
            };

            if output.success() || (request.command == "plan" && output.exit_code == 2) {
                return RunOutcome::terminal(request.command, output, attempt);
            }

            if attempt >= MAX_ATTEMPTS {
                warn!(
                    "Giving up on {} in {} after {} attempts",
                    request.command,
                    request.directory.display(),
                    attempt
                );
                return RunOutcome::terminal(request.command, output, attempt);
            }

            match self.repair(request, &output) {
                Ok(Retry::Backoff) => {
                    transient_retries += 1;
                    let delay = backoff_delay(transient_retries, rand::random::<f64>());
                    debug!(
                        "Retrying {} in {} after {:.1}s (attempt {})",
                        request.command,
                        request.directory.display(),
                        delay.as_secs_f64(),
                        attempt + 1
                    );
                    self.clock.sleep(delay);
                }
                Ok(Retry::Now) => {
                    debug!(
                        "Retrying {} in {} (attempt {})",
                        request.command,
                        request.directory.display(),
                        attempt + 1
                    );
                }
                Ok(Retry::No) => return RunOutcome::terminal(request.command, output, attempt),
                Err(e) => {
                    error!("{}", e);
                    return RunOutcome::terminal(request.command, output, attempt);
                }
            }
        }
    }

    /// Perform the repair the output calls for. Returns whether and when a
    /// retry is worthwhile.
    fn repair(&self, request: &RunRequest, output: &ToolOutput) -> Result<Retry> {
        match classify(&output.lines) {
            RepairAction::StealLock { id, created } => {
                let age = self.clock.now() - created;
                if age <= self.lock_timeout {
                    info!(
                        "State lock {} in {} is held ({} minutes old), not stealing it",
                        id,
                        request.directory.display(),
                        age.num_minutes()
                    );
                    return Ok(Retry::No);
                }
                warn!(
                    "Force-unlocking stale state lock {} in {} ({} minutes old)",
                    id,
                    request.directory.display(),
                    age.num_minutes()
                );
                self.invoke_repair(request, &["force-unlock", "-force", &id])?;
                Ok(Retry::Now)
            }
            RepairAction::RepairDigest { digest } => {
                let state = request.state.ok_or_else(|| Error::Repair {
                    dir: request.directory.to_path_buf(),
                    message: "state digest mismatch but no s3 backend is configured".to_string(),
                })?;
                let table = state.lock_table.as_deref().ok_or_else(|| Error::Repair {
                    dir: request.directory.to_path_buf(),
                    message: "state digest mismatch but no lock table is configured".to_string(),
                })?;
                let record_key = digest_record_key(&state.bucket, &state.key);
                match digest {
                    Some(digest) => {
                        warn!("Updating state digest {} to {}", record_key, digest);
                        self.lock_table
                            .upsert(table, &record_key, DIGEST_ATTRIBUTE, &digest)?;
                    }
                    None => {
                        warn!("Removing state digest {}", record_key);
                        self.lock_table.delete(table, &record_key)?;
                    }
                }
                Ok(Retry::Now)
            }
            RepairAction::RepushState => {
                if !request.directory.join(ERRORED_STATE_FILE).is_file() {
                    info!(
                        "State persist failed in {} and no {} to push",
                        request.directory.display(),
                        ERRORED_STATE_FILE
                    );
                    return Ok(Retry::No);
                }
                warn!("Pushing {} in {}", ERRORED_STATE_FILE, request.directory.display());
                self.invoke_repair(request, &["state", "push", ERRORED_STATE_FILE])?;
                Ok(Retry::Now)
            }
            RepairAction::None => {
                let transient = transient_errors(&output.lines);
                if transient.is_empty() {
                    return Ok(Retry::No);
                }
                warn!(
                    "Network errors running {} in {}: {}",
                    request.command,
                    request.directory.display(),
                    transient.join("; ")
                );
                Ok(Retry::Backoff)
            }
        }
    }

    fn invoke_repair(&self, request: &RunRequest, args: &[&str]) -> Result<()> {
        let args: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
        let output = self
            .tool
            .invoke(&args, request.directory, request.env)
            .map_err(|e| Error::Repair {
                dir: request.directory.to_path_buf(),
                message: e.to_string(),
            })?;
        if !output.success() {
            return Err(Error::Repair {
                dir: request.directory.to_path_buf(),
                message: format!("'{}' exited with {}", args.join(" "), output.exit_code),
            });
        }
        Ok(())
    }
}
