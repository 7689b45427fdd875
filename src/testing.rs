//! In-memory fakes for the external collaborators, shared by unit tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::lock_table::LockTable;
use crate::secrets::SecretStore;
use crate::tool::{ToolInvoker, ToolOutput};

pub fn lines(text: &str) -> Vec<String> {
    text.lines().map(str::to_string).collect()
}

pub struct MemorySecretStore {
    values: HashMap<String, String>,
    calls: Mutex<usize>,
}

impl MemorySecretStore {
    pub fn new(values: &[(&str, &str)]) -> Self {
        Self {
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, path: &str) -> Result<String> {
        *self.calls.lock().unwrap() += 1;
        self.values
            .get(path)
            .cloned()
            .ok_or_else(|| Error::SecretNotFound {
                path: path.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub args: Vec<String>,
    pub dir: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl ToolCall {
    pub fn command_line(&self) -> String {
        self.args.join(" ")
    }
}

/// Tool that replays queued outputs keyed by command (the first argument).
///
/// Responses registered for a specific directory win over directory-less
/// ones. The last queued output repeats once the queue drains, and an
/// unscripted command succeeds with no output.
#[derive(Default)]
pub struct ScriptedTool {
    responses: Mutex<HashMap<(Option<PathBuf>, String), VecDeque<ToolOutput>>>,
    calls: Mutex<Vec<ToolCall>>,
}

impl ScriptedTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, command: &str, exit_code: i32, output: &str) -> &Self {
        self.push(None, command, ToolOutput::new(exit_code, lines(output)))
    }

    pub fn respond_in(&self, dir: &Path, command: &str, exit_code: i32, output: &str) -> &Self {
        self.push(
            Some(dir.to_path_buf()),
            command,
            ToolOutput::new(exit_code, lines(output)),
        )
    }

    fn push(&self, dir: Option<PathBuf>, command: &str, output: ToolOutput) -> &Self {
        self.responses
            .lock()
            .unwrap()
            .entry((dir, command.to_string()))
            .or_default()
            .push_back(output);
        self
    }

    pub fn calls(&self) -> Vec<ToolCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(ToolCall::command_line).collect()
    }

    pub fn calls_in(&self, dir: &Path) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|call| call.dir == dir)
            .map(ToolCall::command_line)
            .collect()
    }

    fn next(queue: &mut VecDeque<ToolOutput>) -> Option<ToolOutput> {
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

impl ToolInvoker for ScriptedTool {
    fn invoke(
        &self,
        args: &[String],
        working_dir: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<ToolOutput> {
        self.calls.lock().unwrap().push(ToolCall {
            args: args.to_vec(),
            dir: working_dir.to_path_buf(),
            env: env.clone(),
        });

        let command = args.first().cloned().unwrap_or_default();
        let mut responses = self.responses.lock().unwrap();
        let scoped = responses
            .get_mut(&(Some(working_dir.to_path_buf()), command.clone()))
            .and_then(Self::next);
        if let Some(output) = scoped {
            return Ok(output);
        }
        let output = responses
            .get_mut(&(None, command))
            .and_then(Self::next)
            .unwrap_or_else(|| ToolOutput::new(0, Vec::new()));
        Ok(output)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockTableCall {
    Upsert {
        table: String,
        record_key: String,
        field: String,
        value: String,
    },
    Delete {
        table: String,
        record_key: String,
    },
}

#[derive(Default)]
pub struct RecordingLockTable {
    calls: Mutex<Vec<LockTableCall>>,
    fail: bool,
}

impl RecordingLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<LockTableCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: LockTableCall) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if self.fail {
            return Err(Error::LockTable {
                table: "test".to_string(),
                record: "test".to_string(),
                message: "access denied".to_string(),
            });
        }
        Ok(())
    }
}

impl LockTable for RecordingLockTable {
    fn upsert(&self, table: &str, record_key: &str, field: &str, value: &str) -> Result<()> {
        self.record(LockTableCall::Upsert {
            table: table.to_string(),
            record_key: record_key.to_string(),
            field: field.to_string(),
            value: value.to_string(),
        })
    }

    fn delete(&self, table: &str, record_key: &str) -> Result<()> {
        self.record(LockTableCall::Delete {
            table: table.to_string(),
            record_key: record_key.to_string(),
        })
    }
}
