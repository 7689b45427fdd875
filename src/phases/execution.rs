//! Phase 4: Execution
//!
//! Runs the schedule level by level. Each level gets its own rayon pool of
//! `min(parallel, level size)` threads and `pool.install` blocks until every
//! directory of the level has finished, so no directory starts before all of
//! its dependencies are done.
//!
//! A level always runs to completion. If any directory in it failed, the
//! remaining levels are not started and their directories are reported as
//! skipped.
//!
//! Each directory runs `init` followed by the requested command through the
//! [`ResilientRunner`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::backend::StateLocation;
use crate::defaults;
use crate::error::{Error, Result};
use crate::graph::ExecutionLevels;
use crate::runner::{Classification, ResilientRunner, RunRequest};

/// Prepared per-directory inputs for a unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitSettings {
    pub env: BTreeMap<String, String>,
    pub init_args: Vec<String>,
    pub state: Option<StateLocation>,
}

#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub command: String,
    /// Extra arguments passed to the command after the built-in ones
    pub args: Vec<String>,
    pub parallel: usize,
    /// Replace the output of unchanged directories with a short message
    pub only_changed: bool,
    /// Run the tool with `TF_LOG=DEBUG`
    pub debug: bool,
    /// Directories to run; everything else is left untouched
    pub selection: Option<BTreeSet<PathBuf>>,
    pub progress: bool,
}

impl ExecutionOptions {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            parallel: defaults::PARALLEL,
            only_changed: false,
            debug: false,
            selection: None,
            progress: false,
        }
    }

    fn command_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if matches!(self.command.as_str(), "apply" | "destroy") {
            args.push("-auto-approve".to_string());
        }
        args.extend(self.args.iter().cloned());
        args
    }

    fn is_selected(&self, dir: &Path) -> bool {
        self.selection
            .as_ref()
            .map_or(true, |selection| selection.contains(dir))
    }
}

/// Outcome of one directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryResult {
    pub directory: PathBuf,
    pub classification: Classification,
    pub output: Vec<String>,
    pub attempts: u32,
}

/// Outcome of a whole run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionSummary {
    pub command: String,
    /// Directories that ran, in schedule order
    pub results: Vec<DirectoryResult>,
    /// Directories never started because an earlier level failed
    pub skipped: Vec<PathBuf>,
    /// Directories outside the selection
    pub not_selected: Vec<PathBuf>,
}

impl ExecutionSummary {
    /// Most severe classification observed
    pub fn status(&self) -> Classification {
        self.results
            .iter()
            .map(|result| result.classification)
            .max()
            .unwrap_or(Classification::Success)
    }

    pub fn exit_code(&self) -> i32 {
        self.status().exit_code()
    }

    pub fn with_classification(&self, classification: Classification) -> Vec<&DirectoryResult> {
        self.results
            .iter()
            .filter(|result| result.classification == classification)
            .collect()
    }

    pub fn failures(&self) -> Vec<&DirectoryResult> {
        self.with_classification(Classification::ToolFailure)
    }

    pub fn iam_changes(&self) -> Vec<&DirectoryResult> {
        self.with_classification(Classification::IamChange)
    }
}

/// Execute Phase 4: run `options.command` over every level.
pub fn execute(
    levels: &ExecutionLevels,
    settings: &BTreeMap<PathBuf, UnitSettings>,
    runner: &ResilientRunner,
    options: &ExecutionOptions,
) -> Result<ExecutionSummary> {
    // Every selected directory must have been prepared before anything runs
    let mut prepared: BTreeMap<&PathBuf, &UnitSettings> = BTreeMap::new();
    for dir in levels.iter().flatten().filter(|dir| options.is_selected(dir)) {
        let unit = settings.get(dir).ok_or_else(|| Error::Config {
            path: dir.clone(),
            message: "directory was selected but not prepared".to_string(),
        })?;
        prepared.insert(dir, unit);
    }

    let mut summary = ExecutionSummary {
        command: options.command.clone(),
        ..ExecutionSummary::default()
    };
    let mut failed = false;

    for (index, level) in levels.iter().enumerate() {
        if failed {
            summary.skipped.extend(level.iter().cloned());
            continue;
        }

        let (selected, not_selected): (Vec<&PathBuf>, Vec<&PathBuf>) =
            level.iter().partition(|dir| options.is_selected(dir));
        summary.not_selected.extend(not_selected.into_iter().cloned());
        let units: Vec<(&PathBuf, &UnitSettings)> = selected
            .into_iter()
            .filter_map(|dir| prepared.get(dir).map(|unit| (dir, *unit)))
            .collect();
        if units.is_empty() {
            continue;
        }

        info!(
            "Level {}: running {} in {} directories",
            index,
            options.command,
            units.len()
        );
        let results = run_level(&units, runner, options)?;
        failed = results
            .iter()
            .any(|result| result.classification == Classification::ToolFailure);
        summary.results.extend(results);

        if failed {
            warn!("Level {} had failures, not starting later levels", index);
        }
    }

    Ok(summary)
}

fn progress_bar(len: usize, enabled: bool) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len as u64);
    let style = ProgressStyle::with_template("{spinner} [{pos}/{len}] {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar
}

fn run_level(
    units: &[(&PathBuf, &UnitSettings)],
    runner: &ResilientRunner,
    options: &ExecutionOptions,
) -> Result<Vec<DirectoryResult>> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.parallel.max(1).min(units.len()))
        .build()?;

    let bar = progress_bar(units.len(), options.progress);
    let results: Mutex<Vec<DirectoryResult>> = Mutex::new(Vec::with_capacity(units.len()));

    pool.install(|| {
        units.par_iter().for_each(|(dir, unit)| {
            // Directories removed since discovery are skipped
            if !dir.is_dir() {
                debug!("{} no longer exists, skipping", dir.display());
                bar.inc(1);
                return;
            }

            let result = run_unit(dir, unit, runner, options);
            bar.set_message(format!(
                "{} {}",
                dir.display(),
                result.classification.label()
            ));
            bar.inc(1);

            match results.lock() {
                Ok(mut results) => results.push(result),
                Err(poisoned) => poisoned.into_inner().push(result),
            }
        });
    });
    bar.finish_and_clear();

    let mut results = results.into_inner().map_err(|_| Error::LockPoisoned {
        context: "level results".to_string(),
    })?;
    results.sort_by(|a, b| a.directory.cmp(&b.directory));
    Ok(results)
}

fn run_unit(
    dir: &Path,
    unit: &UnitSettings,
    runner: &ResilientRunner,
    options: &ExecutionOptions,
) -> DirectoryResult {
    let mut env = unit.env.clone();
    if options.debug {
        env.insert("TF_LOG".to_string(), "DEBUG".to_string());
    }

    let init = runner.run(&RunRequest {
        directory: dir,
        command: "init",
        args: &unit.init_args,
        env: &env,
        state: unit.state.as_ref(),
    });
    if init.classification == Classification::ToolFailure {
        return DirectoryResult {
            directory: dir.to_path_buf(),
            classification: init.classification,
            output: init.lines,
            attempts: init.attempts,
        };
    }

    let command_args = options.command_args();
    let outcome = runner.run(&RunRequest {
        directory: dir,
        command: &options.command,
        args: &command_args,
        env: &env,
        state: unit.state.as_ref(),
    });

    let output = if options.only_changed && outcome.classification == Classification::Success {
        vec![defaults::NO_CHANGES_MESSAGE.to_string()]
    } else {
        outcome.lines
    };

    DirectoryResult {
        directory: dir.to_path_buf(),
        classification: outcome.classification,
        output,
        attempts: outcome.attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingLockTable, ScriptedTool};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        root: PathBuf,
        tool: Arc<ScriptedTool>,
        runner: ResilientRunner,
    }

    impl Fixture {
        fn new(dirs: &[&str]) -> Self {
            let temp = TempDir::new().unwrap();
            let root = temp.path().to_path_buf();
            for dir in dirs {
                std::fs::create_dir_all(root.join(dir)).unwrap();
            }
            let tool = Arc::new(ScriptedTool::new());
            let runner = ResilientRunner::new(tool.clone(), Arc::new(RecordingLockTable::new()));
            Self {
                _temp: temp,
                root,
                tool,
                runner,
            }
        }

        fn dir(&self, name: &str) -> PathBuf {
            self.root.join(name)
        }

        fn levels(&self, levels: &[&[&str]]) -> ExecutionLevels {
            ExecutionLevels {
                levels: levels
                    .iter()
                    .map(|level| level.iter().map(|name| self.dir(name)).collect())
                    .collect(),
            }
        }

        fn run(&self, levels: &ExecutionLevels, options: &ExecutionOptions) -> ExecutionSummary {
            let settings: BTreeMap<PathBuf, UnitSettings> = levels
                .iter()
                .flatten()
                .map(|dir| (dir.clone(), UnitSettings::default()))
                .collect();
            execute(levels, &settings, &self.runner, options).unwrap()
        }
    }

    #[test]
    fn test_levels_run_in_order() {
        let f = Fixture::new(&["a", "b", "c", "d"]);
        let levels = f.levels(&[&["a"], &["b", "c"], &["d"]]);

        let summary = f.run(&levels, &ExecutionOptions::new("apply"));
        assert_eq!(summary.status(), Classification::Success);
        assert_eq!(summary.results.len(), 4);

        // Every call for a later level happens after all calls of earlier levels
        let order: Vec<PathBuf> = f.tool.calls().into_iter().map(|call| call.dir).collect();
        let last = |name: &str| order.iter().rposition(|d| d == &f.dir(name)).unwrap();
        let first = |name: &str| order.iter().position(|d| d == &f.dir(name)).unwrap();
        assert!(last("a") < first("b"));
        assert!(last("a") < first("c"));
        assert!(last("b").max(last("c")) < first("d"));
    }

    #[test]
    fn test_unit_runs_init_then_command() {
        let f = Fixture::new(&["a"]);
        let mut settings = BTreeMap::new();
        let mut env = BTreeMap::new();
        env.insert("AWS_REGION".to_string(), "us-west-2".to_string());
        settings.insert(
            f.dir("a"),
            UnitSettings {
                env,
                init_args: vec!["-reconfigure".to_string()],
                state: None,
            },
        );

        let options = ExecutionOptions {
            debug: true,
            ..ExecutionOptions::new("apply")
        };
        execute(&f.levels(&[&["a"]]), &settings, &f.runner, &options).unwrap();

        let calls = f.tool.calls();
        assert_eq!(
            f.tool.command_lines(),
            vec!["init -reconfigure", "apply -auto-approve"]
        );
        assert_eq!(calls[1].env["AWS_REGION"], "us-west-2");
        assert_eq!(calls[1].env["TF_LOG"], "DEBUG");
    }

    #[test]
    fn test_failure_completes_level_then_stops() {
        let f = Fixture::new(&["a", "b", "c", "d"]);
        f.tool.respond_in(&f.dir("a"), "apply", 1, "Error: boom");
        let levels = f.levels(&[&["a", "b"], &["c"], &["d"]]);

        let summary = f.run(&levels, &ExecutionOptions::new("apply"));
        assert_eq!(summary.status(), Classification::ToolFailure);
        assert_eq!(summary.exit_code(), 3);
        // b still ran to completion
        assert_eq!(
            summary.results.iter().map(|r| r.directory.clone()).collect::<Vec<_>>(),
            vec![f.dir("a"), f.dir("b")]
        );
        assert_eq!(summary.skipped, vec![f.dir("c"), f.dir("d")]);
        assert!(f.tool.calls_in(&f.dir("c")).is_empty());
        assert_eq!(summary.failures()[0].output, vec!["Error: boom"]);
    }

    #[test]
    fn test_init_failure_skips_command() {
        let f = Fixture::new(&["a"]);
        f.tool.respond("init", 1, "Error: Backend initialization required");

        let summary = f.run(&f.levels(&[&["a"]]), &ExecutionOptions::new("plan"));
        assert_eq!(summary.status(), Classification::ToolFailure);
        assert_eq!(f.tool.command_lines(), vec!["init"]);
    }

    #[test]
    fn test_worst_classification_wins() {
        let f = Fixture::new(&["a", "b", "c"]);
        f.tool
            .respond_in(&f.dir("b"), "plan", 2, "  # aws_s3_bucket.x will be created")
            .respond_in(&f.dir("c"), "plan", 2, "  # aws_iam_role.r will be created");

        let summary = f.run(&f.levels(&[&["a", "b", "c"]]), &ExecutionOptions::new("plan"));
        assert_eq!(summary.status(), Classification::IamChange);
        assert_eq!(summary.exit_code(), 2);
        assert_eq!(summary.iam_changes().len(), 1);
        assert_eq!(summary.with_classification(Classification::DiffPresent).len(), 1);
    }

    #[test]
    fn test_only_changed_replaces_unchanged_output() {
        let f = Fixture::new(&["a", "b"]);
        f.tool
            .respond_in(&f.dir("a"), "plan", 0, "No changes. Infrastructure is up-to-date.")
            .respond_in(&f.dir("b"), "plan", 2, "Plan: 1 to add");

        let options = ExecutionOptions {
            only_changed: true,
            ..ExecutionOptions::new("plan")
        };
        let summary = f.run(&f.levels(&[&["a", "b"]]), &options);
        assert_eq!(summary.results[0].output, vec!["No changes detected."]);
        assert_eq!(summary.results[1].output, vec!["Plan: 1 to add"]);
    }

    #[test]
    fn test_unselected_directories_are_not_run() {
        let f = Fixture::new(&["a", "b", "c"]);
        let options = ExecutionOptions {
            selection: Some([f.dir("b")].into_iter().collect()),
            ..ExecutionOptions::new("plan")
        };

        let summary = f.run(&f.levels(&[&["a"], &["b", "c"]]), &options);
        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.not_selected, vec![f.dir("a"), f.dir("c")]);
        assert!(f.tool.calls().iter().all(|call| call.dir == f.dir("b")));
    }

    #[test]
    fn test_vanished_directory_is_skipped() {
        let f = Fixture::new(&["a"]);
        let levels = f.levels(&[&["a", "gone"]]);

        let summary = f.run(&levels, &ExecutionOptions::new("plan"));
        assert_eq!(summary.results.len(), 1);
        assert!(f.tool.calls_in(&f.dir("gone")).is_empty());
    }

    #[test]
    fn test_unprepared_directory_aborts_before_running() {
        let f = Fixture::new(&["a", "b"]);
        let mut settings = BTreeMap::new();
        settings.insert(f.dir("a"), UnitSettings::default());

        let err = execute(
            &f.levels(&[&["a"], &["b"]]),
            &settings,
            &f.runner,
            &ExecutionOptions::new("plan"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config { ref path, .. } if path == &f.dir("b")));
        assert!(f.tool.calls().is_empty());
    }

    #[test]
    fn test_empty_schedule() {
        let f = Fixture::new(&[]);
        let summary = f.run(&ExecutionLevels::default(), &ExecutionOptions::new("plan"));
        assert_eq!(summary.status(), Classification::Success);
        assert!(summary.results.is_empty());
    }
}
