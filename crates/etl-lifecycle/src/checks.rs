// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Verifications run against a project directory.
//!
//! Each [`ProjectCheck`] inspects the checked-out project and reports one
//! [`SubCheck`]. A [`CheckRunner`] runs a fixed ordered list of checks and
//! aggregates their results. Checks are synchronous file system scans and are
//! run on the blocking thread pool by the checker.

use std::fs;
use std::path::Path;

use tracing::warn;

use crate::model::{CheckResult, ProjectOutputType, SubCheck, SubCheckResult};

/// A verification of a checked-out project.
pub trait ProjectCheck: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Inspect an existing project directory.
    fn inspect(&self, project_dir: &Path, output_type: ProjectOutputType) -> SubCheck;

    /// Run the check; fails when the project directory does not exist.
    fn run(&self, project_dir: &Path, output_type: ProjectOutputType) -> SubCheck {
        if !project_dir.is_dir() {
            return SubCheck::failed(format!(
                "Project directory {} does not exist in the repository",
                project_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            ));
        }
        self.inspect(project_dir, output_type)
    }
}

/// Settings, requirements and the output-type manifest must exist.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequiredFilesCheck;

impl RequiredFilesCheck {
    /// Files every project must carry, in reporting order.
    pub fn required_files(output_type: ProjectOutputType) -> [&'static str; 3] {
        ["settings.yaml", "requirements.txt", output_type.manifest_file()]
    }
}

impl ProjectCheck for RequiredFilesCheck {
    fn name(&self) -> &'static str {
        "required_files"
    }

    fn inspect(&self, project_dir: &Path, output_type: ProjectOutputType) -> SubCheck {
        let missing: Vec<&str> = Self::required_files(output_type)
            .into_iter()
            .filter(|file| !project_dir.join(file).is_file())
            .collect();

        if missing.is_empty() {
            SubCheck::success("All required files are present")
        } else {
            SubCheck::failed(format!(
                "Project directory is missing required files: {}",
                missing.join(", ")
            ))
        }
    }
}

/// Flags Python sources that materialize Spark data frames on the driver.
#[derive(Debug, Clone)]
pub struct MaterializationCallCheck {
    pattern: String,
}

impl Default for MaterializationCallCheck {
    fn default() -> Self {
        Self {
            pattern: ".toPandas()".to_string(),
        }
    }
}

impl MaterializationCallCheck {
    /// Collect offending files, relative to `root`, into `found`.
    fn scan(&self, root: &Path, dir: &Path, found: &mut Vec<String>) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Failed to read directory");
                return;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || name == "__pycache__" {
                continue;
            }

            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };

            if file_type.is_dir() {
                self.scan(root, &path, found);
            } else if file_type.is_file() && name.ends_with(".py") {
                let Ok(contents) = fs::read(&path) else {
                    continue;
                };
                if contents.is_empty() {
                    continue;
                }
                if String::from_utf8_lossy(&contents).contains(&self.pattern) {
                    let relative = path.strip_prefix(root).unwrap_or(&path);
                    found.push(relative.to_string_lossy().into_owned());
                }
            }
        }
    }
}

impl ProjectCheck for MaterializationCallCheck {
    fn name(&self) -> &'static str {
        "materialization_call"
    }

    fn inspect(&self, project_dir: &Path, _output_type: ProjectOutputType) -> SubCheck {
        let mut found = Vec::new();
        self.scan(project_dir, project_dir, &mut found);
        found.sort();

        if found.is_empty() {
            SubCheck::success(format!("No {} calls found", self.pattern))
        } else {
            SubCheck::warning(format!(
                "{} calls found in {}; they load the whole data frame into driver memory and may fail the DAG",
                self.pattern,
                found.join(", ")
            ))
        }
    }
}

/// Outcome of running all checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    /// Aggregate result.
    pub result: CheckResult,
    /// Sub-check results in check order.
    pub checks: Vec<SubCheck>,
}

/// Aggregate sub-checks: FAILED if any failed, SUCCESS otherwise.
pub fn aggregate(checks: &[SubCheck]) -> CheckResult {
    if checks.iter().any(|c| c.result == SubCheckResult::Failed) {
        CheckResult::Failed
    } else {
        CheckResult::Success
    }
}

/// Ordered list of project checks.
pub struct CheckRunner {
    checks: Vec<Box<dyn ProjectCheck>>,
}

impl Default for CheckRunner {
    fn default() -> Self {
        Self::new(vec![
            Box::new(RequiredFilesCheck),
            Box::new(MaterializationCallCheck::default()),
        ])
    }
}

impl CheckRunner {
    /// Create a runner over the given checks.
    pub fn new(checks: Vec<Box<dyn ProjectCheck>>) -> Self {
        Self { checks }
    }

    /// Names of the configured checks, in order.
    pub fn check_names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    /// Run every check against the project directory.
    pub fn run(&self, project_dir: &Path, output_type: ProjectOutputType) -> CheckOutcome {
        let checks: Vec<SubCheck> = self
            .checks
            .iter()
            .map(|check| check.run(project_dir, output_type))
            .collect();
        CheckOutcome {
            result: aggregate(&checks),
            checks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn project(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (path, contents) in files {
            let full = dir.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, contents).unwrap();
        }
        dir
    }

    #[test]
    fn test_required_files_present() {
        let dir = project(&[
            ("settings.yaml", "a: 1"),
            ("requirements.txt", ""),
            ("features.yaml", "[]"),
        ]);
        let check = RequiredFilesCheck.run(dir.path(), ProjectOutputType::Features);
        assert_eq!(check.result, SubCheckResult::Success);
    }

    #[test]
    fn test_required_files_names_missing_manifest() {
        let dir = project(&[("settings.yaml", "a: 1"), ("requirements.txt", "")]);
        let check = RequiredFilesCheck.run(dir.path(), ProjectOutputType::Targets);
        assert_eq!(check.result, SubCheckResult::Failed);
        assert!(check.description.ends_with(": targets.yaml"));
    }

    #[test]
    fn test_required_files_names_every_missing_file() {
        let dir = project(&[("requirements.txt", "")]);
        let check = RequiredFilesCheck.run(dir.path(), ProjectOutputType::Aggregates);
        assert!(check.description.ends_with(": settings.yaml, aggregates.yaml"));
    }

    #[test]
    fn test_missing_project_dir_fails_every_check() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        let outcome = CheckRunner::default().run(&missing, ProjectOutputType::Features);
        assert_eq!(outcome.result, CheckResult::Failed);
        assert_eq!(outcome.checks.len(), 2);
        assert!(
            outcome
                .checks
                .iter()
                .all(|c| c.result == SubCheckResult::Failed)
        );
    }

    #[test]
    fn test_materialization_call_skips_hidden_cache_and_empty() {
        let dir = project(&[
            ("jobs/build.py", "df.toPandas()\n"),
            ("jobs/clean.py", "df.count()\n"),
            (".venv/lib.py", "df.toPandas()"),
            ("jobs/__pycache__/build.py", "df.toPandas()"),
            ("jobs/notes.txt", "df.toPandas()"),
            ("jobs/empty.py", ""),
        ]);
        let check = MaterializationCallCheck::default().run(dir.path(), ProjectOutputType::Features);
        assert_eq!(check.result, SubCheckResult::Warning);
        assert!(check.description.contains("jobs/build.py"));
        assert!(!check.description.contains(".venv"));
        assert!(!check.description.contains("__pycache__"));
        assert!(!check.description.contains("notes.txt"));
    }

    #[test]
    fn test_warning_does_not_fail_aggregate() {
        let checks = vec![SubCheck::success("ok"), SubCheck::warning("hm")];
        assert_eq!(aggregate(&checks), CheckResult::Success);
        let checks = vec![SubCheck::warning("hm"), SubCheck::failed("no")];
        assert_eq!(aggregate(&checks), CheckResult::Failed);
    }

    #[test]
    fn test_runner_order() {
        assert_eq!(
            CheckRunner::default().check_names(),
            vec!["required_files", "materialization_call"]
        );
    }
}
