//! Terraform CLI binding plus the apply-with-import recovery protocol.
//!
//! Applies are not idempotent across resources created out-of-band (an
//! OpenAI model deployment or workspace notebook may already exist). The
//! recovery protocol detects the known conflict signatures in captured apply
//! output, imports the conflicting resources into state, and retries the
//! apply exactly once. Anything else propagates the original failure
//! verbatim, exit code included.

use crate::process::{self, Captured, CommandError};
use anyhow::Result;
use regex::Regex;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// One terraform stack bound to its working directory.
pub struct Terraform {
    bin: PathBuf,
    dir: PathBuf,
}

impl Terraform {
    pub fn new(dir: PathBuf) -> Self {
        Terraform {
            bin: PathBuf::from("terraform"),
            dir,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn chdir(&self) -> String {
        format!("-chdir={}", self.dir.display())
    }

    pub fn init(&self) -> Result<(), CommandError> {
        process::run(&self.bin, &[self.chdir(), "init".into()])
    }

    pub fn apply(&self) -> Result<(), CommandError> {
        process::run(
            &self.bin,
            &[self.chdir(), "apply".into(), "-auto-approve".into()],
        )
    }

    pub fn destroy(&self) -> Result<(), CommandError> {
        process::run(
            &self.bin,
            &[self.chdir(), "destroy".into(), "-auto-approve".into()],
        )
    }

    /// Read a single raw output value.
    pub fn output(&self, name: &str) -> Result<String, CommandError> {
        process::run_capture(
            &self.bin,
            &[self.chdir(), "output".into(), "-raw".into(), name.into()],
        )
    }

    /// Read an output, mapping subprocess failure to `None`.
    pub fn output_optional(&self, name: &str) -> Option<String> {
        self.output(name).ok()
    }

    /// Read an output, forcing one apply when the first read fails.
    pub fn output_or_apply(&self, name: &str) -> Result<String, CommandError> {
        match self.output(name) {
            Ok(value) => Ok(value),
            Err(_) => {
                self.apply()?;
                self.output(name)
            }
        }
    }
}

/// Seam between the recovery protocol and the terraform binary, so the
/// protocol is testable with a scripted runner.
pub trait StackRunner {
    fn apply_captured(&self) -> Result<Captured, CommandError>;
    fn import(&self, address: &str, id: &str) -> Result<(), CommandError>;
}

impl StackRunner for Terraform {
    fn apply_captured(&self) -> Result<Captured, CommandError> {
        process::run_captured_lenient(
            &self.bin,
            &[self.chdir(), "apply".into(), "-auto-approve".into()],
        )
    }

    fn import(&self, address: &str, id: &str) -> Result<(), CommandError> {
        process::run(
            &self.bin,
            &[self.chdir(), "import".into(), address.into(), id.into()],
        )
    }
}

/// A resource to adopt into state before retrying the apply.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportTarget {
    pub address: String,
    pub id: String,
}

/// A known "already exists" signature and how to derive its import targets
/// from the captured apply output.
pub struct ConflictRule<'a> {
    /// Substring that must appear in the combined output.
    pub needle: &'a str,
    /// Additional resource-kind substring, when the needle alone is too broad.
    pub kind: Option<&'a str>,
    pub targets: &'a dyn Fn(&str) -> Vec<ImportTarget>,
}

impl<'a> ConflictRule<'a> {
    fn matches(&self, output: &str) -> bool {
        if !output.contains(self.needle) {
            return false;
        }
        match self.kind {
            Some(kind) => output.contains(kind),
            None => true,
        }
    }
}

/// Apply the stack, recovering from the given conflict signatures with a
/// single import-then-retry. On any other failure, or when the retry fails,
/// the original failure is returned verbatim.
pub fn apply_with_recovery(
    runner: &dyn StackRunner,
    rules: &[ConflictRule<'_>],
) -> Result<(), CommandError> {
    let first = runner.apply_captured()?;
    if first.success {
        return Ok(());
    }
    let original = CommandError {
        program: "terraform".to_string(),
        code: first.code,
        output: first.combined.clone(),
    };
    let Some(rule) = rules.iter().find(|rule| rule.matches(&first.combined)) else {
        return Err(original);
    };
    let targets = (rule.targets)(&first.combined);
    if targets.is_empty() {
        return Err(original);
    }
    for target in &targets {
        tracing::info!(address = %target.address, id = %target.id, "importing conflicting resource");
        if runner.import(&target.address, &target.id).is_err() {
            return Err(original);
        }
    }
    let retry = runner.apply_captured()?;
    if retry.success {
        Ok(())
    } else {
        Err(original)
    }
}

/// Parse notebook conflicts out of apply output. Each failed notebook
/// reports its workspace path in the error message and its resource address
/// in the trailing `with ...` line; several may conflict in one apply.
pub fn parse_notebook_conflicts(output: &str) -> Vec<ImportTarget> {
    let path_re = Regex::new(r"Path \(([^)]+)\) already exists").unwrap();
    let addr_re = Regex::new(r#"with (databricks_notebook\.[A-Za-z0-9_.\["\]-]+),"#).unwrap();
    let mut targets = Vec::new();
    let mut pending_path: Option<String> = None;
    for line in output.lines() {
        if let Some(caps) = path_re.captures(line) {
            pending_path = Some(caps[1].to_string());
            continue;
        }
        if let Some(caps) = addr_re.captures(line) {
            if let Some(id) = pending_path.take() {
                targets.push(ImportTarget {
                    address: caps[1].to_string(),
                    id,
                });
            }
        }
    }
    targets
}

/// Best-effort read of the Databricks workspace location from the stack's
/// local state file. Unreadable or absent state yields `None`.
pub fn workspace_location_from_state(stack_dir: &Path) -> Option<String> {
    let state_path = stack_dir.join("terraform.tfstate");
    let text = std::fs::read_to_string(state_path).ok()?;
    let state: Value = serde_json::from_str(&text).ok()?;
    for resource in state.get("resources")?.as_array()? {
        if resource.get("type").and_then(Value::as_str) != Some("azurerm_databricks_workspace") {
            continue;
        }
        for instance in resource.get("instances").and_then(Value::as_array)? {
            if let Some(location) = instance
                .get("attributes")
                .and_then(|attrs| attrs.get("location"))
                .and_then(Value::as_str)
            {
                return Some(location.to_string());
            }
        }
    }
    None
}

/// Fail fast when the stack directory is missing.
pub fn require_stack_dir(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        anyhow::bail!("missing Terraform dir: {}", dir.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Scripted runner: pops canned apply outcomes and records imports.
    struct ScriptedRunner {
        applies: RefCell<Vec<Captured>>,
        apply_count: RefCell<usize>,
        imports: RefCell<Vec<ImportTarget>>,
    }

    impl ScriptedRunner {
        fn new(applies: Vec<Captured>) -> Self {
            ScriptedRunner {
                applies: RefCell::new(applies),
                apply_count: RefCell::new(0),
                imports: RefCell::new(Vec::new()),
            }
        }
    }

    impl StackRunner for ScriptedRunner {
        fn apply_captured(&self) -> Result<Captured, CommandError> {
            *self.apply_count.borrow_mut() += 1;
            Ok(self.applies.borrow_mut().remove(0))
        }

        fn import(&self, address: &str, id: &str) -> Result<(), CommandError> {
            self.imports.borrow_mut().push(ImportTarget {
                address: address.to_string(),
                id: id.to_string(),
            });
            Ok(())
        }
    }

    fn failed(combined: &str) -> Captured {
        Captured {
            success: false,
            code: 1,
            combined: combined.to_string(),
        }
    }

    fn ok() -> Captured {
        Captured {
            success: true,
            code: 0,
            combined: String::new(),
        }
    }

    fn deployment_rule<'a>(targets: &'a dyn Fn(&str) -> Vec<ImportTarget>) -> ConflictRule<'a> {
        ConflictRule {
            needle: "already exists",
            kind: Some("azurerm_cognitive_deployment"),
            targets,
        }
    }

    #[test]
    fn conflict_signature_triggers_one_import_and_one_retry() {
        let runner = ScriptedRunner::new(vec![
            failed("Error: a resource with the ID already exists\nazurerm_cognitive_deployment"),
            ok(),
        ]);
        let targets = |_: &str| {
            vec![ImportTarget {
                address: "azurerm_cognitive_deployment.main".to_string(),
                id: "/acct/deployments/gpt".to_string(),
            }]
        };
        apply_with_recovery(&runner, &[deployment_rule(&targets)]).unwrap();
        assert_eq!(*runner.apply_count.borrow(), 2);
        assert_eq!(runner.imports.borrow().len(), 1);
        assert_eq!(runner.imports.borrow()[0].id, "/acct/deployments/gpt");
    }

    #[test]
    fn unmatched_failure_propagates_verbatim_with_zero_imports() {
        let runner = ScriptedRunner::new(vec![failed("Error: quota exceeded")]);
        let targets = |_: &str| vec![];
        let err = apply_with_recovery(&runner, &[deployment_rule(&targets)]).unwrap_err();
        assert_eq!(err.code, 1);
        assert_eq!(err.output, "Error: quota exceeded");
        assert_eq!(*runner.apply_count.borrow(), 1);
        assert!(runner.imports.borrow().is_empty());
    }

    #[test]
    fn failed_retry_returns_original_output() {
        let runner = ScriptedRunner::new(vec![
            failed("already exists azurerm_cognitive_deployment original text"),
            failed("retry text"),
        ]);
        let targets = |_: &str| {
            vec![ImportTarget {
                address: "azurerm_cognitive_deployment.main".to_string(),
                id: "id".to_string(),
            }]
        };
        let err = apply_with_recovery(&runner, &[deployment_rule(&targets)]).unwrap_err();
        assert!(err.output.contains("original text"));
        assert_eq!(*runner.apply_count.borrow(), 2);
    }

    #[test]
    fn matching_signature_without_targets_propagates_original() {
        let runner = ScriptedRunner::new(vec![failed(
            "already exists azurerm_cognitive_deployment",
        )]);
        let targets = |_: &str| vec![];
        let err = apply_with_recovery(&runner, &[deployment_rule(&targets)]).unwrap_err();
        assert!(err.output.contains("already exists"));
        assert!(runner.imports.borrow().is_empty());
    }

    #[test]
    fn notebook_conflicts_parse_address_and_path_pairs() {
        let output = r#"
Error: cannot create notebook: Path (/Shared/rag/01_ingest) already exists

  with databricks_notebook.notebooks["01_ingest"],
  on main.tf line 12, in resource "databricks_notebook" "notebooks":

Error: cannot create notebook: Path (/Shared/rag/02_index) already exists

  with databricks_notebook.notebooks["02_index"],
"#;
        let targets = parse_notebook_conflicts(output);
        assert_eq!(
            targets,
            vec![
                ImportTarget {
                    address: "databricks_notebook.notebooks[\"01_ingest\"]".to_string(),
                    id: "/Shared/rag/01_ingest".to_string(),
                },
                ImportTarget {
                    address: "databricks_notebook.notebooks[\"02_index\"]".to_string(),
                    id: "/Shared/rag/02_index".to_string(),
                },
            ]
        );
    }

    #[test]
    fn workspace_location_reads_tfstate() {
        let dir = tempfile::tempdir().unwrap();
        let state = serde_json::json!({
            "resources": [
                {"type": "azurerm_resource_group", "instances": []},
                {
                    "type": "azurerm_databricks_workspace",
                    "instances": [{"attributes": {"location": "eastus2"}}]
                }
            ]
        });
        std::fs::write(
            dir.path().join("terraform.tfstate"),
            serde_json::to_string(&state).unwrap(),
        )
        .unwrap();
        assert_eq!(
            workspace_location_from_state(dir.path()),
            Some("eastus2".to_string())
        );
        let empty = tempfile::tempdir().unwrap();
        assert_eq!(workspace_location_from_state(empty.path()), None);
    }
}
