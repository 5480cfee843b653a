//! Shared stub-toolchain infrastructure for integration tests.
//!
//! Tests drive the compiled binary against stub `terraform` and `az`
//! executables installed on a prepended PATH. Every stub invocation is
//! appended to a log file so tests can assert on call order.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

pub struct StubEnv {
    pub root: TempDir,
    bin_dir: PathBuf,
    log: PathBuf,
    state: PathBuf,
}

pub fn setup() -> StubEnv {
    let root = tempfile::tempdir().expect("create temp root");
    let bin_dir = root.path().join("stub-bin");
    fs::create_dir_all(&bin_dir).expect("create stub bin dir");
    let log = root.path().join("stub.log");
    fs::write(&log, "").expect("create stub log");
    let state = root.path().join("stub.state");
    StubEnv {
        root,
        bin_dir,
        log,
        state,
    }
}

impl StubEnv {
    /// Install an executable shell stub under the prepended PATH.
    pub fn install_stub(&self, name: &str, script: &str) {
        let path = self.bin_dir.join(name);
        fs::write(&path, script).expect("write stub");
        let mut perms = fs::metadata(&path).expect("stat stub").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod stub");
    }

    /// Create terraform stack directories under the root.
    pub fn mk_stage_dirs(&self, dirs: &[&str]) {
        for dir in dirs {
            fs::create_dir_all(self.root.path().join(dir)).expect("create stage dir");
        }
    }

    /// Run the ragstack binary with the stub toolchain on PATH.
    pub fn run(&self, args: &[&str]) -> Output {
        let path_var = std::env::var_os("PATH").unwrap_or_default();
        let mut paths = vec![self.bin_dir.clone()];
        paths.extend(std::env::split_paths(&path_var));
        let joined = std::env::join_paths(paths).expect("join PATH");
        Command::new(env!("CARGO_BIN_EXE_ragstack"))
            .args(args)
            .arg("--root")
            .arg(self.root.path())
            .env("PATH", joined)
            .env("STUB_LOG", &self.log)
            .env("STUB_STATE", &self.state)
            .env_remove("DATABRICKS_TOKEN")
            .env_remove("DATABRICKS_AUTO_PAT")
            .env_remove("AUTO_CREATE_DATABRICKS_PAT")
            .output()
            .expect("run ragstack")
    }

    pub fn log_lines(&self) -> Vec<String> {
        fs::read_to_string(&self.log)
            .expect("read stub log")
            .lines()
            .map(str::to_string)
            .collect()
    }
}

/// Panic with the child's output when it did not succeed.
pub fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "ragstack failed\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}
