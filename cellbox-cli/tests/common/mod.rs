#![allow(dead_code)]

use assert_cmd::Command;
use std::time::Duration;
use tempfile::TempDir;

pub struct TestContext {
    pub cmd: Command,
    pub home: TempDir,
}

impl TestContext {
    /// Another invocation sharing this context's home dir.
    pub fn new_cmd(&self) -> Command {
        let bin_path = env!("CARGO_BIN_EXE_cellbox");
        let mut cmd = Command::new(bin_path);
        cmd.timeout(Duration::from_secs(30));
        cmd.env_remove("RUST_LOG");
        cmd.arg("--home").arg(self.home.path());
        cmd
    }
}

pub fn cellbox() -> TestContext {
    let home = TempDir::new().expect("Failed to create temp dir");
    let bin_path: &str = env!("CARGO_BIN_EXE_cellbox");
    let mut cmd = Command::new(bin_path);
    // You can override this with .timeout(Duration::from_secs(N))
    cmd.timeout(Duration::from_secs(30));
    cmd.env_remove("RUST_LOG");
    cmd.arg("--home").arg(home.path());

    TestContext { cmd, home }
}
