//! Action runner
//!
//! Executes user-defined hook commands with working directory, extra
//! environment, per-attempt timeout, retries and output capture. A
//! successful action with `setVariable` publishes its trimmed stdout to
//! the variable store for everything that runs later.

use anyhow::Result;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::domain::bundle::Action;
use crate::error::ActionError;
use crate::services::variables::VariableStore;

pub struct ActionRunner {
    variables: Arc<VariableStore>,
}

impl ActionRunner {
    pub fn new(variables: Arc<VariableStore>) -> Self {
        Self { variables }
    }

    /// Run a hook list sequentially, stopping at the first failure.
    pub async fn run_set(&self, actions: &[Action]) -> Result<()> {
        for action in actions {
            self.run(action).await?;
        }
        Ok(())
    }

    /// Run one action with its retry and timeout policy.
    pub async fn run(&self, action: &Action) -> Result<()> {
        let cmd = self.variables.render(&action.cmd, "action cmd")?;
        let label = action.description.as_deref().unwrap_or(&cmd);
        let attempts_allowed = action.max_retries + 1;
        let mut attempts = 0;

        loop {
            attempts += 1;
            debug!(cmd = %cmd, attempt = attempts, "running action");
            match self.run_once(action, &cmd).await {
                Ok(stdout) => {
                    if let Some(variable) = &action.set_variable {
                        let value = stdout.trim().to_string();
                        self.variables.set(variable, &value, false);
                        info!(
                            variable = %variable,
                            value = %self.variables.display_value(variable),
                            "action output captured"
                        );
                    }
                    info!("action succeeded: {label}");
                    return Ok(());
                }
                Err(e) if attempts < attempts_allowed => {
                    warn!(
                        attempt = attempts,
                        error = %e,
                        "action failed, retrying: {label}"
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One attempt: spawn, enforce the per-attempt timeout, capture output.
    async fn run_once(&self, action: &Action, cmd: &str) -> Result<String> {
        let (shell, flag) = shell_invocation(action.shell.as_deref());
        let mut command = Command::new(&shell);
        command
            .arg(flag)
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &action.dir {
            command.current_dir(dir);
        }
        for pair in &action.env {
            if let Some((key, value)) = pair.split_once('=') {
                command.env(key, value);
            }
        }
        for (key, value) in self.variables.env_pairs() {
            command.env(key, value);
        }

        let wait = command.output();
        let output = match action.max_total_seconds {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), wait)
                .await
                .map_err(|_| ActionError::Timeout {
                    cmd: cmd.to_string(),
                    timeout_secs: secs,
                })?,
            None => wait.await,
        }
        .map_err(|e| ActionError::SpawnFailed {
            shell: shell.clone(),
            message: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !action.mute {
            for line in stdout.lines().chain(stderr.lines()) {
                info!("  {line}");
            }
        }
        if !output.status.success() {
            return Err(ActionError::CommandFailed {
                cmd: cmd.to_string(),
                attempts: action.max_retries + 1,
                code: output.status.code(),
            }
            .into());
        }
        Ok(stdout)
    }
}

/// Platform shell: POSIX `sh -c` on Linux/macOS, PowerShell on Windows,
/// unless the action pins one.
fn shell_invocation(pinned: Option<&str>) -> (String, &'static str) {
    if let Some(shell) = pinned {
        let flag = if shell.contains("powershell") || shell.contains("pwsh") {
            "-Command"
        } else {
            "-c"
        };
        return (shell.to_string(), flag);
    }
    if cfg!(windows) {
        ("powershell".to_string(), "-Command")
    } else {
        ("sh".to_string(), "-c")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bundle::Bundle;

    fn runner() -> (ActionRunner, Arc<VariableStore>) {
        let bundle = Bundle::parse(
            "kind: ZarfPackageConfig\nmetadata:\n  name: t\ncomponents:\n  - name: a\n",
        )
        .unwrap();
        let store = Arc::new(VariableStore::new(&bundle, &[]).unwrap());
        (ActionRunner::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_set_variable_captures_trimmed_stdout() {
        let (runner, store) = runner();
        let action = Action {
            cmd: "echo 1.2.3".to_string(),
            set_variable: Some("VERSION".to_string()),
            mute: true,
            ..Default::default()
        };
        runner.run(&action).await.unwrap();
        assert_eq!(store.get("VERSION").unwrap(), "1.2.3");
    }

    #[tokio::test]
    async fn test_command_renders_variables() {
        let (runner, store) = runner();
        store.set("GREETING", "hello", false);
        let action = Action {
            cmd: "echo ###ZARF_VAR_GREETING###".to_string(),
            set_variable: Some("ECHOED".to_string()),
            mute: true,
            ..Default::default()
        };
        runner.run(&action).await.unwrap();
        assert_eq!(store.get("ECHOED").unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_variables_exported_to_environment() {
        let (runner, store) = runner();
        store.set("TOKEN", "abc", false);
        let action = Action {
            cmd: "echo $ZARF_VAR_TOKEN".to_string(),
            set_variable: Some("SEEN".to_string()),
            mute: true,
            ..Default::default()
        };
        runner.run(&action).await.unwrap();
        assert_eq!(store.get("SEEN").unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_after_retries() {
        let (runner, _) = runner();
        let action = Action {
            cmd: "exit 3".to_string(),
            max_retries: 1,
            mute: true,
            ..Default::default()
        };
        let err = runner.run(&action).await.unwrap_err();
        assert!(err.to_string().contains("exit"));
    }

    #[tokio::test]
    async fn test_timeout_kills_slow_command() {
        let (runner, _) = runner();
        let action = Action {
            cmd: "sleep 30".to_string(),
            max_total_seconds: Some(1),
            mute: true,
            ..Default::default()
        };
        let err = runner.run(&action).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_working_directory_respected() {
        let (runner, store) = runner();
        let dir = tempfile::tempdir().unwrap();
        let action = Action {
            cmd: "pwd".to_string(),
            dir: Some(dir.path().display().to_string()),
            set_variable: Some("CWD".to_string()),
            mute: true,
            ..Default::default()
        };
        runner.run(&action).await.unwrap();
        assert!(store.get("CWD").unwrap().contains(
            dir.path().file_name().unwrap().to_str().unwrap()
        ));
    }
}
