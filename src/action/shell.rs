// src/action/shell.rs

//! Shell command action used by build-file tasks.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{ActionFuture, TaskAction, TaskContext, TaskFailure};

/// Runs `cmd` through the platform shell in the project root.
///
/// Declared outputs are exported as `KILN_OUTPUT_<NAME>` and path inputs as
/// `KILN_INPUT_<NAME>` so commands need not repeat paths.
#[derive(Debug, Clone)]
pub struct ShellAction {
    cmd: String,
}

impl ShellAction {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self { cmd: cmd.into() }
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    fn command(&self) -> Command {
        if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(&self.cmd);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(&self.cmd);
            c
        }
    }
}

fn env_key(prefix: &str, name: &str) -> String {
    let name: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{prefix}{name}")
}

impl TaskAction for ShellAction {
    fn identity(&self) -> String {
        format!("shell:{}", self.cmd)
    }

    fn execute<'a>(&'a self, ctx: &'a TaskContext) -> ActionFuture<'a> {
        Box::pin(async move {
            info!(task = %ctx.task_id, cmd = %self.cmd, "starting task process");

            let mut cmd = self.command();
            cmd.current_dir(&ctx.root)
                .env("KILN_TASK", ctx.task_id.as_str())
                .stdout(Stdio::inherit())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            for output in &ctx.outputs {
                cmd.env(env_key("KILN_OUTPUT_", &output.name), &output.path);
            }
            for input in &ctx.inputs {
                if let Some(path) = ctx.input_path(&input.name) {
                    cmd.env(env_key("KILN_INPUT_", &input.name), path);
                }
            }

            let mut child = cmd.spawn().map_err(|e| {
                TaskFailure::new(format!("spawning process for task '{}': {e}", ctx.task_id))
            })?;

            // Always consume stderr so the pipe never fills; keep the tail
            // for the failure message.
            let stderr_tail = child.stderr.take().map(|stderr| {
                let task = ctx.task_id.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    let mut tail: Vec<String> = Vec::new();
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!(task = %task, "stderr: {}", line);
                        eprintln!("{line}");
                        tail.push(line);
                        if tail.len() > 20 {
                            tail.remove(0);
                        }
                    }
                    tail
                })
            });

            tokio::select! {
                status = child.wait() => {
                    let status = status.map_err(|e| {
                        TaskFailure::new(format!("waiting for process of task '{}': {e}", ctx.task_id))
                    })?;
                    let code = status.code().unwrap_or(-1);
                    info!(task = %ctx.task_id, exit_code = code, success = status.success(), "task process exited");
                    if status.success() {
                        return Ok(());
                    }
                    let tail = match stderr_tail {
                        Some(handle) => handle.await.unwrap_or_default(),
                        None => Vec::new(),
                    };
                    let mut message = format!("command `{}` exited with code {code}", self.cmd);
                    if let Some(last) = tail.last() {
                        message.push_str(": ");
                        message.push_str(last);
                    }
                    Err(TaskFailure::with_exit_code(message, code))
                }
                _ = ctx.cancel.cancelled() => {
                    info!(task = %ctx.task_id, "build cancelled; killing task process");
                    if let Err(e) = child.kill().await {
                        warn!(task = %ctx.task_id, error = %e, "failed to kill child process on cancellation");
                    }
                    Err(TaskFailure::new("cancelled"))
                }
            }
        })
    }
}
