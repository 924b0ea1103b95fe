//! CLI provider: shells out to an external command-line model tool.
//!
//! The tool receives the assembled prompt on stdin and is expected to
//! print its work to stdout, ending with a single JSON line carrying
//! the verdict. Output lines are streamed to the caller as partials.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::models::TaskOutcome;
use crate::domain::ports::{InvokeRequest, Provider, ProviderError};

/// Configuration for the CLI provider.
#[derive(Debug, Clone)]
pub struct CliProviderConfig {
    /// Executable name or path (resolved through PATH).
    pub command: String,
    /// Fixed arguments prepended to every invocation.
    pub args: Vec<String>,
    /// Flag used to pass the model name, e.g. `--model`.
    pub model_flag: Option<String>,
    /// Working directory for the subprocess.
    pub working_dir: Option<PathBuf>,
}

impl Default for CliProviderConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec!["--print".to_string()],
            model_flag: Some("--model".to_string()),
            working_dir: None,
        }
    }
}

/// Provider that wraps one external CLI model tool.
pub struct CliProvider {
    name: String,
    config: CliProviderConfig,
}

impl CliProvider {
    pub fn new(name: impl Into<String>, config: CliProviderConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    fn build_command(&self, request: &InvokeRequest) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);
        if let (Some(flag), Some(model)) = (&self.config.model_flag, &request.model) {
            cmd.arg(flag).arg(model);
        }
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Assemble the prompt handed to the tool on stdin.
    fn format_prompt(request: &InvokeRequest) -> String {
        let mut prompt = String::new();
        if !request.system_prompt.is_empty() {
            prompt.push_str(&request.system_prompt);
            prompt.push_str("\n\n");
        }
        prompt.push_str("# Task ");
        prompt.push_str(request.task.id.as_str());
        prompt.push_str(": ");
        prompt.push_str(&request.task.title);
        prompt.push_str("\n\n");
        prompt.push_str(&request.task.description);
        if let Some(reason) = &request.task.rejection_reason {
            prompt.push_str("\n\nThis work was previously rejected. Address the feedback:\n");
            prompt.push_str(reason);
        }
        if !request.tools.is_empty() {
            prompt.push_str("\n\nAvailable tools: ");
            prompt.push_str(&request.tools.join(", "));
        }
        prompt.push_str(
            "\n\nWhen finished, print exactly one final line of JSON describing the verdict: \
             {\"kind\":\"success\",\"summary\":...,\"produces\":[...]} or \
             {\"kind\":\"reject\",\"reason\":...,\"back_to_role\":...} or \
             {\"kind\":\"fail\",\"reason\":...,\"transient\":false}.\n",
        );
        prompt
    }
}

#[async_trait]
impl Provider for CliProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        Command::new(&self.config.command)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    async fn invoke(
        &self,
        request: InvokeRequest,
        partials: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<TaskOutcome, ProviderError> {
        let mut cmd = self.build_command(&request);
        tracing::debug!(
            task_id = %request.task.id,
            command = %self.config.command,
            "spawning provider subprocess"
        );

        let mut child = cmd
            .spawn()
            .map_err(|e| ProviderError::Unavailable(format!("failed to spawn: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProviderError::Transient("no stdin handle".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::Transient("no stdout handle".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProviderError::Transient("no stderr handle".to_string()))?;

        let prompt = Self::format_prompt(&request);
        stdin
            .write_all(prompt.as_bytes())
            .await
            .map_err(|e| ProviderError::Transient(format!("failed to write prompt: {e}")))?;
        drop(stdin);

        // Stream stdout lines as partials, remembering the last
        // non-empty line as the verdict candidate.
        let mut lines = BufReader::new(stdout).lines();
        let mut last_line: Option<String> = None;
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(ProviderError::Cancelled);
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if !line.trim().is_empty() {
                            last_line = Some(line.clone());
                        }
                        // A closed receiver must not fail the run.
                        let _ = partials.send(line).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        return Err(ProviderError::Transient(format!("stdout read failed: {e}")));
                    }
                }
            }
        }

        let status = tokio::select! {
            () = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(ProviderError::Cancelled);
            }
            status = child.wait() => status
                .map_err(|e| ProviderError::Transient(format!("wait failed: {e}")))?,
        };

        if !status.success() {
            let mut err_tail = String::new();
            let _ = stderr.read_to_string(&mut err_tail).await;
            let err_tail: String = err_tail.chars().rev().take(500).collect::<Vec<_>>()
                .into_iter().rev().collect();
            return Err(ProviderError::Permanent(format!(
                "provider exited with {status}: {err_tail}"
            )));
        }

        match last_line.as_deref().map(serde_json::from_str::<TaskOutcome>) {
            Some(Ok(outcome)) => Ok(outcome),
            _ => Err(ProviderError::Permanent(
                "provider produced no verdict line".to_string(),
            )),
        }
    }
}
