//! Typed subprocess execution.
//!
//! Every external collaborator (download CLI, merge tool, model runtime) is
//! described as a [`CommandSpec`] and executed through a [`ProcessRunner`].
//! Arguments are passed as a list, never through a shell, and the runner
//! returns a structured [`ProcessOutput`] instead of raising on non-zero exit.

use async_trait::async_trait;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{Result, ToolfitError};

/// A program invocation: executable, ordered arguments, working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub current_dir: Option<PathBuf>,
    pub envs: Vec<(OsString, OsString)>,
    /// Log each output line at info level while the process runs.
    pub stream_output: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            envs: Vec::new(),
            stream_output: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn streamed(mut self) -> Self {
        self.stream_output = true;
        self
    }

    /// Short program label for logs (file name of the executable).
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.to_string_lossy().into_owned())
    }

    /// Arguments as UTF-8 strings (lossy), for logging and assertions.
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; -1 when the process was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout and stderr joined, trimmed; used in error messages.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.trim().to_string();
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(stderr);
        }
        text
    }
}

/// Executes [`CommandSpec`]s.
///
/// Implementations must not retry: one command, one attempt.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput>;
}

/// [`ProcessRunner`] backed by `tokio::process`.
///
/// Children are killed when the returned future is dropped, so an interrupted
/// run does not leave a merge or download running in the background.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput> {
        let label = spec.program_name();
        debug!("Running: {}", spec);

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }
        for (key, value) in &spec.envs {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| ToolfitError::ProcessSpawn {
            program: spec.program.to_string_lossy().into_owned(),
            source,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (stdout, stderr) = tokio::join!(
            collect_lines(stdout, &label, spec.stream_output),
            collect_lines(stderr, &label, spec.stream_output),
        );

        let status = child
            .wait()
            .await
            .map_err(|e| ToolfitError::io("waiting for child process", &spec.program, e))?;

        let output = ProcessOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        };
        debug!("{} exited with {}", label, output.exit_code);
        Ok(output)
    }
}

async fn collect_lines<R>(reader: Option<R>, label: &str, stream: bool) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return String::new();
    };

    let mut lines = BufReader::new(reader).lines();
    let mut collected = String::new();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if stream && !line.trim().is_empty() {
                    info!("[{}] {}", label, line.trim_end());
                }
                collected.push_str(&line);
                collected.push('\n');
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Error reading {} output: {}", label, e);
                break;
            }
        }
    }
    collected
}

/// Look up an executable on the process search path.
pub fn find_on_path(name: impl AsRef<OsStr>) -> Option<PathBuf> {
    which::which(name).ok()
}

/// Return `path` if it names an existing file.
pub fn existing_file(path: &Path) -> Option<PathBuf> {
    path.is_file().then(|| path.to_path_buf())
}

/// Resolve an executable from an optional configured value.
///
/// A configured path to an existing file is used as is; a bare program name
/// (no directory part) is looked up on the search path. Without a
/// configured value `default_name` is looked up.
pub fn resolve_program(configured: Option<&Path>, default_name: &str) -> Option<PathBuf> {
    match configured {
        Some(path) if path.is_file() => Some(path.to_path_buf()),
        Some(path) if path.components().count() == 1 => find_on_path(path),
        Some(_) => None,
        None => find_on_path(default_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_builder() {
        let spec = CommandSpec::new("/usr/bin/llama-gguf-split")
            .arg("--merge")
            .args(["a.gguf", "b.gguf"])
            .env("KEY", "VALUE")
            .streamed();

        assert_eq!(spec.program_name(), "llama-gguf-split");
        assert_eq!(spec.args_lossy(), vec!["--merge", "a.gguf", "b.gguf"]);
        assert!(spec.stream_output);
        assert_eq!(
            spec.to_string(),
            "/usr/bin/llama-gguf-split --merge a.gguf b.gguf"
        );
    }

    #[test]
    fn test_combined_output() {
        let output = ProcessOutput {
            exit_code: 1,
            stdout: "line one\n".into(),
            stderr: "boom\n".into(),
        };
        assert!(!output.success());
        assert_eq!(output.combined(), "line one\nboom");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_runner_captures_output() {
        let spec = CommandSpec::new("sh").args(["-c", "echo hello; echo oops >&2; exit 3"]);
        let output = TokioProcessRunner.run(&spec).await.unwrap();

        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[test]
    fn test_resolve_program() {
        let temp = tempfile::TempDir::new().unwrap();
        let tool = temp.path().join("ollama");
        std::fs::write(&tool, b"").unwrap();

        assert_eq!(resolve_program(Some(&tool), "ollama"), Some(tool));
        assert_eq!(
            resolve_program(Some(&temp.path().join("missing/ollama")), "ollama"),
            None
        );
        assert_eq!(
            resolve_program(Some(Path::new("definitely-not-a-real-binary-7f3a")), "x"),
            None
        );
    }

    #[tokio::test]
    async fn test_tokio_runner_spawn_failure() {
        let spec = CommandSpec::new("definitely-not-a-real-binary-7f3a");
        let result = TokioProcessRunner.run(&spec).await;
        assert!(matches!(result, Err(ToolfitError::ProcessSpawn { .. })));
    }
}
