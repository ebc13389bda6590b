//! Model runtime (Ollama) command-line driver.
//!
//! Registration is fatal on failure. Verification and the smoke test only
//! ever produce [`Advisory`] values.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::ModelConfig;
use crate::error::Advisory;
use crate::process::{resolve_program, CommandSpec, ProcessRunner};
use crate::{Result, ToolfitError};

/// Drives `ollama create`, `ollama list` and `ollama run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OllamaCli {
    program: PathBuf,
}

impl OllamaCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Find the runtime executable, failing with
    /// [`ToolfitError::RuntimeNotFound`].
    pub fn locate(configured: Option<&Path>) -> Result<Self> {
        resolve_program(configured, ModelConfig::RUNTIME_PROGRAM)
            .map(Self::new)
            .ok_or_else(|| ToolfitError::RuntimeNotFound {
                program: configured
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| ModelConfig::RUNTIME_PROGRAM.to_string()),
            })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn create_command(&self, model: &str, modelfile: &Path) -> CommandSpec {
        let spec = CommandSpec::new(&self.program)
            .args(["create", model, "-f"])
            .arg(modelfile);
        match modelfile.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(dir) => spec.current_dir(dir),
            None => spec,
        }
    }

    pub fn list_command(&self) -> CommandSpec {
        CommandSpec::new(&self.program).arg("list")
    }

    pub fn run_command(&self, model: &str, prompt: &str) -> CommandSpec {
        CommandSpec::new(&self.program).args(["run", model, prompt])
    }

    /// Register `model` from the Modelfile at `modelfile`.
    pub async fn create(
        &self,
        runner: &dyn ProcessRunner,
        model: &str,
        modelfile: &Path,
    ) -> Result<()> {
        info!("Registering model {}", model);
        let output = runner.run(&self.create_command(model, modelfile)).await?;
        if !output.success() {
            return Err(ToolfitError::RegistrationFailed {
                model: model.to_string(),
                exit_code: output.exit_code,
                output: output.combined(),
            });
        }
        let text = output.combined();
        if !text.is_empty() {
            debug!("{}", text);
        }
        Ok(())
    }

    /// Check that `model` shows up in the runtime's model list.
    pub async fn verify(&self, runner: &dyn ProcessRunner, model: &str) -> Option<Advisory> {
        let inconclusive = || Advisory::VerificationInconclusive {
            model: model.to_string(),
        };

        match runner.run(&self.list_command()).await {
            Ok(output) if output.success() && listing_contains(&output.stdout, model) => {
                info!("Model {} is registered", model);
                None
            }
            Ok(output) => {
                debug!("Model list (exit {}): {}", output.exit_code, output.combined());
                Some(inconclusive())
            }
            Err(e) => {
                debug!("Model list failed: {}", e);
                Some(inconclusive())
            }
        }
    }

    /// Send one prompt and judge the response.
    pub async fn smoke_test(
        &self,
        runner: &dyn ProcessRunner,
        model: &str,
        prompt: &str,
    ) -> Option<Advisory> {
        info!("Running a quick smoke test");
        let reason = match runner.run(&self.run_command(model, prompt)).await {
            Ok(output) if !output.success() => {
                format!("exit {}: {}", output.exit_code, output.combined())
            }
            Ok(output) => match judge_response(&output.stdout) {
                Ok(()) => {
                    info!("Model responded successfully");
                    return None;
                }
                Err(reason) => reason,
            },
            Err(e) => e.to_string(),
        };
        Some(Advisory::SmokeTestInconclusive { reason })
    }
}

/// Whether a model listing names `model`.
///
/// Compares the first column of every row, accepting an implicit `:latest`
/// tag on either side.
pub fn listing_contains(listing: &str, model: &str) -> bool {
    let wanted = model.trim().to_lowercase();
    let wanted_base = wanted.strip_suffix(":latest").unwrap_or(&wanted);

    listing
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_lowercase)
        .any(|name| {
            let base = name.strip_suffix(":latest").unwrap_or(&name);
            base == wanted_base
        })
}

/// A usable response is non-empty and carries no error marker.
pub fn judge_response(response: &str) -> std::result::Result<(), String> {
    let trimmed = response.trim();
    if trimmed.is_empty() {
        return Err("empty response".to_string());
    }
    if trimmed.to_lowercase().contains("error:") {
        let first_line = trimmed.lines().next().unwrap_or(trimmed);
        return Err(format!("response reported an error: {first_line}"));
    }
    Ok(())
}
