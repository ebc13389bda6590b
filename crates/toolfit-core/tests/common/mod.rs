//! Shared fixtures for the integration tests.
//!
//! [`FakeTools`] stands in for `hf`, `llama-gguf-split` and `ollama`: it
//! records every invocation and produces the files the real tools would.

#![allow(dead_code)]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use toolfit_core::config::ResolvedSettings;
use toolfit_core::{CommandSpec, Orchestrator, ProcessOutput, ProcessRunner, Result, Settings};

/// How the fake merge tool behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeBehavior {
    Succeed,
    Fail(i32),
    /// Write part of the output, then exit with the given code.
    FailAfterWrite(i32),
    NoOutput,
    /// Write part of the output, then never finish.
    Hang,
}

pub struct FakeTools {
    /// Every invocation, in order.
    pub calls: Mutex<Vec<CommandSpec>>,
    /// Names accepted by `ollama create`.
    pub registered: Mutex<Vec<String>>,
    /// Modelfile contents seen by `ollama create`.
    pub modelfiles: Mutex<Vec<String>>,
    /// Files `hf download` writes into `--local-dir`.
    pub download_files: Vec<(String, Vec<u8>)>,
    pub download_exit: i32,
    pub download_help: String,
    pub merge: MergeBehavior,
    pub create_exit: i32,
    /// When false, `ollama list` never shows the registered model.
    pub list_shows_registered: bool,
    pub smoke_reply: String,
}

impl Default for FakeTools {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            registered: Mutex::new(Vec::new()),
            modelfiles: Mutex::new(Vec::new()),
            download_files: Vec::new(),
            download_exit: 0,
            download_help: "usage: hf download REPO_ID [--include ...]".to_string(),
            merge: MergeBehavior::Succeed,
            create_exit: 0,
            list_shows_registered: true,
            smoke_reply: "Sure, I can help with code.".to_string(),
        }
    }
}

impl FakeTools {
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Invocations of the program named `program`, as argument lists.
    pub fn calls_to(&self, program: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.program_name() == program)
            .map(|c| c.args_lossy())
            .collect()
    }

    /// Contents of every Modelfile passed to `ollama create`.
    pub fn modelfiles(&self) -> Vec<String> {
        self.modelfiles.lock().unwrap().clone()
    }

    fn hf(&self, spec: &CommandSpec) -> ProcessOutput {
        let args = spec.args_lossy();
        if args.get(1).map(String::as_str) == Some("--help") {
            return ok(&self.download_help);
        }
        if self.download_exit != 0 {
            return failed(self.download_exit, "401 Client Error: Unauthorized");
        }
        let dest = value_after(&args, "--local-dir").expect("--local-dir missing");
        for (name, bytes) in &self.download_files {
            let path = Path::new(&dest).join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, bytes).unwrap();
        }
        ok("Fetching files: 100%")
    }

    async fn merge_tool(&self, spec: &CommandSpec) -> ProcessOutput {
        let args = spec.args_lossy();
        match self.merge {
            MergeBehavior::Succeed => {
                let mut bytes = std::fs::read(&args[1]).unwrap();
                bytes.extend_from_slice(b"+merged");
                std::fs::write(&args[2], bytes).unwrap();
                ok("gguf_merge: done")
            }
            MergeBehavior::Fail(code) => failed(code, "gguf_merge: invalid split file"),
            MergeBehavior::FailAfterWrite(code) => {
                std::fs::write(&args[2], vec![0u8; 4096]).unwrap();
                failed(code, "gguf_merge: write error")
            }
            MergeBehavior::NoOutput => ok("gguf_merge: done"),
            MergeBehavior::Hang => {
                std::fs::write(&args[2], vec![0u8; 4096]).unwrap();
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    fn ollama(&self, spec: &CommandSpec) -> ProcessOutput {
        let args = spec.args_lossy();
        match args[0].as_str() {
            "create" => {
                let text = std::fs::read_to_string(&args[3]).unwrap();
                self.modelfiles.lock().unwrap().push(text);
                if self.create_exit != 0 {
                    return failed(self.create_exit, "Error: invalid model file");
                }
                self.registered.lock().unwrap().push(args[1].clone());
                ok("success")
            }
            "list" => {
                let mut listing = String::from("NAME    ID    SIZE    MODIFIED\n");
                if self.list_shows_registered {
                    for name in self.registered.lock().unwrap().iter() {
                        listing.push_str(&format!("{name}:latest    abc123    2.0 GB    now\n"));
                    }
                }
                ok(&listing)
            }
            "run" => ok(&self.smoke_reply),
            other => failed(2, &format!("unknown command {other}")),
        }
    }
}

#[async_trait]
impl ProcessRunner for FakeTools {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput> {
        self.calls.lock().unwrap().push(spec.clone());
        let output = match spec.program_name().as_str() {
            "hf" => self.hf(spec),
            "llama-gguf-split" => self.merge_tool(spec).await,
            "ollama" => self.ollama(spec),
            other => failed(127, &format!("{other}: not found")),
        };
        Ok(output)
    }
}

pub fn ok(stdout: &str) -> ProcessOutput {
    ProcessOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn failed(exit_code: i32, stderr: &str) -> ProcessOutput {
    ProcessOutput {
        exit_code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

fn value_after(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

/// A temp directory holding placeholder tool binaries, a cache root and a
/// models folder.
pub struct TestEnv {
    pub temp: TempDir,
    pub settings: ResolvedSettings,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let bin = temp.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::create_dir_all(temp.path().join("models")).unwrap();

        let tool = |name: &str| {
            let path = bin.join(name);
            std::fs::write(&path, b"").unwrap();
            path
        };

        let settings = Settings {
            merge_tool_path: Some(tool("llama-gguf-split")),
            runtime_program: Some(tool("ollama")),
            download_program: Some(tool("hf")),
            ..Settings::default()
        };

        let settings = ResolvedSettings {
            config_path: temp.path().join("config.json"),
            cache_root: temp.path().join("cache"),
            settings,
        };
        Self { temp, settings }
    }

    pub fn models_dir(&self) -> PathBuf {
        self.temp.path().join("models")
    }

    /// Write a model file under the models folder.
    pub fn model(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.models_dir().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    pub fn orchestrator(&self, tools: &Arc<FakeTools>) -> Orchestrator {
        Orchestrator::new(self.settings.clone(), tools.clone())
    }

    /// Files left anywhere under the merged area.
    pub fn merged_files(&self) -> Vec<PathBuf> {
        walkdir::WalkDir::new(self.settings.merged_dir())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect()
    }

    /// `run-*` directories left in the work area.
    pub fn leftover_work_dirs(&self) -> Vec<PathBuf> {
        let work = self.settings.work_dir();
        match std::fs::read_dir(&work) {
            Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// GGUF-looking bytes that carry an architecture name in the header.
pub fn gguf_with_arch(arch: &str) -> Vec<u8> {
    let mut bytes = b"GGUF\x03\x00\x00\x00".to_vec();
    bytes.extend_from_slice(b"general.architecture\x00");
    bytes.extend_from_slice(arch.as_bytes());
    bytes.extend_from_slice(&[0u8; 32]);
    bytes
}
