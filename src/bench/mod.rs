//! Benchmark orchestration: the patch builder against reference tools.
//!
//! Pairs from a [`manifest::Manifest`] are measured on a bounded worker pool;
//! each pair runs every tool in turn. A tool missing from the host is
//! recorded as `skipped` and never fails the run.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::{info, warn};
use rayon::prelude::*;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::patch::BuildConfig;

pub mod manifest;
pub mod report;
pub mod tools;

use manifest::{Job, Manifest};
use report::{Env, PairReport, Report, REPORT_VERSION};
use tools::{ExternalTool, HajimiTool, Invocation, ReferenceTool};

#[derive(Error, Debug)]
pub enum BenchError {
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("report failed schema validation: {0}")]
    Schema(String),
    #[error("invalid manifest: {0}")]
    Manifest(String),
    #[error("corpus file {path} does not match the manifest: {reason}")]
    CorpusMismatch { path: String, reason: String },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Time(#[from] time::error::Format),
    #[error(transparent)]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Programs used for the reference tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPrograms {
    pub zstd: PathBuf,
    pub xdelta3: PathBuf,
    pub git: PathBuf,
}

impl Default for ToolPrograms {
    fn default() -> Self {
        ToolPrograms {
            zstd: PathBuf::from("zstd"),
            xdelta3: PathBuf::from("xdelta3"),
            git: PathBuf::from("git"),
        }
    }
}

pub fn available_cores() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}

pub struct Orchestrator {
    tools: Vec<Box<dyn ReferenceTool>>,
    workers: usize,
}

impl Orchestrator {
    pub fn new(workers: usize) -> Self {
        Orchestrator {
            tools: Vec::new(),
            workers: workers.clamp(1, available_cores()),
        }
    }

    pub fn with_tool(mut self, tool: Box<dyn ReferenceTool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// The hajimi builder plus zstd, xdelta3 and git diff.
    pub fn standard(workers: usize, timeout: Duration, programs: &ToolPrograms, build: BuildConfig) -> Self {
        Orchestrator::new(workers)
            .with_tool(Box::new(HajimiTool::new(build)))
            .with_tool(Box::new(ExternalTool::new(
                "zstd",
                &programs.zstd,
                Invocation::Compress,
                timeout,
            )))
            .with_tool(Box::new(ExternalTool::new(
                "xdelta3",
                &programs.xdelta3,
                Invocation::Delta,
                timeout,
            )))
            .with_tool(Box::new(ExternalTool::new(
                "git",
                &programs.git,
                Invocation::VcsDiff,
                timeout,
            )))
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Measures every pair of `manifest`, paths resolved against `root`.
    ///
    /// Corpus files are checked before anything is measured.
    pub fn run(&self, manifest: &Manifest, root: &Path) -> Result<Report, BenchError> {
        if self.tools.is_empty() {
            return Err(BenchError::Schema("bad_tools".to_string()));
        }
        let jobs = manifest.jobs(root)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()?;
        info!("Benchmarking {} pairs on {} workers", jobs.len(), self.workers);

        let pairs = pool.install(|| {
            jobs.par_iter()
                .map(|job| self.measure(job))
                .collect::<Result<Vec<_>, BenchError>>()
        })?;

        let tool_presence = self
            .tools
            .iter()
            .map(|t| (t.name().to_string(), t.presence()))
            .collect();

        Ok(Report {
            version: REPORT_VERSION.to_string(),
            preset: manifest.preset.clone(),
            generated_at_utc: OffsetDateTime::now_utc().format(&Rfc3339)?,
            tools: self.tools.iter().map(|t| t.name().to_string()).collect(),
            env: Env {
                os: std::env::consts::OS.to_string(),
                arch: std::env::consts::ARCH.to_string(),
                cpus: available_cores(),
                tool_presence,
            },
            pairs,
        })
    }

    fn measure(&self, job: &Job) -> Result<PairReport, BenchError> {
        let scratch = tempfile::tempdir()?;
        let mut metrics = BTreeMap::new();

        for tool in self.tools.iter() {
            let m = tool.measure(&job.base, &job.target, scratch.path());
            if m.status == tools::Status::Error {
                warn!("{} failed on {}: {:?}", tool.name(), job.id, m.reason);
            }
            metrics.insert(tool.name().to_string(), m);
        }

        Ok(PairReport {
            id: job.id.clone(),
            kind: serde_json::to_value(job.kind)?
                .as_str()
                .unwrap_or_default()
                .to_string(),
            base: job.base_spec.path.clone(),
            target: job.target_spec.path.clone(),
            base_bytes: job.base_spec.bytes,
            target_bytes: job.target_spec.bytes,
            metrics,
        })
    }
}
