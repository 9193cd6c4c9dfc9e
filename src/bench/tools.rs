use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::patch::{ApplyConfig, BuildConfig, PatchApplier, PatchBuilder};

const POLL: Duration = Duration::from_millis(10);
const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
    Skipped,
}

/// What one tool produced for one pair.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolMetrics {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ratio: Option<f64>,
}

impl ToolMetrics {
    pub fn ok(bytes: u64, elapsed: Duration, target_bytes: u64) -> Self {
        ToolMetrics {
            status: Status::Ok,
            reason: None,
            bytes: Some(bytes),
            ms: Some(elapsed.as_secs_f64() * 1000.0),
            ratio: (target_bytes > 0).then(|| bytes as f64 / target_bytes as f64),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        ToolMetrics {
            status: Status::Skipped,
            reason: Some(reason.into()),
            bytes: None,
            ms: None,
            ratio: None,
        }
    }

    pub fn error(reason: impl Into<String>, elapsed: Option<Duration>) -> Self {
        ToolMetrics {
            status: Status::Error,
            reason: Some(reason.into()),
            bytes: None,
            ms: elapsed.map(|e| e.as_secs_f64() * 1000.0),
            ratio: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    pub present: bool,
    pub version: Option<String>,
}

/// A compressor or delta tool measured against the same pairs.
pub trait ReferenceTool: Send + Sync {
    fn name(&self) -> &str;

    fn presence(&self) -> Presence;

    /// Measures one pair, `scratch` is a private directory for outputs.
    ///
    /// Never fails: problems are reported through the metrics status.
    fn measure(&self, base: &Path, target: &Path, scratch: &Path) -> ToolMetrics;
}

/// How an external program is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation {
    /// `zstd -q -19 -c <target>`, output on stdout
    Compress,
    /// `xdelta3 -e -f -s <base> <target> <out>`
    Delta,
    /// `git diff --no-index --binary -- <base> <target>`, output on stdout
    VcsDiff,
}

pub struct ExternalTool {
    name: String,
    program: PathBuf,
    invocation: Invocation,
    timeout: Duration,
}

impl ExternalTool {
    pub fn new(name: &str, program: impl Into<PathBuf>, invocation: Invocation, timeout: Duration) -> Self {
        ExternalTool {
            name: name.to_string(),
            program: program.into(),
            invocation,
            timeout,
        }
    }

    fn version_arg(&self) -> &'static str {
        match self.invocation {
            Invocation::Delta => "-V",
            _ => "--version",
        }
    }

    fn run(&self, base: &Path, target: &Path, out: &Path) -> io::Result<Option<ExitStatus>> {
        let mut cmd = Command::new(&self.program);
        cmd.stdin(Stdio::null()).stderr(Stdio::null());

        match self.invocation {
            Invocation::Compress => {
                cmd.args(["-q", "-19", "-c"]).arg(target);
                cmd.stdout(File::create(out)?);
            }
            Invocation::Delta => {
                cmd.args(["-e", "-f", "-s"]).arg(base).arg(target).arg(out);
                cmd.stdout(Stdio::null());
            }
            Invocation::VcsDiff => {
                cmd.args(["diff", "--no-index", "--binary", "--"]).arg(base).arg(target);
                cmd.stdout(File::create(out)?);
            }
        }

        run_with_timeout(&mut cmd, self.timeout)
    }

    // First line of the version output, stdout first then stderr
    fn query_version(&self) -> io::Result<Option<String>> {
        let mut stdout = tempfile::tempfile()?;
        let mut stderr = tempfile::tempfile()?;

        let mut cmd = Command::new(&self.program);
        cmd.arg(self.version_arg())
            .stdin(Stdio::null())
            .stdout(stdout.try_clone()?)
            .stderr(stderr.try_clone()?);

        if run_with_timeout(&mut cmd, self.timeout.min(VERSION_TIMEOUT))?.is_none() {
            warn!("{} {} timed out", self.program.display(), self.version_arg());
            return Ok(None);
        }

        let mut text = Vec::new();
        stdout.seek(SeekFrom::Start(0))?;
        stdout.read_to_end(&mut text)?;
        if text.is_empty() {
            stderr.seek(SeekFrom::Start(0))?;
            stderr.read_to_end(&mut text)?;
        }
        Ok(String::from_utf8_lossy(&text).trim().lines().next().map(str::to_string))
    }

    fn succeeded(&self, status: ExitStatus) -> bool {
        match self.invocation {
            // Exit 1 means the files differ
            Invocation::VcsDiff => matches!(status.code(), Some(0) | Some(1)),
            _ => status.success(),
        }
    }
}

impl ReferenceTool for ExternalTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn presence(&self) -> Presence {
        match self.query_version() {
            Ok(version) => Presence {
                present: true,
                version,
            },
            Err(e) => {
                debug!("{} unavailable: {}", self.program.display(), e);
                Presence {
                    present: false,
                    version: None,
                }
            }
        }
    }

    fn measure(&self, base: &Path, target: &Path, scratch: &Path) -> ToolMetrics {
        let out = scratch.join(format!("{}.out", self.name));
        let target_bytes = fs::metadata(target).map(|m| m.len()).unwrap_or(0);

        let start = Instant::now();
        let status = match self.run(base, target, &out) {
            Ok(status) => status,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} not found, skipping", self.program.display());
                return ToolMetrics::skipped(format!("missing_cli:{}", self.name));
            }
            Err(e) => return ToolMetrics::error(format!("{}_spawn:{}", self.name, e), None),
        };
        let elapsed = start.elapsed();

        match status {
            None => {
                warn!("{} timed out after {:?}", self.name, self.timeout);
                ToolMetrics::error(format!("{}_timeout", self.name), Some(elapsed))
            }
            Some(status) if !self.succeeded(status) => {
                let code = status.code().map_or("signal".to_string(), |c| c.to_string());
                ToolMetrics::error(format!("{}_exit:{}", self.name, code), Some(elapsed))
            }
            Some(_) => match fs::metadata(&out) {
                Ok(meta) => ToolMetrics::ok(meta.len(), elapsed, target_bytes),
                Err(e) => ToolMetrics::error(format!("{}_output:{}", self.name, e), Some(elapsed)),
            },
        }
    }
}

/// Runs `cmd`, killing it once `timeout` elapses.
///
/// Returns `None` on timeout. A missing program surfaces as the spawn error.
pub fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let mut child = cmd.spawn()?;
    let start = Instant::now();

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start.elapsed() >= timeout {
            child.kill()?;
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(POLL);
    }
}

/// The in-process patch builder, verified by applying its own output.
pub struct HajimiTool {
    config: BuildConfig,
}

impl HajimiTool {
    pub fn new(config: BuildConfig) -> Self {
        HajimiTool { config }
    }

    fn run(&self, base: &Path, target: &Path, out: &Path) -> Result<u64, crate::patch::PatchError> {
        let builder = PatchBuilder::new(self.config.clone())?;
        let summary = builder.build(
            File::open(base)?,
            BufReader::new(File::open(target)?),
            tempfile::tempfile()?,
            BufWriter::new(File::create(out)?),
        )?;

        PatchApplier::new(ApplyConfig {
            window: self.config.window,
            ..ApplyConfig::default()
        })
        .apply(File::open(base)?, File::open(out)?, io::sink())?;

        Ok(summary.patch_len)
    }
}

impl ReferenceTool for HajimiTool {
    fn name(&self) -> &str {
        "hajimi"
    }

    fn presence(&self) -> Presence {
        Presence {
            present: true,
            version: Some(hdiff::FORMAT_VERSION.to_string()),
        }
    }

    fn measure(&self, base: &Path, target: &Path, scratch: &Path) -> ToolMetrics {
        let target_bytes = fs::metadata(target).map(|m| m.len()).unwrap_or(0);
        let out = scratch.join("hajimi.hdiff");

        let start = Instant::now();
        match self.run(base, target, &out) {
            Ok(bytes) => ToolMetrics::ok(bytes, start.elapsed(), target_bytes),
            Err(e) => ToolMetrics::error(format!("hajimi:{}", e), Some(start.elapsed())),
        }
    }
}

#[cfg(test)]
mod test_tools {
    use super::*;

    fn pair(dir: &Path) -> (PathBuf, PathBuf) {
        let base = dir.join("base.txt");
        let target = dir.join("target.txt");
        fs::write(&base, b"Hello World - Base Content").unwrap();
        fs::write(&target, b"Hello World - Modified Content").unwrap();
        (base, target)
    }

    #[test]
    fn metrics_json() {
        let ok = ToolMetrics::ok(15, Duration::from_millis(2), 30);
        assert_eq!(ok.ratio, Some(0.5));

        let json = serde_json::to_value(ToolMetrics::skipped("missing_cli:xdelta3")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "skipped", "reason": "missing_cli:xdelta3"})
        );

        assert_eq!(ToolMetrics::ok(10, Duration::ZERO, 0).ratio, None);
    }

    #[test]
    fn missing_program_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (base, target) = pair(dir.path());
        let tool = ExternalTool::new(
            "xdelta3",
            "hajimi-test-no-such-program",
            Invocation::Delta,
            Duration::from_secs(5),
        );

        let metrics = tool.measure(&base, &target, dir.path());
        assert_eq!(metrics.status, Status::Skipped);
        assert_eq!(metrics.reason.as_deref(), Some("missing_cli:xdelta3"));
        assert!(!tool.presence().present);
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");

        let start = Instant::now();
        assert_eq!(run_with_timeout(&mut cmd, Duration::from_millis(100)).unwrap(), None);
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn version_reads_stdout() {
        let tool = ExternalTool::new("echo", "echo", Invocation::Compress, Duration::from_secs(5));
        let presence = tool.presence();

        assert!(presence.present);
        assert!(presence.version.is_some_and(|v| !v.is_empty()));
    }

    #[cfg(unix)]
    #[test]
    fn hung_version_times_out() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("hang.sh");
        fs::write(&script, b"#!/bin/sh\nsleep 5\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let tool = ExternalTool::new("hang", &script, Invocation::Delta, Duration::from_millis(100));
        let start = Instant::now();
        let presence = tool.presence();

        assert!(start.elapsed() < Duration::from_secs(4));
        assert!(presence.present);
        assert_eq!(presence.version, None);
    }

    #[cfg(unix)]
    #[test]
    fn failing_program_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let (base, target) = pair(dir.path());
        let tool = ExternalTool::new("false", "false", Invocation::Compress, Duration::from_secs(5));

        let metrics = tool.measure(&base, &target, dir.path());
        assert_eq!(metrics.status, Status::Error);
        assert_eq!(metrics.reason.as_deref(), Some("false_exit:1"));
    }

    #[test]
    fn hajimi_measures_patch() {
        let dir = tempfile::tempdir().unwrap();
        let (base, target) = pair(dir.path());
        let tool = HajimiTool::new(BuildConfig::default());

        let metrics = tool.measure(&base, &target, dir.path());
        assert_eq!(metrics.status, Status::Ok);
        assert_eq!(
            metrics.bytes,
            Some(fs::metadata(dir.path().join("hajimi.hdiff")).unwrap().len())
        );
        assert!(tool.presence().present);
    }
}
