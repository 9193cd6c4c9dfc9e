use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use log::{debug, info, warn};
use tempfile::NamedTempFile;
use thiserror::Error;

use hajimi::bench::manifest::Manifest;
use hajimi::bench::{BenchError, Orchestrator};
use hajimi::cli::{Algorithm, Cli, Commands, Config, ConfigFileError, ReportFormat};
use hajimi::corrupt::{corrupt, CorruptError, CorruptMode};
use hajimi::mem::PeakRss;
use hajimi::patch::{PatchApplier, PatchBuilder, PatchError};
use hcore::hash::{hash, to_hex};
use hdiff::golden;
use hdiff::hctx::reader::HdiffReader;
use hdiff::hctx::recover::{recover, scan};
use hdiff::HdiffError;

#[derive(Error, Debug)]
enum CliError {
    #[error("cannot open {}: {source}", path.display())]
    Input { path: PathBuf, source: io::Error },
    #[error(transparent)]
    IO(#[from] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigFileError),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error(transparent)]
    Hdiff(#[from] HdiffError),
    #[error(transparent)]
    Corrupt(#[from] CorruptError),
    #[error(transparent)]
    Bench(#[from] BenchError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{path}: {issues} problem(s) found")]
    Damaged { path: String, issues: usize },
}

fn main() -> ExitCode {
    // Parse the cli
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    debug!("Config: {:?}", config);

    match cli.command {
        Commands::Diff {
            old,
            new,
            output,
            algorithm,
            window,
        } => diff(&config, &old, &new, &output, algorithm, window),
        Commands::Apply {
            patch,
            base,
            output,
            window,
        } => apply(&config, &patch, &base, &output, window),
        Commands::Hash { file } => {
            let digest = hash(&mut BufReader::new(open(&file)?))?;
            println!("{}  {}", to_hex(&digest), file.display());
            Ok(())
        }
        Commands::Verify { patch, report } => match report {
            ReportFormat::Text => verify(&config, &patch),
            ReportFormat::Json => verify_json(&config, &patch),
        },
        Commands::Recover {
            input,
            output,
            report,
        } => recover_file(&input, &output, report.as_deref()),
        Commands::Corrupt {
            input,
            output,
            mode,
            seed,
        } => corrupt_file(&input, &output, mode, seed),
        Commands::Golden { out } => write_golden(&out),
        Commands::Bench {
            manifest,
            out,
            workers,
            timeout,
        } => {
            let (manifest, root) = Manifest::load(&manifest)?;
            let orchestrator = Orchestrator::standard(
                workers.unwrap_or(config.bench.workers),
                config.bench_timeout(timeout),
                &config.tool_programs(),
                config.build_config(None, None),
            );

            let report = orchestrator.run(&manifest, &root)?;
            report.write(&out)?;
            println!("wrote {}; pairs={}", out.display(), report.pairs.len());
            Ok(())
        }
    }
}

fn open(path: &Path) -> Result<File, CliError> {
    File::open(path).map_err(|source| CliError::Input {
        path: path.to_path_buf(),
        source,
    })
}

/// Runs `write` against a temporary file next to `path` and only moves it
/// into place when `write` succeeded.
fn write_atomic<T, F>(path: &Path, write: F) -> Result<T, CliError>
where
    F: FnOnce(&mut BufWriter<&mut NamedTempFile>) -> Result<T, CliError>,
{
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;

    let value = {
        let mut out = BufWriter::new(&mut tmp);
        let value = write(&mut out)?;
        out.flush()?;
        value
    };

    tmp.persist(path).map_err(|e| CliError::IO(e.error))?;
    Ok(value)
}

fn diff(
    config: &Config,
    old: &Path,
    new: &Path,
    output: &Path,
    algorithm: Option<Algorithm>,
    window: Option<usize>,
) -> Result<(), CliError> {
    let base = open(old)?;
    let target = open(new)?;
    let old_len = base.metadata()?.len();
    let new_len = target.metadata()?.len();

    let builder = PatchBuilder::new(config.build_config(algorithm, window)).map_err(PatchError::from)?;
    let streaming = old_len.max(new_len) > config.streaming.threshold;
    let sampler = streaming.then(PeakRss::start);

    let summary = write_atomic(output, |out| {
        let summary = if streaming {
            debug!("Streaming build through a file spool");
            builder.build(base, target, tempfile::tempfile()?, out)?
        } else {
            builder.build(base, target, Cursor::new(Vec::new()), out)?
        };
        Ok(summary)
    })?;

    if let Some(sampler) = sampler {
        report_peak(config, sampler.stop());
    }

    println!(
        "old: {} bytes, new: {} bytes, patch: {} bytes ({} chunks)",
        old_len, new_len, summary.patch_len, summary.chunks
    );
    Ok(())
}

fn apply(config: &Config, patch: &Path, base: &Path, output: &Path, window: Option<usize>) -> Result<(), CliError> {
    let patch_file = open(patch)?;
    let base_file = open(base)?;
    let streaming = base_file.metadata()?.len() > config.streaming.threshold;
    let sampler = streaming.then(PeakRss::start);

    let applier = PatchApplier::new(config.apply_config(window));
    let summary = write_atomic(output, |out| {
        Ok(applier.apply(base_file, BufReader::new(patch_file), out)?)
    })?;

    if let Some(sampler) = sampler {
        report_peak(config, sampler.stop());
    }

    println!(
        "applied: {} bytes, blake3 {} -> {}",
        summary.chain.new_len,
        to_hex(&summary.chain.new_hash),
        output.display()
    );
    Ok(())
}

fn report_peak(config: &Config, peak: u64) {
    if peak > config.streaming.memory_ceiling {
        warn!(
            "Peak RSS {} bytes over the {} byte ceiling",
            peak, config.streaming.memory_ceiling
        );
    } else {
        info!("Peak RSS {} bytes", peak);
    }
}

// Full structural and integrity pass, every payload checksum included
fn check<R: io::Read + io::Seek>(config: &Config, input: R) -> Result<HdiffReader<R>, CliError> {
    let mut reader = HdiffReader::open(input, config.version_policy)?.with_window(config.streaming.window);
    reader.verify_integrity()?;
    for i in 0..reader.entries().len() {
        reader.read_payload(i)?;
    }
    Ok(reader)
}

fn verify(config: &Config, patch: &Path) -> Result<(), CliError> {
    let reader = check(config, BufReader::new(open(patch)?))?;

    let header = *reader.header();
    println!("version: {}.{}", header.major, header.minor);
    println!("entries: {}", header.entry_count);
    println!("index: {} + {}", header.index_offset, header.index_len);
    println!("data: {} + {}", header.data_offset, header.data_len);
    println!("footer: {}", header.footer_offset);
    println!("blake3: {}", to_hex(&reader.footer().digest));
    println!("ok: {} bytes", reader.file_len());
    Ok(())
}

fn read_input(path: &Path) -> Result<Vec<u8>, CliError> {
    fs::read(path).map_err(|source| CliError::Input {
        path: path.to_path_buf(),
        source,
    })
}

fn verify_json(config: &Config, patch: &Path) -> Result<(), CliError> {
    let bytes = read_input(patch)?;
    let report = scan(&bytes);
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.ok {
        return Err(CliError::Damaged {
            path: patch.display().to_string(),
            issues: report.errors.len(),
        });
    }
    // The scan does not look at the version or decode anything
    check(config, Cursor::new(&bytes[..]))?;
    Ok(())
}

fn recover_file(input: &Path, output: &Path, report_path: Option<&Path>) -> Result<(), CliError> {
    let bytes = read_input(input)?;
    let (recovered, report) = recover(&bytes)?;

    write_atomic(output, |out| Ok(out.write_all(&recovered)?))?;
    if let Some(path) = report_path {
        write_atomic(path, |out| {
            serde_json::to_writer_pretty(&mut *out, &report)?;
            Ok(out.write_all(b"\n")?)
        })?;
    }

    if report.actions.entries_dropped > 0 {
        warn!(
            "Dropped {} damaged chunks, the recovered patch may not apply",
            report.actions.entries_dropped
        );
    }
    println!(
        "wrote {}; kept={} dropped={} recoverable={}%",
        output.display(),
        report.actions.entries_kept,
        report.actions.entries_dropped,
        report.original_scan.recoverable_pct
    );
    Ok(())
}

fn corrupt_file(input: &Path, output: &Path, mode: CorruptMode, seed: u32) -> Result<(), CliError> {
    let bytes = read_input(input)?;
    let damaged = corrupt(&bytes, mode, seed)?;

    write_atomic(output, |out| Ok(out.write_all(&damaged)?))?;
    println!("wrote {} mode={} seed={}", output.display(), mode, seed);
    Ok(())
}

fn write_golden(dir: &Path) -> Result<(), CliError> {
    fs::create_dir_all(dir)?;
    let (bytes, vector) = golden::minimal()?;

    let file = dir.join(golden::GOLDEN_FILE_NAME);
    write_atomic(&file, |out| Ok(out.write_all(&bytes)?))?;

    let descriptor = dir.join(golden::VECTOR_FILE_NAME);
    write_atomic(&descriptor, |out| {
        serde_json::to_writer_pretty(&mut *out, &vector)?;
        Ok(out.write_all(b"\n")?)
    })?;

    println!("wrote {} ({} bytes)", file.display(), vector.file_size);
    println!("wrote {}", descriptor.display());
    Ok(())
}
