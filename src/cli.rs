use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Deserialize;

use hdiff::{Importance, VersionPolicy};

use crate::bench::{available_cores, ToolPrograms};
use crate::corrupt::{CorruptMode, DEFAULT_SEED};
use crate::patch::builder::{DEFAULT_LEVEL, DEFAULT_WINDOW};
use crate::patch::{ApplyConfig, BuildConfig, ChunkMode, ChunkSizes};

#[derive(Parser)]
#[command(name = "hajimi")]
#[command(about = "Content addressed binary diff and patch (HCTX .hdiff)")]
#[command(author, version, long_about = None)]
pub struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// More logging, repeat for more
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Builds a patch turning the old file into the new one
    Diff {
        old: PathBuf,
        new: PathBuf,

        /// Where to write the patch
        #[arg(short, long)]
        output: PathBuf,

        /// Chunking strategy, overrides the config file
        #[arg(long, value_enum)]
        algorithm: Option<Algorithm>,

        /// Streaming window in bytes
        #[arg(long)]
        window: Option<usize>,
    },

    /// Reconstructs the new file from a patch and its base
    Apply {
        patch: PathBuf,
        base: PathBuf,

        /// Where to write the reconstructed file
        #[arg(short, long)]
        output: PathBuf,

        /// Streaming window in bytes
        #[arg(long)]
        window: Option<usize>,
    },

    /// Prints the BLAKE3-256 digest of a file
    Hash { file: PathBuf },

    /// Checks the structure and digests of a patch
    Verify {
        patch: PathBuf,

        /// Output format, `json` prints the damage scan
        #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
        report: ReportFormat,
    },

    /// Rebuilds a sealed container from the intact chunks of a damaged one
    Recover {
        #[arg(long = "in")]
        input: PathBuf,

        #[arg(long = "out")]
        output: PathBuf,

        /// Also write the recovery report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Writes a deliberately damaged copy of a patch
    Corrupt {
        #[arg(long = "in")]
        input: PathBuf,

        #[arg(long = "out")]
        output: PathBuf,

        #[arg(long, value_enum)]
        mode: CorruptMode,

        #[arg(long, default_value_t = DEFAULT_SEED)]
        seed: u32,
    },

    /// Writes the golden vector container and its descriptor
    Golden {
        #[arg(long)]
        out: PathBuf,
    },

    /// Runs the benchmark against the reference tools
    Bench {
        #[arg(long)]
        manifest: PathBuf,

        #[arg(long)]
        out: PathBuf,

        #[arg(long)]
        workers: Option<usize>,

        /// Per tool timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Algorithm {
    /// Whole target as one chunk
    Literal,
    /// Content defined chunking with copy and delta reuse
    Cdc,
}

impl From<Algorithm> for ChunkMode {
    fn from(a: Algorithm) -> ChunkMode {
        match a {
            Algorithm::Literal => ChunkMode::Literal,
            Algorithm::Cdc => ChunkMode::Cdc,
        }
    }
}

// Configuration
#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version_policy: VersionPolicy,
    pub chunking: Chunking,
    pub streaming: Streaming,
    pub bench: Bench,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Chunking {
    pub mode: ChunkMode,
    pub min_size: u32,
    pub avg_size: u32,
    pub max_size: u32,
    pub level: i32,
    pub dictionary_sharing: bool,
    pub importance: Importance,
}

impl Default for Chunking {
    fn default() -> Self {
        Chunking {
            mode: ChunkMode::Cdc,
            min_size: ChunkSizes::DEFAULT.min_size,
            avg_size: ChunkSizes::DEFAULT.avg_size,
            max_size: ChunkSizes::DEFAULT.max_size,
            level: DEFAULT_LEVEL,
            dictionary_sharing: false,
            importance: Importance::User,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Streaming {
    pub threshold: u64,
    pub window: usize,
    pub memory_ceiling: u64,
}

impl Default for Streaming {
    fn default() -> Self {
        Streaming {
            threshold: 256 * 1024 * 1024,
            window: DEFAULT_WINDOW,
            memory_ceiling: 200 * 1024 * 1024,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Bench {
    pub workers: usize,
    pub timeout_secs: u64,
    pub tools: Tools,
}

impl Default for Bench {
    fn default() -> Self {
        Bench {
            workers: available_cores(),
            timeout_secs: 300,
            tools: Tools::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Tools {
    pub zstd: PathBuf,
    pub xdelta3: PathBuf,
    pub git: PathBuf,
}

impl Default for Tools {
    fn default() -> Self {
        let programs = ToolPrograms::default();
        Tools {
            zstd: programs.zstd,
            xdelta3: programs.xdelta3,
            git: programs.git,
        }
    }
}

impl Config {
    /// Reads the config file, the defaults when there is none.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigFileError> {
        match path {
            None => Ok(Config::default()),
            Some(path) => {
                let text = fs::read_to_string(path)?;
                Ok(toml::from_str(&text)?)
            }
        }
    }

    pub fn build_config(&self, algorithm: Option<Algorithm>, window: Option<usize>) -> BuildConfig {
        let c = &self.chunking;
        BuildConfig {
            mode: algorithm.map(ChunkMode::from).unwrap_or(c.mode),
            sizes: ChunkSizes {
                min_size: c.min_size,
                avg_size: c.avg_size,
                max_size: c.max_size,
            },
            level: c.level,
            dictionary_sharing: c.dictionary_sharing,
            importance: c.importance,
            window: window.unwrap_or(self.streaming.window),
            ..BuildConfig::default()
        }
    }

    pub fn apply_config(&self, window: Option<usize>) -> ApplyConfig {
        ApplyConfig {
            policy: self.version_policy,
            window: window.unwrap_or(self.streaming.window),
            ..ApplyConfig::default()
        }
    }

    pub fn tool_programs(&self) -> ToolPrograms {
        ToolPrograms {
            zstd: self.bench.tools.zstd.clone(),
            xdelta3: self.bench.tools.xdelta3.clone(),
            git: self.bench.tools.git.clone(),
        }
    }

    pub fn bench_timeout(&self, timeout: Option<u64>) -> Duration {
        Duration::from_secs(timeout.unwrap_or(self.bench.timeout_secs))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigFileError {
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
}

#[cfg(test)]
mod test_config {
    use super::*;

    #[test]
    fn empty_is_default() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(Config::load(None).unwrap(), Config::default());

        let build = config.build_config(None, None);
        assert_eq!(build, BuildConfig::default());
        assert_eq!(config.apply_config(None), ApplyConfig::default());
    }

    #[test]
    fn sections() {
        let config: Config = toml::from_str(
            r#"
            version_policy = "lenient"

            [chunking]
            mode = "literal"
            min_size = 1024
            avg_size = 4096
            max_size = 16384
            dictionary_sharing = true
            importance = "pinned"

            [streaming]
            window = 1048576

            [bench]
            workers = 2
            timeout_secs = 10

            [bench.tools]
            xdelta3 = "/opt/bin/xdelta3"
            "#,
        )
        .unwrap();

        assert_eq!(config.version_policy, VersionPolicy::Lenient);
        assert_eq!(config.streaming.threshold, 256 * 1024 * 1024);
        assert_eq!(config.bench.timeout_secs, 10);
        assert_eq!(config.tool_programs().xdelta3, PathBuf::from("/opt/bin/xdelta3"));
        assert_eq!(config.tool_programs().zstd, PathBuf::from("zstd"));

        let build = config.build_config(None, None);
        assert_eq!(build.mode, ChunkMode::Literal);
        assert_eq!(build.sizes.avg_size, 4096);
        assert_eq!(build.importance, Importance::Pinned);
        assert_eq!(build.window, 1048576);
        assert!(build.dictionary_sharing);
    }

    #[test]
    fn flags_override() {
        let config = Config::default();
        let build = config.build_config(Some(Algorithm::Literal), Some(4096));

        assert_eq!(build.mode, ChunkMode::Literal);
        assert_eq!(build.window, 4096);
        assert_eq!(config.bench_timeout(Some(3)), Duration::from_secs(3));
        assert_eq!(config.bench_timeout(None), Duration::from_secs(300));
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(toml::from_str::<Config>("[chunking]\nmin = 3\n").is_err());
    }

    #[test]
    fn parses_commands() {
        let cli = Cli::try_parse_from(["hajimi", "diff", "a", "b", "-o", "p.hdiff", "--algorithm", "literal"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Diff {
                algorithm: Some(Algorithm::Literal),
                ..
            }
        ));

        let cli = Cli::try_parse_from(["hajimi", "corrupt", "--in", "a", "--out", "b", "--mode", "magicflip"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Corrupt {
                mode: CorruptMode::Magicflip,
                seed: 1337,
                ..
            }
        ));

        let cli = Cli::try_parse_from(["hajimi", "-vv", "hash", "f"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }
}
