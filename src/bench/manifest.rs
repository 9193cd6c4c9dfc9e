use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use hcore::hash::{hash, Hash};

use crate::bench::BenchError;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub version: String,
    #[serde(default = "default_preset")]
    pub preset: String,
    pub datasets: Vec<Dataset>,
}

fn default_preset() -> String {
    "unknown".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    SourceText,
    TimeseriesLog,
    EncryptedBinary,
    Synthetic,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub kind: DatasetKind,
    pub pairs: Vec<PairSpec>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PairSpec {
    pub id: String,
    pub base: FileSpec,
    pub target: FileSpec,
}

/// A corpus file, relative to the manifest's directory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    pub path: String,
    pub bytes: u64,
    pub blake3: Hash,
}

/// One checked pair, ready to be measured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub kind: DatasetKind,
    pub base: PathBuf,
    pub target: PathBuf,
    pub base_spec: FileSpec,
    pub target_spec: FileSpec,
}

impl Manifest {
    /// Loads a manifest, returning it with the directory its paths are relative to.
    pub fn load(path: &Path) -> Result<(Manifest, PathBuf), BenchError> {
        let file = File::open(path)?;
        let manifest: Manifest = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| BenchError::Manifest(format!("{}: {}", path.display(), e)))?;

        let root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok((manifest, root))
    }

    /// Checks every declared size and digest against the files under `root`.
    ///
    /// Jobs come back in manifest order.
    pub fn jobs(&self, root: &Path) -> Result<Vec<Job>, BenchError> {
        let mut jobs = Vec::new();

        for dataset in self.datasets.iter() {
            for pair in dataset.pairs.iter() {
                let base = check_file(root, &pair.base)?;
                let target = check_file(root, &pair.target)?;

                jobs.push(Job {
                    id: pair.id.clone(),
                    kind: dataset.kind,
                    base,
                    target,
                    base_spec: pair.base.clone(),
                    target_spec: pair.target.clone(),
                });
            }
        }

        debug!("Manifest {} lists {} pairs", self.version, jobs.len());
        Ok(jobs)
    }
}

fn check_file(root: &Path, spec: &FileSpec) -> Result<PathBuf, BenchError> {
    let path = root.join(&spec.path);
    let mismatch = |reason: String| BenchError::CorpusMismatch {
        path: spec.path.clone(),
        reason,
    };

    let len = fs::metadata(&path)
        .map_err(|e| mismatch(format!("unreadable: {}", e)))?
        .len();
    if len != spec.bytes {
        return Err(mismatch(format!("declared {} bytes, found {}", spec.bytes, len)));
    }

    let actual = hash(&mut BufReader::new(File::open(&path)?))?;
    if actual != spec.blake3 {
        return Err(mismatch(format!("declared blake3 {}, found {}", spec.blake3, actual)));
    }

    Ok(path)
}
