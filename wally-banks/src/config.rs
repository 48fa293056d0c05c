//! Pipeline configuration

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What to do when a source image cannot be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodePolicy {
    /// Abort the whole run on the first unreadable image
    #[default]
    Abort,
    /// Log a warning, leave the image out and keep going
    Skip,
}

/// Configuration for a bank-generation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankConfig {
    /// Dataset root, laid out as `<character>/<part>/*.jpg` plus `negatives_hard/*.jpg`
    #[serde(default = "default_dataset")]
    pub dataset: PathBuf,
    /// Directory receiving the `.i8.bin` banks and `index.json`
    #[serde(default = "default_output")]
    pub output: PathBuf,
    /// Target number of centroids per label (default: 12)
    #[serde(default = "default_clusters")]
    pub clusters: usize,
    /// Square input resolution fed to the backbone (default: 160)
    #[serde(default = "default_image_size")]
    pub image_size: u32,
    /// Seed threaded into clustering (default: 42)
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// K-means iteration cap (default: 300)
    #[serde(default = "default_max_iters")]
    pub max_iters: usize,
    /// K-means convergence tolerance (default: 1e-4)
    #[serde(default = "default_tol")]
    pub tol: f64,
    /// Policy for unreadable source images (default: abort)
    #[serde(default)]
    pub on_decode_error: DecodePolicy,
}

fn default_dataset() -> PathBuf {
    PathBuf::from("dataset")
}

fn default_output() -> PathBuf {
    PathBuf::from("../banks")
}

fn default_clusters() -> usize {
    12
}

fn default_image_size() -> u32 {
    160
}

fn default_seed() -> u64 {
    42
}

fn default_max_iters() -> usize {
    300
}

fn default_tol() -> f64 {
    1e-4
}

impl Default for BankConfig {
    fn default() -> Self {
        Self {
            dataset: default_dataset(),
            output: default_output(),
            clusters: default_clusters(),
            image_size: default_image_size(),
            seed: default_seed(),
            max_iters: default_max_iters(),
            tol: default_tol(),
            on_decode_error: DecodePolicy::default(),
        }
    }
}

impl BankConfig {
    /// Load a configuration from a JSON file. Missing fields take their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            Error::Config(format!("Failed to open config {}: {}", path.display(), e))
        })?;
        let config: BankConfig = serde_json::from_reader(BufReader::new(file))?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.clusters == 0 {
            return Err(Error::Config("clusters must be at least 1".into()));
        }
        if self.image_size == 0 {
            return Err(Error::Config("image_size must be at least 1".into()));
        }
        if self.max_iters == 0 {
            return Err(Error::Config("max_iters must be at least 1".into()));
        }
        if !self.tol.is_finite() || self.tol < 0.0 {
            return Err(Error::Config(format!(
                "tol must be a finite non-negative number, got {}",
                self.tol
            )));
        }
        Ok(())
    }
}
