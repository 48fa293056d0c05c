//! Dataset scanning and label grouping.
//!
//! Expected layout:
//!
//! ```text
//! dataset/
//! ├── <character>/<part>/*.jpg
//! └── negatives_hard/*.jpg
//! ```
//!
//! Entries are visited in sorted file-name order at every level so that the
//! resulting groups, and the bank order derived from them, are reproducible.
//! Names starting with `.` are skipped at every level.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Top-level directory holding hard-negative frames.
pub const NEGATIVES_DIR: &str = "negatives_hard";

/// Part name assigned to every hard-negative sample.
pub const NEGATIVES_PART: &str = "frame";

const IMAGE_EXTENSION: &str = "jpg";

/// A `character:part` label identifying one bank.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label {
    pub character: String,
    pub part: String,
}

impl Label {
    pub fn new(character: impl Into<String>, part: impl Into<String>) -> Self {
        Self {
            character: character.into(),
            part: part.into(),
        }
    }

    /// The reserved `negatives_hard:frame` label.
    pub fn negatives() -> Self {
        Self::new(NEGATIVES_DIR, NEGATIVES_PART)
    }

    pub fn is_negatives(&self) -> bool {
        self.character == NEGATIVES_DIR && self.part == NEGATIVES_PART
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.character, self.part)
    }
}

/// All source images for one label, in traversal order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub label: Label,
    pub paths: Vec<PathBuf>,
}

impl Group {
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Total number of source images across all groups.
pub fn total_samples(groups: &[Group]) -> usize {
    groups.iter().map(Group::len).sum()
}

/// Walk `root` and group its `.jpg` files by label.
///
/// Returns [`Error::NoSamples`] when no group contains a single image, and
/// [`Error::Config`] when `root` is not a readable directory.
pub fn scan_dataset<P: AsRef<Path>>(root: P) -> Result<Vec<Group>> {
    let root = root.as_ref();
    if !root.is_dir() {
        return Err(Error::Config(format!(
            "dataset root {} is not a directory",
            root.display()
        )));
    }

    let mut groups = Vec::new();

    for top in sorted_entries(root)? {
        if !top.is_dir() {
            continue;
        }
        let Some(character) = file_name(&top) else {
            continue;
        };

        if character == NEGATIVES_DIR {
            push_group(&mut groups, Label::negatives(), jpg_files(&top)?);
            continue;
        }

        for part_dir in sorted_entries(&top)? {
            if !part_dir.is_dir() {
                continue;
            }
            let Some(part) = file_name(&part_dir) else {
                continue;
            };
            push_group(
                &mut groups,
                Label::new(character.clone(), part),
                jpg_files(&part_dir)?,
            );
        }
    }

    if total_samples(&groups) == 0 {
        return Err(Error::NoSamples(root.to_path_buf()));
    }

    tracing::debug!(
        groups = groups.len(),
        samples = total_samples(&groups),
        "dataset.scanned"
    );

    Ok(groups)
}

fn push_group(groups: &mut Vec<Group>, label: Label, paths: Vec<PathBuf>) {
    if !paths.is_empty() {
        groups.push(Group { label, paths });
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_string())
}

/// Non-hidden entries of `dir`, sorted by name.
fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.retain(|p| !is_hidden(p));
    entries.sort();
    Ok(entries)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

fn jpg_files(dir: &Path) -> Result<Vec<PathBuf>> {
    Ok(sorted_entries(dir)?
        .into_iter()
        .filter(|p| p.is_file())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(IMAGE_EXTENSION))
        .collect())
}
