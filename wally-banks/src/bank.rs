//! Bank serialization and read-back.
//!
//! Layout of an output directory:
//!
//! ```text
//! banks/
//! ├── <character>_<part>.i8.bin   K x D signed bytes, row-major
//! └── index.json                   {version, embeddingSize, banks, color}
//! ```
//!
//! A descriptor is appended to the index only after its binary file has been
//! written, so the index never references a missing bank.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::dataset::Label;
use crate::error::{Error, Result};

/// Version written to `index.json`.
pub const INDEX_VERSION: u32 = 1;

/// Name of the metadata document inside the output directory.
pub const INDEX_FILE: &str = "index.json";

/// Suffix shared by every bank file.
pub const BANK_SUFFIX: &str = ".i8.bin";

/// Description of one persisted bank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankDescriptor {
    pub character: String,
    pub part: String,
    /// File name relative to the output directory
    pub file: String,
    /// Number of embeddings the centroids were computed from
    pub count: usize,
    /// Number of centroid rows in the file
    pub k: usize,
}

impl BankDescriptor {
    pub fn label(&self) -> Label {
        Label::new(self.character.clone(), self.part.clone())
    }

    /// Expected size in bytes of the bank file.
    pub fn byte_len(&self, embedding_size: usize) -> usize {
        self.k * embedding_size
    }
}

/// The `index.json` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankIndex {
    pub version: u32,
    #[serde(rename = "embeddingSize")]
    pub embedding_size: usize,
    pub banks: Vec<BankDescriptor>,
    /// Reserved; always empty in this version
    #[serde(default)]
    pub color: BTreeMap<String, serde_json::Value>,
}

impl BankIndex {
    pub fn new(embedding_size: usize) -> Self {
        Self {
            version: INDEX_VERSION,
            embedding_size,
            banks: Vec::new(),
            color: BTreeMap::new(),
        }
    }

    /// Load `index.json` from an output directory.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(INDEX_FILE);
        let file = File::open(&path).map_err(|e| {
            Error::Bank(format!("Failed to open {}: {}", path.display(), e))
        })?;
        let index: BankIndex = serde_json::from_reader(BufReader::new(file))?;
        Ok(index)
    }

    /// Look a bank up by its `(character, part)` key.
    pub fn find(&self, character: &str, part: &str) -> Option<&BankDescriptor> {
        self.banks
            .iter()
            .find(|b| b.character == character && b.part == part)
    }

    /// Total number of centroid rows across all banks.
    pub fn total_centroids(&self) -> usize {
        self.banks.iter().map(|b| b.k).sum()
    }
}

/// File name used for a label's bank.
pub fn bank_file_name(label: &Label) -> String {
    format!("{}_{}{}", label.character, label.part, BANK_SUFFIX)
}

/// Writes bank files one label at a time and accumulates the index.
pub struct BankWriter {
    dir: PathBuf,
    index: BankIndex,
}

impl BankWriter {
    /// Create the output directory (and parents) and start an empty index.
    pub fn create<P: AsRef<Path>>(dir: P, embedding_size: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            index: BankIndex::new(embedding_size),
        })
    }

    pub fn index(&self) -> &BankIndex {
        &self.index
    }

    /// Write `centroids` as `<character>_<part>.i8.bin` and record its descriptor.
    ///
    /// Files left over from an earlier run are overwritten. A label whose file
    /// name collides with a bank already written in this run is rejected
    /// before anything touches the disk.
    pub fn write_bank(
        &mut self,
        label: &Label,
        count: usize,
        centroids: &Array2<i8>,
    ) -> Result<&BankDescriptor> {
        if centroids.ncols() != self.index.embedding_size {
            return Err(Error::Shape(format!(
                "bank {} has {} columns, index embedding size is {}",
                label,
                centroids.ncols(),
                self.index.embedding_size
            )));
        }
        if centroids.nrows() == 0 {
            return Err(Error::Shape(format!("bank {} has no centroids", label)));
        }

        let file = bank_file_name(label);
        if let Some(existing) = self.index.banks.iter().find(|b| b.file == file) {
            return Err(Error::Bank(format!(
                "labels {} and {} both map to bank file {}",
                existing.label(),
                label,
                file
            )));
        }
        let path = self.dir.join(&file);
        let bytes: Vec<u8> = centroids.iter().map(|&v| v as u8).collect();
        fs::write(&path, &bytes)?;

        tracing::debug!(
            label = %label,
            path = %path.display(),
            bytes = bytes.len(),
            "bank.written"
        );

        self.index.banks.push(BankDescriptor {
            character: label.character.clone(),
            part: label.part.clone(),
            file,
            count,
            k: centroids.nrows(),
        });
        // Just pushed
        Ok(&self.index.banks[self.index.banks.len() - 1])
    }

    /// Write `index.json` and return the final index.
    pub fn finish(self) -> Result<BankIndex> {
        let path = self.dir.join(INDEX_FILE);
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &self.index)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        tracing::debug!(path = %path.display(), banks = self.index.banks.len(), "index.written");
        Ok(self.index)
    }
}

/// Read a bank file back as a `[k, embedding_size]` matrix.
pub fn read_bank<P: AsRef<Path>>(
    dir: P,
    descriptor: &BankDescriptor,
    embedding_size: usize,
) -> Result<Array2<i8>> {
    let path = dir.as_ref().join(&descriptor.file);
    let bytes = fs::read(&path)?;
    let expected = descriptor.byte_len(embedding_size);
    if bytes.len() != expected {
        return Err(Error::Shape(format!(
            "{} is {} bytes, expected k * embeddingSize = {} * {} = {}",
            path.display(),
            bytes.len(),
            descriptor.k,
            embedding_size,
            expected
        )));
    }
    let values: Vec<i8> = bytes.into_iter().map(|b| b as i8).collect();
    Ok(Array2::from_shape_vec((descriptor.k, embedding_size), values)?)
}

/// Load an output directory and check every bank against its descriptor.
///
/// Checks the index version, that each `(character, part)` key appears once,
/// that `k <= count`, and that every file holds exactly `k * embeddingSize`
/// values in `[-127, 127]`.
pub fn verify_bank_set<P: AsRef<Path>>(dir: P) -> Result<BankIndex> {
    let dir = dir.as_ref();
    let index = BankIndex::load(dir)?;

    if index.version != INDEX_VERSION {
        return Err(Error::Bank(format!(
            "unsupported index version {} (expected {})",
            index.version, INDEX_VERSION
        )));
    }
    if index.embedding_size == 0 {
        return Err(Error::Bank("embeddingSize must be positive".into()));
    }

    let mut seen = HashSet::new();
    for descriptor in &index.banks {
        let label = descriptor.label();
        if !seen.insert(label.clone()) {
            return Err(Error::Bank(format!("duplicate bank for {}", label)));
        }
        if descriptor.k == 0 || descriptor.k > descriptor.count {
            return Err(Error::Bank(format!(
                "bank {} has k = {} for count = {}",
                label, descriptor.k, descriptor.count
            )));
        }
        let bank = read_bank(dir, descriptor, index.embedding_size)?;
        if bank.iter().any(|&v| v == i8::MIN) {
            return Err(Error::Bank(format!(
                "bank {} contains -128, outside the quantized range",
                label
            )));
        }
    }

    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::TempDir;

    #[test]
    fn test_bank_file_name() {
        assert_eq!(bank_file_name(&Label::new("hero", "head")), "hero_head.i8.bin");
        assert_eq!(
            bank_file_name(&Label::negatives()),
            "negatives_hard_frame.i8.bin"
        );
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("nested/banks");

        let mut writer = BankWriter::create(&out, 3).unwrap();
        let centroids = array![[127i8, -127, 0], [1, -1, 64]];
        let descriptor = writer
            .write_bank(&Label::new("hero", "head"), 24, &centroids)
            .unwrap()
            .clone();
        assert_eq!(descriptor.k, 2);
        assert_eq!(descriptor.count, 24);

        let index = writer.finish().unwrap();
        assert_eq!(index.banks.len(), 1);

        let bytes = fs::read(out.join("hero_head.i8.bin")).unwrap();
        assert_eq!(bytes.len(), 6);
        assert_eq!(bytes[1], 0x81);

        let loaded = BankIndex::load(&out).unwrap();
        assert_eq!(loaded, index);
        let back = read_bank(&out, &loaded.banks[0], loaded.embedding_size).unwrap();
        assert_eq!(back, centroids);
    }

    #[test]
    fn test_index_json_layout() {
        let dir = TempDir::new().unwrap();
        let mut writer = BankWriter::create(dir.path(), 2).unwrap();
        writer
            .write_bank(&Label::negatives(), 120, &array![[1i8, 2], [3, 4]])
            .unwrap();
        writer.finish().unwrap();

        let raw = fs::read_to_string(dir.path().join(INDEX_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["embeddingSize"], 2);
        assert_eq!(json["color"], serde_json::json!({}));
        assert_eq!(
            json["banks"][0],
            serde_json::json!({
                "character": "negatives_hard",
                "part": "frame",
                "file": "negatives_hard_frame.i8.bin",
                "count": 120,
                "k": 2
            })
        );
    }

    #[test]
    fn test_wrong_width_is_rejected_without_descriptor() {
        let dir = TempDir::new().unwrap();
        let mut writer = BankWriter::create(dir.path(), 4).unwrap();
        let result = writer.write_bank(&Label::new("a", "b"), 3, &array![[1i8, 2, 3]]);

        assert!(matches!(result, Err(Error::Shape(_))));
        assert!(writer.index().banks.is_empty());
        assert!(!dir.path().join("a_b.i8.bin").exists());
    }

    #[test]
    fn test_overwrites_existing_bank() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a_b.i8.bin"), vec![9u8; 100]).unwrap();

        let mut writer = BankWriter::create(dir.path(), 2).unwrap();
        writer
            .write_bank(&Label::new("a", "b"), 1, &array![[5i8, 6]])
            .unwrap();
        assert_eq!(fs::read(dir.path().join("a_b.i8.bin")).unwrap(), vec![5, 6]);
    }

    #[test]
    fn test_colliding_file_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let mut writer = BankWriter::create(dir.path(), 2).unwrap();
        writer
            .write_bank(&Label::new("a", "b_c"), 3, &array![[1i8, 2], [3, 4]])
            .unwrap();

        let result = writer.write_bank(&Label::new("a_b", "c"), 1, &array![[7i8, 8]]);

        assert!(matches!(result, Err(Error::Bank(_))));
        assert_eq!(writer.index().banks.len(), 1);
        assert_eq!(
            fs::read(dir.path().join("a_b_c.i8.bin")).unwrap(),
            vec![1, 2, 3, 4]
        );
    }

    #[test]
    fn test_find_by_key() {
        let mut index = BankIndex::new(4);
        for (c, p) in [("hero", "head"), ("hero", "legs")] {
            index.banks.push(BankDescriptor {
                character: c.into(),
                part: p.into(),
                file: format!("{}_{}.i8.bin", c, p),
                count: 12,
                k: 3,
            });
        }
        assert_eq!(index.find("hero", "legs").unwrap().file, "hero_legs.i8.bin");
        assert!(index.find("villain", "legs").is_none());
        assert_eq!(index.total_centroids(), 6);
    }

    #[test]
    fn test_verify_detects_truncated_bank() {
        let dir = TempDir::new().unwrap();
        let mut writer = BankWriter::create(dir.path(), 2).unwrap();
        writer
            .write_bank(&Label::new("a", "b"), 4, &array![[1i8, 2], [3, 4]])
            .unwrap();
        writer.finish().unwrap();
        assert!(verify_bank_set(dir.path()).is_ok());

        fs::write(dir.path().join("a_b.i8.bin"), vec![1u8, 2, 3]).unwrap();
        assert!(matches!(verify_bank_set(dir.path()), Err(Error::Shape(_))));
    }

    #[test]
    fn test_verify_detects_duplicate_keys() {
        let dir = TempDir::new().unwrap();
        let mut writer = BankWriter::create(dir.path(), 1).unwrap();
        let label = Label::new("a", "b");
        writer.write_bank(&label, 1, &array![[1i8]]).unwrap();
        writer.write_bank(&label, 1, &array![[1i8]]).unwrap();
        writer.finish().unwrap();

        assert!(matches!(verify_bank_set(dir.path()), Err(Error::Bank(_))));
    }

    #[test]
    fn test_load_missing_index() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(BankIndex::load(dir.path()), Err(Error::Bank(_))));
    }
}
