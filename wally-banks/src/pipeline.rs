//! End-to-end bank generation.
//!
//! Groups are processed strictly one after another. For each group, every
//! source image is decoded, expanded into its augmentation bundle and pushed
//! through the extractor before the next image is opened, so at most one
//! image's variants are alive at a time. The group's embedding matrix is then
//! clustered, quantized and written before the next group starts.

use std::path::{Path, PathBuf};

use image::RgbImage;
use ndarray::Array2;

use crate::augment::{augment, AUGMENTATIONS_PER_IMAGE};
use crate::bank::{BankDescriptor, BankIndex, BankWriter};
use crate::config::{BankConfig, DecodePolicy};
use crate::dataset::{scan_dataset, total_samples, Group, Label};
use crate::error::{Error, Result};
use crate::extractor::FeatureExtractor;
use crate::kmeans::{compute_centroids, ClusterConfig};
use crate::quantize::quantize_centroids;

/// Receives progress notifications from [`BankPipeline::run`].
pub trait ProgressSink {
    /// Called once, after scanning, with the number of groups and source
    /// images to process.
    fn start(&mut self, _total_groups: usize, _total_images: usize) {}

    /// Called after each source image of `label`, whether it was embedded or
    /// skipped.
    fn image_done(&mut self, _label: &Label) {}

    /// Called after each group. `descriptor` is `None` for a skipped group.
    fn group_done(&mut self, _label: &Label, _descriptor: Option<&BankDescriptor>) {}

    /// Called once after `index.json` has been written.
    fn finish(&mut self, _index: &BankIndex) {}
}

/// A [`ProgressSink`] that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {}

/// Embeddings for one group, before clustering.
#[derive(Debug, Clone)]
pub struct GroupEmbeddings {
    /// `[count, D]` matrix, one row per augmented variant
    pub matrix: Array2<f32>,
    /// Source images left out under [`DecodePolicy::Skip`]
    pub skipped: Vec<PathBuf>,
}

/// Quantized centroids for one group, ready to be written.
#[derive(Debug, Clone)]
pub struct QuantizedGroup {
    /// Number of embeddings the centroids summarise
    pub count: usize,
    /// `[k, D]` signed bytes
    pub centroids: Array2<i8>,
}

/// Outcome of a full run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub index: BankIndex,
    pub skipped_images: Vec<PathBuf>,
    pub skipped_groups: Vec<Label>,
}

/// The bank-generation pipeline, bound to one configuration and one backbone.
pub struct BankPipeline<E> {
    config: BankConfig,
    cluster: ClusterConfig,
    extractor: E,
}

impl<E: FeatureExtractor> BankPipeline<E> {
    /// Validate `config` and bind it to a loaded extractor.
    pub fn new(config: BankConfig, extractor: E) -> Result<Self> {
        config.validate()?;
        if extractor.embedding_dim() == 0 {
            return Err(Error::Config(
                "extractor reports an embedding dimension of 0".into(),
            ));
        }
        let cluster = ClusterConfig::from(&config);
        Ok(Self {
            config,
            cluster,
            extractor,
        })
    }

    pub fn config(&self) -> &BankConfig {
        &self.config
    }

    pub fn embedding_dim(&self) -> usize {
        self.extractor.embedding_dim()
    }

    /// Scan the dataset, build every bank and write `index.json`.
    ///
    /// Nothing is written when the dataset holds no samples. Any other error
    /// aborts the run; banks already written stay on disk but the index is
    /// not produced.
    pub fn run(&self, progress: &mut dyn ProgressSink) -> Result<PipelineReport> {
        let groups = scan_dataset(&self.config.dataset)?;

        tracing::info!(
            dataset = %self.config.dataset.display(),
            groups = groups.len(),
            samples = total_samples(&groups),
            clusters = self.config.clusters,
            embedding_size = self.embedding_dim(),
            "pipeline.started"
        );

        let mut writer = BankWriter::create(&self.config.output, self.embedding_dim())?;
        let mut skipped_images = Vec::new();
        let mut skipped_groups = Vec::new();

        progress.start(groups.len(), total_samples(&groups));

        for group in &groups {
            let (quantized, skipped) = self.process_group_with(group, progress)?;
            skipped_images.extend(skipped);

            match quantized {
                Some(quantized) => {
                    let descriptor =
                        writer.write_bank(&group.label, quantized.count, &quantized.centroids)?;
                    tracing::info!(
                        label = %group.label,
                        images = group.len(),
                        count = descriptor.count,
                        k = descriptor.k,
                        "group.written"
                    );
                    progress.group_done(&group.label, Some(descriptor));
                }
                None => {
                    tracing::warn!(
                        label = %group.label,
                        "group.skipped: no readable images, bank not written"
                    );
                    skipped_groups.push(group.label.clone());
                    progress.group_done(&group.label, None);
                }
            }
        }

        let index = writer.finish()?;

        tracing::info!(
            output = %self.config.output.display(),
            banks = index.banks.len(),
            skipped_images = skipped_images.len(),
            skipped_groups = skipped_groups.len(),
            "pipeline.finished"
        );
        progress.finish(&index);

        Ok(PipelineReport {
            index,
            skipped_images,
            skipped_groups,
        })
    }

    /// Embed, cluster and quantize one group.
    ///
    /// Returns `None` for the centroids when no image of the group could be
    /// decoded, along with the images that were skipped.
    pub fn process_group(&self, group: &Group) -> Result<(Option<QuantizedGroup>, Vec<PathBuf>)> {
        self.process_group_with(group, &mut NoProgress)
    }

    fn process_group_with(
        &self,
        group: &Group,
        progress: &mut dyn ProgressSink,
    ) -> Result<(Option<QuantizedGroup>, Vec<PathBuf>)> {
        let GroupEmbeddings { matrix, skipped } = self.embed_group_with(group, progress)?;
        let count = matrix.nrows();
        if count == 0 {
            return Ok((None, skipped));
        }

        let centroids = compute_centroids(&matrix.view(), &self.cluster)?;
        let quantized = QuantizedGroup {
            count,
            centroids: quantize_centroids(&centroids),
        };
        Ok((Some(quantized), skipped))
    }

    /// Build the `[count, D]` embedding matrix of one group.
    pub fn embed_group(&self, group: &Group) -> Result<GroupEmbeddings> {
        self.embed_group_with(group, &mut NoProgress)
    }

    fn embed_group_with(
        &self,
        group: &Group,
        progress: &mut dyn ProgressSink,
    ) -> Result<GroupEmbeddings> {
        let dim = self.embedding_dim();
        let mut values: Vec<f32> =
            Vec::with_capacity(group.len() * AUGMENTATIONS_PER_IMAGE * dim);
        let mut count = 0;
        let mut skipped = Vec::new();

        for path in &group.paths {
            let image = match load_rgb(path) {
                Ok(image) => image,
                Err(e) => match self.config.on_decode_error {
                    DecodePolicy::Abort => return Err(e),
                    DecodePolicy::Skip => {
                        tracing::warn!(label = %group.label, "image.skipped: {}", e);
                        skipped.push(path.clone());
                        progress.image_done(&group.label);
                        continue;
                    }
                },
            };

            for variant in augment(&image) {
                let embedding = self.extractor.extract(&variant, self.config.image_size)?;
                values.extend(embedding.iter());
                count += 1;
            }
            progress.image_done(&group.label);
        }

        let matrix = Array2::from_shape_vec((count, dim), values)?;
        Ok(GroupEmbeddings { matrix, skipped })
    }
}

/// Decode an image file as 8-bit RGB.
pub fn load_rgb(path: &Path) -> Result<RgbImage> {
    image::open(path)
        .map(|image| image.to_rgb8())
        .map_err(|source| Error::ImageDecode {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use ndarray::{Array1, ArrayView4, Axis};
    use std::fs;
    use tempfile::TempDir;

    /// Per-channel mean and spread, padded to a fixed width.
    struct ChannelStats;

    impl FeatureExtractor for ChannelStats {
        fn embedding_dim(&self) -> usize {
            8
        }

        fn forward(&self, input: ArrayView4<f32>) -> Result<Array1<f32>> {
            let mut out = Vec::with_capacity(8);
            for channel in input.axis_iter(Axis(1)) {
                let mean = channel.mean().unwrap_or(0.0);
                out.push(mean);
                out.push(channel.std(0.0));
            }
            out.push(1.0);
            out.push(0.0);
            Ok(Array1::from_vec(out))
        }
    }

    fn write_jpg(path: &Path, shade: u8) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let image = RgbImage::from_fn(24, 24, |x, y| {
            Rgb([shade, (x * 10) as u8, (y * 10) as u8])
        });
        image.save(path).unwrap();
    }

    fn config(dataset: &Path, output: &Path, clusters: usize) -> BankConfig {
        BankConfig {
            dataset: dataset.to_path_buf(),
            output: output.to_path_buf(),
            clusters,
            image_size: 16,
            ..Default::default()
        }
    }

    #[test]
    fn test_embed_group_counts_variants() {
        let dir = TempDir::new().unwrap();
        let paths: Vec<PathBuf> = (0..3)
            .map(|i| {
                let p = dir.path().join(format!("hero/head/{}.jpg", i));
                write_jpg(&p, 40 * i as u8);
                p
            })
            .collect();
        let group = Group {
            label: Label::new("hero", "head"),
            paths,
        };

        let pipeline =
            BankPipeline::new(config(dir.path(), &dir.path().join("out"), 12), ChannelStats)
                .unwrap();
        let embedded = pipeline.embed_group(&group).unwrap();

        assert_eq!(embedded.matrix.dim(), (3 * AUGMENTATIONS_PER_IMAGE, 8));
        assert!(embedded.skipped.is_empty());
    }

    #[test]
    fn test_process_group_shrinks_k() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hero/head/0.jpg");
        write_jpg(&path, 120);
        let group = Group {
            label: Label::new("hero", "head"),
            paths: vec![path],
        };

        let pipeline =
            BankPipeline::new(config(dir.path(), &dir.path().join("out"), 20), ChannelStats)
                .unwrap();
        let (quantized, skipped) = pipeline.process_group(&group).unwrap();
        let quantized = quantized.unwrap();

        assert!(skipped.is_empty());
        assert_eq!(quantized.count, 12);
        assert_eq!(quantized.centroids.dim(), (12, 8));
    }

    #[test]
    fn test_unreadable_image_aborts_by_default() {
        let dir = TempDir::new().unwrap();
        let bad = dir.path().join("hero/head/bad.jpg");
        fs::create_dir_all(bad.parent().unwrap()).unwrap();
        fs::write(&bad, b"not a jpeg").unwrap();
        let group = Group {
            label: Label::new("hero", "head"),
            paths: vec![bad],
        };

        let pipeline =
            BankPipeline::new(config(dir.path(), &dir.path().join("out"), 4), ChannelStats)
                .unwrap();
        let result = pipeline.process_group(&group);
        assert!(matches!(result, Err(Error::ImageDecode { .. })));
    }

    #[test]
    fn test_all_unreadable_group_is_skipped_not_clustered() {
        let dir = TempDir::new().unwrap();
        let bad = dir.path().join("hero/head/bad.jpg");
        fs::create_dir_all(bad.parent().unwrap()).unwrap();
        fs::write(&bad, b"not a jpeg").unwrap();
        let group = Group {
            label: Label::new("hero", "head"),
            paths: vec![bad.clone()],
        };

        let mut cfg = config(dir.path(), &dir.path().join("out"), 4);
        cfg.on_decode_error = DecodePolicy::Skip;
        let pipeline = BankPipeline::new(cfg, ChannelStats).unwrap();
        let (quantized, skipped) = pipeline.process_group(&group).unwrap();

        assert!(quantized.is_none());
        assert_eq!(skipped, vec![bad]);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let cfg = BankConfig {
            clusters: 0,
            ..Default::default()
        };
        assert!(matches!(
            BankPipeline::new(cfg, ChannelStats),
            Err(Error::Config(_))
        ));
    }
}
