//! Wally Banks: quantized appearance banks for an on-device matcher
//!
//! This crate turns a labeled crop dataset into per-label INT8 centroid banks:
//! dataset grouping, deterministic augmentation, embedding extraction through a
//! frozen backbone, per-label k-means, quantization and serialization.
//!
//! The backbone itself is plugged in through [`FeatureExtractor`]; see the
//! `wally-banks-onnx` crate for ONNX Runtime backbones.

pub mod augment;
pub mod bank;
pub mod config;
pub mod dataset;
pub mod error;
pub mod extractor;
pub mod kmeans;
pub mod pipeline;
pub mod quantize;

pub use augment::{augment, Augmentation, AUGMENTATIONS_PER_IMAGE, AUGMENTATION_PLAN};
pub use bank::{
    bank_file_name, read_bank, verify_bank_set, BankDescriptor, BankIndex, BankWriter,
    INDEX_FILE, INDEX_VERSION,
};
pub use config::{BankConfig, DecodePolicy};
pub use dataset::{scan_dataset, Group, Label};
pub use error::{Error, Result};
pub use extractor::{preprocess, FeatureExtractor};
pub use kmeans::{compute_centroids, effective_k, ClusterConfig};
pub use pipeline::{
    load_rgb, BankPipeline, GroupEmbeddings, NoProgress, PipelineReport, ProgressSink,
    QuantizedGroup,
};
pub use quantize::{dot_i8, quantize_centroid, quantize_centroids};
