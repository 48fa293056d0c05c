use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wally_banks::{
    verify_bank_set, BankConfig, BankIndex, BankPipeline, DecodePolicy, NoProgress,
    PipelineReport,
};
use wally_banks_onnx::{Backbone, ExecutionProvider, OnnxExtractor};

mod progress;

use progress::BarProgress;

const MAIN_HELP: &str = "\
EXAMPLES:
    # Build banks from ./dataset into ../banks with MobileNetV2
    wally-banks build --model models/mobilenet_v2_features.onnx

    # Smaller backbone, 8 centroids per label
    wally-banks build --model models/mobilenet_v3_small_features.onnx \\
        --backbone mobilenet-v3-small --clusters 8

    # Check a bank set before shipping it
    wally-banks verify ../banks

DATASET LAYOUT:
    <dataset>/<character>/<part>/*.jpg   one bank per (character, part)
    <dataset>/negatives_hard/*.jpg       one bank labelled negatives_hard:frame

ENVIRONMENT:
    RUST_LOG        log filter (default: wally_banks=warn, info with -v)
    ORT_DYLIB_PATH  ONNX Runtime shared library (searched for if unset)";

const BUILD_HELP: &str = "\
EXAMPLES:
    wally-banks build --model mobilenet_v2_features.onnx
    wally-banks build --config banks.json --model mobilenet_v2_features.onnx
    wally-banks build --dataset crops --output out --seed 7 --skip-unreadable \\
        --model mobilenet_v2_features.onnx

NOTES:
    • Flags override values from --config, which override built-in defaults
    • Each source image yields 12 augmented embeddings
    • Labels with fewer embeddings than --clusters get one centroid per embedding";

const VERIFY_HELP: &str = "\
EXAMPLES:
    wally-banks verify ../banks
    wally-banks verify ../banks --json | jq '.banks[] | .file'";

#[derive(Parser)]
#[command(
    name = "wally-banks",
    version,
    about = "Build quantized appearance banks for the on-device matcher",
    after_help = MAIN_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show per-group log lines
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate one INT8 bank per label plus index.json
    #[command(after_help = BUILD_HELP)]
    Build(BuildArgs),

    /// Check a generated bank set for consistency
    #[command(after_help = VERIFY_HELP)]
    Verify {
        /// Bank directory containing index.json
        dir: PathBuf,

        /// Print the index as JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// Dataset root (default: dataset)
    #[arg(long)]
    dataset: Option<PathBuf>,

    /// Output directory (default: ../banks)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Target centroids per label (default: 12)
    #[arg(long)]
    clusters: Option<usize>,

    /// Square backbone input resolution (default: 160)
    #[arg(long)]
    image_size: Option<u32>,

    /// Clustering seed (default: 42)
    #[arg(long)]
    seed: Option<u64>,

    /// JSON file with any BankConfig fields
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Headless backbone exported to ONNX
    #[arg(long, value_name = "FILE")]
    model: PathBuf,

    /// Backbone architecture: mobilenet-v2, mobilenet-v3-small, mobilenet-v3-large, efficientnet-b0
    #[arg(long, default_value = "mobilenet-v2")]
    backbone: Backbone,

    /// ONNX Runtime execution provider
    #[arg(long, value_enum, default_value_t = Provider::Auto)]
    provider: Provider,

    /// Intra-op threads for the backbone (default: all cores)
    #[arg(long)]
    threads: Option<usize>,

    /// Leave out unreadable images instead of aborting
    #[arg(long)]
    skip_unreadable: bool,

    /// No progress bar or summary
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Provider {
    Auto,
    Cpu,
    Cuda,
    Coreml,
}

impl From<Provider> for ExecutionProvider {
    fn from(p: Provider) -> Self {
        match p {
            Provider::Auto => ExecutionProvider::Auto,
            Provider::Cpu => ExecutionProvider::Cpu,
            Provider::Cuda => ExecutionProvider::Cuda,
            Provider::Coreml => ExecutionProvider::CoreML,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Build(args) => cmd_build(&args),
        Commands::Verify { dir, json } => cmd_verify(&dir, json),
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "wally_banks=info,wally_banks_onnx=info"
    } else {
        "wally_banks=warn,wally_banks_onnx=warn"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Resolve the run configuration: flag > config file > default
fn resolve_config(args: &BuildArgs) -> Result<BankConfig> {
    let mut config = match &args.config {
        Some(path) => BankConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => BankConfig::default(),
    };

    if let Some(dataset) = &args.dataset {
        config.dataset = dataset.clone();
    }
    if let Some(output) = &args.output {
        config.output = output.clone();
    }
    if let Some(clusters) = args.clusters {
        config.clusters = clusters;
    }
    if let Some(image_size) = args.image_size {
        config.image_size = image_size;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if args.skip_unreadable {
        config.on_decode_error = DecodePolicy::Skip;
    }

    config.validate()?;
    Ok(config)
}

fn cmd_build(args: &BuildArgs) -> Result<()> {
    let config = resolve_config(args)?;
    tracing::debug!(?config, backbone = %args.backbone, "config.resolved");

    let mut builder = OnnxExtractor::builder(&args.model, args.backbone)
        .with_execution_provider(args.provider.into());
    if let Some(threads) = args.threads {
        builder = builder.with_threads(threads);
    }
    let extractor = builder.build()?;

    let pipeline = BankPipeline::new(config, extractor)?;

    let report = if args.quiet {
        pipeline.run(&mut NoProgress)?
    } else {
        pipeline.run(&mut BarProgress::new()?)?
    };

    if !args.quiet {
        print_build_summary(&report, &pipeline.config().output);
    }
    Ok(())
}

fn print_build_summary(report: &PipelineReport, output: &Path) {
    let index = &report.index;
    eprintln!(
        "{} Wrote {} banks ({} centroids, D={}) to {}",
        "✓".green(),
        index.banks.len(),
        index.total_centroids(),
        index.embedding_size,
        output.display()
    );

    if !report.skipped_images.is_empty() {
        eprintln!(
            "{} Skipped {} unreadable image(s):",
            "!".yellow(),
            report.skipped_images.len()
        );
        for path in &report.skipped_images {
            eprintln!("    {}", path.display().to_string().dimmed());
        }
    }
    for label in &report.skipped_groups {
        eprintln!("{} No bank for {} (no readable images)", "!".yellow(), label);
    }
}

fn cmd_verify(dir: &Path, json: bool) -> Result<()> {
    let index = verify_bank_set(dir)
        .with_context(|| format!("Bank set at {} failed verification", dir.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&index)?);
        return Ok(());
    }

    print_index_table(&index);
    println!();
    println!(
        "{} {} banks, {} centroids, D={}",
        "OK".green().bold(),
        index.banks.len(),
        index.total_centroids(),
        index.embedding_size
    );
    Ok(())
}

fn print_index_table(index: &BankIndex) {
    let mut lines = index_table(index).into_iter();
    if let Some(header) = lines.next() {
        println!("{}", header.bold());
    }
    for line in lines {
        println!("{}", line);
    }
}

/// Header plus one row per bank.
fn index_table(index: &BankIndex) -> Vec<String> {
    let label_width = index
        .banks
        .iter()
        .map(|b| b.character.len() + b.part.len() + 1)
        .max()
        .unwrap_or(5)
        .max(5);

    let row = |label: &str, kind: &str, count: &str, k: &str, bytes: &str| {
        format!(
            "{:<width$}  {:<8}  {:>5}  {:>3}  {:>9}",
            label,
            kind,
            count,
            k,
            bytes,
            width = label_width
        )
    };

    let mut lines = vec![row("LABEL", "KIND", "COUNT", "K", "BYTES")];
    for bank in &index.banks {
        let label = bank.label();
        let kind = if label.is_negatives() {
            "negative"
        } else {
            "part"
        };
        lines.push(row(
            &label.to_string(),
            kind,
            &bank.count.to_string(),
            &bank.k.to_string(),
            &bank.byte_len(index.embedding_size).to_string(),
        ));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn parse_build(args: &[&str]) -> BuildArgs {
        let mut argv = vec!["wally-banks", "build"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Build(args) => args,
            Commands::Verify { .. } => panic!("expected build"),
        }
    }

    #[test]
    fn test_build_defaults() {
        let args = parse_build(&["--model", "m.onnx"]);
        assert_eq!(args.backbone, Backbone::MobileNetV2);
        assert_eq!(args.provider, Provider::Auto);

        let config = resolve_config(&args).unwrap();
        assert_eq!(config, BankConfig::default());
    }

    #[test]
    fn test_model_is_required() {
        assert!(Cli::try_parse_from(["wally-banks", "build"]).is_err());
    }

    #[test]
    fn test_backbone_flag() {
        let args = parse_build(&["--model", "m.onnx", "--backbone", "mobilenet-v3-small"]);
        assert_eq!(args.backbone, Backbone::MobileNetV3Small);
        assert!(
            Cli::try_parse_from(["wally-banks", "build", "--model", "m", "--backbone", "vgg"])
                .is_err()
        );
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("banks.json");
        fs::write(
            &file,
            r#"{"dataset": "crops", "clusters": 8, "seed": 3, "image_size": 224}"#,
        )
        .unwrap();

        let args = parse_build(&[
            "--model",
            "m.onnx",
            "--config",
            file.to_str().unwrap(),
            "--clusters",
            "5",
            "--skip-unreadable",
        ]);
        let config = resolve_config(&args).unwrap();

        assert_eq!(config.dataset, PathBuf::from("crops"));
        assert_eq!(config.clusters, 5);
        assert_eq!(config.seed, 3);
        assert_eq!(config.image_size, 224);
        assert_eq!(config.output, PathBuf::from("../banks"));
        assert_eq!(config.on_decode_error, DecodePolicy::Skip);
    }

    #[test]
    fn test_invalid_flag_value_rejected() {
        let args = parse_build(&["--model", "m.onnx", "--clusters", "0"]);
        assert!(resolve_config(&args).is_err());
    }

    #[test]
    fn test_provider_mapping() {
        let args = parse_build(&["--model", "m.onnx", "--provider", "coreml"]);
        assert_eq!(
            ExecutionProvider::from(args.provider),
            ExecutionProvider::CoreML
        );
    }

    #[test]
    fn test_verify_subcommand() {
        let cli = Cli::try_parse_from(["wally-banks", "verify", "out", "--json"]).unwrap();
        match cli.command {
            Commands::Verify { dir, json } => {
                assert_eq!(dir, PathBuf::from("out"));
                assert!(json);
            }
            Commands::Build(_) => panic!("expected verify"),
        }
    }

    #[test]
    fn test_index_table_marks_negatives() {
        let mut index = BankIndex::new(4);
        let banks = [("hero", "head", 60, 12), ("negatives_hard", "frame", 120, 12)];
        for (character, part, count, k) in banks {
            index.banks.push(wally_banks::BankDescriptor {
                character: character.into(),
                part: part.into(),
                file: format!("{}_{}.i8.bin", character, part),
                count,
                k,
            });
        }

        let lines = index_table(&index);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("LABEL"));
        assert!(lines[1].starts_with("hero:head"));
        assert!(lines[1].contains(" part "));
        assert!(lines[2].starts_with("negatives_hard:frame"));
        assert!(lines[2].contains(" negative "));
        assert!(lines[2].trim_end().ends_with("48"));
    }

    #[test]
    fn test_verify_missing_index_fails() {
        let dir = TempDir::new().unwrap();
        assert!(cmd_verify(dir.path(), true).is_err());
    }
}
