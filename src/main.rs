use std::{fs, path::PathBuf, time::Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tcalayout::{
    dataset::VAL_SPLIT,
    evaluation,
    overlay::OverlayStyle,
    runner::{FolderRunner, IdScope, RunnerOptions},
    CategoryIndex, DatasetRegistry, DetectionOptions, LayoutAnalyzerBuilder,
};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

/// Document layout analysis with an exported Mask R-CNN.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Exported Mask R-CNN model.
    #[arg(long, global = true, default_value = "models/maskrcnn_tca.onnx")]
    model: PathBuf,
    /// Name of the image input of the model graph.
    #[arg(long, global = true, default_value = "image")]
    input_name: String,
    /// ONNX Runtime intra-op threads.
    #[arg(long, global = true, default_value_t = 4)]
    threads: usize,
    /// Directory for cached TensorRT engines.
    #[arg(long, global = true)]
    engine_cache: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Segment every image below the input directory and write overlays plus COCO results.
    Predict {
        /// JSON object mapping category ids to names.
        #[arg(long, default_value = "labels.json")]
        labels: PathBuf,
        #[arg(long, default_value = "input")]
        input: PathBuf,
        #[arg(long, default_value = "output")]
        output: PathBuf,
        #[arg(long, default_value_t = 0.8)]
        score_threshold: f32,
        #[arg(long, default_value_t = 0.5)]
        mask_threshold: f32,
        /// Font for overlay captions. Captions are skipped without one.
        #[arg(long)]
        font: Option<PathBuf>,
        #[arg(long, default_value_t = 20.0)]
        font_size: f32,
        /// Keep image and annotation ids increasing across folders.
        #[arg(long, default_value_t = false)]
        global_ids: bool,
    },
    /// Compute COCO metrics and text-proportion score agreement on a registered split.
    Evaluate {
        #[arg(long, default_value = VAL_SPLIT)]
        split: String,
        /// Overrides $DETECTRON2_DATASETS.
        #[arg(long)]
        dataset_root: Option<PathBuf>,
        #[arg(long, default_value_t = 0.5)]
        score_threshold: f32,
        #[arg(long, default_value_t = 0.5)]
        mask_threshold: f32,
        /// Write the report as JSON.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// List the registered dataset splits.
    Splits {
        #[arg(long)]
        dataset_root: Option<PathBuf>,
    },
}

fn registry(root: Option<PathBuf>) -> DatasetRegistry {
    root.map(DatasetRegistry::new)
        .unwrap_or_else(DatasetRegistry::from_env)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut builder = LayoutAnalyzerBuilder::new()
        .model(&args.model)
        .input_name(&args.input_name)
        .threads(args.threads);
    if let Some(cache) = &args.engine_cache {
        fs::create_dir_all(cache)?;
        builder = builder.with_engine_cache_path(cache);
    }

    match args.command {
        Command::Predict {
            labels,
            input,
            output,
            score_threshold,
            mask_threshold,
            font,
            font_size,
            global_ids,
        } => {
            let index = CategoryIndex::load(&labels)
                .with_context(|| format!("Failed to load label index {}", labels.display()))?;
            let mut style = OverlayStyle {
                mask_threshold,
                font_size,
                ..OverlayStyle::default()
            };
            if let Some(font) = font {
                style = style.with_font_file(font)?;
            }
            let analyzer = builder.build().context("Failed to build model")?;
            let options = RunnerOptions {
                detection: DetectionOptions {
                    score_threshold,
                    mask_threshold,
                    ..DetectionOptions::default()
                },
                id_scope: if global_ids {
                    IdScope::Global
                } else {
                    IdScope::PerFolder
                },
                ..RunnerOptions::default()
            };
            let start = Instant::now();
            let summary = FolderRunner::new(&analyzer, &index, &style, options)
                .run(&input, &output)
                .with_context(|| format!("Failed to process {}", input.display()))?;
            log::info!(
                "Processed {} images ({} failed) in {} folders, {} annotations in {:?}",
                summary.images,
                summary.failed,
                summary.folders,
                summary.annotations,
                start.elapsed()
            );
        }
        Command::Evaluate {
            split,
            dataset_root,
            score_threshold,
            mask_threshold,
            report,
        } => {
            let registry = registry(dataset_root);
            let split = registry.get(&split)?;
            let analyzer = builder.build().context("Failed to build model")?;
            let options = DetectionOptions {
                score_threshold,
                mask_threshold,
                ..DetectionOptions::default()
            };
            let result = evaluation::evaluate(&analyzer, split, options)?;
            println!("{result}");
            if let Some(path) = report {
                let file = fs::File::create(&path)
                    .with_context(|| format!("Failed to create {}", path.display()))?;
                serde_json::to_writer_pretty(file, &result)?;
            }
        }
        Command::Splits { dataset_root } => {
            let registry = registry(dataset_root);
            println!("Dataset root: {}", registry.root().display());
            for split in registry.splits() {
                println!(
                    "{}: images {}, annotations {} ({})",
                    split.name,
                    split.image_root.display(),
                    split.annotation_file.display(),
                    split.evaluator_type
                );
            }
        }
    }
    Ok(())
}
