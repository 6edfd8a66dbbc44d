use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use presence_core::{preprocess, DetectorConfig, FacePolicy};
use presenced::engine::CASCADE_FILE;
use presenced::{Config, Pipeline, SqliteStore, Sweeper, SystemClock};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "presence", about = "Presence attendance CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ModelArgs {
    /// Directory with the cascade, model bundle and texture config
    #[arg(long, env = "PRESENCE_MODEL_DIR")]
    model_dir: Option<PathBuf>,
    /// Detector pyramid step
    #[arg(long, default_value_t = 1.3)]
    scale_factor: f64,
    /// Detector grouping threshold
    #[arg(long, default_value_t = 5)]
    min_neighbors: usize,
    /// Smallest face side in pixels (0 scans every pyramid level)
    #[arg(long, default_value_t = 0)]
    min_face_size: usize,
    /// Use every detected face instead of the first
    #[arg(long)]
    all_faces: bool,
}

impl ModelArgs {
    fn model_dir(&self) -> PathBuf {
        self.model_dir.clone().unwrap_or_else(|| {
            presenced::config::default_data_dir(&|key: &str| std::env::var(key).ok()).join("models")
        })
    }

    fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            scale_factor: self.scale_factor,
            min_neighbors: self.min_neighbors,
            min_face_size: self.min_face_size,
            policy: if self.all_faces { FacePolicy::All } else { FacePolicy::First },
        }
    }

    fn pipeline(&self) -> Result<Pipeline> {
        let dir = self.model_dir();
        Pipeline::load(&dir, self.detector_config())
            .with_context(|| format!("failed to load models from {}", dir.display()))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Detect faces in an image and print their rectangles
    Detect {
        image: PathBuf,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Print the texture descriptor of every detected face
    Features {
        image: PathBuf,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Predict the identity label for an image
    Predict {
        image: PathBuf,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Load and cross-check every model artifact
    Check {
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Run the absentee sweep once, now (uses PRESENCE_* daemon configuration)
    Sweep,
}

fn read_image(path: &PathBuf) -> Result<presence_core::GrayImage> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    preprocess::decode_gray(&bytes).with_context(|| format!("failed to decode {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Detect { image, model } => {
            let gray = read_image(&image)?;
            let detector = presence_core::FaceDetector::load(&model.model_dir().join(CASCADE_FILE), model.detector_config())?;
            let detections = detector.detect_rects(&gray);
            println!("{}x{} image, {} face(s)", gray.width, gray.height, detections.len());
            for d in detections {
                println!(
                    "  x={} y={} w={} h={} neighbors={}",
                    d.rect.x, d.rect.y, d.rect.width, d.rect.height, d.neighbors
                );
            }
        }
        Commands::Features { image, model } => {
            let gray = read_image(&image)?;
            let pipeline = model.pipeline()?;
            let faces = pipeline.detector().detect(&gray)?;
            let out: Vec<_> = faces
                .iter()
                .map(|face| {
                    let fv = pipeline.extractor().extract(face);
                    json!({ "bounds": face.bounds, "columns": fv.columns, "values": fv.values })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::Predict { image, model } => {
            let bytes = std::fs::read(&image).with_context(|| format!("failed to read {}", image.display()))?;
            let pipeline = model.pipeline()?;
            let id = pipeline.run(&bytes)?;
            println!("{}", id.label);
            if id.all_labels.len() > 1 {
                println!("all faces: {}", id.all_labels.join(", "));
            }
        }
        Commands::Check { model } => {
            let pipeline = model.pipeline()?;
            let bundle = pipeline.bundle();
            let texture = pipeline.extractor().config();
            println!("model dir:        {}", model.model_dir().display());
            println!("feature version:  {}", texture.version);
            println!("features:         {}", texture.feature_len());
            println!("reference cols:   {}", bundle.reference_columns().len());
            println!("target:           {}", bundle.target());
            println!("labels:           {}", bundle.labels().join(", "));
            println!("ok");
        }
        Commands::Sweep => {
            let config = Config::from_env()?;
            let store = Arc::new(SqliteStore::open(&config.credentials).await?);
            let sweeper = Sweeper::new(
                store.clone(),
                store,
                Arc::new(SystemClock),
                config.window.clone(),
                config.store_timeout,
                Arc::new(tokio::sync::Mutex::new(())),
            );
            let report = sweeper.sweep_once().await?;
            println!("marked absent: {}", report.absent.len());
            for id in &report.absent {
                println!("  {id}");
            }
            if !report.failed.is_empty() {
                anyhow::bail!("{} absent write(s) failed: {}", report.failed.len(), report.failed.join(", "));
            }
        }
    }

    Ok(())
}
