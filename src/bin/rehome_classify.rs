//! ReHome 寄付品分類 CLI
#![recursion_limit = "256"]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use rehome_classifier_lib::ml::{DEFAULT_TRUNCATE_LAYER, IMAGE_SIZE};
use rehome_classifier_lib::model::{load_metadata, print_metadata_info, save_model_package, HeadSettings};
use rehome_classifier_lib::{
    BackboneSource, ClassificationRequest, ClassifierConfig, CpuBackend, DeviceType, GpuBackend, HeadOptions,
    ImageInput, LabelSet, ModelLoader, ModelManager,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "On-device donation item classifier", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 画像を分類して1件ごとにJSONを出力
    Classify {
        /// 設定ファイル
        #[arg(long, value_name = "CONFIG")]
        config: Option<PathBuf>,
        /// モデルパッケージのパスまたはURL（設定より優先）
        #[arg(long, value_name = "MODEL")]
        model: Option<String>,
        /// 同時実行数（設定より優先）
        #[arg(long)]
        concurrency: Option<usize>,
        /// 画像のパス・URL・data URI
        #[arg(required = true, value_name = "INPUT")]
        inputs: Vec<String>,
    },
    /// モデルパッケージのメタデータを表示
    Inspect {
        package: PathBuf,
    },
    /// 学習前の重みでモデルパッケージを作成
    Init {
        output: PathBuf,
        #[arg(long, default_value = "mobilenet_v1_0.25")]
        architecture: String,
        #[arg(long, default_value_t = IMAGE_SIZE)]
        input_size: usize,
        #[arg(long, default_value = DEFAULT_TRUNCATE_LAYER)]
        truncate_layer: String,
    },
}

fn parse_input(raw: &str) -> Result<ImageInput> {
    if raw.starts_with("data:") {
        return Ok(ImageInput::DataUri(raw.to_string()));
    }
    if let Ok(url) = Url::parse(raw) {
        if matches!(url.scheme(), "http" | "https" | "file") {
            return Ok(ImageInput::Url(url));
        }
    }
    let bytes = std::fs::read(raw).with_context(|| format!("画像ファイルを読み込めません: {}", raw))?;
    Ok(ImageInput::Bytes(bytes))
}

async fn run_classify<B: Backend>(config: &ClassifierConfig, inputs: &[String], device: B::Device) -> Result<()> {
    let requests = inputs
        .iter()
        .map(|raw| Ok(ClassificationRequest::new(raw.clone(), parse_input(raw)?)))
        .collect::<Result<Vec<_>>>()?;

    let manager = Arc::new(ModelManager::<B>::from_config(config, device));
    manager.ensure_loaded().await?;

    let now = std::time::Instant::now();
    let outcomes = manager.classify_batch(requests).await;
    info!("{}件の分類が完了しました（{:.2?}）", outcomes.len(), now.elapsed());

    let mut failures = 0;
    for outcome in outcomes {
        let line = match outcome.result {
            Ok(result) => serde_json::json!({
                "id": outcome.correlation_id,
                "result": result,
            }),
            Err(e) => {
                failures += 1;
                warn!(id = %outcome.correlation_id, "{}", e);
                serde_json::json!({
                    "id": outcome.correlation_id,
                    "error": e.to_string(),
                    "message": e.user_message(),
                })
            }
        };
        println!("{}", line);
    }

    manager.dispose().await;
    if failures > 0 {
        anyhow::bail!("{}件の分類に失敗しました", failures);
    }
    Ok(())
}

async fn run_init(output: &Path, architecture: String, input_size: usize, truncate_layer: String) -> Result<()> {
    let labels = LabelSet::rehome();
    let head = HeadOptions::for_labels(&labels, truncate_layer, HeadSettings::default());
    let loader = ModelLoader::<CpuBackend>::new(Default::default(), Default::default());
    let handle = loader
        .load(
            &BackboneSource::Initialized {
                architecture,
                input_size,
            },
            &labels,
            &head,
        )
        .await?;

    let path = save_model_package(output, &handle.export_package()?)?;
    info!("モデルパッケージを作成しました: {}", path.display());
    print_metadata_info(handle.metadata());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Command::Classify {
            config,
            model,
            concurrency,
            inputs,
        } => {
            let mut config = ClassifierConfig::load_or_default(config.unwrap_or_else(ClassifierConfig::default_path));
            if let Some(model) = model {
                config.model.source = model;
            }
            if let Some(concurrency) = concurrency {
                config.runtime.max_concurrency = concurrency;
            }
            config.display();

            match config.device_type {
                DeviceType::Cpu => run_classify::<CpuBackend>(&config, &inputs, Default::default()).await,
                DeviceType::Wgpu => run_classify::<GpuBackend>(&config, &inputs, burn_wgpu::WgpuDevice::default()).await,
            }
        }
        Command::Inspect { package } => {
            let metadata = load_metadata(&package)?;
            print_metadata_info(&metadata);
            println!("{}", metadata.to_json_string()?);
            Ok(())
        }
        Command::Init {
            output,
            architecture,
            input_size,
            truncate_layer,
        } => run_init(&output, architecture, input_size, truncate_layer).await,
    }
}
