//! モデル読み込み
//!
//! モデルパッケージ（またはURL）からバックボーンの重みを取得し、指定層で
//! 切り詰めて分類ヘッドを接続した [`ModelHandle`] を作ります。

use std::future::Future;
use std::io::Cursor;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor},
};
use rand::Rng;
use tracing::{info, warn};
use url::Url;

use crate::error::LoadError;
use crate::ml::ml_model::{
    BackboneConfig, CompileSettings, HeadConfig, RehomeClassifier, DEFAULT_TRUNCATE_LAYER, INPUT_CHANNELS,
};
use crate::model::{
    read_model_package, FetchSettings, HeadSettings, InferenceConfig, ModelMetadata, ModelPackage,
    RuntimeSettings,
};
use crate::types::LabelSet;

/// 重みレコードの形式（f32精度）
type WeightRecorder = BinBytesRecorder<FullPrecisionSettings>;

/// バックボーンの取得元
#[derive(Debug, Clone, PartialEq)]
pub enum BackboneSource {
    /// ローカルのモデルパッケージ（tar.gz）
    Package(PathBuf),
    /// http(s) / file URL のモデルパッケージ
    Url(Url),
    /// 学習済み重みなしで初期化（スモークテスト・パッケージ作成用）
    Initialized {
        architecture: String,
        input_size: usize,
    },
}

impl BackboneSource {
    /// 設定文字列（パスまたはURL）から取得元を決める
    pub fn parse(source: &str) -> Self {
        match Url::parse(source) {
            Ok(url) if matches!(url.scheme(), "http" | "https" | "file") => BackboneSource::Url(url),
            _ => BackboneSource::Package(PathBuf::from(source)),
        }
    }
}

impl std::fmt::Display for BackboneSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackboneSource::Package(path) => write!(f, "{}", path.display()),
            BackboneSource::Url(url) => write!(f, "{}", url),
            BackboneSource::Initialized { architecture, input_size } => {
                write!(f, "initialized {} @ {}px", architecture, input_size)
            }
        }
    }
}

/// 分類ヘッドの指定
#[derive(Debug, Clone, PartialEq)]
pub struct HeadOptions {
    /// バックボーンを切り詰める層
    pub truncate_layer: String,
    /// 全結合層の設定
    pub settings: HeadSettings,
    /// 最終層の出力幅
    pub num_classes: usize,
}

impl HeadOptions {
    /// ラベルセットに合わせたヘッド
    pub fn for_labels(label_set: &LabelSet, truncate_layer: impl Into<String>, settings: HeadSettings) -> Self {
        Self {
            truncate_layer: truncate_layer.into(),
            settings,
            num_classes: label_set.len(),
        }
    }
}

impl Default for HeadOptions {
    fn default() -> Self {
        Self::for_labels(&LabelSet::rehome(), DEFAULT_TRUNCATE_LAYER, HeadSettings::default())
    }
}

/// ローダー設定
#[derive(Debug, Clone)]
pub struct LoaderSettings {
    /// ネットワークエラー時の追加リトライ回数
    pub retries: u32,
    /// リトライ間隔の基準値
    pub backoff: Duration,
    /// デバイスメモリ予算（バイト）
    pub memory_budget: Option<u64>,
    /// パッケージ取得のタイムアウト
    pub fetch_timeout: Duration,
}

impl LoaderSettings {
    pub fn from_settings(runtime: &RuntimeSettings, fetch: &FetchSettings) -> Self {
        Self {
            retries: runtime.load_retries,
            backoff: runtime.retry_backoff(),
            memory_budget: runtime.memory_budget_bytes(),
            fetch_timeout: fetch.fetch_timeout(),
        }
    }
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self::from_settings(&RuntimeSettings::default(), &FetchSettings::default())
    }
}

/// 読み込み済みモデル
///
/// 推論は内部のMutexで直列化される。
#[derive(Debug)]
pub struct ModelHandle<B: Backend> {
    model: Mutex<RehomeClassifier<B>>,
    device: B::Device,
    config: InferenceConfig,
    metadata: ModelMetadata,
    compile: CompileSettings,
    num_params: usize,
    activation_bytes: u64,
}

impl<B: Backend> ModelHandle<B> {
    pub fn label_set(&self) -> &LabelSet {
        &self.config.label_set
    }

    pub fn input_size(&self) -> usize {
        self.config.input_size
    }

    /// 入力テンソルの形状 [高さ, 幅, チャネル]
    pub fn input_shape(&self) -> [usize; 3] {
        self.config.input_shape()
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn compile_settings(&self) -> &CompileSettings {
        &self.compile
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn num_params(&self) -> usize {
        self.num_params
    }

    /// 1枚分の中間活性化の見積もり（バイト）
    pub fn activation_bytes(&self) -> u64 {
        self.activation_bytes
    }

    pub(crate) fn model(&self) -> &Mutex<RehomeClassifier<B>> {
        &self.model
    }

    /// 現在の重みをパッケージとして書き出す
    pub fn export_package(&self) -> anyhow::Result<ModelPackage> {
        let model = self
            .model
            .lock()
            .map_err(|_| anyhow::anyhow!("model lock poisoned"))?;
        let recorder = WeightRecorder::default();
        let backbone = Recorder::<B>::record(&recorder, model.backbone.clone().into_record(), ())
            .map_err(|e| anyhow::anyhow!("バックボーン重みの書き出しエラー: {:?}", e))?;
        let head = Recorder::<B>::record(&recorder, model.head.clone().into_record(), ())
            .map_err(|e| anyhow::anyhow!("ヘッド重みの書き出しエラー: {:?}", e))?;

        Ok(ModelPackage {
            metadata: self.metadata.clone(),
            backbone: Some(backbone),
            head: Some(head),
        })
    }
}

/// モデルローダー
///
/// 共有状態を持たないため、同じ引数で何度呼んでも独立したハンドルを返す。
#[derive(Debug, Clone)]
pub struct ModelLoader<B: Backend> {
    settings: LoaderSettings,
    device: B::Device,
    client: reqwest::Client,
}

impl<B: Backend> ModelLoader<B> {
    pub fn new(settings: LoaderSettings, device: B::Device) -> Self {
        let client = reqwest::Client::builder()
            .timeout(settings.fetch_timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("HTTPクライアントの設定に失敗しました: {}", e);
                reqwest::Client::new()
            });
        Self {
            settings,
            device,
            client,
        }
    }

    pub fn settings(&self) -> &LoaderSettings {
        &self.settings
    }

    /// ネットワークエラーのみ指数バックオフでリトライして読み込む
    pub async fn load_with_retry(
        &self,
        source: &BackboneSource,
        label_set: &LabelSet,
        head: &HeadOptions,
    ) -> Result<ModelHandle<B>, LoadError> {
        self.retry(|| self.load(source, label_set, head)).await
    }

    async fn retry<T, F, Fut>(&self, mut operation: F) -> Result<T, LoadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LoadError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Err(e) if e.is_retryable() && attempt < self.settings.retries => {
                    let delay = self.backoff_delay(attempt);
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries = self.settings.retries,
                        "モデルの取得に失敗しました。{:?}後に再試行します: {}",
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.settings.backoff.saturating_mul(2u32.saturating_pow(attempt));
        let jitter_ms = self.settings.backoff.as_millis() as u64 / 2;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        base + jitter
    }

    /// バックボーン取得 → 切り詰め → ヘッド接続 → コンパイル
    pub async fn load(
        &self,
        source: &BackboneSource,
        label_set: &LabelSet,
        head: &HeadOptions,
    ) -> Result<ModelHandle<B>, LoadError> {
        if head.num_classes != label_set.len() {
            return Err(LoadError::IncompatibleShape(format!(
                "head outputs {} classes but the label set has {}",
                head.num_classes,
                label_set.len()
            )));
        }

        let package = self.resolve(source, label_set, head).await?;

        let label_set = label_set.clone();
        let head = head.clone();
        let budget = self.settings.memory_budget;
        let device = self.device.clone();
        let handle = tokio::task::spawn_blocking(move || build_handle::<B>(package, label_set, head, budget, device))
            .await
            .map_err(|e| LoadError::IncompatibleShape(format!("model construction failed: {}", e)))??;

        info!(
            source = %source,
            architecture = %handle.metadata.architecture,
            params = handle.num_params,
            "モデルを読み込みました"
        );
        Ok(handle)
    }

    async fn resolve(
        &self,
        source: &BackboneSource,
        label_set: &LabelSet,
        head: &HeadOptions,
    ) -> Result<ModelPackage, LoadError> {
        let unavailable = |reason: String| LoadError::NetworkUnavailable {
            source_desc: source.to_string(),
            reason,
        };

        let bytes = match source {
            BackboneSource::Initialized {
                architecture,
                input_size,
            } => {
                let metadata = ModelMetadata::new(
                    architecture.clone(),
                    "untrained",
                    label_set.as_slice().to_vec(),
                    *input_size as u32,
                    head.truncate_layer.clone(),
                    head.settings.clone(),
                );
                return Ok(ModelPackage {
                    metadata,
                    backbone: None,
                    head: None,
                });
            }
            BackboneSource::Package(path) => tokio::fs::read(path)
                .await
                .map_err(|e| unavailable(e.to_string()))?,
            BackboneSource::Url(url) => match url.scheme() {
                "file" => {
                    let path = url
                        .to_file_path()
                        .map_err(|_| unavailable("not a local file path".to_string()))?;
                    tokio::fs::read(path)
                        .await
                        .map_err(|e| unavailable(e.to_string()))?
                }
                "http" | "https" => {
                    let response = self
                        .client
                        .get(url.clone())
                        .send()
                        .await
                        .map_err(|e| unavailable(e.to_string()))?;
                    if !response.status().is_success() {
                        return Err(unavailable(format!("HTTP {}", response.status())));
                    }
                    response
                        .bytes()
                        .await
                        .map_err(|e| unavailable(e.to_string()))?
                        .to_vec()
                }
                other => {
                    return Err(LoadError::InvalidPackage(format!(
                        "unsupported URL scheme: {}",
                        other
                    )))
                }
            },
        };

        read_model_package(Cursor::new(bytes)).map_err(|e| LoadError::InvalidPackage(format!("{:#}", e)))
    }
}

/// パッケージからモデルを組み立てる（CPU負荷が高いのでブロッキングスレッドで実行）
fn build_handle<B: Backend>(
    package: ModelPackage,
    label_set: LabelSet,
    head: HeadOptions,
    memory_budget: Option<u64>,
    device: B::Device,
) -> Result<ModelHandle<B>, LoadError> {
    let ModelPackage {
        metadata,
        backbone: backbone_bytes,
        head: head_bytes,
    } = package;

    // 学習済みヘッドはパッケージのラベル・構成と一致している必要がある
    if head_bytes.is_some() {
        if metadata.labels != label_set.as_slice() {
            return Err(LoadError::IncompatibleShape(format!(
                "package labels [{}] differ from requested labels [{}]",
                metadata.labels.join(", "),
                label_set.as_slice().join(", ")
            )));
        }
        if metadata.truncate_layer != head.truncate_layer || metadata.head != head.settings {
            return Err(LoadError::IncompatibleShape(format!(
                "package head was trained on '{}' with {:?}",
                metadata.truncate_layer, metadata.head
            )));
        }
    }

    let backbone_config = BackboneConfig::from_architecture(&metadata.architecture)?;
    let recorder = WeightRecorder::default();

    let mut backbone = backbone_config.init::<B>(&device);
    if let Some(bytes) = backbone_bytes {
        let record = Recorder::<B>::load(&recorder, bytes, &device)
            .map_err(|e| LoadError::InvalidPackage(format!("backbone record: {:?}", e)))?;
        backbone = backbone.load_record(record);
    }
    let backbone = backbone.truncate_at(&head.truncate_layer)?;

    let head_config = HeadConfig::new(backbone.out_channels(), head.num_classes)
        .with_hidden_units(head.settings.hidden_units)
        .with_second_units(head.settings.second_units)
        .with_dropout(head.settings.dropout);
    let mut classifier_head = head_config.init::<B>(&device);
    if let Some(bytes) = head_bytes {
        let record = Recorder::<B>::load(&recorder, bytes, &device)
            .map_err(|e| LoadError::InvalidPackage(format!("head record: {:?}", e)))?;
        classifier_head = classifier_head.load_record(record);
    }

    let model = RehomeClassifier::new(backbone, classifier_head);

    let metadata = ModelMetadata {
        labels: label_set.as_slice().to_vec(),
        truncate_layer: head.truncate_layer.clone(),
        head: head.settings.clone(),
        ..metadata
    };
    let config = InferenceConfig::from_metadata(&metadata)?;

    let num_params = model.num_params();
    let activation_bytes = model.activation_bytes(config.input_size);
    if let Some(budget) = memory_budget {
        let required = num_params as u64 * 4 + activation_bytes;
        if required > budget {
            return Err(LoadError::OutOfMemory { required, budget });
        }
    }

    probe(&model, config.input_size, label_set.len(), &device)?;

    Ok(ModelHandle {
        model: Mutex::new(model),
        device,
        config,
        metadata,
        compile: CompileSettings::default(),
        num_params,
        activation_bytes,
    })
}

/// ゼロ画像で順伝播し、出力幅がラベル数と一致するか確認
fn probe<B: Backend>(
    model: &RehomeClassifier<B>,
    input_size: usize,
    num_classes: usize,
    device: &B::Device,
) -> Result<(), LoadError> {
    let dims = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let input = Tensor::<B, 4>::zeros([1, INPUT_CHANNELS, input_size, input_size], device);
        model.forward(input).dims()
    }))
    .map_err(|_| LoadError::IncompatibleShape("probe forward pass failed".to_string()))?;

    let [_, width] = dims;
    if width != num_classes {
        return Err(LoadError::IncompatibleShape(format!(
            "model outputs {} values but the label set has {} labels",
            width, num_classes
        )));
    }
    Ok(())
}
