//! モデルのライフサイクル管理
//!
//! 読み込み済みモデルをプロセス内で1つだけ保持し、分類リクエストを
//! 同時実行数の上限つきで処理します。
//!
//! ## 保証
//! - 同時に `ensure_loaded` されても読み込みは1回だけ
//! - `dispose` 後の推論は `ModelNotLoaded`
//! - 前処理テンソルと中間活性化はリクエスト完了時に解放される

use std::panic::resume_unwind;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use burn::tensor::backend::Backend;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{ClassificationError, InferError, LoadError};
use crate::ml::inference::{InferenceEngine, RawDistribution};
use crate::ml::loader::{BackboneSource, HeadOptions, LoaderSettings, ModelHandle, ModelLoader};
use crate::ml::preprocess::{ImageInput, PreprocessedTensor, Preprocessor};
use crate::ml::ranking::{rank, ReusabilityTable};
use crate::ml::transient::TransientTracker;
use crate::model::{ClassifierConfig, RuntimeSettings};
use crate::types::{ClassificationResult, LabelSet};

/// バッチ内の1リクエスト
#[derive(Debug, Clone)]
pub struct ClassificationRequest {
    pub correlation_id: String,
    pub input: ImageInput,
}

impl ClassificationRequest {
    pub fn new(correlation_id: impl Into<String>, input: ImageInput) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            input,
        }
    }
}

/// バッチ内の1リクエストの結果
#[derive(Debug)]
pub struct BatchOutcome {
    pub correlation_id: String,
    pub result: Result<ClassificationResult, ClassificationError>,
}

/// モデル管理
pub struct ModelManager<B: Backend> {
    loader: ModelLoader<B>,
    source: BackboneSource,
    label_set: LabelSet,
    head: HeadOptions,
    preprocessor: Preprocessor,
    engine: InferenceEngine,
    reusability: ReusabilityTable,
    slot: RwLock<Option<Arc<ModelHandle<B>>>>,
    load_lock: Mutex<()>,
    limiter: Arc<Semaphore>,
    settings: RuntimeSettings,
    tracker: TransientTracker,
}

impl<B: Backend> ModelManager<B> {
    /// 設定ファイルの内容から作成（ReHomeの5カテゴリ）
    pub fn from_config(config: &ClassifierConfig, device: B::Device) -> Self {
        Self::new(BackboneSource::parse(&config.model.source), config, device)
    }

    pub fn new(source: BackboneSource, config: &ClassifierConfig, device: B::Device) -> Self {
        let tracker = TransientTracker::new();
        let label_set = LabelSet::rehome();
        let head = HeadOptions::for_labels(&label_set, config.model.truncate_layer.clone(), config.model.head.clone());
        let reusability = match &config.reusability {
            Some(overrides) => ReusabilityTable::rehome().with_overrides(overrides),
            None => ReusabilityTable::rehome(),
        };

        Self {
            loader: ModelLoader::new(LoaderSettings::from_settings(&config.runtime, &config.fetch), device),
            source,
            label_set,
            head,
            preprocessor: Preprocessor::new(&config.preprocessing, &config.fetch).with_tracker(tracker.clone()),
            engine: InferenceEngine::new(tracker.clone()),
            reusability,
            slot: RwLock::new(None),
            load_lock: Mutex::new(()),
            limiter: Arc::new(Semaphore::new(config.runtime.max_concurrency.max(1))),
            settings: config.runtime.clone(),
            tracker,
        }
    }

    /// ラベルセットを差し替える（読み込み前のみ有効）
    pub fn with_label_set(mut self, label_set: LabelSet) -> Self {
        self.head.num_classes = label_set.len();
        self.label_set = label_set;
        self
    }

    pub fn source(&self) -> &BackboneSource {
        &self.source
    }

    pub fn label_set(&self) -> &LabelSet {
        &self.label_set
    }

    /// 一時バッファの計測値
    pub fn tracker(&self) -> &TransientTracker {
        &self.tracker
    }

    fn read_slot(&self) -> RwLockReadGuard<'_, Option<Arc<ModelHandle<B>>>> {
        self.slot.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slot(&self) -> RwLockWriteGuard<'_, Option<Arc<ModelHandle<B>>>> {
        self.slot.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// 読み込み済みのモデル
    pub fn loaded(&self) -> Option<Arc<ModelHandle<B>>> {
        self.read_slot().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.read_slot().is_some()
    }

    /// 未読み込みなら読み込む
    ///
    /// 同時に呼ばれた場合は最初の呼び出しの読み込みを共有する。
    pub async fn ensure_loaded(&self) -> Result<Arc<ModelHandle<B>>, LoadError> {
        if let Some(handle) = self.loaded() {
            return Ok(handle);
        }

        let _guard = self.load_lock.lock().await;
        if let Some(handle) = self.loaded() {
            return Ok(handle);
        }

        info!(source = %self.source, "モデルを読み込んでいます...");
        let timeout = self.settings.load_timeout();
        let handle = tokio::time::timeout(
            timeout,
            self.loader
                .load_with_retry(&self.source, &self.label_set, &self.head),
        )
        .await
        .map_err(|_| LoadError::Timeout(timeout))??;

        if handle.input_size() != self.preprocessor.target_size() {
            warn!(
                model = handle.input_size(),
                preprocess = self.preprocessor.target_size(),
                "モデル入力サイズと前処理サイズが一致しません"
            );
        }

        let handle = Arc::new(handle);
        *self.write_slot() = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// 読み込み中かどうか
    pub fn is_loading(&self) -> bool {
        self.load_lock.try_lock().is_err()
    }

    /// モデルを解放する
    ///
    /// 読み込み中なら完了を待ってから解放する。
    /// 実行中の推論はハンドルを保持しているため、完了後に解放される。
    pub async fn dispose(&self) {
        let _guard = self.load_lock.lock().await;
        if self.write_slot().take().is_some() {
            info!("モデルを解放しました");
        }
    }

    /// 読み込み済みのモデルで推論する（読み込みは行わない）
    pub async fn infer(&self, input: PreprocessedTensor) -> Result<RawDistribution, InferError> {
        self.infer_on(self.loaded(), input, None).await
    }

    /// ブロッキングスレッドで推論し、タイムアウトを適用する
    ///
    /// 許可証はスレッド側に移し、推論が終わるまで保持する。
    async fn infer_on(
        &self,
        handle: Option<Arc<ModelHandle<B>>>,
        input: PreprocessedTensor,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<RawDistribution, InferError> {
        let handle = handle.ok_or(InferError::ModelNotLoaded)?;
        let engine = self.engine.clone();
        let timeout = self.settings.infer_timeout();

        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            engine.infer(Some(&handle), input)
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) if e.is_panic() => resume_unwind(e.into_panic()),
            Ok(Err(e)) => Err(InferError::RuntimeFault(format!("inference task failed: {}", e))),
            Err(_) => {
                warn!(?timeout, "推論がタイムアウトしました");
                Err(InferError::Timeout(timeout))
            }
        }
    }

    /// 1枚の画像を分類する
    ///
    /// 読み込み → 前処理 → 推論 → 順位付け
    pub async fn classify(&self, input: ImageInput) -> Result<ClassificationResult, ClassificationError> {
        let permit = Arc::clone(&self.limiter)
            .acquire_owned()
            .await
            .map_err(|_| InferError::RuntimeFault("request limiter closed".to_string()))?;

        let handle = self.ensure_loaded().await?;
        let tensor = self.preprocessor.preprocess(input).await?;
        let distribution = self
            .infer_on(Some(Arc::clone(&handle)), tensor, Some(permit))
            .await?;

        let result = rank(&distribution, handle.label_set(), &self.reusability);
        debug!(
            category = %result.category,
            confidence = result.confidence,
            "分類完了"
        );
        Ok(result)
    }

    /// 複数の画像を分類する
    ///
    /// 結果は投入順に並び、各結果は相関IDで対応付けられる。
    /// 1件の失敗は他のリクエストに影響しない。
    pub async fn classify_batch(self: &Arc<Self>, requests: Vec<ClassificationRequest>) -> Vec<BatchOutcome> {
        let total = requests.len();
        let mut tasks = JoinSet::new();
        for (index, request) in requests.into_iter().enumerate() {
            let manager = Arc::clone(self);
            let span = info_span!("classify", correlation_id = %request.correlation_id);
            tasks.spawn(
                async move {
                    debug!("分類リクエストを開始します");
                    let result = manager.classify(request.input).await;
                    if let Err(e) = &result {
                        warn!("分類に失敗しました: {}", e);
                    }
                    (
                        index,
                        BatchOutcome {
                            correlation_id: request.correlation_id,
                            result,
                        },
                    )
                }
                .instrument(span),
            );
        }

        let mut outcomes = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) if e.is_panic() => resume_unwind(e.into_panic()),
                Err(e) => error!("分類タスクが中断されました: {}", e),
            }
        }
        outcomes.sort_by_key(|(index, _)| *index);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }
}
