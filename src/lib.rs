pub mod error;
pub mod types;
pub mod model;
pub mod ml;

use tracing::{error, info};

pub use error::{ClassificationError, InferError, LoadError, PreprocessError};
pub use ml::{
    BackboneSource, BatchOutcome, ClassificationRequest, HeadOptions, ImageInput, ModelHandle, ModelLoader,
    ModelManager,
};
pub use model::{ClassifierConfig, DeviceType};
pub use types::{Category, ClassificationResult, LabelSet, Prediction};

/// CPU (NdArray) バックエンド
pub type CpuBackend = burn_ndarray::NdArray<f32>;

/// WGPU (GPU) バックエンド
pub type GpuBackend = burn::backend::Wgpu;

/// 画像を1枚分類する（ホストアプリ向けエントリポイント）
///
/// 失敗時はエラーをログに残し、型付きエラーをそのまま返す。
/// 表示用の文言は [`ClassificationError::user_message`] を使う。
pub async fn classify_image<B: burn::tensor::backend::Backend>(
    manager: &ModelManager<B>,
    input: ImageInput,
) -> Result<ClassificationResult, ClassificationError> {
    match manager.classify(input).await {
        Ok(result) => {
            info!(
                category = %result.category,
                confidence = result.confidence,
                reusable = result.reusable,
                "分類結果"
            );
            Ok(result)
        }
        Err(e) => {
            error!("分類に失敗しました: {}", e);
            Err(e)
        }
    }
}
