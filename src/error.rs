//! 分類パイプラインのエラー型
//!
//! ローダー・前処理・推論の各段階ごとに型付きエラーを定義し、
//! 公開エントリポイントでは [`ClassificationError`] に集約します。

use std::time::Duration;

use thiserror::Error;

/// モデル読み込みエラー
#[derive(Error, Debug)]
pub enum LoadError {
    /// 重みを取得できない（ネットワーク・ファイル）
    #[error("backbone weights unavailable from {source_desc}: {reason}")]
    NetworkUnavailable { source_desc: String, reason: String },

    /// 層名・ヘッド設定・ラベル数の不整合
    #[error("incompatible model shape: {0}")]
    IncompatibleShape(String),

    /// メモリ予算を超える
    #[error("model needs {required} bytes but the device budget is {budget} bytes")]
    OutOfMemory { required: u64, budget: u64 },

    /// パッケージ・重みレコードが壊れている
    #[error("invalid model package: {0}")]
    InvalidPackage(String),

    /// 読み込みがタイムアウトした
    #[error("model load timed out after {0:?}")]
    Timeout(Duration),
}

impl LoadError {
    /// 自動リトライの対象かどうか
    ///
    /// ネットワーク起因の失敗のみリトライする。
    pub fn is_retryable(&self) -> bool {
        matches!(self, LoadError::NetworkUnavailable { .. })
    }
}

/// 前処理エラー
#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("failed to decode image: {0}")]
    DecodeFailed(String),

    #[error("failed to fetch image from {url}: {reason}")]
    FetchFailed { url: String, reason: String },

    #[error("cross-origin image from {origin} is not readable")]
    CrossOriginBlocked { origin: String },
}

/// 推論エラー
#[derive(Error, Debug)]
pub enum InferError {
    #[error("input shape {actual:?} does not match model input {expected:?}")]
    ShapeMismatch {
        expected: [usize; 3],
        actual: [usize; 3],
    },

    #[error("model is not loaded")]
    ModelNotLoaded,

    #[error("inference runtime fault: {0}")]
    RuntimeFault(String),

    #[error("inference timed out after {0:?}")]
    Timeout(Duration),
}

/// 公開エントリポイントのエラー
#[derive(Error, Debug)]
pub enum ClassificationError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Preprocess(#[from] PreprocessError),

    #[error(transparent)]
    Infer(#[from] InferError),
}

impl ClassificationError {
    /// ホストアプリで表示するメッセージ
    pub fn user_message(&self) -> &'static str {
        match self {
            ClassificationError::Load(LoadError::NetworkUnavailable { .. }) => {
                "Could not download the classification model. Check your connection and try again."
            }
            ClassificationError::Load(LoadError::Timeout(_)) => {
                "Loading the classification model took too long. Please try again."
            }
            ClassificationError::Load(_) => "The classification model could not be loaded.",
            ClassificationError::Preprocess(PreprocessError::DecodeFailed(_)) => {
                "This image could not be read. Try another photo."
            }
            ClassificationError::Preprocess(PreprocessError::FetchFailed { .. }) => {
                "The image could not be downloaded."
            }
            ClassificationError::Preprocess(PreprocessError::CrossOriginBlocked { .. }) => {
                "The image host does not allow it to be analysed. Upload the photo instead."
            }
            ClassificationError::Infer(InferError::ModelNotLoaded) => "Model not loaded yet.",
            ClassificationError::Infer(_) => "Failed to classify image.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_errors_retry() {
        let network = LoadError::NetworkUnavailable {
            source_desc: "https://example.com/model.tar.gz".to_string(),
            reason: "connection refused".to_string(),
        };
        assert!(network.is_retryable());
        assert!(!LoadError::IncompatibleShape("x".to_string()).is_retryable());
        assert!(!LoadError::OutOfMemory { required: 2, budget: 1 }.is_retryable());
        assert!(!LoadError::Timeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn test_user_message() {
        let err: ClassificationError = InferError::ModelNotLoaded.into();
        assert_eq!(err.user_message(), "Model not loaded yet.");

        let err: ClassificationError = InferError::RuntimeFault("nan".to_string()).into();
        assert_eq!(err.user_message(), "Failed to classify image.");
    }
}
