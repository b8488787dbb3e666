//! モデル推論機能

use std::panic::AssertUnwindSafe;

use burn::tensor::{backend::Backend, Tensor};
use tracing::{debug, error};

use crate::error::InferError;
use crate::ml::loader::ModelHandle;
use crate::ml::preprocess::PreprocessedTensor;
use crate::ml::transient::TransientTracker;

/// ラベルセット順の確率分布（softmax後）
pub type RawDistribution = Vec<f32>;

/// 推論エンジン
///
/// 状態は一時バッファ計測のみ。モデルはハンドル側で保持する。
#[derive(Debug, Clone, Default)]
pub struct InferenceEngine {
    tracker: TransientTracker,
}

impl InferenceEngine {
    pub fn new(tracker: TransientTracker) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &TransientTracker {
        &self.tracker
    }

    /// 単一画像の順伝播
    ///
    /// 入力テンソルはこの呼び出しで消費され、戻る前に解放される。
    pub fn infer<B: Backend>(
        &self,
        handle: Option<&ModelHandle<B>>,
        input: PreprocessedTensor,
    ) -> Result<RawDistribution, InferError> {
        let handle = handle.ok_or(InferError::ModelNotLoaded)?;

        if B::ad_enabled() {
            return Err(InferError::RuntimeFault(
                "inference requires a backend without autodiff".to_string(),
            ));
        }

        let expected = handle.input_shape();
        let actual = input.shape();
        if actual != expected {
            return Err(InferError::ShapeMismatch { expected, actual });
        }

        let _activations = self.tracker.lease(handle.activation_bytes());
        let model = handle
            .model()
            .lock()
            .map_err(|_| InferError::RuntimeFault("model lock poisoned".to_string()))?;

        let [height, width, channels] = actual;
        let device = handle.device();
        let output = std::panic::catch_unwind(AssertUnwindSafe(|| {
            // HWC -> NCHW
            let images = Tensor::<B, 1>::from_floats(input.data(), device)
                .reshape([1, height, width, channels])
                .permute([0, 3, 1, 2]);
            model.forward_softmax(images).into_data().to_vec::<f32>()
        }))
        .map_err(|_| {
            error!("推論中にバックエンドがパニックしました");
            InferError::RuntimeFault("backend panicked during forward pass".to_string())
        })?
        .map_err(|e| InferError::RuntimeFault(format!("推論結果の取得エラー: {:?}", e)))?;
        drop(model);
        drop(input);

        let num_classes = handle.label_set().len();
        if output.len() != num_classes {
            return Err(InferError::RuntimeFault(format!(
                "model produced {} values for {} labels",
                output.len(),
                num_classes
            )));
        }
        if output.iter().any(|p| !p.is_finite()) {
            return Err(InferError::RuntimeFault("model produced non-finite output".to_string()));
        }

        debug!(?output, "推論完了");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::loader::tests::{initialized, TestBackend};
    use crate::ml::loader::{HeadOptions, LoaderSettings, ModelLoader};
    use crate::types::LabelSet;
    use burn_autodiff::Autodiff;

    async fn load<B: Backend>(input_size: usize) -> ModelHandle<B> {
        ModelLoader::<B>::new(LoaderSettings::default(), Default::default())
            .load(&initialized(input_size), &LabelSet::rehome(), &HeadOptions::default())
            .await
            .unwrap()
    }

    fn tensor(size: usize, value: f32) -> PreprocessedTensor {
        PreprocessedTensor::from_hwc(vec![value; size * size * 3], [size, size, 3]).unwrap()
    }

    #[test]
    fn test_not_loaded() {
        let engine = InferenceEngine::default();
        let err = engine.infer::<TestBackend>(None, tensor(8, 0.5)).unwrap_err();
        assert!(matches!(err, InferError::ModelNotLoaded));
    }

    #[tokio::test]
    async fn test_distribution_sums_to_one() {
        let handle = load::<TestBackend>(64).await;
        let engine = InferenceEngine::default();

        let output = engine.infer(Some(&handle), tensor(64, 1.0)).unwrap();
        assert_eq!(output.len(), 5);
        assert!(output.iter().all(|p| (0.0..=1.0).contains(p)));
        let sum: f32 = output.iter().sum();
        assert!((sum - 1.0).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_same_input_same_output() {
        let handle = load::<TestBackend>(64).await;
        let engine = InferenceEngine::default();

        let first = engine.infer(Some(&handle), tensor(64, 0.3)).unwrap();
        let second = engine.infer(Some(&handle), tensor(64, 0.3)).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_shape_mismatch() {
        let handle = load::<TestBackend>(64).await;
        let engine = InferenceEngine::default();

        let err = engine.infer(Some(&handle), tensor(32, 0.5)).unwrap_err();
        assert!(matches!(
            err,
            InferError::ShapeMismatch {
                expected: [64, 64, 3],
                actual: [32, 32, 3]
            }
        ));
    }

    #[tokio::test]
    async fn test_activations_released_after_infer() {
        let handle = load::<TestBackend>(64).await;
        let tracker = TransientTracker::new();
        let engine = InferenceEngine::new(tracker.clone());

        engine.infer(Some(&handle), tensor(64, 0.5)).unwrap();
        assert_eq!(tracker.live_bytes(), 0);
        assert_eq!(tracker.peak_bytes(), handle.activation_bytes());
    }

    #[tokio::test]
    async fn test_autodiff_backend_rejected() {
        let handle = load::<Autodiff<TestBackend>>(32).await;
        let err = InferenceEngine::default()
            .infer(Some(&handle), tensor(32, 0.5))
            .unwrap_err();
        assert!(matches!(err, InferError::RuntimeFault(_)));
    }
}
