//! モデルメタデータから推論用情報を取り出す

use crate::error::LoadError;
use crate::model::model_metadata::ModelMetadata;
use crate::types::LabelSet;

/// モデルメタデータから得た推論用情報
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// 全クラスラベル（出力インデックス順）
    pub label_set: LabelSet,

    /// モデル入力解像度
    pub input_size: usize,

    /// 切り詰め層
    pub truncate_layer: String,
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    pub fn from_metadata(metadata: &ModelMetadata) -> Result<Self, LoadError> {
        if metadata.input_size == 0 {
            return Err(LoadError::IncompatibleShape(
                "model input size must be positive".to_string(),
            ));
        }
        Ok(Self {
            label_set: LabelSet::new(metadata.labels.clone())?,
            input_size: metadata.input_size as usize,
            truncate_layer: metadata.truncate_layer.clone(),
        })
    }

    /// クラス数
    pub fn num_classes(&self) -> usize {
        self.label_set.len()
    }

    /// クラスインデックスからラベルを取得
    pub fn class_index_to_label(&self, index: usize) -> Option<&str> {
        self.label_set.get(index)
    }

    /// ラベルからクラスインデックスを取得
    pub fn label_to_index(&self, label: &str) -> Option<usize> {
        self.label_set.index_of(label)
    }

    /// モデル入力テンソルの形状 [高さ, 幅, チャネル]
    pub fn input_shape(&self) -> [usize; 3] {
        [self.input_size, self.input_size, 3]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::HeadSettings;

    fn metadata(labels: Vec<&str>, input_size: u32) -> ModelMetadata {
        ModelMetadata::new(
            "mobilenet_v1_0.25",
            "1",
            labels.into_iter().map(String::from).collect(),
            input_size,
            "conv_pw_13_relu",
            HeadSettings::default(),
        )
    }

    #[test]
    fn test_index_mapping() {
        let config =
            InferenceConfig::from_metadata(&metadata(vec!["books", "clothes", "ewaste"], 224)).unwrap();
        assert_eq!(config.num_classes(), 3);
        assert_eq!(config.class_index_to_label(2), Some("ewaste"));
        assert_eq!(config.class_index_to_label(3), None);
        assert_eq!(config.label_to_index("clothes"), Some(1));
        assert_eq!(config.input_shape(), [224, 224, 3]);
    }

    #[test]
    fn test_rejects_invalid_metadata() {
        assert!(InferenceConfig::from_metadata(&metadata(vec![], 224)).is_err());
        assert!(InferenceConfig::from_metadata(&metadata(vec!["books"], 0)).is_err());
    }
}
