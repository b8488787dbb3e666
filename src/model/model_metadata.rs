//! モデルメタデータの定義と永続化
//!
//! tar.gz形式のモデルパッケージに同梱されるメタデータです。
//!
//! ## パッケージの内容
//! - バックボーンのアーキテクチャ名とバージョン
//! - ラベルセット（出力インデックス順）
//! - 入力解像度・切り詰め層・ヘッド設定

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::config::HeadSettings;

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - backbone.bin: バックボーンの重み（バイナリ）
/// - head.bin: 分類ヘッドの重み（任意）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// バックボーンのアーキテクチャ名
    /// 例: "mobilenet_v1_0.25"
    pub architecture: String,

    /// 重みのバージョン
    pub version: String,

    /// 全クラスラベル（出力インデックス順）
    /// 例: ["books", "clothes", "electronics", "ewaste", "furniture"]
    pub labels: Vec<String>,

    /// モデル入力サイズ（正方形、通常224）
    pub input_size: u32,

    /// バックボーンを切り詰める層の名前
    pub truncate_layer: String,

    /// 分類ヘッド設定
    #[serde(default)]
    pub head: HeadSettings,

    /// パッケージの作成時刻（ISO8601形式）
    pub created_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        architecture: impl Into<String>,
        version: impl Into<String>,
        labels: Vec<String>,
        input_size: u32,
        truncate_layer: impl Into<String>,
        head: HeadSettings,
    ) -> Self {
        Self {
            architecture: architecture.into(),
            version: version.into(),
            labels,
            input_size,
            truncate_layer: truncate_layer.into(),
            head,
            created_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}
