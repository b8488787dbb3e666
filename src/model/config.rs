//! 分類器設定管理モジュール
//!
//! 計算デバイス・モデル取得元・前処理・実行時制限などをJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::ml::ml_model::{DEFAULT_TRUNCATE_LAYER, IMAGE_SIZE};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    #[default]
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// 分類ヘッド設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadSettings {
    /// 1段目の全結合ユニット数
    pub hidden_units: usize,
    /// 2段目の全結合ユニット数
    pub second_units: usize,
    /// ドロップアウト率（学習時のみ有効）
    pub dropout: f64,
}

impl Default for HeadSettings {
    fn default() -> Self {
        Self {
            hidden_units: 128,
            second_units: 64,
            dropout: 0.5,
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// モデルパッケージのパスまたはURL
    pub source: String,
    /// バックボーンを切り詰める層
    pub truncate_layer: String,
    /// 分類ヘッド設定
    pub head: HeadSettings,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            source: "models/rehome_classifier.tar.gz".to_string(),
            truncate_layer: DEFAULT_TRUNCATE_LAYER.to_string(),
            head: HeadSettings::default(),
        }
    }
}

/// リサイズ方法
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResizeMode {
    /// アスペクト比を無視して拡大縮小（学習時と同じ）
    #[default]
    Stretch,
    /// 中央を正方形に切り出してから拡大縮小
    CenterCrop,
}

/// 前処理設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessSettings {
    /// モデル入力サイズ（正方形）
    pub target_size: u32,
    pub resize_mode: ResizeMode,
}

impl PreprocessSettings {
    /// 設定値を検証する
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.target_size > 0, "preprocessing.target_size must be positive");
        Ok(())
    }
}

impl Default for PreprocessSettings {
    fn default() -> Self {
        Self {
            target_size: IMAGE_SIZE as u32,
            resize_mode: ResizeMode::Stretch,
        }
    }
}

/// 実行時設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// 同時に処理する分類リクエスト数
    pub max_concurrency: usize,
    /// モデル読み込みのタイムアウト（ミリ秒）
    pub load_timeout_ms: u64,
    /// 1枚あたりの推論タイムアウト（ミリ秒）
    pub infer_timeout_ms: u64,
    /// ネットワークエラー時の追加リトライ回数
    pub load_retries: u32,
    /// リトライ間隔の基準値（ミリ秒、試行ごとに倍）
    pub retry_backoff_ms: u64,
    /// デバイスメモリ予算（MB、未設定なら無制限）
    pub memory_budget_mb: Option<u64>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            load_timeout_ms: 60_000,
            infer_timeout_ms: 10_000,
            load_retries: 2,
            retry_backoff_ms: 250,
            memory_budget_mb: None,
        }
    }
}

impl RuntimeSettings {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn infer_timeout(&self) -> Duration {
        Duration::from_millis(self.infer_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn memory_budget_bytes(&self) -> Option<u64> {
        self.memory_budget_mb.map(|mb| mb * 1024 * 1024)
    }
}

/// 画像取得設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    /// ホストアプリのオリジン（設定時のみクロスオリジン制限を適用）
    pub origin: Option<String>,
    /// 読み取りを許可する他オリジン
    pub allowed_origins: Vec<String>,
    /// 取得タイムアウト（ミリ秒）
    pub fetch_timeout_ms: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            origin: None,
            allowed_origins: Vec::new(),
            fetch_timeout_ms: 15_000,
        }
    }
}

impl FetchSettings {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// 分類器設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// モデル設定
    pub model: ModelSettings,
    /// 前処理設定
    pub preprocessing: PreprocessSettings,
    /// 実行時設定
    pub runtime: RuntimeSettings,
    /// 画像取得設定
    pub fetch: FetchSettings,
    /// 再利用可否テーブルの上書き（ラベル -> 再利用可能か）
    pub reusability: Option<HashMap<String, bool>>,
}

impl ClassifierConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("rehome_classifier.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: ClassifierConfig = serde_json::from_str(&content)?;
        config.preprocessing.validate()?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しない・壊れている場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定情報をログに出力
    pub fn display(&self) {
        info!("=== 分類器設定 ===");
        info!("計算デバイス: {}", self.device_type);
        info!("モデル: {}", self.model.source);
        info!("切り詰め層: {}", self.model.truncate_layer);
        info!(
            "入力サイズ: {}x{} ({:?})",
            self.preprocessing.target_size, self.preprocessing.target_size, self.preprocessing.resize_mode
        );
        info!("同時実行数: {}", self.runtime.max_concurrency);
        info!(
            "タイムアウト: 読み込み {}ms / 推論 {}ms",
            self.runtime.load_timeout_ms, self.runtime.infer_timeout_ms
        );
        if let Some(origin) = &self.fetch.origin {
            info!("オリジン: {} (許可: {})", origin, self.fetch.allowed_origins.join(", "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClassifierConfig::default();
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.preprocessing.target_size, 224);
        assert_eq!(config.model.truncate_layer, "conv_pw_13_relu");
        assert_eq!(config.runtime.max_concurrency, 4);
        assert_eq!(config.runtime.load_retries, 2);
        assert!(config.runtime.memory_budget_bytes().is_none());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "device_type": "Wgpu", "runtime": { "max_concurrency": 2 } }"#;
        let config: ClassifierConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.runtime.max_concurrency, 2);
        assert_eq!(config.runtime.infer_timeout(), Duration::from_secs(10));
        assert_eq!(config.preprocessing.resize_mode, ResizeMode::Stretch);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = ClassifierConfig::default();
        config.preprocessing.resize_mode = ResizeMode::CenterCrop;
        config.fetch.origin = Some("https://rehome.app".to_string());
        config.save(&path).unwrap();

        let loaded = ClassifierConfig::load(&path).unwrap();
        assert_eq!(loaded.preprocessing.resize_mode, ResizeMode::CenterCrop);
        assert_eq!(loaded.fetch.origin.as_deref(), Some("https://rehome.app"));
    }

    #[test]
    fn test_load_or_default_on_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let config = ClassifierConfig::load_or_default(&path);
        assert_eq!(config.runtime.max_concurrency, 4);
    }

    #[test]
    fn test_zero_target_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "preprocessing": { "target_size": 0 } }"#).unwrap();

        assert!(ClassifierConfig::load(&path).is_err());
        let config = ClassifierConfig::load_or_default(&path);
        assert_eq!(config.preprocessing.target_size, 224);
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}
