use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;

use crate::error::LoadError;

/// 寄付カテゴリ
///
/// 永続化スキーマのcategory列と共有する互換面。変更は破壊的変更になる。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Books,
    Clothes,
    Electronics,
    Ewaste,
    Furniture,
}

impl Category {
    /// ラベルセット順の全カテゴリ
    pub const ALL: [Category; 5] = [
        Category::Books,
        Category::Clothes,
        Category::Electronics,
        Category::Ewaste,
        Category::Furniture,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Books => "books",
            Category::Clothes => "clothes",
            Category::Electronics => "electronics",
            Category::Ewaste => "ewaste",
            Category::Furniture => "furniture",
        }
    }

    /// 再利用可能なカテゴリか
    pub fn is_reusable(&self) -> bool {
        match self {
            Category::Books => true,
            Category::Clothes => true,
            Category::Electronics => true,
            Category::Ewaste => false,
            Category::Furniture => true,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown category: {}", s))
    }
}

/// 出力分布のインデックスと対応する順序付きラベル列
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct LabelSet(Vec<String>);

impl LabelSet {
    /// 空でなく重複のないラベル列から作成
    pub fn new(labels: Vec<String>) -> Result<Self, LoadError> {
        if labels.is_empty() {
            return Err(LoadError::IncompatibleShape("label set is empty".to_string()));
        }
        let mut seen = HashSet::new();
        for label in &labels {
            if !seen.insert(label.as_str()) {
                return Err(LoadError::IncompatibleShape(format!(
                    "duplicate label in label set: {}",
                    label
                )));
            }
        }
        Ok(Self(labels))
    }

    /// ReHomeの5カテゴリ
    pub fn rehome() -> Self {
        Self(Category::ALL.iter().map(|c| c.as_str().to_string()).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.0.iter().position(|l| l == label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl<'de> Deserialize<'de> for LabelSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let labels = Vec::<String>::deserialize(deserializer)?;
        LabelSet::new(labels).map_err(serde::de::Error::custom)
    }
}

/// 1カテゴリ分の予測
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub category: String,
    pub confidence: f32,
}

/// 分類結果
///
/// ホストアプリ（永続化・UI）はこのフィールド名と `all_predictions` の降順に依存する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationResult {
    /// 最上位ラベル
    pub category: String,
    /// 最上位ラベルの確信度
    pub confidence: f32,
    /// 全ラベル（確信度の降順）
    pub all_predictions: Vec<Prediction>,
    /// 再利用可能か
    pub reusable: bool,
    /// 再利用テーブルにラベルがなくフォールバック値を使った
    #[serde(default)]
    pub reusability_fallback: bool,
    /// 説明文（リモート分類経路のみ）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl ClassificationResult {
    pub fn top_label(&self) -> &str {
        &self.category
    }

    pub fn top_confidence(&self) -> f32 {
        self.confidence
    }

    pub fn ranked(&self) -> &[Prediction] {
        &self.all_predictions
    }

    /// 型付きカテゴリ（ReHomeラベルセット外ならNone）
    pub fn category(&self) -> Option<Category> {
        self.category.parse().ok()
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}
