//! 出力分布の順位付け

use std::collections::HashMap;
use tracing::warn;

use crate::types::{Category, ClassificationResult, LabelSet, Prediction};

/// テーブルにラベルがない場合の再利用可否
pub const FALLBACK_REUSABLE: bool = true;

/// ラベル -> 再利用可能か
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReusabilityTable(HashMap<String, bool>);

impl ReusabilityTable {
    /// ReHomeの全カテゴリを網羅したテーブル
    pub fn rehome() -> Self {
        Self(
            Category::ALL
                .iter()
                .map(|c| (c.as_str().to_string(), c.is_reusable()))
                .collect(),
        )
    }

    pub fn from_map(map: HashMap<String, bool>) -> Self {
        Self(map)
    }

    /// 設定による上書きを適用
    pub fn with_overrides(mut self, overrides: &HashMap<String, bool>) -> Self {
        self.0
            .extend(overrides.iter().map(|(label, reusable)| (label.clone(), *reusable)));
        self
    }

    pub fn lookup(&self, label: &str) -> Option<bool> {
        self.0.get(label).copied()
    }
}

impl Default for ReusabilityTable {
    fn default() -> Self {
        Self::rehome()
    }
}

/// 出力分布をラベルと対応付けて降順に並べる
///
/// 同じ確信度はラベルセット順を保つ（安定ソート）。
///
/// # Panics
/// 分布の長さとラベル数が異なる場合。モデルとラベルセットの不整合を示す。
pub fn rank(distribution: &[f32], label_set: &LabelSet, table: &ReusabilityTable) -> ClassificationResult {
    assert_eq!(
        distribution.len(),
        label_set.len(),
        "distribution width does not match the label set; model and labels are out of sync"
    );

    let mut ranked: Vec<Prediction> = label_set
        .iter()
        .zip(distribution)
        .map(|(label, &confidence)| Prediction {
            category: label.to_string(),
            confidence,
        })
        .collect();
    ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let top = &ranked[0];
    let (reusable, reusability_fallback) = match table.lookup(&top.category) {
        Some(reusable) => (reusable, false),
        None => {
            warn!(
                label = %top.category,
                "ラベルが再利用テーブルにありません。フォールバック値を使用します"
            );
            (FALLBACK_REUSABLE, true)
        }
    };

    ClassificationResult {
        category: top.category.clone(),
        confidence: top.confidence,
        all_predictions: ranked,
        reusable,
        reusability_fallback,
        reasoning: None,
    }
}
