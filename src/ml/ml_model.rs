//! 分類モデルの定義
//!
//! MobileNet v1系のバックボーン（特徴抽出器）と、ラベルセットに合わせた
//! 分類ヘッドを合成したCNNモデルを提供します。

use burn::{
    config::Config,
    module::{AutodiffModule, Module},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
        Relu,
    },
    optim::{AdamConfig, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        Int, Tensor,
    },
    train::ClassificationOutput,
};

use crate::error::LoadError;

/// 画像サイズ（正方形）
pub const IMAGE_SIZE: usize = 224;

/// 入力チャネル数（RGB）
pub const INPUT_CHANNELS: usize = 3;

/// デフォルトの切り詰め層
pub const DEFAULT_TRUNCATE_LAYER: &str = "conv_pw_13_relu";

/// ステム層の名前
const STEM_LAYER: &str = "conv1_relu";

/// ステムの出力チャネル数（幅倍率1.0時）
const STEM_FILTERS: usize = 32;

/// 深さ方向分離畳み込みブロックの (出力チャネル数, ストライド)（幅倍率1.0時）
const BLOCK_PLAN: [(usize, usize); 13] = [
    (64, 1),
    (128, 2),
    (128, 1),
    (256, 2),
    (256, 1),
    (512, 2),
    (512, 1),
    (512, 1),
    (512, 1),
    (512, 1),
    (512, 1),
    (1024, 2),
    (1024, 1),
];

/// 対応するバックボーンの幅倍率
const KNOWN_ALPHAS: [(&str, f64); 4] = [
    ("0.25", 0.25),
    ("0.50", 0.5),
    ("0.75", 0.75),
    ("1.00", 1.0),
];

fn scaled(filters: usize, alpha: f64) -> usize {
    ((filters as f64 * alpha) as usize).max(8)
}

/// 3x3 / パディング1 の畳み込み後の空間サイズ
fn conv_output_size(size: usize, stride: usize) -> usize {
    (size.saturating_sub(1)) / stride + 1
}

fn relu6<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clamp(0.0, 6.0)
}

/// バックボーン設定
#[derive(Config, Debug)]
pub struct BackboneConfig {
    /// 幅倍率
    #[config(default = 0.25)]
    pub alpha: f64,
}

impl BackboneConfig {
    /// アーキテクチャ名（例: `mobilenet_v1_0.25`）から設定を作成
    pub fn from_architecture(architecture: &str) -> Result<Self, LoadError> {
        let alpha = architecture
            .strip_prefix("mobilenet_v1_")
            .and_then(|suffix| KNOWN_ALPHAS.iter().find(|(name, _)| *name == suffix))
            .map(|(_, alpha)| *alpha)
            .ok_or_else(|| {
                LoadError::IncompatibleShape(format!("unknown backbone architecture: {}", architecture))
            })?;
        Ok(Self::new().with_alpha(alpha))
    }

    /// アーキテクチャ名
    pub fn architecture(&self) -> String {
        let suffix = KNOWN_ALPHAS
            .iter()
            .find(|(_, alpha)| (*alpha - self.alpha).abs() < f64::EPSILON)
            .map(|(name, _)| name.to_string())
            .unwrap_or_else(|| format!("{:.2}", self.alpha));
        format!("mobilenet_v1_{}", suffix)
    }

    /// バックボーン全体（13ブロック）を初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> Backbone<B> {
        let stem_channels = scaled(STEM_FILTERS, self.alpha);
        let stem = ConvBnBlock::new(INPUT_CHANNELS, stem_channels, 3, 2, 1, device);

        let mut in_channels = stem_channels;
        let mut blocks = Vec::with_capacity(BLOCK_PLAN.len());
        for (filters, stride) in BLOCK_PLAN {
            let out_channels = scaled(filters, self.alpha);
            blocks.push(DepthwiseSeparableBlock::new(in_channels, out_channels, stride, device));
            in_channels = out_channels;
        }

        Backbone {
            stem,
            blocks,
            stem_channels,
        }
    }
}

/// Conv + BatchNorm + ReLU6
#[derive(Module, Debug)]
pub struct ConvBnBlock<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B>,
    stride: usize,
}

impl<B: Backend> ConvBnBlock<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        groups: usize,
        device: &B::Device,
    ) -> Self {
        let padding = kernel_size / 2;
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_groups(groups)
            .with_bias(false)
            .init(device);

        Self {
            conv,
            bn: BatchNormConfig::new(out_channels).init(device),
            stride,
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        relu6(x)
    }
}

/// 深さ方向分離畳み込みブロック
///
/// depthwise 3x3 (groups = in) → pointwise 1x1。名前は `conv_dw_{n}` / `conv_pw_{n}`。
#[derive(Module, Debug)]
pub struct DepthwiseSeparableBlock<B: Backend> {
    depthwise: ConvBnBlock<B>,
    pointwise: ConvBnBlock<B>,
    out_channels: usize,
}

impl<B: Backend> DepthwiseSeparableBlock<B> {
    fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        Self {
            depthwise: ConvBnBlock::new(in_channels, in_channels, 3, stride, in_channels, device),
            pointwise: ConvBnBlock::new(in_channels, out_channels, 1, 1, 1, device),
            out_channels,
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.depthwise.forward(x);
        self.pointwise.forward(x)
    }

    fn stride(&self) -> usize {
        self.depthwise.stride
    }
}

/// 特徴抽出バックボーン
///
/// # 名前付き層
/// - `conv1_relu`: ステム出力
/// - `conv_pw_{n}_relu` (n = 1..=13): n番目のブロック出力
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    stem: ConvBnBlock<B>,
    blocks: Vec<DepthwiseSeparableBlock<B>>,
    stem_channels: usize,
}

impl<B: Backend> Backbone<B> {
    /// 切り詰め可能な層名の一覧
    pub fn layer_names(&self) -> Vec<String> {
        std::iter::once(STEM_LAYER.to_string())
            .chain((1..=self.blocks.len()).map(|n| format!("conv_pw_{}_relu", n)))
            .collect()
    }

    /// 指定した層の出力で切り詰める
    pub fn truncate_at(mut self, layer: &str) -> Result<Self, LoadError> {
        let keep = self
            .layer_names()
            .iter()
            .position(|name| name == layer)
            .ok_or_else(|| {
                LoadError::IncompatibleShape(format!("backbone has no layer named '{}'", layer))
            })?;
        self.blocks.truncate(keep);
        Ok(self)
    }

    /// 出力特徴マップのチャネル数
    pub fn out_channels(&self) -> usize {
        self.blocks
            .last()
            .map(|block| block.out_channels)
            .unwrap_or(self.stem_channels)
    }

    /// 出力特徴マップの空間サイズ
    pub fn feature_map_size(&self, input_size: usize) -> usize {
        let size = conv_output_size(input_size, self.stem.stride);
        self.blocks
            .iter()
            .fold(size, |size, block| conv_output_size(size, block.stride()))
    }

    /// 1枚分の中間活性化のバイト数（f32、全層合計の上限見積もり）
    pub fn activation_bytes(&self, input_size: usize) -> u64 {
        let mut size = conv_output_size(input_size, self.stem.stride);
        let mut in_channels = self.stem_channels;
        let mut elements = (INPUT_CHANNELS * input_size * input_size + in_channels * size * size) as u64;
        for block in &self.blocks {
            size = conv_output_size(size, block.stride());
            // depthwise出力 + pointwise出力
            elements += ((in_channels + block.out_channels) * size * size) as u64;
            in_channels = block.out_channels;
        }
        elements * 4
    }

    /// 順伝播
    ///
    /// - `images`: [batch_size, 3, size, size]
    /// - 戻り値: [batch_size, out_channels, h, w]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.stem.forward(images);
        self.blocks.iter().fold(x, |x, block| block.forward(x))
    }
}

/// 分類ヘッド設定
#[derive(Config, Debug)]
pub struct HeadConfig {
    /// バックボーン出力チャネル数
    pub in_features: usize,
    /// 分類クラス数
    pub num_classes: usize,
    /// 1段目の全結合ユニット数
    #[config(default = 128)]
    pub hidden_units: usize,
    /// 2段目の全結合ユニット数
    #[config(default = 64)]
    pub second_units: usize,
    /// ドロップアウト率
    #[config(default = 0.5)]
    pub dropout: f64,
}

impl HeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ClassificationHead<B> {
        ClassificationHead {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc1: LinearConfig::new(self.in_features, self.hidden_units).init(device),
            bn1: BatchNormConfig::new(self.hidden_units).init(device),
            dropout1: DropoutConfig::new(self.dropout).init(),
            fc2: LinearConfig::new(self.hidden_units, self.second_units).init(device),
            bn2: BatchNormConfig::new(self.second_units).init(device),
            dropout2: DropoutConfig::new(self.dropout).init(),
            fc3: LinearConfig::new(self.second_units, self.num_classes).init(device),
            activation: Relu::new(),
        }
    }
}

/// 分類ヘッド
///
/// # アーキテクチャ
/// - Global Average Pooling
/// - FC: in -> hidden + ReLU + BatchNorm + Dropout
/// - FC: hidden -> second + ReLU + BatchNorm + Dropout
/// - FC: second -> num_classes
/// - Softmax (分類時)
#[derive(Module, Debug)]
pub struct ClassificationHead<B: Backend> {
    pool: AdaptiveAvgPool2d,
    fc1: Linear<B>,
    bn1: BatchNorm<B>,
    dropout1: Dropout,
    fc2: Linear<B>,
    bn2: BatchNorm<B>,
    dropout2: Dropout,
    fc3: Linear<B>,
    activation: Relu,
}

impl<B: Backend> ClassificationHead<B> {
    /// [batch, features] に1次元を足してBatchNormを通す
    fn normalize(bn: &BatchNorm<B>, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let [batch_size, features] = x.dims();
        bn.forward(x.reshape([batch_size, features, 1]))
            .reshape([batch_size, features])
    }

    /// 特徴マップ [batch, c, h, w] からロジット [batch, num_classes] を計算
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.pool.forward(features);
        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);

        let x = self.activation.forward(self.fc1.forward(x));
        let x = Self::normalize(&self.bn1, x);
        let x = self.dropout1.forward(x);

        let x = self.activation.forward(self.fc2.forward(x));
        let x = Self::normalize(&self.bn2, x);
        let x = self.dropout2.forward(x);

        self.fc3.forward(x)
    }

    /// 出力クラス数
    pub fn num_classes(&self) -> usize {
        let [_, num_classes] = self.fc3.weight.dims();
        num_classes
    }
}

/// バックボーン + 分類ヘッドの合成モデル
#[derive(Module, Debug)]
pub struct RehomeClassifier<B: Backend> {
    pub backbone: Backbone<B>,
    pub head: ClassificationHead<B>,
}

impl<B: Backend> RehomeClassifier<B> {
    pub fn new(backbone: Backbone<B>, head: ClassificationHead<B>) -> Self {
        Self { backbone, head }
    }

    /// 順伝播
    ///
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    /// - 戻り値: クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(images);
        self.head.forward(features)
    }

    /// 順伝播 + Softmax
    pub fn forward_softmax(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        burn::tensor::activation::softmax(self.forward(images), 1)
    }

    /// 順伝播と損失計算（学習用）
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
        settings: &CompileSettings,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = settings
            .loss
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }

    /// 1枚分の推論に必要なメモリ見積もり（バイト）
    pub fn activation_bytes(&self, input_size: usize) -> u64 {
        self.backbone.activation_bytes(input_size)
    }
}

/// コンパイル設定（最適化手法と損失関数）
///
/// 推論のみなら使わないが、ファインチューニング可能な構成と揃えて保持する。
#[derive(Config, Debug)]
pub struct CompileSettings {
    /// 学習率
    #[config(default = 1e-4)]
    pub learning_rate: f64,
    /// 最適化手法
    pub optimizer: AdamConfig,
    /// 損失関数（カテゴリカル交差エントロピー）
    pub loss: CrossEntropyLossConfig,
}

impl Default for CompileSettings {
    fn default() -> Self {
        Self::new(AdamConfig::new(), CrossEntropyLossConfig::new())
    }
}

impl CompileSettings {
    /// Adamオプティマイザを初期化
    pub fn optimizer<AB, M>(&self) -> impl Optimizer<M, AB>
    where
        AB: AutodiffBackend,
        M: AutodiffModule<AB>,
    {
        self.optimizer.init::<AB, M>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn small_model(device: &<TestBackend as Backend>::Device) -> RehomeClassifier<TestBackend> {
        let backbone = BackboneConfig::new()
            .init::<TestBackend>(device)
            .truncate_at("conv_pw_5_relu")
            .unwrap();
        let head = HeadConfig::new(backbone.out_channels(), 5).init(device);
        RehomeClassifier::new(backbone, head)
    }

    #[test]
    fn test_architecture_names() {
        let config = BackboneConfig::from_architecture("mobilenet_v1_0.50").unwrap();
        assert_eq!(config.alpha, 0.5);
        assert_eq!(config.architecture(), "mobilenet_v1_0.50");
        assert!(matches!(
            BackboneConfig::from_architecture("resnet50"),
            Err(LoadError::IncompatibleShape(_))
        ));
    }

    #[test]
    fn test_truncate_at_named_layer() {
        let device = Default::default();
        let backbone = BackboneConfig::new().init::<TestBackend>(&device);
        assert_eq!(backbone.layer_names().len(), 14);
        assert_eq!(backbone.out_channels(), 256);
        assert_eq!(backbone.feature_map_size(IMAGE_SIZE), 7);

        let truncated = backbone.truncate_at("conv_pw_3_relu").unwrap();
        assert_eq!(truncated.out_channels(), 32);
        assert_eq!(truncated.feature_map_size(IMAGE_SIZE), 56);
    }

    #[test]
    fn test_truncate_unknown_layer() {
        let device = Default::default();
        let backbone = BackboneConfig::new().init::<TestBackend>(&device);
        assert!(matches!(
            backbone.truncate_at("conv_pw_14_relu"),
            Err(LoadError::IncompatibleShape(_))
        ));
    }

    #[test]
    fn test_output_shape_and_softmax() {
        let device = Default::default();
        let model = small_model(&device);

        let input = Tensor::<TestBackend, 4>::ones([2, 3, 64, 64], &device);
        let output = model.forward_softmax(input);
        assert_eq!(output.dims(), [2, 5]);

        let sums = output.sum_dim(1).into_data().to_vec::<f32>().unwrap();
        for sum in sums {
            assert!((sum - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_inference_is_deterministic() {
        let device = Default::default();
        let model = small_model(&device);

        let input = Tensor::<TestBackend, 4>::ones([1, 3, 64, 64], &device);
        let first = model.forward_softmax(input.clone()).into_data().to_vec::<f32>().unwrap();
        let second = model.forward_softmax(input).into_data().to_vec::<f32>().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_forward_classification_loss() {
        type TrainBackend = Autodiff<TestBackend>;
        let device = Default::default();
        let backbone = BackboneConfig::new()
            .init::<TrainBackend>(&device)
            .truncate_at("conv_pw_2_relu")
            .unwrap();
        let head = HeadConfig::new(backbone.out_channels(), 5).init(&device);
        let model = RehomeClassifier::new(backbone, head);
        let settings = CompileSettings::default();

        let images = Tensor::<TrainBackend, 4>::ones([2, 3, 32, 32], &device);
        let targets = Tensor::<TrainBackend, 1, Int>::from_ints([0, 3], &device);
        let output = model.forward_classification(images, targets, &settings);

        let loss = output.loss.into_scalar();
        assert!(loss.is_finite());
        assert_eq!(settings.learning_rate, 1e-4);

        let _optimizer = settings.optimizer::<TrainBackend, RehomeClassifier<TrainBackend>>();
    }
}
