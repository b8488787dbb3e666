//! モデルパッケージの永続化
//!
//! Tar.gz形式でメタデータと重みを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（ラベル、入力サイズなど）
//! - backbone.bin    - バックボーンの重み（任意）
//! - head.bin        - 分類ヘッドの重み（任意）

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};
use tracing::info;

use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const BACKBONE_ENTRY: &str = "backbone.bin";
const HEAD_ENTRY: &str = "head.bin";

/// メタデータと重みのまとまり
#[derive(Debug, Clone)]
pub struct ModelPackage {
    pub metadata: ModelMetadata,
    /// バックボーンの重み（なければ初期化状態）
    pub backbone: Option<Vec<u8>>,
    /// 分類ヘッドの重み（なければ初期化状態）
    pub head: Option<Vec<u8>>,
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, bytes)
        .context(format!("Failed to add {} to tar", name))
}

/// モデルパッケージをTar.gz形式で保存
///
/// 保存先のパスを返す（拡張子がなければ `.tar.gz` を付ける）。
pub fn save_model_package(output_path: &Path, package: &ModelPackage) -> Result<PathBuf> {
    let tar_gz_path = if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    };

    if let Some(parent) = tar_gz_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .context(format!("Failed to create parent directory: {:?}", parent))?;
    }

    let tar_gz_file = File::create(&tar_gz_path)
        .context(format!("Failed to create tar.gz file: {:?}", tar_gz_path))?;

    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = package.metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;

    if let Some(backbone) = &package.backbone {
        append_entry(&mut tar_builder, BACKBONE_ENTRY, backbone)?;
    }
    if let Some(head) = &package.head {
        append_entry(&mut tar_builder, HEAD_ENTRY, head)?;
    }

    tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?
        .finish()
        .context("Failed to finalize tar.gz archive")?;

    Ok(tar_gz_path)
}

/// 任意のリーダー（ファイル・ダウンロード済みバイト列）からパッケージを読み込む
pub fn read_model_package<R: Read>(reader: R) -> Result<ModelPackage> {
    let decoder = GzDecoder::new(reader);
    let mut archive = Archive::new(decoder);

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut backbone = None;
    let mut head = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_path_buf();

        match path.to_str() {
            Some(METADATA_ENTRY) => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(ModelMetadata::from_json_string(&json_str)?);
            }
            Some(BACKBONE_ENTRY) => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                backbone = Some(buffer);
            }
            Some(HEAD_ENTRY) => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                head = Some(buffer);
            }
            _ => {}
        }
    }

    let metadata = metadata_opt
        .ok_or_else(|| anyhow::anyhow!("metadata.json not found in tar.gz archive"))?;

    Ok(ModelPackage {
        metadata,
        backbone,
        head,
    })
}

/// Tar.gzからモデルパッケージを読み込む
pub fn load_model_package(tar_gz_path: &Path) -> Result<ModelPackage> {
    let tar_gz_file = File::open(tar_gz_path)
        .context(format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;
    read_model_package(tar_gz_file)
}

/// Tar.gzからモデルメタデータのみを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let tar_gz_file = File::open(tar_gz_path)
        .context(format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;

    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;

        if path.to_str() == Some(METADATA_ENTRY) {
            let mut json_str = String::new();
            entry.read_to_string(&mut json_str)?;
            return ModelMetadata::from_json_string(&json_str);
        }
    }

    Err(anyhow::anyhow!("metadata.json not found in tar.gz archive"))
}

/// メタデータをログに出力
pub fn print_metadata_info(metadata: &ModelMetadata) {
    info!("=== モデルメタデータ ===");
    info!("アーキテクチャ: {} (version {})", metadata.architecture, metadata.version);
    info!("ラベル: {}", metadata.labels.join(", "));
    info!("モデル入力サイズ: {}x{}", metadata.input_size, metadata.input_size);
    info!("切り詰め層: {}", metadata.truncate_layer);
    info!(
        "ヘッド: {} -> {} (dropout {})",
        metadata.head.hidden_units, metadata.head.second_units, metadata.head.dropout
    );
    info!("作成日時: {}", metadata.created_at);
}
