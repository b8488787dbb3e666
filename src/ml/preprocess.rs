//! 画像の前処理
//!
//! 画像バイト列・data URI・URLから画像をデコードし、モデル入力サイズの
//! 正方形にリサイズして [0, 1] に正規化した HWC テンソルを作ります。

use base64::Engine as _;
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use tracing::{debug, warn};
use url::Url;

use crate::error::PreprocessError;
use crate::ml::transient::{TransientLease, TransientTracker};
use crate::model::config::{FetchSettings, PreprocessSettings, ResizeMode};

/// 入力チャネル数（RGB）
const CHANNELS: usize = 3;

/// 学習時と同じリサイズフィルタ（バイリニア）
const RESIZE_FILTER: FilterType = FilterType::Triangle;

/// 分類対象の画像
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// エンコード済み画像バイト列
    Bytes(Vec<u8>),
    /// `data:image/png;base64,...`
    DataUri(String),
    /// 取得可能なURL（http / https / file）
    Url(Url),
}

/// 前処理済みテンソル [高さ, 幅, チャネル]
///
/// リクエストが所有し、Dropで一時バッファのリースを返す。
#[derive(Debug)]
pub struct PreprocessedTensor {
    data: Vec<f32>,
    shape: [usize; 3],
    _lease: Option<TransientLease>,
}

impl PreprocessedTensor {
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// バッファのバイト数
    pub fn byte_len(&self) -> u64 {
        (self.data.len() * std::mem::size_of::<f32>()) as u64
    }

    /// 外部で用意したHWCバッファから作成（計測なし）
    pub fn from_hwc(data: Vec<f32>, shape: [usize; 3]) -> Option<Self> {
        (data.len() == shape.iter().product::<usize>()).then_some(Self {
            data,
            shape,
            _lease: None,
        })
    }
}

/// クロスオリジン読み取り制限
///
/// ホストのオリジンが設定されている場合のみ有効。
#[derive(Debug, Clone, Default)]
pub struct CrossOriginPolicy {
    origin: Option<String>,
    allowed_origins: Vec<String>,
}

/// リクエスト前の判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OriginCheck {
    /// 同一オリジン・許可済み・制限なし
    Readable,
    /// レスポンスのCORSヘッダ次第
    NeedsCors,
}

fn normalize_origin(origin: &str) -> String {
    Url::parse(origin)
        .map(|url| url.origin().ascii_serialization())
        .unwrap_or_else(|_| origin.trim_end_matches('/').to_string())
}

impl CrossOriginPolicy {
    pub fn new(origin: Option<&str>, allowed_origins: &[String]) -> Self {
        Self {
            origin: origin.map(normalize_origin),
            allowed_origins: allowed_origins.iter().map(|o| normalize_origin(o)).collect(),
        }
    }

    pub fn from_settings(settings: &FetchSettings) -> Self {
        Self::new(settings.origin.as_deref(), &settings.allowed_origins)
    }

    fn check_request(&self, url: &Url) -> Result<OriginCheck, PreprocessError> {
        let Some(host_origin) = &self.origin else {
            return Ok(OriginCheck::Readable);
        };
        let target = url.origin();
        if !target.is_tuple() {
            // file:// などの不透明なオリジン
            return Err(PreprocessError::CrossOriginBlocked {
                origin: url.scheme().to_string(),
            });
        }
        let target = target.ascii_serialization();
        if &target == host_origin || self.allowed_origins.contains(&target) {
            Ok(OriginCheck::Readable)
        } else {
            Ok(OriginCheck::NeedsCors)
        }
    }

    fn check_response(&self, url: &Url, allow_origin: Option<&str>) -> Result<(), PreprocessError> {
        let allowed = match (allow_origin.map(str::trim), &self.origin) {
            (Some("*"), _) => true,
            (Some(value), Some(host)) => normalize_origin(value) == *host,
            _ => false,
        };
        if allowed {
            Ok(())
        } else {
            Err(PreprocessError::CrossOriginBlocked {
                origin: url.origin().ascii_serialization(),
            })
        }
    }
}

/// URLから画像バイト列を取得する
#[derive(Debug, Clone)]
pub struct ImageFetcher {
    client: reqwest::Client,
    policy: CrossOriginPolicy,
}

impl ImageFetcher {
    pub fn new(settings: &FetchSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(settings.fetch_timeout())
            .build()
            .unwrap_or_else(|e| {
                warn!("HTTPクライアントの設定に失敗しました: {}", e);
                reqwest::Client::new()
            });
        Self {
            client,
            policy: CrossOriginPolicy::from_settings(settings),
        }
    }

    pub async fn fetch(&self, url: &Url) -> Result<Vec<u8>, PreprocessError> {
        let fetch_failed = |reason: String| PreprocessError::FetchFailed {
            url: url.to_string(),
            reason,
        };

        match url.scheme() {
            "data" => decode_data_uri(url.as_str()),
            "file" => {
                self.policy.check_request(url)?;
                let path = url
                    .to_file_path()
                    .map_err(|_| fetch_failed("not a local file path".to_string()))?;
                tokio::fs::read(&path)
                    .await
                    .map_err(|e| fetch_failed(e.to_string()))
            }
            "http" | "https" => {
                let check = self.policy.check_request(url)?;
                let response = self
                    .client
                    .get(url.clone())
                    .send()
                    .await
                    .map_err(|e| fetch_failed(e.to_string()))?;
                if !response.status().is_success() {
                    return Err(fetch_failed(format!("HTTP {}", response.status())));
                }
                if check == OriginCheck::NeedsCors {
                    let allow_origin = response
                        .headers()
                        .get(reqwest::header::ACCESS_CONTROL_ALLOW_ORIGIN)
                        .and_then(|v| v.to_str().ok());
                    self.policy.check_response(url, allow_origin)?;
                }
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| fetch_failed(e.to_string()))?;
                Ok(bytes.to_vec())
            }
            other => Err(fetch_failed(format!("unsupported URL scheme: {}", other))),
        }
    }
}

/// `data:<mime>;base64,<payload>` をデコード
pub fn decode_data_uri(uri: &str) -> Result<Vec<u8>, PreprocessError> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| PreprocessError::DecodeFailed("not a data URI".to_string()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| PreprocessError::DecodeFailed("data URI has no payload".to_string()))?;
    if !header.ends_with(";base64") {
        return Err(PreprocessError::DecodeFailed(
            "only base64 data URIs are supported".to_string(),
        ));
    }
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| PreprocessError::DecodeFailed(format!("invalid base64 payload: {}", e)))
}

/// デコード・リサイズ・正規化
///
/// 戻り値は HWC 順で平坦化した [0, 1] の値
fn image_to_hwc(bytes: &[u8], target_size: u32, resize_mode: ResizeMode) -> Result<Vec<f32>, PreprocessError> {
    if target_size == 0 {
        return Err(PreprocessError::DecodeFailed("target size must be positive".to_string()));
    }
    if bytes.is_empty() {
        return Err(PreprocessError::DecodeFailed("empty image data".to_string()));
    }
    let img = image::load_from_memory(bytes).map_err(|e| PreprocessError::DecodeFailed(e.to_string()))?;
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Err(PreprocessError::DecodeFailed("image has no pixels".to_string()));
    }

    let resized = resize(img, target_size, resize_mode);
    let rgb = resized.to_rgb8();

    Ok(rgb.as_raw().iter().map(|&v| v as f32 / 255.0).collect())
}

fn resize(img: DynamicImage, target_size: u32, resize_mode: ResizeMode) -> DynamicImage {
    let (width, height) = img.dimensions();
    if width == target_size && height == target_size {
        return img;
    }
    match resize_mode {
        ResizeMode::Stretch => img.resize_exact(target_size, target_size, RESIZE_FILTER),
        ResizeMode::CenterCrop => {
            let side = width.min(height);
            let x = (width - side) / 2;
            let y = (height - side) / 2;
            img.crop_imm(x, y, side, side)
                .resize_exact(target_size, target_size, RESIZE_FILTER)
        }
    }
}

/// 前処理器
#[derive(Debug, Clone)]
pub struct Preprocessor {
    target_size: u32,
    resize_mode: ResizeMode,
    fetcher: ImageFetcher,
    tracker: TransientTracker,
}

impl Preprocessor {
    pub fn new(settings: &PreprocessSettings, fetch: &FetchSettings) -> Self {
        Self {
            target_size: settings.target_size,
            resize_mode: settings.resize_mode,
            fetcher: ImageFetcher::new(fetch),
            tracker: TransientTracker::new(),
        }
    }

    /// 一時バッファ計測を共有する
    pub fn with_tracker(mut self, tracker: TransientTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn target_size(&self) -> usize {
        self.target_size as usize
    }

    /// 出力テンソルの形状
    pub fn output_shape(&self) -> [usize; 3] {
        [self.target_size(), self.target_size(), CHANNELS]
    }

    /// 入力を取得・デコードしてテンソルを作成
    pub async fn preprocess(&self, input: ImageInput) -> Result<PreprocessedTensor, PreprocessError> {
        let bytes = match input {
            ImageInput::Bytes(bytes) => bytes,
            ImageInput::DataUri(uri) => decode_data_uri(&uri)?,
            ImageInput::Url(url) => {
                debug!(%url, "画像を取得します");
                self.fetcher.fetch(&url).await?
            }
        };

        let target_size = self.target_size;
        let resize_mode = self.resize_mode;
        let data = tokio::task::spawn_blocking(move || image_to_hwc(&bytes, target_size, resize_mode))
            .await
            .map_err(|e| PreprocessError::DecodeFailed(format!("decode task failed: {}", e)))??;

        Ok(self.wrap(data))
    }

    /// バイト列を同期的に前処理
    pub fn preprocess_bytes(&self, bytes: &[u8]) -> Result<PreprocessedTensor, PreprocessError> {
        let data = image_to_hwc(bytes, self.target_size, self.resize_mode)?;
        Ok(self.wrap(data))
    }

    fn wrap(&self, data: Vec<f32>) -> PreprocessedTensor {
        let lease = self
            .tracker
            .lease((data.len() * std::mem::size_of::<f32>()) as u64);
        PreprocessedTensor {
            data,
            shape: self.output_shape(),
            _lease: Some(lease),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    pub(crate) fn png_bytes(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb(color));
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    /// 固定レスポンスを返すローカルHTTPサーバー
    ///
    /// 戻り値は画像URLと受け付けた接続数
    pub(crate) async fn serve_http(status: &str, headers: &[(&str, &str)], body: Vec<u8>) -> (Url, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut response = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n",
            status,
            body.len()
        );
        for (name, value) in headers {
            response.push_str(&format!("{}: {}\r\n", name, value));
        }
        response.push_str("\r\n");
        let mut response = response.into_bytes();
        response.extend_from_slice(&body);
        let response = Arc::new(response);

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let response = response.clone();
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    let _ = stream.write_all(&response).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        (Url::parse(&format!("http://{}/image.png", addr)).unwrap(), hits)
    }

    fn preprocessor(target_size: u32) -> Preprocessor {
        let settings = PreprocessSettings {
            target_size,
            ..Default::default()
        };
        Preprocessor::new(&settings, &FetchSettings::default())
    }

    #[tokio::test]
    async fn test_white_image_is_normalized() {
        let pre = preprocessor(224);
        let tensor = pre
            .preprocess(ImageInput::Bytes(png_bytes(300, 200, [255, 255, 255])))
            .await
            .unwrap();
        assert_eq!(tensor.shape(), [224, 224, 3]);
        assert_eq!(tensor.data().len(), 224 * 224 * 3);
        assert!(tensor.data().iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[tokio::test]
    async fn test_hwc_channel_order() {
        let pre = preprocessor(4);
        let tensor = pre
            .preprocess(ImageInput::Bytes(png_bytes(4, 4, [255, 0, 51])))
            .await
            .unwrap();
        assert_eq!(&tensor.data()[..3], &[1.0, 0.0, 0.2]);
    }

    #[test]
    fn test_preprocessing_is_deterministic() {
        let pre = preprocessor(32);
        let bytes = png_bytes(57, 91, [12, 200, 99]);
        let a = pre.preprocess_bytes(&bytes).unwrap();
        let b = pre.preprocess_bytes(&bytes).unwrap();
        assert_eq!(a.data(), b.data());
    }

    #[test]
    fn test_center_crop_shape() {
        let settings = PreprocessSettings {
            target_size: 16,
            resize_mode: ResizeMode::CenterCrop,
        };
        let pre = Preprocessor::new(&settings, &FetchSettings::default());
        let tensor = pre.preprocess_bytes(&png_bytes(40, 10, [0, 0, 0])).unwrap();
        assert_eq!(tensor.shape(), [16, 16, 3]);
    }

    #[tokio::test]
    async fn test_empty_and_corrupt_input() {
        let pre = preprocessor(224);
        let empty = pre.preprocess(ImageInput::Bytes(Vec::new())).await;
        assert!(matches!(empty, Err(PreprocessError::DecodeFailed(_))));

        let corrupt = pre
            .preprocess(ImageInput::Bytes(b"\x89PNG\r\n\x1a\nbroken".to_vec()))
            .await;
        assert!(matches!(corrupt, Err(PreprocessError::DecodeFailed(_))));
    }

    #[tokio::test]
    async fn test_data_uri() {
        let pre = preprocessor(8);
        let encoded = base64::engine::general_purpose::STANDARD.encode(png_bytes(8, 8, [0, 0, 0]));
        let tensor = pre
            .preprocess(ImageInput::DataUri(format!("data:image/png;base64,{}", encoded)))
            .await
            .unwrap();
        assert!(tensor.data().iter().all(|&v| v == 0.0));

        let bad = pre
            .preprocess(ImageInput::DataUri("data:image/png;base64,!!!".to_string()))
            .await;
        assert!(matches!(bad, Err(PreprocessError::DecodeFailed(_))));

        let plain = pre
            .preprocess(ImageInput::DataUri("data:text/plain,hello".to_string()))
            .await;
        assert!(matches!(plain, Err(PreprocessError::DecodeFailed(_))));
    }

    #[tokio::test]
    async fn test_file_url_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chair.png");
        std::fs::write(&path, png_bytes(10, 10, [255, 255, 255])).unwrap();

        let pre = preprocessor(8);
        let url = Url::from_file_path(&path).unwrap();
        let tensor = pre.preprocess(ImageInput::Url(url)).await.unwrap();
        assert_eq!(tensor.shape(), [8, 8, 3]);

        let missing = Url::from_file_path(dir.path().join("missing.png")).unwrap();
        let err = pre.preprocess(ImageInput::Url(missing)).await;
        assert!(matches!(err, Err(PreprocessError::FetchFailed { .. })));
    }

    #[tokio::test]
    async fn test_file_url_blocked_with_origin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lamp.png");
        std::fs::write(&path, png_bytes(10, 10, [1, 2, 3])).unwrap();

        let fetch = FetchSettings {
            origin: Some("https://rehome.app".to_string()),
            ..Default::default()
        };
        let pre = Preprocessor::new(&PreprocessSettings::default(), &fetch);
        let err = pre
            .preprocess(ImageInput::Url(Url::from_file_path(&path).unwrap()))
            .await;
        assert!(matches!(err, Err(PreprocessError::CrossOriginBlocked { .. })));
    }

    #[tokio::test]
    async fn test_http_fetch() {
        let (url, hits) = serve_http("200 OK", &[("Content-Type", "image/png")], png_bytes(16, 16, [10, 20, 30])).await;
        let tensor = preprocessor(8).preprocess(ImageInput::Url(url)).await.unwrap();
        assert_eq!(tensor.shape(), [8, 8, 3]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_http_not_found() {
        let (url, _) = serve_http("404 Not Found", &[], b"not found".to_vec()).await;
        let err = preprocessor(8).preprocess(ImageInput::Url(url)).await;
        match err {
            Err(PreprocessError::FetchFailed { reason, .. }) => assert!(reason.contains("404")),
            other => panic!("unexpected result: {:?}", other.map(|t| t.shape())),
        }
    }

    fn cross_origin_preprocessor() -> Preprocessor {
        let settings = PreprocessSettings {
            target_size: 8,
            ..Default::default()
        };
        let fetch = FetchSettings {
            origin: Some("https://rehome.app".to_string()),
            ..Default::default()
        };
        Preprocessor::new(&settings, &fetch)
    }

    #[tokio::test]
    async fn test_http_cross_origin_without_cors_header() {
        let (url, hits) = serve_http("200 OK", &[("Content-Type", "image/png")], png_bytes(8, 8, [1, 1, 1])).await;
        let err = cross_origin_preprocessor().preprocess(ImageInput::Url(url)).await;
        assert!(matches!(err, Err(PreprocessError::CrossOriginBlocked { .. })));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_http_cross_origin_with_wildcard() {
        let (url, _) = serve_http(
            "200 OK",
            &[("Content-Type", "image/png"), ("Access-Control-Allow-Origin", "*")],
            png_bytes(8, 8, [1, 1, 1]),
        )
        .await;
        let tensor = cross_origin_preprocessor()
            .preprocess(ImageInput::Url(url))
            .await
            .unwrap();
        assert_eq!(tensor.shape(), [8, 8, 3]);
    }

    #[test]
    fn test_zero_target_size_is_rejected() {
        let err = preprocessor(0).preprocess_bytes(&png_bytes(4, 4, [0, 0, 0]));
        assert!(matches!(err, Err(PreprocessError::DecodeFailed(_))));
    }

    #[test]
    fn test_cross_origin_policy() {
        let policy = CrossOriginPolicy::new(
            Some("https://rehome.app/"),
            &["https://cdn.rehome.app".to_string()],
        );
        let same = Url::parse("https://rehome.app/uploads/a.png").unwrap();
        let cdn = Url::parse("https://cdn.rehome.app/a.png").unwrap();
        let other = Url::parse("https://images.example.com/a.png").unwrap();

        assert_eq!(policy.check_request(&same).unwrap(), OriginCheck::Readable);
        assert_eq!(policy.check_request(&cdn).unwrap(), OriginCheck::Readable);
        assert_eq!(policy.check_request(&other).unwrap(), OriginCheck::NeedsCors);

        assert!(policy.check_response(&other, Some("*")).is_ok());
        assert!(policy.check_response(&other, Some("https://rehome.app")).is_ok());
        assert!(matches!(
            policy.check_response(&other, None),
            Err(PreprocessError::CrossOriginBlocked { .. })
        ));
        assert!(policy.check_response(&other, Some("https://evil.example")).is_err());

        let open = CrossOriginPolicy::default();
        assert_eq!(open.check_request(&other).unwrap(), OriginCheck::Readable);
    }

    #[test]
    fn test_tensor_releases_lease() {
        let tracker = TransientTracker::new();
        let pre = preprocessor(8).with_tracker(tracker.clone());
        let tensor = pre.preprocess_bytes(&png_bytes(8, 8, [9, 9, 9])).unwrap();
        assert_eq!(tracker.live_bytes(), tensor.byte_len());
        drop(tensor);
        assert_eq!(tracker.live_bytes(), 0);
    }
}
