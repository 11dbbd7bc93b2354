//! 快照上传

use async_trait::async_trait;
use log::{debug, error, info};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::error::UploadError;

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub mime: &'static str,
}

impl EncodedImage {
    pub fn jpeg(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            mime: "image/jpeg",
        }
    }

    /// 识别用户直接上传的图片；非图片数据返回 `UnsupportedImage`
    pub fn sniff(bytes: Vec<u8>) -> Result<Self, UploadError> {
        let mime = match image::guess_format(&bytes) {
            Ok(image::ImageFormat::Jpeg) => "image/jpeg",
            Ok(image::ImageFormat::Png) => "image/png",
            Ok(image::ImageFormat::Bmp) => "image/bmp",
            Ok(image::ImageFormat::Gif) => "image/gif",
            Ok(image::ImageFormat::WebP) => "image/webp",
            _ => return Err(UploadError::UnsupportedImage),
        };
        Ok(Self { bytes, mime })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResult {
    pub url: String,
}

/// Accepts encoded image bytes and returns a stable URL. No retry contract:
/// callers decide what a failure means.
#[async_trait]
pub trait SnapshotUploader: Send + Sync {
    async fn upload(
        &self,
        image: &EncodedImage,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<UploadResult, UploadError>;
}

/// 向预先申请好的上传地址发送图片字节，响应体为 `{ "url": "..." }`
pub struct HttpSnapshotUploader {
    client: Client,
    endpoint: String,
}

impl HttpSnapshotUploader {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, UploadError> {
        let client = Client::builder()
            .user_agent(concat!("snapshot_lib/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client, endpoint))
    }

    pub fn with_client(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl SnapshotUploader for HttpSnapshotUploader {
    async fn upload(
        &self,
        image: &EncodedImage,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<UploadResult, UploadError> {
        debug!("📤 uploading {} bytes ({}) to {}", image.len(), image.mime, self.endpoint);
        progress(0.0);

        let resp = self
            .client
            .put(&self.endpoint)
            .header(CONTENT_TYPE, image.mime)
            .body(image.bytes.clone())
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!("❌ upload rejected: {} {}", status.as_u16(), body);
            return Err(UploadError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let result: UploadResult = resp
            .json()
            .await
            .map_err(|e| UploadError::InvalidResponse(e.to_string()))?;
        if result.url.trim().is_empty() {
            return Err(UploadError::InvalidResponse("empty url".into()));
        }

        progress(1.0);
        info!("✅ snapshot uploaded: {}", result.url);
        Ok(result)
    }
}
