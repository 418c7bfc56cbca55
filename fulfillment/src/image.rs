use ::image::{ImageFormat, codecs::jpeg::JpegEncoder, imageops::FilterType};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::MarketError;
use crate::object_store::ObjectStorage;

pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;
pub const ALLOWED_IMAGE_TYPES: &[&str] = &["image/jpeg", "image/jpg", "image/png", "image/webp"];

#[derive(Debug, Clone, PartialEq)]
pub struct ImageFile {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl ImageFile {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self.content_type.as_str() {
            "image/png" => "png",
            "image/webp" => "webp",
            _ => "jpg",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionOptions {
    pub max_width: u32,
    pub max_height: u32,
    pub quality: u8,
}

impl From<&common::config::CompressionConfig> for CompressionOptions {
    fn from(config: &common::config::CompressionConfig) -> Self {
        Self {
            max_width: config.max_width,
            max_height: config.max_height,
            quality: config.quality,
        }
    }
}

/// Resizes (keeping the aspect ratio) and re-encodes an image.
pub trait Compressor: Send + Sync {
    fn compress(
        &self,
        image: &ImageFile,
        options: &CompressionOptions,
    ) -> Result<ImageFile, String>;
}

/// Downscales to fit the bounds and re-encodes as JPEG.
///
/// A JPEG that re-encoding would not shrink is kept as is.
#[derive(Debug, Clone, Copy, Default)]
pub struct JpegCompressor;

impl Compressor for JpegCompressor {
    fn compress(
        &self,
        image: &ImageFile,
        options: &CompressionOptions,
    ) -> Result<ImageFile, String> {
        let decoded = ::image::load_from_memory(&image.bytes).map_err(|e| e.to_string())?;
        let oversized =
            decoded.width() > options.max_width || decoded.height() > options.max_height;
        let decoded = if oversized {
            decoded.resize(options.max_width, options.max_height, FilterType::Lanczos3)
        } else {
            decoded
        };

        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut bytes, options.quality.clamp(1, 100))
            .encode_image(&decoded.to_rgb8())
            .map_err(|e| e.to_string())?;

        let was_jpeg = matches!(::image::guess_format(&image.bytes), Ok(ImageFormat::Jpeg));
        if was_jpeg && bytes.len() >= image.bytes.len() {
            return Ok(image.clone());
        }

        let stem = image
            .file_name
            .rsplit_once('.')
            .map_or(image.file_name.as_str(), |(stem, _)| stem);
        Ok(ImageFile::new(format!("{}.jpg", stem), "image/jpeg", bytes))
    }
}

#[derive(Debug, Clone)]
pub struct ImagePolicy {
    pub allowed_types: Vec<String>,
    pub max_bytes: usize,
}

impl Default for ImagePolicy {
    fn default() -> Self {
        Self {
            allowed_types: ALLOWED_IMAGE_TYPES.iter().map(|t| t.to_string()).collect(),
            max_bytes: MAX_IMAGE_BYTES,
        }
    }
}

impl ImagePolicy {
    /// Configured limits can lower [`MAX_IMAGE_BYTES`] but never raise it.
    pub fn with_max_bytes(max_bytes: usize) -> Self {
        Self {
            max_bytes: max_bytes.min(MAX_IMAGE_BYTES),
            ..Self::default()
        }
    }

    pub fn validate(&self, image: &ImageFile) -> Result<(), MarketError> {
        let content_type = image.content_type.to_ascii_lowercase();
        if !self.allowed_types.iter().any(|t| *t == content_type) {
            return Err(MarketError::Validation(format!(
                "Unsupported image type {}, expected one of {}",
                image.content_type,
                self.allowed_types.join(", ")
            )));
        }
        if image.bytes.is_empty() {
            return Err(MarketError::Validation("Image is empty".to_string()));
        }
        if image.bytes.len() > self.max_bytes {
            return Err(MarketError::Validation(format!(
                "Image is {} bytes, the limit is {} bytes",
                image.bytes.len(),
                self.max_bytes
            )));
        }
        Ok(())
    }
}

/// `<unix-millis>-<random>.<ext>`
pub fn object_name(image: &ImageFile) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("{}-{}.{}", Utc::now().timestamp_millis(), &random[..12], image.extension())
}

#[derive(Clone)]
pub struct ImagePipeline {
    store: Arc<dyn ObjectStorage>,
    policy: ImagePolicy,
    compression: Option<(Arc<dyn Compressor>, CompressionOptions)>,
}

impl ImagePipeline {
    pub fn new(store: Arc<dyn ObjectStorage>, policy: ImagePolicy) -> Self {
        Self {
            store,
            policy,
            compression: None,
        }
    }

    pub fn with_compressor(
        mut self,
        compressor: Arc<dyn Compressor>,
        options: CompressionOptions,
    ) -> Self {
        self.compression = Some((compressor, options));
        self
    }

    pub fn store(&self) -> &Arc<dyn ObjectStorage> {
        &self.store
    }

    pub fn validate(&self, image: &ImageFile) -> Result<(), MarketError> {
        self.policy.validate(image)
    }

    /// Compressed image, or the original when compression is disabled or fails.
    pub fn prepare(&self, image: ImageFile) -> ImageFile {
        let Some((compressor, options)) = &self.compression else {
            return image;
        };
        match compressor.compress(&image, options) {
            Ok(compressed) => {
                debug!(
                    original = image.bytes.len(),
                    compressed = compressed.bytes.len(),
                    "Compressed image {}",
                    image.file_name
                );
                compressed
            }
            Err(e) => {
                warn!(
                    error = %e,
                    file = %image.file_name,
                    "Image compression failed, uploading original"
                );
                image
            }
        }
    }

    /// Validates, compresses and uploads the image; returns its public URL.
    pub async fn upload(&self, bucket: &str, image: ImageFile) -> Result<String, MarketError> {
        self.validate(&image)?;
        let image = self.prepare(image);
        let path = object_name(&image);

        self.store
            .put(bucket, &path, &image.content_type, image.bytes)
            .await?;

        let url = self.store.public_url(bucket, &path);
        info!(bucket, path = %path, "Uploaded image");
        Ok(url)
    }

    /// Uploads the new image, then removes the old one best-effort.
    pub async fn replace(
        &self,
        bucket: &str,
        image: ImageFile,
        old_url: Option<&str>,
    ) -> Result<String, MarketError> {
        let url = self.upload(bucket, image).await?;

        if let Some(old_url) = old_url {
            if let Err(e) = self.delete_by_url(bucket, old_url).await {
                warn!(error = %e, old_url, "Failed to delete replaced image");
            }
        }

        Ok(url)
    }

    /// Returns `false` when the object was already gone.
    pub async fn delete_by_url(&self, bucket: &str, url: &str) -> Result<bool, MarketError> {
        let path = self.store.object_path(bucket, url)?;
        let deleted = self.store.delete(bucket, &path).await?;
        debug!(bucket, path = %path, deleted, "Deleted image");
        Ok(deleted)
    }
}
