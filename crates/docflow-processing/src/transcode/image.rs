use ::image::codecs::png::{CompressionType, FilterType, PngEncoder};
use ::image::{DynamicImage, GenericImageView, ImageFormat};
use async_trait::async_trait;
use bytes::Bytes;
use docflow_core::models::{Document, MediaKind};
use serde_json::{json, Value};
use std::time::Instant;

use super::{TranscodeOutput, Transcoder};
use crate::error::TranscodeError;
use crate::level::{clamp_level, png_compression_level};

/// Formats the image transcoder re-encodes in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetFormat {
    Jpeg,
    Png,
    WebP,
}

impl TargetFormat {
    fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(TargetFormat::Jpeg),
            "image/png" => Some(TargetFormat::Png),
            "image/webp" => Some(TargetFormat::WebP),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            TargetFormat::Jpeg => "jpeg",
            TargetFormat::Png => "png",
            TargetFormat::WebP => "webp",
        }
    }

    fn image_format(self) -> ImageFormat {
        match self {
            TargetFormat::Jpeg => ImageFormat::Jpeg,
            TargetFormat::Png => ImageFormat::Png,
            TargetFormat::WebP => ImageFormat::WebP,
        }
    }
}

/// Re-encodes JPEG (mozjpeg), PNG and WebP images at the requested level.
/// Other image types pass through unchanged.
#[derive(Debug, Clone, Default)]
pub struct ImageTranscoder;

impl ImageTranscoder {
    pub fn new() -> Self {
        Self
    }

    fn encode(
        data: &[u8],
        format: TargetFormat,
        level: u8,
    ) -> Result<(Vec<u8>, Value), TranscodeError> {
        let img = ::image::load_from_memory_with_format(data, format.image_format())
            .map_err(|e| TranscodeError::Image(format!("failed to decode {}: {}", format.as_str(), e)))?;

        match format {
            TargetFormat::Jpeg => {
                let out = Self::compress_jpeg(&img, level)?;
                Ok((out, json!({ "quality": level })))
            }
            TargetFormat::WebP => {
                let out = Self::compress_webp(&img, level);
                Ok((out, json!({ "quality": level })))
            }
            TargetFormat::Png => {
                let compression_level = png_compression_level(level);
                let out = Self::compress_png(&img, compression_level)?;
                Ok((out, json!({ "compressionLevel": compression_level })))
            }
        }
    }

    /// Compress to JPEG using mozjpeg
    fn compress_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, TranscodeError> {
        let rgb_img = img.to_rgb8();
        let (width, height) = rgb_img.dimensions();

        let mut comp = mozjpeg::Compress::new(mozjpeg::ColorSpace::JCS_RGB);
        comp.set_size(width as usize, height as usize);
        comp.set_quality(quality as f32);
        comp.set_progressive_mode();
        comp.set_optimize_coding(true);

        let jpeg_error = |e: std::io::Error| TranscodeError::Image(format!("jpeg encoding failed: {}", e));
        let mut comp = comp.start_compress(Vec::new()).map_err(jpeg_error)?;
        comp.write_scanlines(&rgb_img).map_err(jpeg_error)?;
        comp.finish().map_err(jpeg_error)
    }

    /// Lossless; the level only trades encoding effort for size.
    fn compress_png(img: &DynamicImage, compression_level: u8) -> Result<Vec<u8>, TranscodeError> {
        let compression = match compression_level {
            0..=2 => CompressionType::Fast,
            3..=6 => CompressionType::Default,
            _ => CompressionType::Best,
        };

        let mut buffer = Vec::new();
        let encoder = PngEncoder::new_with_quality(&mut buffer, compression, FilterType::Adaptive);
        img.write_with_encoder(encoder)
            .map_err(|e| TranscodeError::Image(format!("png encoding failed: {}", e)))?;
        Ok(buffer)
    }

    fn compress_webp(img: &DynamicImage, quality: u8) -> Vec<u8> {
        let (width, height) = img.dimensions();
        let rgba_img = img.to_rgba8();
        let encoder = webp::Encoder::from_rgba(&rgba_img, width, height);
        encoder.encode(quality as f32).to_vec()
    }
}

#[async_trait]
impl Transcoder for ImageTranscoder {
    fn kind(&self) -> MediaKind {
        MediaKind::Image
    }

    #[tracing::instrument(skip(self, document, data), fields(document_id = %document.id, size_bytes = data.len()))]
    async fn transcode(
        &self,
        document: &Document,
        data: Bytes,
        level: u8,
    ) -> Result<TranscodeOutput, TranscodeError> {
        let Some(format) = TargetFormat::from_mime(&document.mime()) else {
            tracing::debug!(mime_type = %document.mime(), "Image type not recompressed");
            return Ok(TranscodeOutput::skipped("unsupported_mime"));
        };

        let level = clamp_level(level);
        let start = Instant::now();
        let original_size = data.len();

        let (encoded, params) = tokio::task::spawn_blocking(move || Self::encode(&data, format, level))
            .await
            .map_err(|e| TranscodeError::Task(e.to_string()))??;

        let mut compression = json!({
            "level": level,
            "format": format.as_str(),
            "originalSize": original_size,
            "outputSize": encoded.len(),
        });
        docflow_core::merge_metadata(&mut compression, params);

        tracing::info!(
            format = format.as_str(),
            level = level,
            original_size = original_size,
            output_size = encoded.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Image recompressed"
        );

        Ok(TranscodeOutput::Rewritten {
            bytes: Bytes::from(encoded),
            processing: json!({ "compression": compression }),
        })
    }
}
