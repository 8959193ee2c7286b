use ::image::ImageReader;
use serde::Serialize;
use std::io::Cursor;

use crate::error::MetadataError;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    pub kind: &'static str,
    /// Canonical extension of the detected format (`jpg`, `png`, ...)
    pub image_type: Option<String>,
    pub width: u32,
    pub height: u32,
    pub orientation: Option<&'static str>,
    pub aspect_ratio: Option<f64>,
}

/// Read the image header; the pixels are not decoded.
pub fn extract_image(data: &[u8]) -> Result<ImageMetadata, MetadataError> {
    let reader = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(MetadataError::content)?;
    let image_type = reader
        .format()
        .and_then(|f| f.extensions_str().first())
        .map(|ext| ext.to_string());
    let (width, height) = reader.into_dimensions().map_err(MetadataError::content)?;

    let has_area = width > 0 && height > 0;
    Ok(ImageMetadata {
        kind: "image",
        image_type,
        width,
        height,
        orientation: has_area.then(|| if width >= height { "landscape" } else { "portrait" }),
        aspect_ratio: has_area.then(|| f64::from(width) / f64::from(height)),
    })
}
