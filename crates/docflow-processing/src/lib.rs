//! Docflow Processing Library
//!
//! Capability services consumed by the processing worker: per-kind
//! transcoders that recompress clean uploads, the ffmpeg runner behind the
//! video and audio transcoders, and metadata extraction for every kind of
//! document the pipeline accepts.

pub mod error;
pub mod ffmpeg;
pub mod level;
pub mod metadata;
pub mod transcode;

pub use error::{MetadataError, TranscodeError};
pub use ffmpeg::FfmpegRunner;
pub use level::{audio_kbps_from_level, crf_from_level, level_fraction, png_compression_level};
pub use metadata::{DocumentMetadataExtractor, MetadataExtractor};
pub use transcode::{TranscodeOutput, Transcoder, Transcoders};

#[cfg(feature = "audio")]
pub use transcode::AudioTranscoder;
#[cfg(feature = "image")]
pub use transcode::ImageTranscoder;
#[cfg(feature = "video")]
pub use transcode::VideoTranscoder;
