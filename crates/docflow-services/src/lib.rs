//! Docflow Services Layer
//!
//! External capability services the worker calls while processing a
//! document. Today that is malware scanning through ClamAV; the worker only
//! sees the [`MalwareScanner`] trait.

pub mod services;

#[cfg(feature = "clamav")]
pub use services::ClamAvScanner;
pub use services::{parse_found_signatures, MalwareScanner, ScanError};
