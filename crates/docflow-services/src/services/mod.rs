#[cfg(feature = "clamav")]
pub mod clamav;
pub mod scanner;

#[cfg(feature = "clamav")]
pub use clamav::ClamAvScanner;
pub use scanner::{parse_found_signatures, MalwareScanner, ScanError};
