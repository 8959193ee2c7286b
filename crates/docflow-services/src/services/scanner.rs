//! Malware scanner contract.

use async_trait::async_trait;
use docflow_core::models::ScanResult;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    /// No scanner could be reached or started
    #[error("Malware scanner unavailable: {0}")]
    Unavailable(String),

    #[error("Malware scan timed out after {0} ms")]
    Timeout(u64),

    /// The scanner ran but reported an error or an unreadable answer
    #[error("Malware scanner error: {0}")]
    Scanner(String),

    #[error("IO error during scan: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait MalwareScanner: Send + Sync {
    /// Scan a buffer. `filename` is only used for temp-file naming and logs.
    async fn scan(&self, data: &[u8], filename: &str) -> Result<ScanResult, ScanError>;
}

/// Extract signature names from `… <signature> FOUND` lines.
///
/// Handles both the clamd reply (`stream: Eicar-Signature FOUND`) and the
/// per-file output of the command-line scanners (`/tmp/x: Eicar FOUND`).
pub fn parse_found_signatures(output: &str) -> Vec<String> {
    output
        .split(['\n', '\0'])
        .filter_map(|line| {
            let line = line.trim().strip_suffix("FOUND")?.trim_end();
            let signature = match line.rsplit_once(": ") {
                Some((_, signature)) => signature,
                None => line,
            };
            let signature = signature.trim();
            (!signature.is_empty()).then(|| signature.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clamd_reply() {
        assert_eq!(
            parse_found_signatures("stream: Win.Test.EICAR_HDB-1 FOUND\0"),
            vec!["Win.Test.EICAR_HDB-1".to_string()]
        );
    }

    #[test]
    fn parses_command_line_output_with_colons_in_path() {
        let out = "/tmp/docflow-scan-a:b.pdf: Eicar-Signature FOUND\n/tmp/other: OK\n";
        assert_eq!(parse_found_signatures(out), vec!["Eicar-Signature".to_string()]);
    }

    #[test]
    fn clean_output_has_no_signatures() {
        assert!(parse_found_signatures("stream: OK\0").is_empty());
        assert!(parse_found_signatures("").is_empty());
    }
}
