use async_trait::async_trait;
use clamav_client::{clean, Tcp};
use docflow_core::models::ScanResult;
use docflow_core::{ClamAvConfig, ScannerPreference};
use std::path::Path;
use std::process::Stdio;
use std::str;
use std::time::{Duration, Instant};
use tokio::process::Command;

use super::scanner::{parse_found_signatures, MalwareScanner, ScanError};

/// ClamAV scanner.
///
/// With the `clamdscan` preference the clamd daemon is asked first (unix
/// socket when configured, TCP otherwise); when it cannot be reached the
/// command-line scanners are tried. With `clamscan` only the local binary is
/// used. When nothing is available the result depends on `fail_closed`.
#[derive(Clone)]
pub struct ClamAvScanner {
    config: ClamAvConfig,
}

impl ClamAvScanner {
    pub fn new(config: ClamAvConfig) -> Self {
        Self { config }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    fn binaries(&self) -> Vec<&str> {
        match self.config.preference {
            ScannerPreference::Clamdscan => vec![
                self.config.clamdscan_path.as_str(),
                self.config.clamscan_path.as_str(),
            ],
            ScannerPreference::Clamscan => vec![self.config.clamscan_path.as_str()],
        }
    }

    /// Scan through the clamd protocol. Uses the sync client inside
    /// spawn_blocking since its futures are not Send.
    async fn scan_daemon(&self, data: &[u8]) -> Result<ScanResult, ScanError> {
        let start = Instant::now();
        let data = data.to_vec();
        let socket = self.config.socket.clone();
        let address = format!("{}:{}", self.config.host, self.config.port);

        tracing::debug!(socket = ?socket, address = %address, "Starting clamd scan");

        let result = tokio::time::timeout(
            self.timeout(),
            tokio::task::spawn_blocking(move || match socket {
                #[cfg(unix)]
                Some(socket_path) => clamav_client::scan_buffer(
                    data.as_slice(),
                    clamav_client::Socket {
                        socket_path: socket_path.as_str(),
                    },
                    None,
                ),
                #[cfg(not(unix))]
                Some(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "unix sockets are not supported on this platform",
                )),
                None => clamav_client::scan_buffer(
                    data.as_slice(),
                    Tcp {
                        host_address: address.as_str(),
                    },
                    None,
                ),
            }),
        )
        .await;

        let response = match result {
            Ok(Ok(Ok(response))) => response,
            Ok(Ok(Err(e))) => return Err(ScanError::Unavailable(format!("clamd: {}", e))),
            Ok(Err(e)) => return Err(ScanError::Scanner(format!("clamd scan task failed: {}", e))),
            Err(_) => return Err(ScanError::Timeout(self.config.timeout_ms)),
        };

        let is_clean = clean(&response)
            .map_err(|e| ScanError::Scanner(format!("Failed to parse clamd response: {}", e)))?;
        if is_clean {
            tracing::info!(
                duration_ms = start.elapsed().as_millis() as u64,
                "File scan completed: clean"
            );
            return Ok(ScanResult::clean());
        }

        let reply = str::from_utf8(&response).unwrap_or_default();
        let mut viruses = parse_found_signatures(reply);
        if viruses.is_empty() {
            viruses.push("unknown".to_string());
        }
        tracing::warn!(
            duration_ms = start.elapsed().as_millis() as u64,
            viruses = ?viruses,
            "File scan detected malware"
        );
        Ok(ScanResult::infected(viruses))
    }

    /// Scan with a command-line scanner; exit code 0 is clean, 1 infected.
    async fn scan_binary(
        &self,
        binary: &str,
        data: &[u8],
        filename: &str,
    ) -> Result<ScanResult, ScanError> {
        let start = Instant::now();
        let suffix = Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{}", ext))
            .unwrap_or_default();
        let file = tempfile::Builder::new()
            .prefix("docflow-scan-")
            .suffix(&suffix)
            .tempfile()?;
        tokio::fs::write(file.path(), data).await?;

        let child = Command::new(binary)
            .arg("--no-summary")
            .arg(file.path())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ScanError::Unavailable(format!("{}: {}", binary, e)))?;

        let output = tokio::time::timeout(self.timeout(), child.wait_with_output())
            .await
            .map_err(|_| ScanError::Timeout(self.config.timeout_ms))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        match output.status.code() {
            Some(0) => {
                tracing::info!(
                    scanner = %binary,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "File scan completed: clean"
                );
                Ok(ScanResult::clean())
            }
            Some(1) => {
                let mut viruses = parse_found_signatures(&stdout);
                if viruses.is_empty() {
                    viruses.push("unknown".to_string());
                }
                tracing::warn!(
                    scanner = %binary,
                    duration_ms = start.elapsed().as_millis() as u64,
                    viruses = ?viruses,
                    "File scan detected malware"
                );
                Ok(ScanResult::infected(viruses))
            }
            code => Err(ScanError::Scanner(format!(
                "{} exited with {:?}: {}",
                binary,
                code,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }

    async fn scan_with_fallback(&self, data: &[u8], filename: &str) -> Result<ScanResult, ScanError> {
        if self.config.preference == ScannerPreference::Clamdscan {
            match self.scan_daemon(data).await {
                Err(ScanError::Unavailable(reason)) => {
                    tracing::warn!(reason = %reason, "clamd unreachable, trying local scanners");
                }
                other => return other,
            }
        }

        let mut last_error = ScanError::Unavailable("no scanner configured".to_string());
        for binary in self.binaries() {
            match self.scan_binary(binary, data, filename).await {
                Err(ScanError::Unavailable(reason)) => {
                    tracing::warn!(scanner = %binary, reason = %reason, "Scanner binary unavailable");
                    last_error = ScanError::Unavailable(reason);
                }
                other => return other,
            }
        }
        Err(last_error)
    }
}

#[async_trait]
impl MalwareScanner for ClamAvScanner {
    #[tracing::instrument(skip(self, data), fields(size_bytes = data.len()))]
    async fn scan(&self, data: &[u8], filename: &str) -> Result<ScanResult, ScanError> {
        match self.scan_with_fallback(data, filename).await {
            Ok(result) => Ok(result),
            Err(e) if self.config.fail_closed => {
                tracing::error!(error = %e, "Malware scan failed");
                Err(e)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Malware scan failed, continuing (fail-open)");
                Ok(ScanResult::clean())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config(fail_closed: bool) -> ClamAvConfig {
        ClamAvConfig {
            socket: None,
            host: "127.0.0.1".to_string(),
            port: 1,
            timeout_ms: 5_000,
            clamdscan_path: "/nonexistent/clamdscan".to_string(),
            clamscan_path: "/nonexistent/clamscan".to_string(),
            preference: ScannerPreference::Clamdscan,
            fail_closed,
        }
    }

    #[tokio::test]
    async fn unavailable_scanner_fails_closed() {
        let scanner = ClamAvScanner::new(unreachable_config(true));
        let err = scanner.scan(b"hello", "a.txt").await.unwrap_err();
        assert!(matches!(err, ScanError::Unavailable(_)));
    }

    #[tokio::test]
    async fn unavailable_scanner_fails_open_when_configured() {
        let scanner = ClamAvScanner::new(unreachable_config(false));
        let result = scanner.scan(b"hello", "a.txt").await.unwrap();
        assert!(!result.is_infected);
        assert!(result.viruses.is_empty());
    }

    #[test]
    fn clamscan_preference_skips_daemon_binary() {
        let mut config = unreachable_config(true);
        config.preference = ScannerPreference::Clamscan;
        let scanner = ClamAvScanner::new(config);
        assert_eq!(scanner.binaries(), vec!["/nonexistent/clamscan"]);
    }
}
