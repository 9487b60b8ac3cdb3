//! Delivery of formatted batches to the collection server.
//!
//! A [`Transport`] write either succeeds (the server has the bytes) or
//! fails; the coordinator commits rows only after success. Destination
//! paths are unique per batch so a retried upload never overwrites a
//! different batch.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tether_core::{Category, Config, DeviceTag, OwnerId, TableName, TransportConfig};

use crate::error::TransportError;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `bytes` to `path` under `category`.
    async fn write(
        &self,
        category: Category,
        path: &str,
        bytes: Vec<u8>,
    ) -> Result<(), TransportError>;
}

/// `<owner>/<device>/<table>/<table>_<yyyyMMdd-HHmmss-SSS>_<seq>.txt`
pub fn destination_path(
    owner: &OwnerId,
    device: &DeviceTag,
    table: &TableName,
    upload_time: DateTime<Utc>,
    seq: u64,
) -> String {
    let table = sanitize(&table.0);
    format!(
        "{}/{}/{table}/{table}_{}_{seq}.txt",
        sanitize(&owner.0),
        sanitize(&device.0),
        upload_time.format("%Y%m%d-%H%M%S-%3f"),
    )
}

/// Path components may not escape their directory.
fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Build the transport named by the config.
pub fn transport_for(config: &Config) -> Arc<dyn Transport> {
    match &config.transport {
        TransportConfig::Spool { dir } => Arc::new(SpoolTransport::new(dir)),
        TransportConfig::Http { endpoint } => {
            Arc::new(HttpTransport::new(endpoint, config.write_timeout()))
        }
    }
}

// ---------------------------------------------------------------------------
// Spool directory
// ---------------------------------------------------------------------------

/// Writes batches under `<dir>/<category>/<path>`, for a separate uploader
/// or for inspection.
#[derive(Debug, Clone)]
pub struct SpoolTransport {
    dir: PathBuf,
}

impl SpoolTransport {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl Transport for SpoolTransport {
    async fn write(
        &self,
        category: Category,
        path: &str,
        bytes: Vec<u8>,
    ) -> Result<(), TransportError> {
        let target = self.dir.join(category.to_string()).join(path);
        tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
            .await
            .map_err(|e| TransportError::Network {
                path: path.to_string(),
                message: format!("spool task failed: {e}"),
            })?
    }
}

/// `.tmp` sibling then rename, so a reader never sees a partial batch.
fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), TransportError> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let tmp = target.with_extension("txt.tmp");
    std::fs::write(&tmp, bytes).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, target).map_err(|e| io_err(target, e))?;
    tracing::debug!(path = %target.display(), bytes = bytes.len(), "spooled batch");
    Ok(())
}

fn io_err(path: &Path, source: std::io::Error) -> TransportError {
    TransportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// `PUT {endpoint}/{category}/{path}` with the batch as the body.
#[derive(Clone)]
pub struct HttpTransport {
    endpoint: String,
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    pub fn url(&self, category: Category, path: &str) -> String {
        format!("{}/{category}/{path}", self.endpoint)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn write(
        &self,
        category: Category,
        path: &str,
        bytes: Vec<u8>,
    ) -> Result<(), TransportError> {
        let url = self.url(category, path);
        let agent = self.agent.clone();
        let owned_path = path.to_string();
        tokio::task::spawn_blocking(move || {
            match agent
                .put(&url)
                .set("Content-Type", "text/plain; charset=utf-8")
                .send_bytes(&bytes)
            {
                Ok(_) => Ok(()),
                Err(ureq::Error::Status(status, _)) => Err(TransportError::Rejected {
                    path: owned_path,
                    status,
                }),
                Err(ureq::Error::Transport(t)) => Err(TransportError::Network {
                    path: owned_path,
                    message: t.to_string(),
                }),
            }
        })
        .await
        .map_err(|e| TransportError::Network {
            path: path.to_string(),
            message: format!("upload task failed: {e}"),
        })?
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tempfile::TempDir;

    use super::*;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap() + chrono::Duration::milliseconds(42)
    }

    #[test]
    fn destination_path_layout() {
        let path = destination_path(
            &OwnerId::from("P1"),
            &DeviceTag::from("phone"),
            &TableName::from("gps"),
            at(),
            3,
        );
        assert_eq!(path, "P1/phone/gps/gps_20240309-140507-042_3.txt");
    }

    #[test]
    fn destination_path_neutralises_separators() {
        let path = destination_path(
            &OwnerId::from("../etc"),
            &DeviceTag::from("left wrist"),
            &TableName::from("gps"),
            at(),
            0,
        );
        assert!(path.starts_with(".._etc/left_wrist/"), "got {path}");
        assert_eq!(sanitize(".."), "_");
    }

    #[tokio::test]
    async fn spool_writes_under_category() {
        let dir = TempDir::new().expect("tempdir");
        let spool = SpoolTransport::new(dir.path());
        spool
            .write(Category::Config, "P1/phone/profile/x.txt", b"hello\n".to_vec())
            .await
            .expect("write");
        let written = dir.path().join("config/P1/phone/profile/x.txt");
        assert_eq!(std::fs::read_to_string(&written).expect("read"), "hello\n");
        assert!(!written.with_extension("txt.tmp").exists());
    }

    #[test]
    fn http_url_joins_category_and_path() {
        let http = HttpTransport::new("https://collector.example/upload/", Duration::from_secs(1));
        assert_eq!(
            http.url(Category::Data, "P1/phone/gps/a.txt"),
            "https://collector.example/upload/data/P1/phone/gps/a.txt"
        );
    }

    #[tokio::test]
    async fn http_connection_failure_is_network_error() {
        // Port 9 on loopback is discard; nothing listens there in CI.
        let http = HttpTransport::new("http://127.0.0.1:9", Duration::from_millis(500));
        let err = http
            .write(Category::Data, "a.txt", b"x".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Network { .. }), "got {err:?}");
    }
}
