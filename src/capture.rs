//! Append-only raw traffic capture
//!
//! One line per datagram or request: RFC 3339 timestamp, direction, peer and
//! the rendered body.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::{GatewayError, Result};

pub struct CaptureSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl CaptureSink {
    /// Open `path` for appending, creating it if needed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| GatewayError::file_error(path.clone(), e))?;
        Ok(Self { path, file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record(&self, direction: &str, peer: &str, body: &str) -> Result<()> {
        let line = format!("{} {} {} {}\n", Utc::now().to_rfc3339(), direction, peer, body);
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| GatewayError::file_error(self.path.clone(), e))?;
        file.flush().await.map_err(|e| GatewayError::file_error(self.path.clone(), e))
    }
}
