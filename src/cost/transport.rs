use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::config::TransportConfig;
use crate::error::{ProxyError, Result};

use super::UsageRecord;

/// Destination for completed usage records. Implementations are best-effort;
/// the pipeline never fails a request over a transport error.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, record: &UsageRecord) -> Result<()>;
}

/// Appends one JSON line per record.
pub struct FileTransport {
    path: PathBuf,
}

impl FileTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Transport for FileTransport {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn send(&self, record: &UsageRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        Ok(())
    }
}

/// Emits records to the structured log, for deployments that scrape logs
/// instead of files.
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, record: &UsageRecord) -> Result<()> {
        tracing::info!(
            provider = %record.provider,
            model = %record.model,
            user_id = %record.user_id,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            total_tokens = record.total_tokens,
            cost_total = record.cost_total,
            "usage record"
        );
        Ok(())
    }
}

pub fn create_transport(config: &TransportConfig) -> Result<Arc<dyn Transport>> {
    match config.kind.as_str() {
        "file" => {
            let file = config.file.as_ref().ok_or_else(|| {
                ProxyError::Config("file transport requires a file.path".to_string())
            })?;
            Ok(Arc::new(FileTransport::new(&file.path)))
        }
        "log" => Ok(Arc::new(LogTransport)),
        other => Err(ProxyError::Config(format!(
            "unsupported transport type: {other}"
        ))),
    }
}
