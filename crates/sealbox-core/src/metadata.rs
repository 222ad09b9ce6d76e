//! Transfer ID to record metadata resolution.

use std::sync::Arc;

use tracing::{debug, warn};
use transport_http::{RemoteError, RemoteStore};

use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::ident::TransferId;
use crate::session::{TransferPhase, TransferSession};

/// What the remote store knows about one record.
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub transfer_id: TransferId,
    pub filename: String,
    pub size_bytes: Option<u64>,
    pub mime_type: Option<String>,
}

/// Turns a raw transfer ID into record metadata. The ID is validated
/// locally first; a malformed one never generates network traffic.
pub struct MetadataResolver {
    remote: Arc<dyn RemoteStore>,
    config: TransferConfig,
}

impl MetadataResolver {
    pub fn new(remote: Arc<dyn RemoteStore>, config: TransferConfig) -> Self {
        Self { remote, config }
    }

    pub async fn resolve(
        &self,
        raw_id: &str,
        session: &TransferSession,
    ) -> Result<FileMetadata, TransferError> {
        let id = TransferId::parse(raw_id)?;
        session.set_phase(TransferPhase::Resolving);

        let mut failures: u32 = 0;
        loop {
            session.check_cancelled()?;
            match self.remote.fetch_metadata(&id.to_string()).await {
                Ok(meta) => {
                    debug!(id = %id, filename = %meta.filename, "resolved record");
                    return Ok(FileMetadata {
                        transfer_id: id,
                        filename: meta.filename,
                        size_bytes: meta.size_bytes,
                        mime_type: meta.mime_type,
                    });
                }
                Err(RemoteError::NotFound) => {
                    return Err(TransferError::NotFound(id.to_string()));
                }
                Err(e) if e.is_transient() && failures < self.config.max_retries => {
                    warn!(id = %id, error = %e, "metadata lookup failed; retrying");
                    tokio::time::sleep(self.config.backoff_delay(failures)).await;
                    failures += 1;
                }
                Err(e) => {
                    return Err(TransferError::Transport {
                        attempts: failures + 1,
                        source: e,
                    });
                }
            }
        }
    }
}
