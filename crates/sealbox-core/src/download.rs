//! Download coordination: fetch, verify, and decrypt one record.
//!
//! A download moves through Resolving, Fetching, Verifying, Decrypting,
//! and Complete. An interrupted fetch resumes from the bytes already in
//! hand; a server that cannot serve the requested range forces a restart
//! from zero. Plaintext reaches the destination only after the entire
//! blob authenticates.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::timeout;
use tracing::{info, warn};
use transport_http::{RemoteError, RemoteStore};

use crate::cipher::{self, DerivedKey, Passphrase};
use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::ident::TransferId;
use crate::metadata::MetadataResolver;
use crate::session::{TransferPhase, TransferSession};

const CANCEL_POLL: Duration = Duration::from_millis(200);

/// Outcome of a finished download.
#[derive(Debug)]
pub struct DownloadReport {
    pub transfer_id: TransferId,
    pub filename: String,
    pub plaintext_len: u64,
    pub fetched_len: u64,
    pub attempts: u32,
}

enum FetchFailure {
    Remote(RemoteError),
    Interrupted(std::io::Error),
    Range { want: u64, got: u64 },
    Cancelled,
}

/// Fetches records with byte-range resumption and releases plaintext only
/// after the whole blob verifies.
pub struct DownloadCoordinator {
    remote: Arc<dyn RemoteStore>,
    config: TransferConfig,
    resolver: MetadataResolver,
}

impl DownloadCoordinator {
    pub fn new(remote: Arc<dyn RemoteStore>, config: TransferConfig) -> Result<Self, TransferError> {
        config.validate()?;
        let resolver = MetadataResolver::new(remote.clone(), config.clone());
        Ok(Self {
            remote,
            config,
            resolver,
        })
    }

    /// Resolves `raw_id`, downloads its ciphertext, and writes the decrypted
    /// payload to `dest`. On any error, `dest` is left untouched.
    pub async fn fetch_to_path(
        &self,
        raw_id: &str,
        passphrase: &Passphrase,
        dest: &Path,
        session: &TransferSession,
    ) -> Result<DownloadReport, TransferError> {
        let meta = self.resolver.resolve(raw_id, session).await?;
        if let Some(n) = meta.size_bytes {
            session.set_total(n);
        }

        session.set_phase(TransferPhase::Fetching);
        let (blob, attempts) = self.fetch_ciphertext(&meta.filename, session).await?;
        let fetched_len = blob.len() as u64;

        session.set_phase(TransferPhase::Verifying);
        let nonce = cipher::peek_nonce(&blob)?;
        let pass = passphrase.clone();
        let key = tokio::task::spawn_blocking(move || DerivedKey::derive(&pass, &nonce))
            .await
            .map_err(|e| TransferError::Task(e.to_string()))??;

        session.set_phase(TransferPhase::Decrypting);
        let plaintext = tokio::task::spawn_blocking(move || cipher::open_blob(&key, &blob))
            .await
            .map_err(|e| TransferError::Task(e.to_string()))??;
        let plaintext_len = plaintext.len() as u64;

        session.check_cancelled()?;
        write_atomically(dest, &plaintext).await?;

        session.set_phase(TransferPhase::Complete);
        info!(
            id = %meta.transfer_id,
            dest = %dest.display(),
            bytes = plaintext_len,
            attempts,
            "download complete"
        );
        Ok(DownloadReport {
            transfer_id: meta.transfer_id,
            filename: meta.filename,
            plaintext_len,
            fetched_len,
            attempts,
        })
    }

    /// Accumulates the full ciphertext, resuming from the buffered length
    /// after each interruption. Returns the blob and the attempt count.
    async fn fetch_ciphertext(
        &self,
        filename: &str,
        session: &TransferSession,
    ) -> Result<(Vec<u8>, u32), TransferError> {
        let mut buf: Vec<u8> = Vec::new();
        let mut expected_total: Option<u64> = None;
        let mut failures: u32 = 0;
        loop {
            session.check_cancelled()?;
            let offset = buf.len() as u64;
            let outcome = self
                .fetch_once(filename, offset, &mut buf, &mut expected_total, session)
                .await;
            match outcome {
                Ok(()) => return Ok((buf, failures + 1)),
                Err(FetchFailure::Cancelled) => return Err(TransferError::Cancelled),
                Err(FetchFailure::Remote(RemoteError::NotFound)) => {
                    return Err(TransferError::NotFound(filename.to_string()));
                }
                Err(FetchFailure::Remote(e))
                    if e.is_transient() && failures < self.config.max_retries =>
                {
                    warn!(error = %e, resume_from = buf.len(), "fetch failed; retrying");
                    tokio::time::sleep(self.config.backoff_delay(failures)).await;
                    failures += 1;
                }
                Err(FetchFailure::Remote(e)) => {
                    return Err(TransferError::Transport {
                        attempts: failures + 1,
                        source: e,
                    });
                }
                Err(FetchFailure::Interrupted(e)) if failures < self.config.max_retries => {
                    warn!(error = %e, resume_from = buf.len(), "stream interrupted; resuming");
                    tokio::time::sleep(self.config.backoff_delay(failures)).await;
                    failures += 1;
                }
                Err(FetchFailure::Interrupted(e)) => {
                    return Err(TransferError::Transport {
                        attempts: failures + 1,
                        source: RemoteError::Interrupted(e),
                    });
                }
                Err(FetchFailure::Range { want, got }) if failures < self.config.max_retries => {
                    // Partial data that does not line up with our buffer is
                    // worthless; drop it and take the whole file again.
                    warn!(want, got, "server cannot resume; restarting from zero");
                    buf.clear();
                    session.reset_bytes();
                    tokio::time::sleep(self.config.backoff_delay(failures)).await;
                    failures += 1;
                }
                Err(FetchFailure::Range { want, got }) => {
                    return Err(TransferError::RangeMismatch { want, got });
                }
            }
        }
    }

    async fn fetch_once(
        &self,
        filename: &str,
        offset: u64,
        buf: &mut Vec<u8>,
        expected_total: &mut Option<u64>,
        session: &TransferSession,
    ) -> Result<(), FetchFailure> {
        let fetch = self
            .remote
            .fetch_ciphertext(filename, offset)
            .await
            .map_err(FetchFailure::Remote)?;

        if fetch.start_offset != offset {
            return Err(FetchFailure::Range {
                want: offset,
                got: fetch.start_offset,
            });
        }
        if let Some(total) = fetch.total_len {
            if let Some(prev) = *expected_total {
                // The record is immutable, so its size cannot change
                // between attempts.
                if prev != total {
                    return Err(FetchFailure::Range {
                        want: prev,
                        got: total,
                    });
                }
            }
            *expected_total = Some(total);
            session.set_total(total);
        }

        let mut stream = fetch.stream;
        loop {
            if session.is_cancelled() {
                return Err(FetchFailure::Cancelled);
            }
            // Bounded wait so cancellation also lands on a stalled stream.
            let item = match timeout(CANCEL_POLL, stream.next()).await {
                Err(_) => continue,
                Ok(item) => item,
            };
            match item {
                None => break,
                Some(Ok(bytes)) => {
                    if let Some(total) = *expected_total {
                        if buf.len() as u64 + bytes.len() as u64 > total {
                            return Err(FetchFailure::Remote(RemoteError::InvalidResponse(
                                format!("server sent more than the advertised {total} bytes"),
                            )));
                        }
                    }
                    session.add_bytes(bytes.len() as u64);
                    buf.extend_from_slice(&bytes);
                }
                Some(Err(e)) => return Err(FetchFailure::Interrupted(e)),
            }
        }

        // A clean end of stream short of the advertised total is a drop too.
        if let Some(total) = *expected_total {
            if (buf.len() as u64) < total {
                return Err(FetchFailure::Interrupted(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("stream ended at {} of {total} bytes", buf.len()),
                )));
            }
        }
        Ok(())
    }
}

/// Writes through a `.partial` companion and renames into place, so the
/// destination only ever holds a complete verified payload.
async fn write_atomically(dest: &Path, data: &[u8]) -> Result<(), TransferError> {
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::io(parent, e))?;
        }
    }

    let mut tmp_name = dest.as_os_str().to_os_string();
    tmp_name.push(".partial");
    let tmp = PathBuf::from(tmp_name);

    if let Err(e) = tokio::fs::write(&tmp, data).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(TransferError::io(&tmp, e));
    }
    if let Err(e) = tokio::fs::rename(&tmp, dest).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(TransferError::io(dest, e));
    }
    Ok(())
}
