//! Upload coordination: seal a local file and push it to the remote store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::channel::mpsc;
use futures::SinkExt;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use transport_http::{NewRecord, RemoteStore};

use crate::cipher::{sealed_len, BlobSealer, DerivedKey, Passphrase};
use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::ident::{RecordNonce, TransferId};
use crate::session::{TransferPhase, TransferSession};

const CANCEL_POLL: Duration = Duration::from_millis(200);

/// Outcome of a finished upload.
#[derive(Debug)]
pub struct UploadReport {
    pub transfer_id: TransferId,
    pub nonce: RecordNonce,
    pub plaintext_len: u64,
    pub sealed_len: u64,
    pub attempts: u32,
}

struct Credentials {
    id: TransferId,
    nonce: RecordNonce,
    key: DerivedKey,
}

/// Seals files under passphrase-derived keys and pushes them as single
/// logical requests, retrying transient failures from the start of the file.
pub struct UploadCoordinator {
    remote: Arc<dyn RemoteStore>,
    config: TransferConfig,
}

impl UploadCoordinator {
    pub fn new(remote: Arc<dyn RemoteStore>, config: TransferConfig) -> Result<Self, TransferError> {
        config.validate()?;
        Ok(Self { remote, config })
    }

    /// Seals `source` and uploads it. Returns the transfer ID the record is
    /// stored under; on any error, no usable record was created.
    pub async fn push_file(
        &self,
        source: &Path,
        passphrase: &Passphrase,
        session: &TransferSession,
    ) -> Result<UploadReport, TransferError> {
        let meta = tokio::fs::metadata(source)
            .await
            .map_err(|e| TransferError::io(source, e))?;
        if !meta.is_file() {
            return Err(TransferError::validation("source", "not a regular file"));
        }
        let plaintext_len = meta.len();
        let filename = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransferError::validation("source", "file name is not valid UTF-8"))?
            .to_string();
        let mime_type = guess_mime(&filename);
        session.set_total(plaintext_len);

        let mut creds: Option<Credentials> = None;
        let mut failures: u32 = 0;
        loop {
            session.check_cancelled()?;
            session.reset_bytes();

            let current = match creds.take() {
                Some(c) => c,
                None => fresh_credentials(passphrase).await?,
            };

            // Each attempt re-reads the file from the start; sealed frames
            // from a broken attempt are never spliced into a new one.
            session.set_phase(TransferPhase::Sealing);
            let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(4);
            let producer = tokio::spawn(produce_blob(
                source.to_path_buf(),
                BlobSealer::new(&current.key, current.nonce.clone()),
                self.config.chunk_size,
                session.clone(),
                tx,
            ));

            let record = NewRecord {
                transfer_id: current.id.to_string(),
                nonce_hex: current.nonce.to_string(),
                filename: filename.clone(),
                mime_type: mime_type.to_string(),
            };

            session.set_phase(TransferPhase::Uploading);
            debug!(id = %current.id, attempt = failures + 1, "upload attempt");
            let mut request = self.remote.put_record(&record, Box::pin(rx));
            let pushed = loop {
                if session.is_cancelled() {
                    break None;
                }
                // Bounded wait so a cancel lands even while the transport
                // stalls mid-request.
                match timeout(CANCEL_POLL, &mut request).await {
                    Ok(outcome) => break Some(outcome),
                    Err(_) => continue,
                }
            };
            // Dropping an unfinished request drops the body stream with it,
            // which unparks a producer blocked on a full channel.
            drop(request);

            // The producer saw the source bytes; its verdict outranks
            // whatever the request side made of the truncated stream.
            match producer.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(TransferError::Task(e.to_string())),
            }

            let pushed = match pushed {
                Some(outcome) => outcome,
                None => return Err(TransferError::Cancelled),
            };

            match pushed {
                Ok(acked) => {
                    let want = current.id.to_string();
                    if acked != want {
                        return Err(TransferError::AckMismatch { want, got: acked });
                    }
                    session.set_phase(TransferPhase::Complete);
                    info!(
                        id = %want,
                        bytes = plaintext_len,
                        attempts = failures + 1,
                        "upload complete"
                    );
                    return Ok(UploadReport {
                        transfer_id: current.id,
                        nonce: current.nonce,
                        plaintext_len,
                        sealed_len: sealed_len(plaintext_len, self.config.chunk_size)?,
                        attempts: failures + 1,
                    });
                }
                Err(e) if e.is_transient() && failures < self.config.max_retries => {
                    // A connect failure cannot have delivered any bytes, so
                    // the id and nonce are still unused. After anything else
                    // the pair counts as burned and a fresh one is minted.
                    let reuse = e.is_connect();
                    warn!(
                        error = %e,
                        attempt = failures + 1,
                        reuse_credentials = reuse,
                        "upload failed; retrying"
                    );
                    if reuse {
                        creds = Some(current);
                    }
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

async fn fresh_credentials(passphrase: &Passphrase) -> Result<Credentials, TransferError> {
    let id = TransferId::generate()?;
    let nonce = RecordNonce::generate()?;
    let pass = passphrase.clone();
    let salt = nonce.clone();
    let key = tokio::task::spawn_blocking(move || DerivedKey::derive(&pass, &salt))
        .await
        .map_err(|e| TransferError::Task(e.to_string()))??;
    debug!(id = %id, "minted transfer credentials");
    Ok(Credentials { id, nonce, key })
}

/// Reads the source file chunk by chunk, seals each chunk, and feeds the
/// frames into the request body. A dropped receiver means the request side
/// already failed with the authoritative error, so sends stop quietly.
async fn produce_blob(
    path: PathBuf,
    mut sealer: BlobSealer,
    chunk_size: usize,
    session: TransferSession,
    mut tx: mpsc::Sender<std::io::Result<Bytes>>,
) -> Result<(), TransferError> {
    let mut file = File::open(&path)
        .await
        .map_err(|e| TransferError::io(&path, e))?;
    if tx.send(Ok(Bytes::from(sealer.header()))).await.is_err() {
        return Ok(());
    }

    let mut buf = vec![0u8; chunk_size];
    loop {
        session.check_cancelled()?;
        // Fill the whole chunk so every frame but the last is exactly
        // chunk_size, keeping the sealed length independent of how the
        // reads happen to split.
        let mut filled = 0;
        while filled < buf.len() {
            let n = file
                .read(&mut buf[filled..])
                .await
                .map_err(|e| TransferError::io(&path, e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        let frame = sealer.seal_chunk(&buf[..filled])?;
        session.add_bytes(filled as u64);
        if tx.send(Ok(Bytes::from(frame))).await.is_err() {
            return Ok(());
        }
    }

    let end = sealer.finish()?;
    if tx.send(Ok(Bytes::from(end))).await.is_err() {
        return Ok(());
    }
    Ok(())
}

/// Best-effort content type from the file extension. The server treats the
/// body as opaque bytes either way.
fn guess_mime(filename: &str) -> &'static str {
    let ext = filename.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt") => "text/plain",
        Some("md") => "text/markdown",
        Some("html") | Some("htm") => "text/html",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        Some("tar") => "application/x-tar",
        Some("mp3") => "audio/mpeg",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_guesses_follow_the_extension() {
        assert_eq!(guess_mime("notes.txt"), "text/plain");
        assert_eq!(guess_mime("photo.JPG"), "image/jpeg");
        assert_eq!(guess_mime("archive.tar"), "application/x-tar");
        assert_eq!(guess_mime("no_extension"), "application/octet-stream");
        assert_eq!(guess_mime("weird.xyz"), "application/octet-stream");
    }
}
