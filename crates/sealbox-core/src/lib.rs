//! Sealbox Core - Encrypted File Transfer Library
//!
//! Client-side sealing of file payloads under passphrase-derived keys,
//! plus resumable, integrity-checked transfer of the sealed blobs through
//! an untrusted remote store.

pub mod cipher;
pub mod config;
pub mod download;
pub mod error;
pub mod ident;
pub mod metadata;
pub mod session;
pub mod upload;

// Re-export commonly used types
pub use cipher::{DerivedKey, Passphrase};
pub use config::TransferConfig;
pub use download::{DownloadCoordinator, DownloadReport};
pub use error::TransferError;
pub use ident::{RecordNonce, TransferId};
pub use metadata::{FileMetadata, MetadataResolver};
pub use session::{CancelHandle, TransferPhase, TransferSession};
pub use upload::{UploadCoordinator, UploadReport};
