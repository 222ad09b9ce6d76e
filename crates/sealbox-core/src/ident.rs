//! Random transfer identifiers and record nonces.
//!
//! Both are 128-bit values drawn from the OS CSPRNG, wide enough that
//! collisions are not a practical concern even across many uploads.

use std::fmt;

use rand_core::{OsRng, RngCore};

use crate::error::TransferError;

pub const ID_BYTES: usize = 16;

fn fill_random(buf: &mut [u8]) -> Result<(), TransferError> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| TransferError::EntropyUnavailable(e.to_string()))
}

/// Public name of one stored record, hex-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferId([u8; ID_BYTES]);

impl TransferId {
    pub fn generate() -> Result<Self, TransferError> {
        let mut bytes = [0u8; ID_BYTES];
        fill_random(&mut bytes)?;
        Ok(Self(bytes))
    }

    /// Parses a user- or wire-supplied identifier. Exactly 32 hex characters;
    /// anything else is rejected before it can reach the network.
    pub fn parse(raw: &str) -> Result<Self, TransferError> {
        if raw.len() != ID_BYTES * 2 {
            return Err(TransferError::validation(
                "transfer_id",
                format!("expected {} hex characters, got {}", ID_BYTES * 2, raw.len()),
            ));
        }
        let decoded = hex::decode(raw)
            .map_err(|_| TransferError::validation("transfer_id", "not valid hex"))?;
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Per-record nonce. Stored in the sealed blob header and doubles as the
/// key-derivation salt, so every record gets an unrelated key stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordNonce([u8; ID_BYTES]);

impl RecordNonce {
    pub fn generate() -> Result<Self, TransferError> {
        let mut bytes = [0u8; ID_BYTES];
        fill_random(&mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }
}

impl fmt::Display for RecordNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
