//! Sealing and opening of payloads under a passphrase-derived key.
//!
//! A sealed blob is `SBX1 || version || nonce` followed by length-prefixed
//! XChaCha20-Poly1305 frames, one per plaintext chunk, and a final empty
//! frame marking the end. Each frame is bound to its position and to the
//! format version through the associated data, so frames cannot be dropped,
//! duplicated, reordered, or spliced between blobs without tripping
//! authentication. Keys come out of Argon2id with the record nonce as salt.

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use zeroize::Zeroizing;

use crate::error::TransferError;
use crate::ident::{RecordNonce, ID_BYTES};

const MAGIC: [u8; 4] = *b"SBX1";
const FORMAT_VERSION: u8 = 1;

/// Bytes before the first frame: magic, version, record nonce.
pub const HEADER_LEN: usize = MAGIC.len() + 1 + ID_BYTES;
/// Poly1305 tag appended to every frame.
pub const TAG_LEN: usize = 16;
/// Little-endian u32 length prefix on every frame.
pub const LEN_PREFIX: usize = 4;
/// Upper bound on plaintext bytes per frame.
pub const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;

pub const KEY_LEN: usize = 32;

// Interactive-profile Argon2id: slow enough to hurt brute force, fast
// enough that a transfer does not stall on key derivation.
const KDF_MEM_KIB: u32 = 19_456;
const KDF_PASSES: u32 = 2;
const KDF_LANES: u32 = 1;

// Frame counters are u64 on the wire but capped well below wraparound.
const MAX_CHUNKS: u64 = 1 << 32;

/// A passphrase held in zeroize-on-drop memory.
#[derive(Clone)]
pub struct Passphrase(Zeroizing<String>);

impl Passphrase {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(Zeroizing::new(raw.into()))
    }

    fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Passphrase(redacted)")
    }
}

/// A stretched cipher key. Derivation is deliberately slow; callers should
/// run it on a blocking thread and reuse the result within one transfer.
#[derive(Clone)]
pub struct DerivedKey(Zeroizing<[u8; KEY_LEN]>);

impl DerivedKey {
    pub fn derive(passphrase: &Passphrase, salt: &RecordNonce) -> Result<Self, TransferError> {
        if passphrase.as_bytes().is_empty() {
            return Err(TransferError::validation("passphrase", "must not be empty"));
        }

        let params = argon2::Params::new(KDF_MEM_KIB, KDF_PASSES, KDF_LANES, Some(KEY_LEN))
            .map_err(|e| TransferError::validation("kdf", e.to_string()))?;
        let kdf = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        kdf.hash_password_into(passphrase.as_bytes(), salt.as_bytes(), &mut key[..])
            .map_err(|e| TransferError::validation("kdf", e.to_string()))?;
        Ok(Self(key))
    }

    /// Wraps raw key material directly, skipping derivation.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&self.0[..]))
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(redacted)")
    }
}

fn frame_nonce(nonce: &RecordNonce, counter: u64) -> XNonce {
    let mut bytes = [0u8; 24];
    bytes[..ID_BYTES].copy_from_slice(nonce.as_bytes());
    bytes[ID_BYTES..].copy_from_slice(&counter.to_le_bytes());
    XNonce::from(bytes)
}

fn frame_aad(counter: u64, is_final: bool) -> [u8; 10] {
    let mut aad = [0u8; 10];
    aad[..8].copy_from_slice(&counter.to_le_bytes());
    aad[8] = is_final as u8;
    aad[9] = FORMAT_VERSION;
    aad
}

/// Incremental sealer. Emit `header()` first, then one `seal_chunk` frame
/// per plaintext chunk, then the `finish()` frame.
pub struct BlobSealer {
    cipher: XChaCha20Poly1305,
    nonce: RecordNonce,
    counter: u64,
}

impl BlobSealer {
    pub fn new(key: &DerivedKey, nonce: RecordNonce) -> Self {
        Self {
            cipher: key.cipher(),
            nonce,
            counter: 0,
        }
    }

    pub fn header(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN);
        out.extend_from_slice(&MAGIC);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(self.nonce.as_bytes());
        out
    }

    pub fn seal_chunk(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, TransferError> {
        if plaintext.is_empty() {
            // An empty frame is reserved for the end marker.
            return Err(TransferError::validation("chunk", "must not be empty"));
        }
        if plaintext.len() > MAX_CHUNK_SIZE {
            return Err(TransferError::validation(
                "chunk",
                format!("{} bytes exceeds the {MAX_CHUNK_SIZE} byte limit", plaintext.len()),
            ));
        }
        self.seal_frame(plaintext, false)
    }

    /// Seals the end marker. Consumes the sealer so no frame can follow it.
    pub fn finish(mut self) -> Result<Vec<u8>, TransferError> {
        self.seal_frame(&[], true)
    }

    fn seal_frame(&mut self, plaintext: &[u8], is_final: bool) -> Result<Vec<u8>, TransferError> {
        if self.counter >= MAX_CHUNKS {
            return Err(TransferError::validation("payload", "too many chunks"));
        }

        let mut ciphertext = Vec::with_capacity(plaintext.len() + TAG_LEN);
        ciphertext.extend_from_slice(plaintext);
        self.cipher
            .encrypt_in_place(
                &frame_nonce(&self.nonce, self.counter),
                &frame_aad(self.counter, is_final),
                &mut ciphertext,
            )
            .map_err(|_| TransferError::validation("chunk", "ciphertext length overflow"))?;
        self.counter += 1;

        let mut frame = Vec::with_capacity(LEN_PREFIX + ciphertext.len());
        frame.extend_from_slice(&(ciphertext.len() as u32).to_le_bytes());
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }
}

/// Seals a whole payload in memory. Streaming callers drive `BlobSealer`
/// themselves.
pub fn seal_blob(
    key: &DerivedKey,
    nonce: RecordNonce,
    plaintext: &[u8],
    chunk_size: usize,
) -> Result<Vec<u8>, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::validation("chunk_size", "must be non-zero"));
    }
    let mut sealer = BlobSealer::new(key, nonce);
    let mut blob = sealer.header();
    for chunk in plaintext.chunks(chunk_size) {
        blob.extend_from_slice(&sealer.seal_chunk(chunk)?);
    }
    blob.extend_from_slice(&sealer.finish()?);
    Ok(blob)
}

/// Reads the record nonce out of a sealed blob header so the key can be
/// derived before decryption starts.
pub fn peek_nonce(blob: &[u8]) -> Result<RecordNonce, TransferError> {
    if blob.len() < HEADER_LEN || blob[..MAGIC.len()] != MAGIC || blob[MAGIC.len()] != FORMAT_VERSION
    {
        return Err(TransferError::AuthenticationFailed);
    }
    let mut nonce = [0u8; ID_BYTES];
    nonce.copy_from_slice(&blob[MAGIC.len() + 1..HEADER_LEN]);
    Ok(RecordNonce::from_bytes(nonce))
}

/// Verifies and decrypts a complete sealed blob.
///
/// Every structural defect reports as `AuthenticationFailed`: a flipped bit
/// in the header is no more trustworthy than one in a tag, and the error
/// must not reveal which byte went wrong. No plaintext escapes unless the
/// whole blob verifies.
pub fn open_blob(key: &DerivedKey, blob: &[u8]) -> Result<Vec<u8>, TransferError> {
    let nonce = peek_nonce(blob)?;
    let cipher = key.cipher();

    let mut plaintext = Vec::new();
    let mut offset = HEADER_LEN;
    let mut counter: u64 = 0;
    let mut finished = false;

    while offset < blob.len() {
        if finished || counter >= MAX_CHUNKS {
            return Err(TransferError::AuthenticationFailed);
        }
        if blob.len() - offset < LEN_PREFIX {
            return Err(TransferError::AuthenticationFailed);
        }
        let len_bytes: [u8; LEN_PREFIX] = blob[offset..offset + LEN_PREFIX].try_into().unwrap();
        let len = u32::from_le_bytes(len_bytes) as usize;
        offset += LEN_PREFIX;

        if len < TAG_LEN || len > MAX_CHUNK_SIZE + TAG_LEN || blob.len() - offset < len {
            return Err(TransferError::AuthenticationFailed);
        }

        // Only the end marker carries an empty plaintext.
        let is_final = len == TAG_LEN;
        let mut chunk = blob[offset..offset + len].to_vec();
        cipher
            .decrypt_in_place(
                &frame_nonce(&nonce, counter),
                &frame_aad(counter, is_final),
                &mut chunk,
            )
            .map_err(|_| TransferError::AuthenticationFailed)?;

        if is_final {
            finished = true;
        } else {
            plaintext.extend_from_slice(&chunk);
        }
        counter += 1;
        offset += len;
    }

    // A blob without its end marker was truncated on a frame boundary.
    if !finished {
        return Err(TransferError::AuthenticationFailed);
    }
    Ok(plaintext)
}

/// Sealed size of a payload, including header, framing, and end marker.
pub fn sealed_len(plaintext_len: u64, chunk_size: usize) -> Result<u64, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::validation("chunk_size", "must be non-zero"));
    }
    let chunk_size = chunk_size as u64;
    let full = plaintext_len / chunk_size;
    let partial = u64::from(plaintext_len % chunk_size > 0);
    let frames = full + partial + 1;
    Ok(HEADER_LEN as u64 + plaintext_len + frames * (LEN_PREFIX + TAG_LEN) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> DerivedKey {
        DerivedKey::from_bytes([7u8; KEY_LEN])
    }

    fn test_nonce() -> RecordNonce {
        RecordNonce::from_bytes([9u8; ID_BYTES])
    }

    fn test_payload(len: usize) -> Vec<u8> {
        let mut state = 0x2545f4914f6cdd1du64;
        let mut out = Vec::with_capacity(len + 8);
        while out.len() < len {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            out.extend_from_slice(&state.to_le_bytes());
        }
        out.truncate(len);
        out
    }

    #[test]
    fn seals_and_opens_payloads_of_varied_sizes() {
        let key = test_key();
        let chunk_size = 1024;
        for len in [0, 1, chunk_size - 1, chunk_size, chunk_size + 1, 3 * chunk_size + 17] {
            let payload = test_payload(len);
            let blob = seal_blob(&key, test_nonce(), &payload, chunk_size).unwrap();
            assert_eq!(blob.len() as u64, sealed_len(len as u64, chunk_size).unwrap());
            assert_eq!(open_blob(&key, &blob).unwrap(), payload, "len {len}");
        }
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let blob = seal_blob(&test_key(), test_nonce(), b"attack at dawn", 1024).unwrap();
        let err = open_blob(&DerivedKey::from_bytes([8u8; KEY_LEN]), &blob).unwrap_err();
        assert!(matches!(err, TransferError::AuthenticationFailed));
    }

    #[test]
    fn kdf_is_deterministic_and_passphrase_sensitive() {
        let nonce = test_nonce();
        let correct = Passphrase::new("correct-horse");

        let k1 = DerivedKey::derive(&correct, &nonce).unwrap();
        let k2 = DerivedKey::derive(&correct, &nonce).unwrap();
        let blob1 = seal_blob(&k1, nonce.clone(), b"battery staple", 64).unwrap();
        let blob2 = seal_blob(&k2, nonce.clone(), b"battery staple", 64).unwrap();
        assert_eq!(blob1, blob2, "same passphrase and salt must agree");

        let wrong = DerivedKey::derive(&Passphrase::new("wrong-horse"), &nonce).unwrap();
        let err = open_blob(&wrong, &blob1).unwrap_err();
        assert!(matches!(err, TransferError::AuthenticationFailed));
    }

    #[test]
    fn empty_passphrase_is_rejected() {
        let err = DerivedKey::derive(&Passphrase::new(""), &test_nonce()).unwrap_err();
        assert!(matches!(err, TransferError::Validation { field: "passphrase", .. }));
    }

    #[test]
    fn every_single_bit_flip_is_rejected() {
        let key = test_key();
        let payload = test_payload(40);
        let blob = seal_blob(&key, test_nonce(), &payload, 32).unwrap();

        for byte in 0..blob.len() {
            for bit in 0..8 {
                let mut tampered = blob.clone();
                tampered[byte] ^= 1 << bit;
                let err = open_blob(&key, &tampered).unwrap_err();
                assert!(
                    matches!(err, TransferError::AuthenticationFailed),
                    "flip at byte {byte} bit {bit} gave {err:?}"
                );
            }
        }
    }

    #[test]
    fn truncated_blobs_are_rejected() {
        let key = test_key();
        let blob = seal_blob(&key, test_nonce(), &test_payload(100), 32).unwrap();
        for cut in 0..blob.len() {
            let err = open_blob(&key, &blob[..cut]).unwrap_err();
            assert!(
                matches!(err, TransferError::AuthenticationFailed),
                "prefix of {cut} bytes gave {err:?}"
            );
        }
    }

    #[test]
    fn reordered_frames_are_rejected() {
        let key = test_key();
        // Two equal-size frames land at known offsets.
        let blob = seal_blob(&key, test_nonce(), &test_payload(64), 32).unwrap();
        let frame_len = LEN_PREFIX + 32 + TAG_LEN;
        let (a, b) = (HEADER_LEN, HEADER_LEN + frame_len);

        let mut swapped = blob.clone();
        swapped.copy_within(b..b + frame_len, a);
        swapped[b..b + frame_len].copy_from_slice(&blob[a..a + frame_len]);
        assert_ne!(swapped, blob);

        let err = open_blob(&key, &swapped).unwrap_err();
        assert!(matches!(err, TransferError::AuthenticationFailed));
    }

    #[test]
    fn trailing_data_is_rejected() {
        let key = test_key();
        let blob = seal_blob(&key, test_nonce(), &test_payload(10), 32).unwrap();

        let mut padded = blob.clone();
        padded.extend_from_slice(&[0u8; 5]);
        assert!(matches!(
            open_blob(&key, &padded).unwrap_err(),
            TransferError::AuthenticationFailed
        ));

        // Replaying a valid frame after the end marker must also fail.
        let mut replayed = blob.clone();
        let frame = blob[HEADER_LEN..HEADER_LEN + LEN_PREFIX + 10 + TAG_LEN].to_vec();
        replayed.extend_from_slice(&frame);
        assert!(matches!(
            open_blob(&key, &replayed).unwrap_err(),
            TransferError::AuthenticationFailed
        ));
    }

    #[test]
    fn stream_without_end_marker_is_rejected() {
        let key = test_key();
        let mut sealer = BlobSealer::new(&key, test_nonce());
        let mut blob = sealer.header();
        blob.extend_from_slice(&sealer.seal_chunk(b"no terminator follows").unwrap());

        let err = open_blob(&key, &blob).unwrap_err();
        assert!(matches!(err, TransferError::AuthenticationFailed));
    }

    #[test]
    fn sealed_len_rejects_a_zero_chunk_size() {
        assert!(matches!(
            sealed_len(10, 0).unwrap_err(),
            TransferError::Validation { field: "chunk_size", .. }
        ));
        // An empty payload still carries the header and the end marker.
        assert_eq!(
            sealed_len(0, 1024).unwrap(),
            (HEADER_LEN + LEN_PREFIX + TAG_LEN) as u64
        );
    }

    #[test]
    fn peek_nonce_reads_the_header() {
        let nonce = RecordNonce::from_bytes([0xAB; ID_BYTES]);
        let blob = seal_blob(&test_key(), nonce.clone(), b"x", 32).unwrap();
        assert_eq!(peek_nonce(&blob).unwrap(), nonce);

        assert!(matches!(
            peek_nonce(b"not a sealed blob").unwrap_err(),
            TransferError::AuthenticationFailed
        ));
        assert!(matches!(
            peek_nonce(&[]).unwrap_err(),
            TransferError::AuthenticationFailed
        ));
    }
}
