//! # Keys and Signatures
//!
//! Spring-83 uses a simple identity model: **a board's address is the
//! Ed25519 public key that signed it**. Not every Ed25519 key qualifies,
//! though - the protocol reserves the final four bytes of the public key
//! for a recognizable suffix:
//!
//! - byte 28 carries the magic nibble [`MAGIC_NIBBLE`] in its low half
//! - byte 29 is exactly [`MAGIC_BYTE`]
//! - byte 30 encodes the key's expiration month as packed decimal
//! - byte 31 encodes the expiration year as two packed-decimal digits
//!   added to 2000
//!
//! Rendered as hex, a conforming key therefore ends in `83eMMYY` - the
//! expiry is readable straight off the address.
//!
//! Because the public key is derived from the secret, the suffix cannot be
//! chosen; it has to be *found*. [`Keypair::generate_conforming`] draws
//! fresh keypairs until one matches, racing an arbitrary number of worker
//! threads on a shared flag. The search averages millions of draws.
//!
//! All bit-level semantics of the suffix live in this module and nowhere
//! else.
//!
//! ## Security Invariants
//!
//! - K1: [`is_valid`] accepts a key only if the magic suffix matches AND
//!   the embedded expiry is live relative to the wall clock
//! - K2: key validity is evaluated at the moment of the request, never at
//!   storage time
//! - K3: only the losing side of the compare-and-swap abandons a found
//!   keypair; the winner is returned exactly once

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use tracing::debug;

use crate::timestamp::Timestamp;

/// Raw length of an Ed25519 public or secret key.
pub const KEY_LEN: usize = 32;

/// Raw length of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// Hex length of a public key - also the board's path component.
pub const KEY_HEX_LEN: usize = 64;

/// Hex length of a signature - the `Spring-Signature` header value.
pub const SIGNATURE_HEX_LEN: usize = 128;

/// Nibble required in the low half of public-key byte 28.
pub const MAGIC_NIBBLE: u8 = 0x08;

/// Byte required at public-key position 29.
pub const MAGIC_BYTE: u8 = 0x3E;

/// Masks applied when matching the magic suffix.
///
/// Test builds zero the masks so conforming keypairs can be drawn in
/// milliseconds rather than minutes; the expiry-window rules in
/// [`KeyMonthYear`] stay fully enforced either way.
#[cfg(not(any(test, feature = "test-keys")))]
const MAGIC_NIBBLE_MASK: u8 = 0x0F;
#[cfg(any(test, feature = "test-keys"))]
const MAGIC_NIBBLE_MASK: u8 = 0x00;

#[cfg(not(any(test, feature = "test-keys")))]
const MAGIC_BYTE_MASK: u8 = 0xFF;
#[cfg(any(test, feature = "test-keys"))]
const MAGIC_BYTE_MASK: u8 = 0x00;

/// Per-worker draw ceiling for the conforming search. The expected draw
/// count is around ten million; hitting this bound indicates a broken
/// CSPRNG rather than bad luck.
const KEYGEN_MAX_DRAWS_PER_WORKER: u64 = 2_000_000_000;

/// Secret half of the keypair the server holds for the live test board.
///
/// The public half is derived from this seed at startup; a GET for that
/// key answers with a freshly signed board carrying the current server
/// time, and a PUT under it is always refused (the secret is published,
/// so anyone could forge uploads).
pub const TEST_BOARD_SECRET_HEX: &str =
    "2c78a9acb11a850ce38eb0d1b6826554d182a4a2d8a6156a02cbee198ecc9396";

// ============================================================================
// Errors
// ============================================================================

/// Error type for fixed-length hex decoding and key-file parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyError {
    /// Input length does not match the expected fixed width.
    InvalidLength,
    /// Input contains non-hex characters.
    InvalidHex,
    /// A key file's public half does not match the secret it carries.
    PublicKeyMismatch,
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyError::InvalidLength => write!(f, "hex input has the wrong length"),
            KeyError::InvalidHex => write!(f, "input is not valid hex"),
            KeyError::PublicKeyMismatch => {
                write!(f, "key file public half does not match its secret")
            }
        }
    }
}

impl std::error::Error for KeyError {}

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is not 128 hex characters.
    InvalidLength,
    /// Signature contains non-hex characters.
    InvalidHex,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
    /// Cryptographic verification failed.
    VerificationFailed,
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::InvalidHex => write!(f, "signature is not valid hex"),
            SignatureError::InvalidPublicKey => write!(f, "public key is not a valid Ed25519 point"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Returned when the conforming search exhausts its draw budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeygenError {
    /// Total keypairs drawn across all workers before giving up.
    pub draws: u64,
    /// Number of worker threads that searched.
    pub threads: usize,
}

impl fmt::Display for KeygenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "conforming key search failed after {} draws across {} threads. \
             This indicates a CSPRNG failure.",
            self.draws, self.threads
        )
    }
}

impl std::error::Error for KeygenError {}

// ============================================================================
// Magic suffix and expiry window
// ============================================================================

/// Magic-suffix match with explicit masks. The public predicates pass the
/// build-selected masks; tests pass full masks to exercise the real rule.
fn suffix_matches(key: &[u8; KEY_LEN], nibble_mask: u8, byte_mask: u8) -> bool {
    key[28] & nibble_mask == MAGIC_NIBBLE & nibble_mask && key[29] & byte_mask == MAGIC_BYTE & byte_mask
}

/// Whether the public key carries the protocol's magic suffix.
pub fn has_magic_suffix(key: &[u8; KEY_LEN]) -> bool {
    suffix_matches(key, MAGIC_NIBBLE_MASK, MAGIC_BYTE_MASK)
}

/// Full conforming-key predicate: magic suffix plus a live expiry window
/// relative to `now`.
pub fn is_valid(key: &[u8; KEY_LEN], now: &Timestamp) -> bool {
    has_magic_suffix(key)
        && KeyMonthYear::from_public_key(key)
            .map(|expiry| expiry.check_expiration_date(now))
            .unwrap_or(false)
}

/// The expiration month and year packed into a public key's last two bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyMonthYear {
    /// 1..=12
    pub month: u8,
    /// 2000..=2099
    pub year: u16,
}

/// Packed-decimal byte decode: both nibbles must be decimal digits.
fn unpack_decimal(byte: u8) -> Option<u8> {
    let hi = byte >> 4;
    let lo = byte & 0x0F;
    if hi > 9 || lo > 9 {
        return None;
    }
    Some(hi * 10 + lo)
}

impl KeyMonthYear {
    /// Decodes the expiry from bytes 30 and 31 of a public key.
    ///
    /// Byte 30 must unpack to a month in 1..=12 (so `0x0A..0x0F` and
    /// `0x13..` reject); byte 31 unpacks to a two-digit year added to 2000.
    pub fn from_public_key(key: &[u8; KEY_LEN]) -> Option<Self> {
        let month = unpack_decimal(key[30]).filter(|m| (1..=12).contains(m))?;
        let year = 2000 + unpack_decimal(key[31])? as u16;
        Some(Self { month, year })
    }

    /// Whether the expiry is live relative to the given wall-clock month.
    ///
    /// A key is usable from its issue month - exactly two years before its
    /// expiry month - through the expiry month itself. Expired keys and
    /// keys dated more than two years out are both rejected.
    pub fn check_expiration_date(&self, now: &Timestamp) -> bool {
        let (em, ey) = (self.month, self.year);
        let (nm, ny) = (now.month, now.year);
        (ey == ny && em >= nm) || ey == ny + 1 || (ey == ny + 2 && em <= nm)
    }
}

// ============================================================================
// Keypair
// ============================================================================

/// Ed25519 signing keypair (secret + public key).
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair with no suffix constraint.
    ///
    /// Keys produced this way will be rejected by the server as board
    /// addresses; use [`generate_conforming`](Self::generate_conforming)
    /// for publishable keys.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Search for a keypair whose public key carries the magic suffix and
    /// a live expiry window, racing `threads` workers.
    ///
    /// Coordination is a single [`AtomicBool`]: each worker draws fresh
    /// keypairs from the OS CSPRNG, re-checks the flag every iteration,
    /// and the first to find a match commits via compare-and-swap. Losing
    /// workers observe the flag on their next iteration and exit. There is
    /// no work to steal - draws are independent.
    ///
    /// # Errors
    /// [`KeygenError`] if every worker exhausts its draw budget, which is
    /// astronomically unlikely with a functioning CSPRNG.
    pub fn generate_conforming(threads: usize) -> Result<Self, KeygenError> {
        let threads = threads.max(1);
        let now = Timestamp::now();
        let found = AtomicBool::new(false);

        let (total_draws, winner) = std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(threads);
            for _ in 0..threads {
                handles.push(scope.spawn(|| {
                    let mut draws: u64 = 0;
                    while !found.load(Ordering::Relaxed) && draws < KEYGEN_MAX_DRAWS_PER_WORKER {
                        draws += 1;
                        let signing_key = SigningKey::generate(&mut OsRng);
                        let public = signing_key.verifying_key().to_bytes();
                        if is_valid(&public, &now)
                            && found
                                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                                .is_ok()
                        {
                            return (draws, Some(Self { signing_key }));
                        }
                    }
                    (draws, None)
                }));
            }

            let mut total: u64 = 0;
            let mut winner = None;
            for handle in handles {
                let (draws, keypair) = handle.join().expect("keygen worker panicked");
                total += draws;
                if keypair.is_some() {
                    winner = keypair;
                }
            }
            (total, winner)
        });

        match winner {
            Some(keypair) => {
                debug!(draws = total_draws, threads, "conforming key found");
                Ok(keypair)
            }
            None => Err(KeygenError { draws: total_draws, threads }),
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; KEY_LEN]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; KEY_LEN] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; KEY_LEN] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Lowercase hex of the public key - the board's address.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// The 128-hex key-file form: secret followed by public.
    pub fn to_key_file_hex(&self) -> String {
        let mut line = hex::encode(self.secret_key_bytes());
        line.push_str(&self.public_key_hex());
        line
    }

    /// Parses the 128-hex key-file form, checking that the public half
    /// matches the key derived from the secret half.
    pub fn from_key_file_hex(line: &str) -> Result<Self, KeyError> {
        let bytes: [u8; 64] = fixed_hex(line)?;
        let mut secret = [0u8; KEY_LEN];
        secret.copy_from_slice(&bytes[..KEY_LEN]);
        let keypair = Self::from_secret_key_bytes(&secret);
        if keypair.public_key_bytes()[..] != bytes[KEY_LEN..] {
            return Err(KeyError::PublicKeyMismatch);
        }
        Ok(keypair)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the secret half.
        f.debug_struct("Keypair")
            .field("public", &self.public_key_hex())
            .finish()
    }
}

// ============================================================================
// Hex codecs and verification
// ============================================================================

fn fixed_hex<const N: usize>(s: &str) -> Result<[u8; N], KeyError> {
    if s.len() != 2 * N {
        return Err(KeyError::InvalidLength);
    }
    let decoded = hex::decode(s).map_err(|_| KeyError::InvalidHex)?;
    let mut out = [0u8; N];
    out.copy_from_slice(&decoded);
    Ok(out)
}

/// Decodes a 64-hex public key.
pub fn public_key_from_hex(s: &str) -> Result<[u8; KEY_LEN], KeyError> {
    fixed_hex(s)
}

/// Decodes a 64-hex secret key.
pub fn secret_key_from_hex(s: &str) -> Result<[u8; KEY_LEN], KeyError> {
    fixed_hex(s)
}

/// Decodes a 128-hex detached signature.
pub fn signature_from_hex(s: &str) -> Result<[u8; SIGNATURE_LEN], KeyError> {
    fixed_hex(s)
}

/// Verifies a 128-hex Ed25519 signature over `message` under `public_key`.
pub fn verify_signature_hex(
    public_key: &[u8; KEY_LEN],
    message: &[u8],
    signature_hex: &str,
) -> Result<(), SignatureError> {
    let raw = signature_from_hex(signature_hex).map_err(|e| match e {
        KeyError::InvalidLength => SignatureError::InvalidLength,
        _ => SignatureError::InvalidHex,
    })?;
    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| SignatureError::InvalidPublicKey)?;
    let signature = Signature::from_bytes(&raw);
    verifying_key
        .verify(message, &signature)
        .map_err(|_| SignatureError::VerificationFailed)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// A public key ending in the hex suffix `83e0628` - magic nibble,
    /// magic byte, June, 2028.
    fn key_with_suffix(b28: u8, b29: u8, b30: u8, b31: u8) -> [u8; KEY_LEN] {
        let mut key = [0x55u8; KEY_LEN];
        key[28] = b28;
        key[29] = b29;
        key[30] = b30;
        key[31] = b31;
        key
    }

    #[test]
    fn magic_suffix_rule() {
        // Full masks exercise the real rule regardless of build flavor.
        let good = key_with_suffix(0xA8, 0x3E, 0x06, 0x28);
        assert!(suffix_matches(&good, 0x0F, 0xFF));
        // High nibble of byte 28 is free.
        assert!(suffix_matches(&key_with_suffix(0x08, 0x3E, 0x06, 0x28), 0x0F, 0xFF));
        // Wrong low nibble.
        assert!(!suffix_matches(&key_with_suffix(0xA7, 0x3E, 0x06, 0x28), 0x0F, 0xFF));
        // Wrong magic byte.
        assert!(!suffix_matches(&key_with_suffix(0xA8, 0x3F, 0x06, 0x28), 0x0F, 0xFF));
    }

    #[test]
    fn month_byte_decoding() {
        let decode = |b30| KeyMonthYear::from_public_key(&key_with_suffix(0xA8, 0x3E, b30, 0x24));
        for (byte, month) in [(0x01u8, 1u8), (0x09, 9), (0x10, 10), (0x11, 11), (0x12, 12)] {
            assert_eq!(decode(byte).map(|e| e.month), Some(month), "byte {byte:#04x}");
        }
        for byte in [0x00u8, 0x0A, 0x0F, 0x13, 0x20, 0x99, 0xFF] {
            assert!(decode(byte).is_none(), "byte {byte:#04x} should reject");
        }
    }

    #[test]
    fn year_byte_decoding() {
        let decode = |b31| KeyMonthYear::from_public_key(&key_with_suffix(0xA8, 0x3E, 0x06, b31));
        assert_eq!(decode(0x00).map(|e| e.year), Some(2000));
        assert_eq!(decode(0x24).map(|e| e.year), Some(2024));
        assert_eq!(decode(0x99).map(|e| e.year), Some(2099));
        // Either nibble above 9 rejects.
        assert!(decode(0x2A).is_none());
        assert!(decode(0xA2).is_none());
    }

    #[test]
    fn expiration_window() {
        let now = Timestamp::parse("2024-06-15T00:00:00Z").unwrap();
        let check = |month, year| KeyMonthYear { month, year }.check_expiration_date(&now);

        // Expiry month itself is still valid; the month before is not.
        assert!(check(6, 2024));
        assert!(!check(5, 2024));
        // Anywhere in the next calendar year.
        assert!(check(1, 2025));
        assert!(check(12, 2025));
        // Two years out only through the current month.
        assert!(check(6, 2026));
        assert!(!check(7, 2026));
        // Long expired and far future.
        assert!(!check(6, 2023));
        assert!(!check(1, 2027));
    }

    #[test]
    fn hex_codec_round_trips() {
        let keypair = Keypair::generate();
        let public = keypair.public_key_bytes();
        assert_eq!(public_key_from_hex(&hex::encode(public)).unwrap(), public);

        let secret = keypair.secret_key_bytes();
        assert_eq!(secret_key_from_hex(&hex::encode(secret)).unwrap(), secret);

        let signature = keypair.sign(b"hello").to_bytes();
        assert_eq!(signature_from_hex(&hex::encode(signature)).unwrap(), signature);
    }

    #[test]
    fn hex_codec_rejects_bad_input() {
        assert_eq!(public_key_from_hex("abcd"), Err(KeyError::InvalidLength));
        assert_eq!(
            public_key_from_hex(&"zz".repeat(32)),
            Err(KeyError::InvalidHex)
        );
        assert_eq!(signature_from_hex(&"00".repeat(32)), Err(KeyError::InvalidLength));
    }

    #[test]
    fn key_file_round_trip() {
        let keypair = Keypair::generate();
        let line = keypair.to_key_file_hex();
        assert_eq!(line.len(), 128);

        let parsed = Keypair::from_key_file_hex(&line).unwrap();
        assert_eq!(parsed.public_key_bytes(), keypair.public_key_bytes());
    }

    #[test]
    fn key_file_rejects_mismatched_public_half() {
        let keypair = Keypair::generate();
        let mut line = keypair.to_key_file_hex();
        // Corrupt one nibble of the public half.
        let tail = line.pop().unwrap();
        line.push(if tail == '0' { '1' } else { '0' });
        assert!(matches!(
            Keypair::from_key_file_hex(&line),
            Err(KeyError::PublicKeyMismatch)
        ));
    }

    #[test]
    fn verify_signature_hex_accepts_and_rejects() {
        let keypair = Keypair::generate();
        let message = b"<time datetime=\"2024-06-01T00:00:00Z\">hello";
        let sig_hex = hex::encode(keypair.sign(message).to_bytes());
        let public = keypair.public_key_bytes();

        assert!(verify_signature_hex(&public, message, &sig_hex).is_ok());
        assert_eq!(
            verify_signature_hex(&public, b"tampered", &sig_hex),
            Err(SignatureError::VerificationFailed)
        );
        assert_eq!(
            verify_signature_hex(&public, message, "ab"),
            Err(SignatureError::InvalidLength)
        );

        let other = Keypair::generate();
        assert_eq!(
            verify_signature_hex(&other.public_key_bytes(), message, &sig_hex),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn conforming_search_finds_a_live_key() {
        // Masks are zeroed under cfg(test), so this only needs to draw a
        // key with a decodable, in-window expiry - a few thousand draws.
        let keypair = Keypair::generate_conforming(2).expect("search failed");
        let public = keypair.public_key_bytes();
        let now = Timestamp::now();

        assert!(is_valid(&public, &now));
        let expiry = KeyMonthYear::from_public_key(&public).unwrap();
        assert!(expiry.check_expiration_date(&now));
    }

    #[test]
    fn test_board_secret_parses() {
        let secret = secret_key_from_hex(TEST_BOARD_SECRET_HEX).unwrap();
        let keypair = Keypair::from_secret_key_bytes(&secret);
        assert_eq!(keypair.public_key_hex().len(), KEY_HEX_LEN);
    }
}
