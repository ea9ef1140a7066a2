//! # Boards
//!
//! A board is the protocol's content unit: up to [`BOARD_MAX_LEN`] bytes
//! of HTML that must carry a `<time datetime="…Z">` element naming its
//! publication instant. The timestamp is what makes replacement monotonic
//! - a stored board yields only to a strictly newer one - so a board
//! without a parseable timestamp is not a board at all.
//!
//! [`Board`] is a fixed-capacity value: content lives in an inline
//! 2217-byte buffer with a logical length, so request handling never
//! allocates for board data.

use std::fmt;

use crate::keys::{self, SignatureError, KEY_LEN};
use crate::timestamp::{Timestamp, TIMESTAMP_STR_LEN};

/// Maximum board content length in bytes.
pub const BOARD_MAX_LEN: usize = 2217;

/// Opening of the element carrying the publication time. The 20 bytes
/// after it must parse as a canonical timestamp.
pub const TIME_ELEMENT_PREFIX: &[u8] = b"<time datetime=\"";

/// Horizon for a future TTL policy, measured backward from the board's
/// own timestamp. TODO: anchor the horizon to the wall clock once the
/// protocol pins down board expiry; against the board's own timestamp the
/// check cannot fail.
const BOARD_TTL_DAYS: i32 = 22;

/// Error type for board construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardError {
    /// Content exceeds [`BOARD_MAX_LEN`] bytes.
    TooLarge,
    /// No `<time datetime="…">` element with a valid timestamp, or the
    /// timestamp is in the future.
    InvalidTimestamp,
}

impl fmt::Display for BoardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoardError::TooLarge => write!(f, "board exceeds {BOARD_MAX_LEN} bytes"),
            BoardError::InvalidTimestamp => write!(f, "board has no valid timestamp"),
        }
    }
}

impl std::error::Error for BoardError {}

/// A validated board: fixed-capacity content plus its logical length.
#[derive(Clone)]
pub struct Board {
    content: [u8; BOARD_MAX_LEN],
    len: usize,
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

impl Board {
    /// Validates and copies `bytes` into a board.
    ///
    /// # Errors
    /// - [`BoardError::TooLarge`] over 2217 bytes
    /// - [`BoardError::InvalidTimestamp`] when the first
    ///   `<time datetime="` is missing or not followed by a canonical
    ///   timestamp, or when that timestamp is ahead of the wall clock or
    ///   behind its TTL horizon
    pub fn new(bytes: &[u8]) -> Result<Self, BoardError> {
        if bytes.len() > BOARD_MAX_LEN {
            return Err(BoardError::TooLarge);
        }
        let mut content = [0u8; BOARD_MAX_LEN];
        content[..bytes.len()].copy_from_slice(bytes);
        let board = Self { content, len: bytes.len() };

        let ts = board.timestamp().map_err(|_| BoardError::InvalidTimestamp)?;
        let now = Timestamp::now();
        if ts > now {
            return Err(BoardError::InvalidTimestamp);
        }
        if ts <= ts.add_days(-BOARD_TTL_DAYS) {
            return Err(BoardError::InvalidTimestamp);
        }

        Ok(board)
    }

    /// The board's content bytes.
    pub fn content(&self) -> &[u8] {
        &self.content[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Extracts the timestamp from the first `<time datetime="` element.
    pub fn timestamp(&self) -> Result<Timestamp, crate::timestamp::InvalidTimestamp> {
        let content = self.content();
        let start = find_subsequence(content, TIME_ELEMENT_PREFIX)
            .ok_or(crate::timestamp::InvalidTimestamp)?
            + TIME_ELEMENT_PREFIX.len();
        let end = start + TIMESTAMP_STR_LEN;
        if end > content.len() {
            return Err(crate::timestamp::InvalidTimestamp);
        }
        let raw = std::str::from_utf8(&content[start..end])
            .map_err(|_| crate::timestamp::InvalidTimestamp)?;
        Timestamp::parse(raw)
    }

    /// Verifies a 128-hex Ed25519 signature over the content under the
    /// given public key.
    pub fn verify_signature(
        &self,
        signature_hex: &str,
        public_key: &[u8; KEY_LEN],
    ) -> Result<(), SignatureError> {
        keys::verify_signature_hex(public_key, self.content(), signature_hex)
    }
}

impl fmt::Debug for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Board")
            .field("len", &self.len)
            .field("timestamp", &self.timestamp().ok())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
