//! # Board Storage
//!
//! The store is the filesystem: one file per public key under the board
//! directory, named by the lowercase 64-hex key. Each file holds the
//! 128-hex detached signature, a single `\n`, then the raw board bytes.
//! Replacement is a create-or-truncate write; there is no in-memory cache,
//! so every request observes the latest write.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::board::{Board, BOARD_MAX_LEN};
use crate::keys::SIGNATURE_HEX_LEN;

/// Largest well-formed record: signature line plus a full board.
const RECORD_MAX_LEN: usize = SIGNATURE_HEX_LEN + 1 + BOARD_MAX_LEN;

/// Error type for store operations.
#[derive(Debug)]
pub enum StoreError {
    /// No record exists for the key.
    NotFound,
    /// A record exists but does not decode: missing signature newline,
    /// non-hex signature, or content failing board validation.
    Corrupted,
    /// Any other filesystem failure.
    Io(io::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "no board stored under this key"),
            StoreError::Corrupted => write!(f, "stored record is corrupted"),
            StoreError::Io(e) => write!(f, "board store I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            StoreError::NotFound
        } else {
            StoreError::Io(e)
        }
    }
}

/// Filesystem-backed mapping from public key to `(signature, board)`.
#[derive(Debug, Clone)]
pub struct BoardStore {
    dir: PathBuf,
}

impl BoardStore {
    /// Opens the store, creating the board directory if needed.
    ///
    /// # Errors
    /// Directory creation failure is fatal at startup; the caller
    /// propagates it to the process entry point.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key_hex: &str) -> PathBuf {
        self.dir.join(key_hex)
    }

    /// Loads the stored record for a key.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] when no file exists,
    /// [`StoreError::Corrupted`] when the record does not decode, and
    /// [`StoreError::Io`] for anything else. Corruption is logged with the
    /// affected key; the next PUT simply overwrites the record.
    pub fn load(&self, key_hex: &str) -> Result<(String, Board), StoreError> {
        let bytes = fs::read(self.path_for(key_hex))?;

        let record = self.decode(&bytes);
        if record.is_err() {
            warn!(key = key_hex, "corrupted board record");
        }
        record
    }

    fn decode(&self, bytes: &[u8]) -> Result<(String, Board), StoreError> {
        if bytes.len() < SIGNATURE_HEX_LEN + 1
            || bytes.len() > RECORD_MAX_LEN
            || bytes[SIGNATURE_HEX_LEN] != b'\n'
        {
            return Err(StoreError::Corrupted);
        }
        let signature = &bytes[..SIGNATURE_HEX_LEN];
        if !signature.iter().all(u8::is_ascii_hexdigit) {
            return Err(StoreError::Corrupted);
        }
        let signature = String::from_utf8(signature.to_vec()).map_err(|_| StoreError::Corrupted)?;

        let board =
            Board::new(&bytes[SIGNATURE_HEX_LEN + 1..]).map_err(|_| StoreError::Corrupted)?;
        Ok((signature, board))
    }

    /// Writes a new record for the key, replacing any prior one.
    ///
    /// Create-or-truncate semantics: the single-threaded serving loop is
    /// the only writer in-process, so a plain truncating create is atomic
    /// enough for the protocol's needs.
    pub fn replace(
        &self,
        key_hex: &str,
        signature_hex: &str,
        board: &Board,
    ) -> Result<(), StoreError> {
        let mut file = fs::File::create(self.path_for(key_hex)).map_err(StoreError::Io)?;
        file.write_all(signature_hex.as_bytes()).map_err(StoreError::Io)?;
        file.write_all(b"\n").map_err(StoreError::Io)?;
        file.write_all(board.content()).map_err(StoreError::Io)?;
        Ok(())
    }

    pub fn exists(&self, key_hex: &str) -> bool {
        self.path_for(key_hex).is_file()
    }
}

// ============================================================================
// Tests
// ============================================================================
