//! # Denylist
//!
//! A newline-delimited file of banned public keys: 64 lowercase hex
//! characters plus `\n`, 65 bytes per record. Presence forbids both GET
//! and PUT for that key. The file is re-read on every lookup - it is tiny,
//! append-only, and editable while the server runs.
//!
//! A denylist can also carry one built-in entry that is denied no matter
//! what the file says; the server seeds it with the reserved test key so
//! uploads under the published test secret are always refused.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::keys::KEY_HEX_LEN;

/// One record: 64 hex characters and the trailing newline.
const RECORD_LEN: usize = KEY_HEX_LEN + 1;

/// Read-only membership test over a denylist file, plus an optional
/// built-in entry.
#[derive(Debug, Clone)]
pub struct Denylist {
    path: PathBuf,
    builtin: Option<String>,
}

impl Denylist {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), builtin: None }
    }

    /// Returns a denylist that also denies `key_hex` unconditionally,
    /// regardless of the file's contents.
    pub fn with_builtin(self, key_hex: impl Into<String>) -> Self {
        Self { builtin: Some(key_hex.into()), ..self }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `key_hex` is the built-in entry or appears in the file.
    ///
    /// A missing file means nothing beyond the built-in entry is denied.
    /// Any other I/O error propagates; a trailing partial record is
    /// ignored.
    pub fn contains(&self, key_hex: &str) -> io::Result<bool> {
        if self.builtin.as_deref() == Some(key_hex) {
            return Ok(true);
        }
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };

        let mut record = [0u8; RECORD_LEN];
        loop {
            match file.read_exact(&mut record) {
                Ok(()) => {
                    if &record[..KEY_HEX_LEN] == key_hex.as_bytes() {
                        return Ok(true);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
                Err(e) => return Err(e),
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
