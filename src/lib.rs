//! # Vernal - A Spring-83 Server
//!
//! Vernal stores and serves small, cryptographically signed HTML "boards",
//! each addressed by the Ed25519 public key that signed it. The protocol
//! guarantees three properties:
//!
//! - **Authenticated**: a board is published only under a key whose
//!   private half the client holds
//! - **Monotonic in time**: a stored board yields only to a strictly
//!   newer one
//! - **Expiring keys**: every key carries its expiration month and year
//!   in its final bytes, enforced at generation and on every request
//!
//! ## Architecture
//!
//! One process, one thread: a fixed pool of client slots cycles through
//! a linear accept/read/write/disconnect state machine on a
//! current-thread runtime, with request handling run inline between the
//! read and the write. The filesystem is the only shared mutable state -
//! there is no board cache, so every request observes the latest write.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `timestamp` | Canonical `YYYY-MM-DDTHH:MM:SSZ` value type and epoch arithmetic |
//! | `keys` | Magic-suffix keys, expiry windows, conforming-key search, signatures |
//! | `board` | The 2217-byte signed content unit and its `<time>` invariant |
//! | `store` | Flat-directory persistence, one file per public key |
//! | `denylist` | Banned-key membership scans |
//! | `http` | Request parsing and response writing over slot buffers |
//! | `handler` | Method dispatch and the domain-error-to-status map |
//! | `server` | The slot-pool serving loop |
//! | `push` | Plain-TCP client for publishing boards |

pub mod board;
pub mod denylist;
pub mod handler;
pub mod http;
pub mod keys;
pub mod push;
pub mod server;
pub mod store;
pub mod timestamp;

pub use board::{Board, BoardError, BOARD_MAX_LEN};
pub use denylist::Denylist;
pub use handler::ServerContext;
pub use keys::{KeyMonthYear, Keypair};
pub use server::Server;
pub use store::{BoardStore, StoreError};
pub use timestamp::Timestamp;
