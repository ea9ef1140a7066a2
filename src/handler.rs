//! # Request Handling
//!
//! Translates the parsed request into a protocol response. The contract
//! is a total function from `(request, store, denylist)` to a status and
//! body; domain errors map to statuses here and are never rethrown into
//! the serving loop.
//!
//! Validation order on PUT is deliberate:
//!
//! 1. denylist, before any cryptographic work
//! 2. key validity, body presence, size and timestamp invariants
//! 3. signature verification
//! 4. stored-timestamp comparison, last, so malformed clients get the
//!    most precise diagnostic
//!
//! ## Status map
//!
//! | Outcome | Status |
//! |---|---|
//! | index page, stored board, live test board | 200 |
//! | board stored | 201 |
//! | CORS preflight | 204 |
//! | `If-Modified-Since` at or past the stored timestamp | 304 |
//! | missing body or signature header, bad board timestamp | 400 |
//! | bad or denied key, failed verification | 403 |
//! | unknown, denied, or corrupted board on GET | 404 |
//! | method other than GET/PUT/OPTIONS | 405 |
//! | board older than (or as old as) the stored one | 409 |
//! | body over 2217 bytes | 413 |
//! | store or denylist I/O failure | 500 |

use tracing::warn;

use crate::board::{Board, BoardError, BOARD_MAX_LEN};
use crate::denylist::Denylist;
use crate::http::{Method, Request, ResponseWriter};
use crate::keys::{self, Keypair, KEY_HEX_LEN, KEY_LEN, TEST_BOARD_SECRET_HEX};
use crate::store::{BoardStore, StoreError};
use crate::timestamp::Timestamp;

/// The index page is served from this path, truncated to
/// [`INDEX_MAX_LEN`] bytes.
pub const INDEX_PATH: &str = "static/index.html";

/// Upper bound on the served index page.
pub const INDEX_MAX_LEN: usize = 2048;

/// Fallback index page for checkouts without a static directory.
const INDEX_FALLBACK: &[u8] =
    b"<!DOCTYPE html><html><body><h1>vernal</h1><p>A Spring-83 server.</p></body></html>";

/// Everything a request needs besides its own bytes. Built once at
/// startup, shared by every slot.
pub struct ServerContext {
    store: BoardStore,
    denylist: Denylist,
    index_html: Vec<u8>,
    test_keypair: Keypair,
    test_key_hex: String,
}

impl ServerContext {
    /// Assembles the context. The test keypair is derived from the held
    /// secret so the pair stays consistent by construction.
    pub fn new(store: BoardStore, denylist: Denylist, index_html: Option<Vec<u8>>) -> Self {
        let secret = keys::secret_key_from_hex(TEST_BOARD_SECRET_HEX)
            .expect("test board secret must be 64 hex characters");
        let test_keypair = Keypair::from_secret_key_bytes(&secret);
        let test_key_hex = test_keypair.public_key_hex();

        // The test secret is published, so uploads under it are forged by
        // definition; the key lives in the denylist as a built-in entry.
        // GET still serves the live board because the test-key intercept
        // runs before the denylist lookup.
        let denylist = denylist.with_builtin(test_key_hex.clone());

        let mut index_html = index_html.unwrap_or_else(|| INDEX_FALLBACK.to_vec());
        index_html.truncate(INDEX_MAX_LEN);

        Self { store, denylist, index_html, test_keypair, test_key_hex }
    }

    /// The reserved key answered with a live signed board.
    pub fn test_key_hex(&self) -> &str {
        &self.test_key_hex
    }
}

/// A computed response, decoupled from the slot buffer so the request
/// borrow can end before the response is written over it.
pub enum Reply<'a> {
    /// 200 with the static index page.
    Index(&'a [u8]),
    /// 200 with a stored or synthesized board.
    BoardHit { signature: String, board: Board },
    /// 304; the client's copy is current.
    NotModified,
    /// 201; the board was stored.
    Created,
    /// 204 with the CORS preamble.
    Cors,
    /// Any of the error statuses in the module table.
    Error(u16),
}

impl Reply<'_> {
    pub fn status(&self) -> u16 {
        match self {
            Reply::Index(_) | Reply::BoardHit { .. } => 200,
            Reply::Created => 201,
            Reply::Cors => 204,
            Reply::NotModified => 304,
            Reply::Error(status) => *status,
        }
    }
}

/// Dispatches a parsed request.
pub fn handle<'ctx>(req: &Request<'_>, ctx: &'ctx ServerContext) -> Reply<'ctx> {
    match req.method {
        Method::Get => handle_get(req, ctx),
        Method::Put => handle_put(req, ctx),
        Method::Options => Reply::Cors,
        Method::Unsupported => Reply::Error(405),
    }
}

/// Extracts and decodes the `/{64-lowercase-hex}` path form.
fn key_path(path: &str) -> Option<(&str, [u8; KEY_LEN])> {
    let key_hex = path.strip_prefix('/')?;
    if key_hex.len() != KEY_HEX_LEN
        || !key_hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    {
        return None;
    }
    let key = keys::public_key_from_hex(key_hex).ok()?;
    Some((key_hex, key))
}

fn handle_get<'ctx>(req: &Request<'_>, ctx: &'ctx ServerContext) -> Reply<'ctx> {
    if req.path == "/" {
        return Reply::Index(&ctx.index_html);
    }
    let Some((key_hex, key)) = key_path(req.path) else {
        return Reply::Error(404);
    };

    if key_hex == ctx.test_key_hex {
        return live_test_board(ctx);
    }
    if !keys::has_magic_suffix(&key) {
        return Reply::Error(404);
    }
    match ctx.denylist.contains(key_hex) {
        Ok(false) => {}
        Ok(true) => return Reply::Error(404),
        Err(e) => {
            warn!(error = %e, "denylist read failed");
            return Reply::Error(500);
        }
    }

    let (signature, board) = match ctx.store.load(key_hex) {
        Ok(record) => record,
        Err(StoreError::NotFound) | Err(StoreError::Corrupted) => return Reply::Error(404),
        Err(StoreError::Io(e)) => {
            warn!(key = key_hex, error = %e, "board load failed");
            return Reply::Error(500);
        }
    };
    let Ok(stored_ts) = board.timestamp() else {
        return Reply::Error(404);
    };

    // An unparseable If-Modified-Since is treated as absent.
    if let Some(since) = req
        .header("If-Modified-Since")
        .and_then(|v| Timestamp::parse(v).ok())
    {
        if since >= stored_ts {
            return Reply::NotModified;
        }
    }

    Reply::BoardHit { signature, board }
}

/// Synthesizes the always-fresh board behind the reserved test key.
fn live_test_board(ctx: &ServerContext) -> Reply<'static> {
    let now = Timestamp::now();
    let content = format!("<time datetime=\"{now}\">The server's clock reads {now}.</time>");
    match Board::new(content.as_bytes()) {
        Ok(board) => {
            let signature = hex::encode(ctx.test_keypair.sign(content.as_bytes()).to_bytes());
            Reply::BoardHit { signature, board }
        }
        Err(_) => Reply::Error(500),
    }
}

fn handle_put(req: &Request<'_>, ctx: &ServerContext) -> Reply<'static> {
    let Some((key_hex, key)) = key_path(req.path) else {
        return Reply::Error(403);
    };

    // The denylist always contains the test key as a built-in entry, so
    // uploads under the published test secret land here too.
    match ctx.denylist.contains(key_hex) {
        Ok(false) => {}
        Ok(true) => return Reply::Error(403),
        Err(e) => {
            warn!(error = %e, "denylist read failed");
            return Reply::Error(500);
        }
    }

    let now = Timestamp::now();
    if !keys::is_valid(&key, &now) {
        return Reply::Error(403);
    }
    if req.body.is_empty() {
        return Reply::Error(400);
    }
    let Some(signature_hex) = req.header("Spring-Signature") else {
        return Reply::Error(400);
    };
    if req.body.len() > BOARD_MAX_LEN {
        return Reply::Error(413);
    }

    let board = match Board::new(req.body) {
        Ok(board) => board,
        Err(BoardError::TooLarge) => return Reply::Error(413),
        Err(BoardError::InvalidTimestamp) => return Reply::Error(400),
    };
    if board.verify_signature(signature_hex, &key).is_err() {
        return Reply::Error(403);
    }
    let Ok(new_ts) = board.timestamp() else {
        return Reply::Error(400);
    };

    match ctx.store.load(key_hex) {
        Ok((_, prior)) => {
            if prior.timestamp().map(|prior_ts| new_ts <= prior_ts).unwrap_or(false) {
                return Reply::Error(409);
            }
        }
        // A first PUT, or a PUT over a record corruption already logged
        // by the store: both proceed to replace.
        Err(StoreError::NotFound) | Err(StoreError::Corrupted) => {}
        Err(StoreError::Io(e)) => {
            warn!(key = key_hex, error = %e, "board load failed");
            return Reply::Error(500);
        }
    }

    match ctx.store.replace(key_hex, signature_hex, &board) {
        Ok(()) => Reply::Created,
        Err(e) => {
            warn!(key = key_hex, error = %e, "board write failed");
            Reply::Error(500)
        }
    }
}

/// Serializes a reply into a slot buffer. Every response carries
/// `Connection: close`; the slot state machine disconnects after writing.
pub fn write_reply(reply: &Reply<'_>, buf: &mut [u8]) -> usize {
    let len = {
        let mut w = ResponseWriter::new(buf);
        w.status(reply.status()).header("Connection", "close");
        let len = match reply {
            Reply::Index(html) => {
                w.header("Content-Type", "text/html");
                w.finish(html)
            }
            Reply::BoardHit { signature, board } => {
                w.header("Content-Type", "text/html;charset=utf-8")
                    .header("Spring-Version", "83")
                    .header("Spring-Signature", signature);
                w.finish(board.content())
            }
            Reply::Cors => {
                w.header("Access-Control-Allow-Methods", "GET, OPTIONS, PUT")
                    .header("Access-Control-Allow-Origin", "*")
                    .header(
                        "Access-Control-Allow-Headers",
                        "Content-Type, If-Modified-Since, Spring-Signature, Spring-Version",
                    )
                    .header(
                        "Access-Control-Expose-Headers",
                        "Content-Type, Last-Modified, Spring-Signature, Spring-Version",
                    );
                w.finish_empty()
            }
            Reply::NotModified | Reply::Created | Reply::Error(_) => w.finish_empty(),
        };
        if w.overflowed() {
            None
        } else {
            Some(len)
        }
    };

    match len {
        Some(len) => len,
        None => {
            let mut w = ResponseWriter::new(buf);
            w.status(500).header("Connection", "close");
            w.finish_empty()
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
