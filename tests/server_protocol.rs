//! End-to-end protocol tests over a live socket.
//!
//! Each test binds a server on an ephemeral port inside a `LocalSet`,
//! then drives it with raw HTTP/1.1 bytes the way a real client would.
//! Conforming keypairs are drawn with the relaxed magic-suffix masks
//! (`test-keys` feature), so key searches finish in milliseconds; the
//! expiry-window rules stay fully enforced.

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::LocalSet;
use tokio::time::timeout;

use vernal::keys;
use vernal::{Board, BoardStore, Denylist, Keypair, Server, ServerContext};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One conforming keypair per test binary; every test can share it.
fn conforming_keypair() -> Keypair {
    static KEY: OnceLock<Keypair> = OnceLock::new();
    KEY.get_or_init(|| Keypair::generate_conforming(2).expect("key search failed"))
        .clone()
}

fn start(dir: &TempDir) -> (Server, SocketAddr) {
    let store = BoardStore::open(dir.path().join("boards")).unwrap();
    let denylist = Denylist::new(dir.path().join("denylist.txt"));
    let ctx = ServerContext::new(store, denylist, None);
    let server = Server::bind("127.0.0.1:0".parse().unwrap(), ctx).expect("bind failed");
    let addr = server.local_addr().unwrap();
    (server, addr)
}

/// Sends raw bytes on a fresh connection and returns the status code and
/// full response.
async fn send(addr: SocketAddr, raw: &[u8]) -> (u16, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.expect("connect failed");
    stream.write_all(raw).await.expect("send failed");
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.expect("recv failed");
    assert!(response.len() >= 12, "truncated response: {response:?}");
    let status = std::str::from_utf8(&response[9..12]).unwrap().parse().unwrap();
    (status, response)
}

fn response_body(response: &[u8]) -> &[u8] {
    let end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header terminator")
        + 4;
    &response[end..]
}

fn header_value<'a>(response: &'a [u8], name: &str) -> Option<&'a str> {
    let text = std::str::from_utf8(response).ok()?;
    let head = text.split("\r\n\r\n").next()?;
    head.lines().skip(1).find_map(|line| {
        let (n, v) = line.split_once(':')?;
        n.eq_ignore_ascii_case(name).then(|| v.trim())
    })
}

fn put_request(key_hex: &str, signature: &str, body: &[u8]) -> Vec<u8> {
    let mut raw = format!(
        "PUT /{key_hex} HTTP/1.1\r\nSpring-Signature: {signature}\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    raw.extend_from_slice(body);
    raw
}

fn signed_put(keypair: &Keypair, body: &[u8]) -> Vec<u8> {
    let signature = hex::encode(keypair.sign(body).to_bytes());
    put_request(&keypair.public_key_hex(), &signature, body)
}

fn get_request(path: &str) -> Vec<u8> {
    format!("GET {path} HTTP/1.1\r\n\r\n").into_bytes()
}

/// Runs a client future against a live server.
async fn with_server<F, Fut>(dir: &TempDir, client: F)
where
    F: FnOnce(SocketAddr) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let (server, addr) = start(dir);
    let local = LocalSet::new();
    local.spawn_local(server.run());
    local
        .run_until(timeout(TEST_TIMEOUT, client(addr)))
        .await
        .expect("test timed out");
}

#[tokio::test]
async fn publish_store_and_fetch() {
    let dir = TempDir::new().unwrap();
    let keypair = conforming_keypair();
    let key_hex = keypair.public_key_hex();
    let body = b"<time datetime=\"2024-06-01T00:00:00Z\">hello";
    let signature = hex::encode(keypair.sign(body).to_bytes());

    with_server(&dir, |addr| async move {
        let (status, _) = send(addr, &put_request(&key_hex, &signature, body)).await;
        assert_eq!(status, 201);

        let (status, response) = send(addr, &get_request(&format!("/{key_hex}"))).await;
        assert_eq!(status, 200);
        assert_eq!(response_body(&response), body);
        assert_eq!(header_value(&response, "Spring-Signature"), Some(signature.as_str()));
        assert_eq!(header_value(&response, "Spring-Version"), Some("83"));
        assert_eq!(
            header_value(&response, "Content-Type"),
            Some("text/html;charset=utf-8")
        );
    })
    .await;

    // On-disk record: signature line, then the raw content.
    let keypair_hex = keypair.public_key_hex();
    let stored = std::fs::read(dir.path().join("boards").join(&keypair_hex)).unwrap();
    let signature = hex::encode(keypair.sign(body).to_bytes());
    assert_eq!(&stored[..128], signature.as_bytes());
    assert_eq!(stored[128], b'\n');
    assert_eq!(&stored[129..], body);
}

#[tokio::test]
async fn stale_upload_conflicts_and_leaves_the_file_alone() {
    let dir = TempDir::new().unwrap();
    let keypair = conforming_keypair();
    let key_hex = keypair.public_key_hex();
    let newer = b"<time datetime=\"2024-06-01T00:00:00Z\">hello".to_vec();
    let older = b"<time datetime=\"2024-05-01T00:00:00Z\">older".to_vec();

    with_server(&dir, |addr| async move {
        let (status, _) = send(addr, &signed_put(&keypair, &newer)).await;
        assert_eq!(status, 201);
        let (status, _) = send(addr, &signed_put(&keypair, &older)).await;
        assert_eq!(status, 409);
    })
    .await;

    let stored = std::fs::read(dir.path().join("boards").join(&key_hex)).unwrap();
    assert!(stored.ends_with(b"<time datetime=\"2024-06-01T00:00:00Z\">hello"));
}

#[tokio::test]
async fn nonconforming_key_is_forbidden() {
    let dir = TempDir::new().unwrap();
    with_server(&dir, |addr| async move {
        let body = b"<time datetime=\"2024-06-01T00:00:00Z\">x";
        let keypair = Keypair::generate();
        let signature = hex::encode(keypair.sign(body).to_bytes());
        let (status, _) = send(addr, &put_request(&"0".repeat(64), &signature, body)).await;
        assert_eq!(status, 403);
    })
    .await;
}

#[tokio::test]
async fn oversize_board_is_too_large() {
    let dir = TempDir::new().unwrap();
    with_server(&dir, |addr| async move {
        let keypair = conforming_keypair();
        let mut body = b"<time datetime=\"2024-06-01T00:00:00Z\">".to_vec();
        body.resize(2218, b'x');
        let (status, _) = send(addr, &signed_put(&keypair, &body)).await;
        assert_eq!(status, 413);

        body.truncate(2217);
        let (status, _) = send(addr, &signed_put(&keypair, &body)).await;
        assert_eq!(status, 201);
    })
    .await;
}

#[tokio::test]
async fn options_answers_the_cors_preamble() {
    let dir = TempDir::new().unwrap();
    with_server(&dir, |addr| async move {
        let (status, response) = send(addr, b"OPTIONS /anything HTTP/1.1\r\n\r\n").await;
        assert_eq!(status, 204);
        assert_eq!(
            header_value(&response, "Access-Control-Allow-Methods"),
            Some("GET, OPTIONS, PUT")
        );
        assert_eq!(header_value(&response, "Access-Control-Allow-Origin"), Some("*"));
        assert_eq!(
            header_value(&response, "Access-Control-Allow-Headers"),
            Some("Content-Type, If-Modified-Since, Spring-Signature, Spring-Version")
        );
        assert_eq!(
            header_value(&response, "Access-Control-Expose-Headers"),
            Some("Content-Type, Last-Modified, Spring-Signature, Spring-Version")
        );
    })
    .await;
}

#[tokio::test]
async fn index_and_unknown_method() {
    let dir = TempDir::new().unwrap();
    with_server(&dir, |addr| async move {
        let (status, response) = send(addr, &get_request("/")).await;
        assert_eq!(status, 200);
        assert_eq!(header_value(&response, "Content-Type"), Some("text/html"));

        let (status, _) = send(addr, b"DELETE /key HTTP/1.1\r\n\r\n").await;
        assert_eq!(status, 405);
    })
    .await;
}

#[tokio::test]
async fn test_key_serves_a_live_signed_board() {
    let dir = TempDir::new().unwrap();
    let store = BoardStore::open(dir.path().join("boards")).unwrap();
    let denylist = Denylist::new(dir.path().join("denylist.txt"));
    let ctx = ServerContext::new(store, denylist, None);
    let test_key_hex = ctx.test_key_hex().to_string();

    let server = Server::bind("127.0.0.1:0".parse().unwrap(), ctx).unwrap();
    let addr = server.local_addr().unwrap();
    let local = LocalSet::new();
    local.spawn_local(server.run());
    local
        .run_until(timeout(TEST_TIMEOUT, async {
            let (status, response) = send(addr, &get_request(&format!("/{test_key_hex}"))).await;
            assert_eq!(status, 200);

            let body = response_body(&response);
            let board = Board::new(body).expect("live board must validate");
            let signature = header_value(&response, "Spring-Signature").unwrap();
            let public = keys::public_key_from_hex(&test_key_hex).unwrap();
            board
                .verify_signature(signature, &public)
                .expect("live board must verify under the test key");
        }))
        .await
        .expect("test timed out");
}

#[tokio::test]
async fn hostile_bytes_get_a_clean_response() {
    let dir = TempDir::new().unwrap();
    with_server(&dir, |addr| async move {
        // Never-parseable request line.
        let (status, _) = send(addr, b"GARBAGE\r\n\r\n").await;
        assert_eq!(status, 400);

        // A request that cannot fit the slot buffer. The server answers
        // mid-stream, so only the status line is read back; waiting for
        // EOF could race the reset of the unread request tail.
        let huge = format!(
            "PUT /{} HTTP/1.1\r\nContent-Length: 100000\r\n\r\n{}",
            "a".repeat(64),
            "x".repeat(8192)
        );
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let _ = stream.write_all(huge.as_bytes()).await;
        let mut buf = [0u8; 64];
        let mut filled = 0;
        while filled < 12 {
            match stream.read(&mut buf[filled..]).await {
                Ok(0) | Err(_) => break,
                Ok(n) => filled += n,
            }
        }
        assert!(buf[..filled].starts_with(b"HTTP/1.1 413"));
    })
    .await;
}

#[tokio::test]
async fn slots_recycle_across_many_connections() {
    let dir = TempDir::new().unwrap();
    with_server(&dir, |addr| async move {
        let keypair = conforming_keypair();
        let key_hex = keypair.public_key_hex();

        for day in 1..=5u8 {
            let body =
                format!("<time datetime=\"2024-06-{day:02}T00:00:00Z\">rev {day}").into_bytes();
            let (status, _) = send(addr, &signed_put(&keypair, &body)).await;
            assert_eq!(status, 201);

            let (status, response) = send(addr, &get_request(&format!("/{key_hex}"))).await;
            assert_eq!(status, 200);
            assert_eq!(response_body(&response), body.as_slice());
        }
    })
    .await;
}
