//! # Push Client
//!
//! The client half of the protocol: PUT a signed board to a server over
//! plain TCP. Used by the `push` subcommand; the server never calls this.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;

use crate::keys::Keypair;

const PUSH_TIMEOUT: Duration = Duration::from_secs(15);

/// Signs `content` with `keypair` and PUTs it under the derived key.
/// Returns the server's status code.
pub async fn push_board(host: &str, port: u16, keypair: &Keypair, content: &[u8]) -> Result<u16> {
    let key_hex = keypair.public_key_hex();
    let signature_hex = hex::encode(keypair.sign(content).to_bytes());

    let mut stream = time::timeout(PUSH_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .context("connect timed out")?
        .with_context(|| format!("failed to connect to {host}:{port}"))?;

    let head = format!(
        "PUT /{key_hex} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Content-Type: text/html;charset=utf-8\r\n\
         Spring-Version: 83\r\n\
         Spring-Signature: {signature_hex}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        content.len()
    );

    time::timeout(PUSH_TIMEOUT, async {
        stream.write_all(head.as_bytes()).await?;
        stream.write_all(content).await?;
        Ok::<_, std::io::Error>(())
    })
    .await
    .context("send timed out")?
    .context("failed to send board")?;

    let mut response = Vec::with_capacity(512);
    time::timeout(PUSH_TIMEOUT, stream.read_to_end(&mut response))
        .await
        .context("response timed out")?
        .context("failed to read response")?;

    parse_status(&response)
}

/// Pulls the status code out of an HTTP/1.1 status line.
fn parse_status(response: &[u8]) -> Result<u16> {
    let line = response
        .split(|&b| b == b'\r')
        .next()
        .and_then(|l| std::str::from_utf8(l).ok())
        .unwrap_or_default();
    let mut parts = line.split(' ');
    match (parts.next(), parts.next()) {
        (Some(version), Some(status)) if version.starts_with("HTTP/1.") => {
            status.parse().context("unparseable status code")
        }
        _ => bail!("malformed response from server: {line:?}"),
    }
}
