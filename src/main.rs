use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use vernal::board::{Board, TIME_ELEMENT_PREFIX};
use vernal::denylist::Denylist;
use vernal::handler::{ServerContext, INDEX_MAX_LEN, INDEX_PATH};
use vernal::keys::{KeyMonthYear, Keypair};
use vernal::push::push_board;
use vernal::server::Server;
use vernal::store::BoardStore;
use vernal::timestamp::Timestamp;

#[derive(Parser, Debug)]
#[command(name = "vernal")]
#[command(author, version, about = "A Spring-83 board server and toolkit", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the board server.
    Server {
        #[arg(long, default_value_t = 8383)]
        port: u16,

        /// Directory of stored boards, one file per public key.
        #[arg(long, default_value = "boards")]
        board_dir: PathBuf,

        /// Newline-delimited file of banned public keys.
        #[arg(long, default_value = "denylist.txt")]
        denylist: PathBuf,
    },

    /// Search for a conforming keypair and print it.
    Key {
        /// Worker threads racing the search; defaults to all cores.
        #[arg(long)]
        threads: Option<usize>,
    },

    /// Sign a board file and print the signature.
    Sign {
        #[arg(long)]
        board: PathBuf,

        /// File holding the 128-hex secret+public key line.
        #[arg(long)]
        key_file: PathBuf,

        /// Insert a fresh <time> element if the board has none,
        /// rewriting the file before signing.
        #[arg(long)]
        append_timestamp: bool,
    },

    /// Sign a board and upload it to a server.
    Push {
        #[arg(long)]
        server: String,

        #[arg(long, default_value_t = 8383)]
        port: u16,

        #[arg(long)]
        board: PathBuf,

        #[arg(long)]
        key_file: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Server { port, board_dir, denylist } => run_server(port, board_dir, denylist).await,
        Command::Key { threads } => generate_key(threads),
        Command::Sign { board, key_file, append_timestamp } => {
            sign_board(&board, &key_file, append_timestamp)
        }
        Command::Push { server, port, board, key_file } => {
            push_to_server(&server, port, &board, &key_file).await
        }
    }
}

async fn run_server(port: u16, board_dir: PathBuf, denylist: PathBuf) -> Result<()> {
    let store = BoardStore::open(&board_dir)
        .with_context(|| format!("failed to create board directory {}", board_dir.display()))?;
    let denylist = Denylist::new(denylist);

    let index_html = match std::fs::read(INDEX_PATH) {
        Ok(html) => Some(html),
        Err(e) => {
            warn!(error = %e, path = INDEX_PATH, "index page unavailable, using fallback");
            None
        }
    };
    if let Some(html) = &index_html {
        if html.len() > INDEX_MAX_LEN {
            warn!(len = html.len(), max = INDEX_MAX_LEN, "index page truncated");
        }
    }

    let ctx = ServerContext::new(store, denylist, index_html);
    info!(test_key = ctx.test_key_hex(), "test board key");

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server = Server::bind(addr, ctx)?;
    server.serve().await
}

fn generate_key(threads: Option<usize>) -> Result<()> {
    let threads = threads.unwrap_or_else(|| {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    });
    info!(threads, "searching for a conforming keypair, this can take minutes");

    let keypair = Keypair::generate_conforming(threads)?;
    let public = keypair.public_key_bytes();
    let expiry = KeyMonthYear::from_public_key(&public)
        .context("conforming key must carry a decodable expiry")?;

    println!("public: {}", keypair.public_key_hex());
    println!("secret: {}", hex::encode(keypair.secret_key_bytes()));
    println!("key file line: {}", keypair.to_key_file_hex());
    println!("expires: {:02}/{}", expiry.month, expiry.year);
    Ok(())
}

fn read_key_file(path: &Path) -> Result<Keypair> {
    let line = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read key file {}", path.display()))?;
    Keypair::from_key_file_hex(line.trim())
        .with_context(|| format!("invalid key file {}", path.display()))
}

fn sign_board(board_path: &Path, key_file: &Path, append_timestamp: bool) -> Result<()> {
    let mut content = std::fs::read(board_path)
        .with_context(|| format!("failed to read board {}", board_path.display()))?;
    let keypair = read_key_file(key_file)?;

    let has_timestamp = content
        .windows(TIME_ELEMENT_PREFIX.len())
        .any(|w| w == TIME_ELEMENT_PREFIX);
    if append_timestamp && !has_timestamp {
        content.extend_from_slice(format!("<time datetime=\"{}\">", Timestamp::now()).as_bytes());
        std::fs::write(board_path, &content)
            .with_context(|| format!("failed to rewrite {}", board_path.display()))?;
        info!(path = %board_path.display(), "appended timestamp element");
    }

    Board::new(&content).context("board failed validation")?;

    let signature = keypair.sign(&content);
    println!("{}", hex::encode(signature.to_bytes()));
    Ok(())
}

async fn push_to_server(server: &str, port: u16, board_path: &Path, key_file: &Path) -> Result<()> {
    let content = std::fs::read(board_path)
        .with_context(|| format!("failed to read board {}", board_path.display()))?;
    let keypair = read_key_file(key_file)?;
    Board::new(&content).context("board failed validation")?;

    let status = push_board(server, port, &keypair, &content).await?;
    match status {
        201 => {
            info!(status, key = keypair.public_key_hex(), "board published");
            Ok(())
        }
        _ => bail!("server refused the board with status {status}"),
    }
}
