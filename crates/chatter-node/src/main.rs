//! `chatter` - serverless encrypted chat between two peers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use chatter_core::config::load_config;
use chatter_core::{Clock, ProxyMode, SystemClock};
use chatter_crypto::{Identity, SharedSecret};
use chatter_node::files::{FileStore, NewFileObject};
use chatter_node::session::{
    PeerSession, SessionEvent, SessionOptions, SessionState, SignatureStatus,
};
use chatter_node::transport::TransportListener;

#[derive(Parser, Debug)]
#[command(name = "chatter")]
#[command(version, about = "P2P Chatter - end-to-end encrypted peer chat")]
struct Args {
    /// Path to a JSON config file (defaults to the per-user config).
    #[arg(long, global = true, env = "CHATTER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, global = true, default_value = "info", env = "CHATTER_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON.
    #[arg(long, global = true, env = "CHATTER_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a throwaway identity and a freshly generated share password.
    Identity,

    /// Wait for one peer to connect.
    Listen {
        #[arg(long, default_value = "127.0.0.1:4444")]
        bind: String,

        #[command(flatten)]
        chat: ChatArgs,
    },

    /// Connect to a listening peer.
    Connect {
        /// Peer address (`host:port`, `.onion` hosts need `--proxy`).
        address: String,

        /// Username the peer is expected to present.
        #[arg(long)]
        peer: String,

        /// Route through a SOCKS5 proxy such as a local Tor client.
        #[arg(long, env = "CHATTER_PROXY")]
        proxy: Option<String>,

        #[command(flatten)]
        chat: ChatArgs,
    },
}

#[derive(clap::Args, Debug)]
struct ChatArgs {
    /// Secret shared with the peer out of band.
    #[arg(long, env = "CHATTER_SECRET", hide_env_values = true)]
    secret: String,

    /// Username to present (random when omitted).
    #[arg(long)]
    username: Option<String>,

    /// Where `/get` and `/open` write retrieved files.
    #[arg(long, default_value = ".")]
    download_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log_filter = format!("chatter_node={0},chatter={0}", args.log_level);
    chatter_core::tracing_init::init_tracing(&log_filter, args.log_json);

    let mut config = load_config(args.config.as_deref()).context("loading config")?;

    match args.command {
        Command::Identity => {
            let identity = Identity::generate();
            print_line(&format!("username     {}", identity.username()));
            print_line(&format!("fingerprint  {}", identity.fingerprint()));
            print_line(&format!("signing key  {}", identity.signing_keys().fingerprint()));
            print_line(&format!("secret       {}", SharedSecret::generate().expose()));
            Ok(())
        }
        Command::Listen { bind, chat } => {
            let listener = TransportListener::bind(&bind).await?;
            let (session, secret, download_dir) = build_session(&config, chat)?;
            print_line(&format!(
                "Listening on {} as {}",
                listener.local_addr()?,
                session.username().await
            ));
            session.accept(&listener, secret).await?;
            chat_loop(&session, &download_dir).await
        }
        Command::Connect {
            address,
            peer,
            proxy,
            chat,
        } => {
            if let Some(endpoint) = proxy {
                config.network.proxy_mode = ProxyMode::Anonymizing;
                config.network.proxy_endpoint = Some(endpoint);
            }
            let (session, secret, download_dir) = build_session(&config, chat)?;
            session.connect(&address, &peer, secret).await?;
            chat_loop(&session, &download_dir).await
        }
    }
}

fn build_session(
    config: &chatter_core::Config,
    chat: ChatArgs,
) -> anyhow::Result<(PeerSession, SharedSecret, PathBuf)> {
    let identity = match chat.username {
        Some(name) => Identity::with_username(name)?,
        None => Identity::generate(),
    };
    info!(
        version = env!("CARGO_PKG_VERSION"),
        username = %identity.username(),
        fingerprint = %identity.fingerprint(),
        proxy = ?config.network.proxy_mode,
        "Starting chatter"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let files = Arc::new(FileStore::new(&config.files, Arc::clone(&clock)));
    let options = SessionOptions::from_config(config).with_clock(clock);
    let session = PeerSession::new(identity, files, options);
    Ok((session, SharedSecret::new(chat.secret), chat.download_dir))
}

async fn chat_loop(session: &PeerSession, download_dir: &Path) -> anyhow::Result<()> {
    let peer = session.peer_username().await.unwrap_or_default();
    let fingerprint = session.peer_fingerprint().await.unwrap_or_default();
    print_line(&format!("Connected to {peer} ({fingerprint})"));
    print_line(&format!("Your signing key: {}", session.signing_fingerprint().await));
    print_line(
        "Type to chat. Commands: /sign <text>, /share <path> <password> [ttl-secs], \
         /get <id> <password>, /open <id> <password>, /files, /quit",
    );

    let mut events = session.subscribe();
    let mut state = session.watch_state();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    session.close().await?;
                    break;
                };
                if line.trim() == "/quit" {
                    session.close().await?;
                    break;
                }
                if let Err(e) = handle_input(session, line.trim(), download_dir).await {
                    print_line(&format!("! {e:#}"));
                }
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "Event consumer lagged"),
                Err(RecvError::Closed) => break,
            },
            changed = state.changed() => {
                if changed.is_err() || state.borrow_and_update().is_terminal() {
                    break;
                }
            }
        }
    }

    match session.state() {
        SessionState::Failed(kind) => bail!("session failed: {kind}"),
        _ => Ok(()),
    }
}

async fn handle_input(
    session: &PeerSession,
    line: &str,
    download_dir: &Path,
) -> anyhow::Result<()> {
    let mut words = line.split_whitespace();
    match words.next() {
        None => Ok(()),
        Some("/files") => {
            for meta in session.files().list().await {
                print_line(&format!(
                    "{}  {}  {} bytes  owner {}",
                    meta.id, meta.name, meta.size_bytes, meta.owner
                ));
            }
            Ok(())
        }
        Some("/share") => {
            let (Some(path), Some(password)) = (words.next(), words.next()) else {
                bail!("usage: /share <path> <password> [ttl-secs]");
            };
            let payload = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading {path}"))?;
            let name = Path::new(path)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(path);
            let mut new = NewFileObject::new(session.username().await, name, payload, password);
            if let Some(peer) = session.peer_username().await {
                new = new.with_recipients([peer]);
            }
            if let Some(ttl) = words.next() {
                new = new.with_ttl(Duration::from_secs(ttl.parse().context("ttl-secs")?));
            }
            let meta = session.files().create(new).await?;
            session.offer_file(&meta.id).await?;
            print_line(&format!("Shared {} as {}", meta.name, meta.id));
            Ok(())
        }
        Some(cmd @ ("/get" | "/open")) => {
            let (Some(id), Some(password)) = (words.next(), words.next()) else {
                bail!("usage: {cmd} <id> <password>");
            };
            let (name, payload) = if cmd == "/get" {
                let file = session.request_file(id, password).await?;
                (file.name, file.payload)
            } else {
                let file = session.files().retrieve(id, password).await?;
                (file.metadata.name, file.payload)
            };
            let file_name = Path::new(&name)
                .file_name()
                .context("file has no usable name")?;
            let target = download_dir.join(file_name);
            tokio::fs::write(&target, &payload)
                .await
                .with_context(|| format!("writing {}", target.display()))?;
            print_line(&format!("Saved {} ({} bytes)", target.display(), payload.len()));
            Ok(())
        }
        Some("/sign") => {
            let body = line.trim_start_matches("/sign").trim();
            if body.is_empty() {
                bail!("usage: /sign <text>");
            }
            session.send_signed_message(body).await?;
            Ok(())
        }
        Some(other) if other.starts_with('/') => bail!("unknown command {other}"),
        Some(_) => {
            session.send_message(line).await?;
            Ok(())
        }
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::MessageReceived {
            body,
            sender,
            signature,
            ..
        } => match signature {
            SignatureStatus::Unsigned => print_line(&format!("<{sender}> {body}")),
            SignatureStatus::Verified { fingerprint } => {
                print_line(&format!("<{sender}> {body}  [signed {fingerprint}]"));
            }
            SignatureStatus::Invalid => {
                print_line(&format!("<{sender}> {body}  [BAD SIGNATURE]"));
            }
        },
        SessionEvent::FileObjectAvailable(meta) => print_line(&format!(
            "* {} offered {} ({} bytes) as {}; /open {} <password>",
            meta.owner, meta.name, meta.size_bytes, meta.id, meta.id
        )),
        SessionEvent::Error { kind, detail } => print_line(&format!("! {kind}: {detail}")),
        SessionEvent::StateChanged(state) => info!(state = %state, "Session state changed"),
    }
}

#[allow(clippy::print_stdout)]
fn print_line(line: &str) {
    println!("{line}");
}
