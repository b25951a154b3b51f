//! Web-of-trust engine daemon: opens the configured entity store, wires
//! up the engine, and serves the FCP-style control surface over a plain
//! TCP line-oriented socket. One connection, one
//! frame: the client writes a request frame and reads back exactly one
//! reply frame before the connection is expected to send the next one.
//!
//! The content-addressed fetch/insert primitive is an external
//! collaborator; this daemon wires the introduction
//! subsystem's insert clients to [`Unconfigured`], which always reports
//! a transient failure, so a fresh checkout runs (and its tests pass)
//! without a host network attached. An embedder replaces it with a real
//! client the same way it replaces `Engine::introduction_server`'s own
//! argument.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use wot_engine::capability::Capabilities;
use wot_engine::config::EngineConfig;
use wot_engine::control::{Frame, FrameSink};
use wot_engine::downloader::{FetchClient, FetchOutcome, InsertClient};
use wot_engine::error::{WotError, WotResult};
use wot_engine::introduction::{PuzzleDownloadClient, SolutionInsertClient};
use wot_engine::Engine;

/// Stand-in for the out-of-scope host-network fetch/insert/puzzle-download
/// primitives. Every call fails as transient (or reports nothing found) so
/// callers retry rather than silently losing intent, and a fresh checkout
/// runs the background jobs (and its tests pass) without a host network
/// attached. An embedder swaps each trait for a real client the same way
/// it replaces `Engine::introduction_server`'s own argument.
struct Unconfigured;

#[async_trait]
impl SolutionInsertClient for Unconfigured {
    async fn insert_solution(&self, _address: &str, _bytes: &[u8]) -> WotResult<()> {
        Err(WotError::Transient(
            "no insert client configured for this daemon".into(),
        ))
    }
}

#[async_trait]
impl FetchClient for Unconfigured {
    async fn fetch(&self, _request_key: &str, _edition_hint: u64) -> WotResult<FetchOutcome> {
        Ok(FetchOutcome::NotFound)
    }
}

#[async_trait]
impl InsertClient for Unconfigured {
    async fn insert(&self, _insert_key: &str, _edition: u64, _bytes: &[u8]) -> WotResult<()> {
        Err(WotError::Transient(
            "no insert client configured for this daemon".into(),
        ))
    }
}

#[async_trait]
impl PuzzleDownloadClient for Unconfigured {
    async fn fetch_puzzle(&self, _address: &str) -> WotResult<Vec<u8>> {
        Err(WotError::Transient(
            "no puzzle download client configured for this daemon".into(),
        ))
    }
}

/// Ships notification/snapshot frames back over the same TCP connection
/// that registered the subscription.
struct TcpFrameSink(tokio::sync::Mutex<tokio::net::tcp::OwnedWriteHalf>);

#[async_trait]
impl FrameSink for TcpFrameSink {
    async fn send(&self, frame: Frame) -> WotResult<()> {
        let mut write_half = self.0.lock().await;
        write_half
            .write_all(&frame.encode())
            .await
            .map_err(|e| WotError::Transient(format!("writing frame: {e}")))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = EngineConfig::default();
    log::info!(
        "starting wotd: store_backend={:?} db_path={} queue_kind={:?}",
        config.store_backend,
        config.db_path,
        config.queue_kind
    );

    let engine = Arc::new(Engine::open(config, Capabilities::system())?);
    let dispatcher = Arc::new(engine.dispatcher(Arc::new(Unconfigured)));
    let background_jobs = engine.clone().run_background_jobs(
        Arc::new(Unconfigured),
        Arc::new(Unconfigured),
        Arc::new(Unconfigured),
    )?;

    let listen_addr = std::env::var("WOT_LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:9481".into());
    let listener = TcpListener::bind(&listen_addr).await?;
    log::info!("control surface listening on {listen_addr}");

    let shutdown = Arc::new(tokio::sync::Notify::new());
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.notify_waiters();
        })?;
    }

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                log::info!("received interrupt, shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, dispatcher).await {
                        log::warn!("connection from {peer} ended with error: {err}");
                    }
                });
            }
        }
    }

    background_jobs.shutdown();
    Ok(())
}

/// Reads one request frame, dispatches it, and writes back the reply.
/// Subsequent frames delivered out-of-band to a `Subscribe` response
/// (snapshots and per-notification pushes) reuse the same write half via
/// [`TcpFrameSink`], so the connection stays open for the life of the
/// subscription rather than closing after the first reply.
async fn handle_connection(stream: TcpStream, dispatcher: Arc<wot_engine::control::Dispatcher>) -> anyhow::Result<()> {
    let (mut read_half, write_half) = stream.into_split();
    let sink: Arc<dyn FrameSink> = Arc::new(TcpFrameSink(tokio::sync::Mutex::new(write_half)));

    loop {
        let frame = match read_frame(&mut read_half).await? {
            Some(frame) => frame,
            None => return Ok(()),
        };
        let reply = dispatcher.dispatch(&frame, Some(sink.clone())).await;
        sink.send(reply).await.map_err(|e| anyhow::anyhow!(e.to_string()))?;
    }
}

/// Reads one frame's worth of bytes up to and including the
/// `EndMessage\n` terminator line, or `None` on a clean EOF before any
/// bytes are read.
async fn read_frame(read_half: &mut tokio::net::tcp::OwnedReadHalf) -> anyhow::Result<Option<Frame>> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = read_half.read(&mut byte).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            break;
        }
        buf.push(byte[0]);
        if buf.ends_with(b"EndMessage\n") {
            break;
        }
    }
    Ok(Some(Frame::parse(&buf)?))
}
