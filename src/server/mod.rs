//! The tag server: socket listeners, connection tasks, and lifecycle.
//!
//! One long-lived process owns the tag database and serves module
//! connections on a UNIX socket and, when configured, a TCP port. Each
//! accepted connection runs three small tasks: a reader that decodes
//! frames and dispatches them, a notifier that drains the connection's
//! event queue, and a writer that owns the socket's write half so
//! response and event frames never interleave.

pub mod config;
pub mod connection;
pub mod core;
pub mod dispatch;

pub use self::config::{parse_args, CliOptions, ConfigError, ServerConfig, USAGE};
pub use self::core::ServerCore;

use std::sync::Arc;

use anyhow::Context;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;

use crate::error::ErrorCode;
use crate::logger::{self, Topics};
use crate::protocol::{error_frame, MessageHeader, HEADER_SIZE};
use crate::retention::RetentionStore;
use crate::tagbase::TagBase;
use crate::topic_log;
use self::connection::{ConnState, Connections};
use self::dispatch::now_ms;

/// Handle for requesting a clean shutdown from outside the server task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// The tag server.
pub struct TagServer {
    config: ServerConfig,
    core: Arc<RwLock<ServerCore>>,
    conns: Arc<Connections>,
    shutdown_tx: watch::Sender<bool>,
}

impl TagServer {
    /// Build the server: tag database with virtual tags, retention store
    /// loaded from disk, empty event/map/group tables.
    pub fn new(config: ServerConfig) -> Self {
        logger::set_topics(config.verbosity);
        let start_ms = now_ms();
        let tags = TagBase::new(config.tag_list_start_size, config.queue_depth, start_ms);
        let retention = RetentionStore::open(&config.retention_file);
        let core = ServerCore::new(tags, retention, config.max_message_size);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            core: Arc::new(RwLock::new(core)),
            conns: Arc::new(Connections::new()),
            shutdown_tx,
        }
    }

    /// Shared core, for embedding and tests.
    pub fn core(&self) -> Arc<RwLock<ServerCore>> {
        self.core.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Run until a signal or the shutdown handle stops the server, then
    /// flush retention and release the sockets.
    pub async fn run(self) -> anyhow::Result<()> {
        let config = &self.config;
        topic_log!(Topics::MAJOR, "tag server starting");
        if config.daemonize {
            // forking belongs to the service supervisor; honor the flag by
            // logging it so configurations port over cleanly
            topic_log!(Topics::CONFIG, "daemonize requested; running in the foreground");
        }
        if let Some(pid_file) = &config.pid_file {
            std::fs::write(pid_file, std::process::id().to_string())
                .with_context(|| format!("writing pid file {}", pid_file.display()))?;
        }

        // a stale socket file from an unclean exit would block the bind
        let _ = std::fs::remove_file(&config.socket_path);
        let unix = UnixListener::bind(&config.socket_path)
            .with_context(|| format!("binding {}", config.socket_path.display()))?;
        topic_log!(Topics::MAJOR, "listening on {}", config.socket_path.display());

        let tcp = match config.tcp_port {
            Some(port) => {
                let listener = TcpListener::bind((config.tcp_host.as_str(), port))
                    .await
                    .with_context(|| format!("binding {}:{}", config.tcp_host, port))?;
                topic_log!(Topics::MAJOR, "listening on {}:{}", config.tcp_host, port);
                Some(listener)
            }
            None => None,
        };

        let flusher = tokio::spawn(retention_flusher(
            self.core.clone(),
            self.config.retention_interval_ms,
            self.shutdown_tx.subscribe(),
        ));

        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigquit = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::quit())?;
        // SIGPIPE is ignored by the runtime; broken sockets surface as
        // write errors on the connection tasks

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            let tcp_accept = async {
                match &tcp {
                    Some(listener) => listener.accept().await.map(|(s, _)| s),
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = sigint.recv() => break,
                _ = sigterm.recv() => break,
                _ = sigquit.recv() => break,
                accepted = unix.accept() => match accepted {
                    Ok((stream, _)) => self.spawn_connection(stream),
                    Err(e) => topic_log!(Topics::ERROR, "accept failed: {}", e),
                },
                accepted = tcp_accept => match accepted {
                    Ok(stream) => {
                        let _ = stream.set_nodelay(true);
                        self.spawn_connection(stream);
                    }
                    Err(e) => topic_log!(Topics::ERROR, "tcp accept failed: {}", e),
                },
            }
        }

        topic_log!(Topics::MAJOR, "shutting down");
        let _ = self.shutdown_tx.send(true);
        let _ = flusher.await;
        flush_retention(&self.core);
        if let Err(e) = self.core.read().retention.save() {
            topic_log!(Topics::ERROR, "final retention flush failed: {}", e);
        }
        let _ = std::fs::remove_file(&config.socket_path);
        if let Some(pid_file) = &config.pid_file {
            let _ = std::fs::remove_file(pid_file);
        }
        topic_log!(Topics::MAJOR, "tag server stopped");
        Ok(())
    }

    fn spawn_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let state = self.conns.register();
        tokio::spawn(serve_connection(
            stream,
            self.core.clone(),
            self.conns.clone(),
            state,
            self.config.max_message_size,
            self.shutdown_tx.subscribe(),
        ));
    }
}

/// Periodically write dirty retained tags back to the store.
async fn retention_flusher(
    core: Arc<RwLock<ServerCore>>,
    interval_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(50)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Some((path, bytes)) = collect_retention(&core) {
                    if let Err(e) = std::fs::write(&path, bytes) {
                        topic_log!(Topics::ERROR, "retention flush to {} failed: {}", path.display(), e);
                    }
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// Fold the dirty set into the retention records under the lock; the file
/// write happens outside it.
fn collect_retention(core: &RwLock<ServerCore>) -> Option<(std::path::PathBuf, Vec<u8>)> {
    let mut guard = core.write();
    let c = &mut *guard;
    if !c.retention.has_dirty() {
        return None;
    }
    for index in c.retention.take_dirty() {
        if let Ok(tag) = c.tags.get(index) {
            c.retention
                .update(&tag.name, tag.type_code, tag.count, tag.raw_data().to_vec());
        }
    }
    Some((c.retention.path().to_path_buf(), c.retention.serialize()))
}

/// Synchronous variant used on the shutdown path.
fn flush_retention(core: &Arc<RwLock<ServerCore>>) {
    let mut guard = core.write();
    let c = &mut *guard;
    for index in c.retention.take_dirty() {
        if let Ok(tag) = c.tags.get(index) {
            c.retention
                .update(&tag.name, tag.type_code, tag.count, tag.raw_data().to_vec());
        }
    }
}

/// Serve one connection until EOF, error, or shutdown.
async fn serve_connection<S>(
    stream: S,
    core: Arc<RwLock<ServerCore>>,
    conns: Arc<Connections>,
    state: Arc<ConnState>,
    max_message_size: u32,
    shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (rd, wr) = tokio::io::split(stream);
    let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer = tokio::spawn(write_loop(wr, frame_rx));
    let notifier = tokio::spawn(notify_loop(
        state.clone(),
        frame_tx.clone(),
        shutdown.clone(),
    ));

    read_loop(rd, &core, &conns, &state, &frame_tx, max_message_size, shutdown).await;

    notifier.abort();
    drop(frame_tx);
    let _ = writer.await;

    // implicit cleanup: release everything the connection owned
    let notes = core.write().drop_connection(state.id, now_ms());
    conns.route(notes);
    conns.remove(state.id);
}

async fn read_loop<R>(
    mut rd: R,
    core: &RwLock<ServerCore>,
    conns: &Connections,
    state: &ConnState,
    frame_tx: &mpsc::UnboundedSender<Vec<u8>>,
    max_message_size: u32,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            read = rd.read_exact(&mut header_buf) => {
                if read.is_err() {
                    return;
                }
            }
        }
        let header = MessageHeader::decode(&header_buf);
        if header.size > max_message_size {
            topic_log!(
                Topics::MSGERR,
                "connection {}: oversized message of {} bytes",
                state.id,
                header.size
            );
            if frame_tx
                .send(error_frame(header.base_command(), header.id, ErrorCode::TooBig))
                .is_err()
            {
                return;
            }
            if discard(&mut rd, header.size as usize).await.is_err() {
                return;
            }
            continue;
        }
        let mut payload = vec![0u8; header.size as usize];
        if rd.read_exact(&mut payload).await.is_err() {
            return;
        }
        let frame = dispatch::dispatch(core, conns, state.id, header, &payload);
        // notifications this request produced for this same connection go
        // out ahead of the response, as modules expect
        if !state.drain_into(frame_tx) {
            return;
        }
        if frame_tx.send(frame).is_err() {
            return;
        }
    }
}

/// Consume and drop `n` bytes to stay in frame sync after a rejected
/// message.
async fn discard<R: AsyncRead + Unpin>(rd: &mut R, mut n: usize) -> std::io::Result<()> {
    let mut scratch = [0u8; 1024];
    while n > 0 {
        let take = n.min(scratch.len());
        rd.read_exact(&mut scratch[..take]).await?;
        n -= take;
    }
    Ok(())
}

async fn write_loop<W>(mut wr: W, mut rx: mpsc::UnboundedReceiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if wr.write_all(&frame).await.is_err() {
            return;
        }
        if wr.flush().await.is_err() {
            return;
        }
    }
    let _ = wr.shutdown().await;
}

/// Drain the notification queue into event frames whenever it signals.
async fn notify_loop(
    state: Arc<ConnState>,
    frame_tx: mpsc::UnboundedSender<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = state.notify.wait() => {}
        }
        if !state.drain_into(&frame_tx) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        use std::sync::atomic::{AtomicU32, Ordering};
        static SEQ: AtomicU32 = AtomicU32::new(0);
        std::env::temp_dir().join(format!(
            "dax_srv_{}_{}_{}",
            name,
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ))
    }

    #[tokio::test]
    async fn test_server_starts_and_stops() {
        let config = ServerConfig {
            socket_path: temp_path("sock"),
            retention_file: temp_path("ret.db"),
            ..ServerConfig::default()
        };
        let socket = config.socket_path.clone();
        let retention = config.retention_file.clone();
        let server = TagServer::new(config);
        let handle = server.shutdown_handle();
        let task = tokio::spawn(server.run());

        // wait for the socket to appear
        for _ in 0..100 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(socket.exists());

        handle.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("server did not stop")
            .expect("server task panicked");
        assert!(result.is_ok());
        // clean shutdown unlinks the socket
        assert!(!socket.exists());
        let _ = std::fs::remove_file(&retention);
    }

    #[tokio::test]
    async fn test_virtual_tags_installed_at_boot() {
        let config = ServerConfig {
            socket_path: temp_path("sock"),
            retention_file: temp_path("ret.db"),
            ..ServerConfig::default()
        };
        let server = TagServer::new(config);
        let core = server.core();
        let core = core.read();
        assert!(core.tags.index_of("_time").is_ok());
        assert!(core.tags.index_of("_starttime").is_ok());
        assert!(core.tags.index_of("_server_version").is_ok());
    }
}
