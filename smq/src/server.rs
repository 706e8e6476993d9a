use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use smq_conf::Settings;
use smq_net::{Acceptor, Builder, ByteStream, SocketStream};

use crate::context::ServerContext;
use crate::Result;

type Sweeper = (Sender<()>, JoinHandle<()>);

/// A running broker: one TCP listener, the socket event multiplexer, the
/// worker pool and the message store sweeper.
pub struct SmqServer {
    scx: ServerContext,
    acceptor: Acceptor,
    sweeper: Mutex<Option<Sweeper>>,
    stopped: AtomicBool,
}

impl SmqServer {
    pub fn start(settings: Settings) -> Result<Self> {
        settings.logs();
        let scx = ServerContext::new(settings)?;
        match Self::serve(&scx) {
            Ok((acceptor, sweeper)) => {
                log::info!("SMQ broker started on {}", acceptor.local_addr());
                Ok(SmqServer { scx, acceptor, sweeper: Mutex::new(sweeper), stopped: AtomicBool::new(false) })
            }
            Err(e) => {
                scx.events.stop();
                scx.pool.stop();
                Err(e)
            }
        }
    }

    fn serve(scx: &ServerContext) -> Result<(Acceptor, Option<Sweeper>)> {
        let cfg = &scx.settings.listener;
        let listener = Builder::new()
            .name(&cfg.name)
            .laddr(cfg.addr)
            .backlog(cfg.backlog)
            .nodelay(cfg.nodelay)
            .reuseaddr(cfg.reuseaddr)
            .reuseport(cfg.reuseport)
            .max_packet_size(cfg.max_packet_size.as_u32())
            .send_timeout(cfg.send_timeout)
            .bind()?;

        scx.events.start("smq-events", scx.settings.broker.poll_timeout)?;

        let accept_scx = scx.clone();
        let acceptor = listener.spawn(move |stream| on_accept(&accept_scx, stream))?;
        match Self::start_sweeper(scx) {
            Ok(sweeper) => Ok((acceptor, sweeper)),
            Err(e) => {
                acceptor.stop()?;
                Err(e)
            }
        }
    }

    /// Periodically drops stored messages older than `broker.message_expiry`.
    fn start_sweeper(scx: &ServerContext) -> Result<Option<Sweeper>> {
        let expiry = scx.settings.broker.message_expiry;
        let interval = scx.settings.broker.store_sweep_interval;
        if expiry.is_zero() || interval.is_zero() {
            return Ok(None);
        }
        let (tx, rx) = bounded::<()>(1);
        let scx = scx.clone();
        let handle = std::thread::Builder::new().name("smq-sweeper".into()).spawn(move || loop {
            match rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let removed = scx.store.remove_expired(expiry);
                    if removed > 0 {
                        log::debug!("{} expired messages removed, {} left", removed, scx.store.len());
                    }
                }
                _ => break,
            }
        })?;
        Ok(Some((tx, handle)))
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    #[inline]
    pub fn context(&self) -> &ServerContext {
        &self.scx
    }

    /// Stops accepting, tears down every connection, then stops the
    /// multiplexer and the worker pool. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.acceptor.stop() {
            log::warn!("acceptor stop error, {}", e);
        }
        self.scx.events.stop();
        for conn in self.scx.registry.connections() {
            self.scx.teardown(&conn, false);
        }
        self.scx.registry.clear();

        let pool = &self.scx.pool;
        log::info!(
            "stopping worker pool, {} threads, {} idle, {} tasks queued",
            pool.size(),
            pool.idle_count(),
            pool.queued()
        );
        pool.stop();

        if let Some((tx, handle)) = self.sweeper.lock().take() {
            drop(tx);
            if handle.join().is_err() {
                log::error!("sweeper thread panicked");
            }
        }
        log::info!(
            "SMQ broker stopped, {} messages left in store, {} events watched, {} pool threads left",
            self.scx.store.len(),
            self.scx.events.len(),
            pool.size()
        );
    }
}

impl Drop for SmqServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn on_accept(scx: &ServerContext, stream: SocketStream) {
    let max_connections = scx.settings.listener.max_connections;
    if max_connections > 0 && scx.registry.connection_count() >= max_connections {
        log::warn!("too many connections ({}), {:?} refused", max_connections, stream.peer_addr());
        stream.close();
        return;
    }
    if let Err(e) = scx.add_connection(Arc::new(stream)) {
        log::warn!("add connection error, {}", e);
    }
}
