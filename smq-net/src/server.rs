use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use socket2::{Domain, SockAddr, Socket, Type};

use crate::error::NetError;
use crate::stream::SocketStream;
use crate::Result;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);

#[derive(Clone, Debug)]
pub struct Builder {
    /// The name of the server.
    pub name: String,
    ///The local address the server listens on.
    pub laddr: SocketAddr,
    ///The maximum length of the TCP connection queue.
    pub backlog: i32,
    ///Sets the value of the TCP_NODELAY option on accepted sockets.
    pub nodelay: bool,
    ///Whether to enable the SO_REUSEADDR option.
    pub reuseaddr: Option<bool>,
    ///Whether to enable the SO_REUSEPORT option.
    pub reuseport: Option<bool>,
    ///Maximum allowed header block or body length. 0 means unlimited, default: 1M
    pub max_packet_size: u32,
    ///How long a write may wait for the peer to drain its socket.
    pub send_timeout: Duration,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            name: Default::default(),
            laddr: SocketAddr::from(SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), 4000)),
            backlog: 512,
            nodelay: false,
            reuseaddr: None,
            reuseport: None,
            max_packet_size: 1024 * 1024, //"1M"
            send_timeout: Duration::from_secs(5),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.into();
        self
    }

    pub fn laddr(mut self, laddr: SocketAddr) -> Self {
        self.laddr = laddr;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn reuseaddr(mut self, reuseaddr: bool) -> Self {
        self.reuseaddr = Some(reuseaddr);
        self
    }

    pub fn reuseport(mut self, reuseport: bool) -> Self {
        self.reuseport = Some(reuseport);
        self
    }

    pub fn max_packet_size(mut self, max_packet_size: u32) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    pub fn send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn bind(self) -> Result<Listener> {
        let builder = match self.laddr {
            SocketAddr::V4(_) => Socket::new(Domain::IPV4, Type::STREAM, None)?,
            SocketAddr::V6(_) => Socket::new(Domain::IPV6, Type::STREAM, None)?,
        };

        builder.set_nonblocking(true)?;

        #[cfg(not(windows))]
        if let Some(reuseaddr) = self.reuseaddr {
            builder.set_reuse_address(reuseaddr)?;
        }

        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        if let Some(reuseport) = self.reuseport {
            builder.set_reuse_port(reuseport)?;
        }

        builder.bind(&SockAddr::from(self.laddr))?;
        builder.listen(self.backlog)?;
        let l = TcpListener::from_std(std::net::TcpListener::from(builder));
        let local_addr = l.local_addr()?;
        log::info!("Starting {} Listening on {}", self.name, local_addr);
        Ok(Listener { cfg: Arc::new(self), l, local_addr, next_id: Arc::new(AtomicUsize::new(1)) })
    }
}

pub struct Listener {
    pub cfg: Arc<Builder>,
    l: TcpListener,
    local_addr: SocketAddr,
    next_id: Arc<AtomicUsize>,
}

impl Listener {
    /// The bound address, with the actual port when bound to port 0
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts one pending connection without blocking.
    pub fn accept(&self) -> io::Result<Option<SocketStream>> {
        match self.l.accept() {
            Ok((socket, _remote_addr)) => {
                socket.set_nodelay(self.cfg.nodelay)?;
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                Ok(Some(SocketStream::new(id, socket, self.cfg.send_timeout)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Runs the accept loop on a dedicated thread, handing every new stream to `on_accept`.
    pub fn spawn<F>(mut self, on_accept: F) -> Result<Acceptor>
    where
        F: Fn(SocketStream) + Send + 'static,
    {
        let mut poll = Poll::new()?;
        poll.registry().register(&mut self.l, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let stopped = Arc::new(AtomicBool::new(false));
        let local_addr = self.local_addr;

        let stop_flag = stopped.clone();
        let name = format!("{}-acceptor", self.cfg.name);
        let handle = std::thread::Builder::new().name(name).spawn(move || {
            let mut events = Events::with_capacity(128);
            while !stop_flag.load(Ordering::SeqCst) {
                if let Err(e) = poll.poll(&mut events, None) {
                    if e.kind() != io::ErrorKind::Interrupted {
                        log::error!("acceptor poll error, {}", e);
                        break;
                    }
                    continue;
                }
                if stop_flag.load(Ordering::SeqCst) {
                    break;
                }
                loop {
                    match self.accept() {
                        Ok(Some(stream)) => on_accept(stream),
                        Ok(None) => break,
                        Err(e) => {
                            log::warn!("accept error, {}", e);
                            break;
                        }
                    }
                }
            }
            log::info!("Stopped {} on {}", self.cfg.name, self.local_addr);
        })?;

        Ok(Acceptor { local_addr, stopped, waker, handle: Mutex::new(Some(handle)) })
    }
}

/// Handle to a running accept loop.
pub struct Acceptor {
    local_addr: SocketAddr,
    stopped: Arc<AtomicBool>,
    waker: Arc<Waker>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Acceptor {
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and closes the listening socket. Idempotent.
    pub fn stop(&self) -> Result<(), NetError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.waker.wake()?;
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                log::error!("acceptor thread panicked");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ByteStream;

    #[test]
    fn accept_loop() {
        let listener = Builder::new().name("test").laddr("127.0.0.1:0".parse().unwrap()).bind().unwrap();
        let addr = listener.local_addr();
        assert_ne!(addr.port(), 0);

        let accepted = Arc::new(Mutex::new(Vec::new()));
        let a = accepted.clone();
        let acceptor = listener.spawn(move |s| a.lock().push(s.id())).unwrap();

        let _c1 = std::net::TcpStream::connect(addr).unwrap();
        let _c2 = std::net::TcpStream::connect(addr).unwrap();
        for _ in 0..100 {
            if accepted.lock().len() == 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*accepted.lock(), vec![1, 2]);

        acceptor.stop().unwrap();
        acceptor.stop().unwrap();
    }

    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    #[test]
    fn shared_port() {
        let first = Builder::new().laddr("127.0.0.1:0".parse().unwrap()).reuseaddr(true).reuseport(true).bind().unwrap();
        let addr = first.local_addr();
        let second = Builder::new().laddr(addr).reuseaddr(true).reuseport(true).bind().unwrap();
        assert_eq!(second.local_addr(), addr);
    }
}
