use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use parking_lot::{Mutex, RwLock};

use crate::error::NetError;

const PEEK_SIZE: usize = 4096;
const WRITE_BACKOFF: Duration = Duration::from_millis(1);

/// A connected, non-blocking byte stream that can be watched for readiness.
pub trait ByteStream: Send + Sync + 'static {
    /// Identifier, unique among the streams watched by one multiplexer
    fn id(&self) -> usize;

    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Non-blocking read. `WouldBlock` means no data is pending, `Ok(0)` means the peer closed.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes the whole buffer, blocking up to the stream's send timeout.
    fn write_all(&self, data: &[u8]) -> Result<(), NetError>;

    /// Number of bytes that can be read without blocking (capped at an implementation limit).
    fn bytes_available(&self) -> io::Result<usize>;

    fn is_active(&self) -> bool;

    fn close(&self);

    fn register(&self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()>;

    fn reregister(&self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()>;

    fn deregister(&self, registry: &Registry) -> io::Result<()>;
}

/// TCP implementation of [`ByteStream`].
pub struct SocketStream {
    id: usize,
    io: RwLock<TcpStream>,
    writer: Mutex<()>,
    peer_addr: Option<SocketAddr>,
    send_timeout: Duration,
    active: AtomicBool,
}

impl SocketStream {
    pub fn new(id: usize, io: TcpStream, send_timeout: Duration) -> Self {
        let peer_addr = io.peer_addr().ok();
        SocketStream {
            id,
            io: RwLock::new(io),
            writer: Mutex::new(()),
            peer_addr,
            send_timeout,
            active: AtomicBool::new(true),
        }
    }

    /// Connects to `addr`, blocking until the connection is established.
    pub fn connect(id: usize, addr: SocketAddr, send_timeout: Duration) -> io::Result<Self> {
        let std = std::net::TcpStream::connect(addr)?;
        std.set_nonblocking(true)?;
        Ok(SocketStream::new(id, TcpStream::from_std(std), send_timeout))
    }

    #[inline]
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.io.read().set_nodelay(nodelay)
    }
}

impl ByteStream for SocketStream {
    #[inline]
    fn id(&self) -> usize {
        self.id
    }

    #[inline]
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.is_active() {
            return Ok(0);
        }
        let stream = self.io.read();
        loop {
            match (&*stream).read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                res => return res,
            }
        }
    }

    fn write_all(&self, mut data: &[u8]) -> Result<(), NetError> {
        let _writer = self.writer.lock();
        let deadline = Instant::now() + self.send_timeout;
        while !data.is_empty() {
            if !self.is_active() {
                return Err(NetError::Closed);
            }
            let res = (&*self.io.read()).write(data);
            match res {
                Ok(0) => return Err(NetError::Closed),
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(NetError::WriteTimeout(self.send_timeout));
                    }
                    std::thread::sleep(WRITE_BACKOFF);
                }
                Err(e) => return Err(NetError::Io(e)),
            }
        }
        Ok(())
    }

    fn bytes_available(&self) -> io::Result<usize> {
        let mut buf = [0u8; PEEK_SIZE];
        match self.io.read().peek(&mut buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    #[inline]
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.io.read().shutdown(Shutdown::Both) {
                log::debug!("{:?} shutdown error, {}", self.peer_addr, e);
            }
        }
    }

    fn register(&self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        registry.register(&mut *self.io.write(), token, interests)
    }

    fn reregister(&self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        registry.reregister(&mut *self.io.write(), token, interests)
    }

    fn deregister(&self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut *self.io.write())
    }
}

impl std::fmt::Debug for SocketStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketStream")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("active", &self.is_active())
            .finish()
    }
}
