//! Readiness multiplexing over a dynamic set of byte streams.
//!
//! [`SocketEvents`] wraps a `mio::Poll` and dispatches one callback per ready
//! stream. The readiness primitive only offers edge notification, so one-shot
//! delivery is implemented by disarming the watch entry after it fires, and
//! level delivery by probing [`ByteStream::bytes_available`] on the next cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use bitflags::bitflags;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;

use crate::error::NetError;
use crate::stream::ByteStream;
use crate::Result;

const WAKE_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;

bitflags! {
    /// Event bits passed to the callback
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventFlags: u8 {
        /// Data is ready to be read
        const DATA = 0b0001;
        /// The peer hung up
        const HANGUP = 0b0010;
        /// The descriptor is in an error state
        const ERROR = 0b0100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Fire once per new-data transition
    EdgeTriggered,
    /// Fire once, then stay disabled until watched again
    OneShot,
    /// Fire on every cycle while data remains
    LevelTriggered,
}

/// Returned by the callback to decide the fate of the watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEventAction {
    Continue,
    /// Keep the registration but stop dispatching until watched again
    Disable,
    /// Drop the watch entirely
    Forget,
}

pub type EventHandler<T> = Arc<dyn Fn(EventFlags, &T) -> SocketEventAction + Send + Sync>;

struct Watch<T> {
    stream: Arc<dyn ByteStream>,
    user_data: T,
    trigger: Trigger,
    armed: bool,
}

struct Poller {
    poll: Poll,
    events: Events,
}

struct Inner<T> {
    poller: Mutex<Option<Poller>>,
    registry: Registry,
    waker: Waker,
    watched: Mutex<AHashMap<Token, Watch<T>>>,
    level_pending: Mutex<AHashSet<Token>>,
    handler: EventHandler<T>,
    stopped: AtomicBool,
    polling_thread: Mutex<Option<ThreadId>>,
    poll_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Watches many streams and invokes a handler per readiness event.
///
/// `watch`/`forget` may be called from any thread, including from inside the
/// handler, while a `poll` is in progress.
pub struct SocketEvents<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SocketEvents<T> {
    fn clone(&self) -> Self {
        SocketEvents { inner: self.inner.clone() }
    }
}

impl<T> SocketEvents<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F>(handler: F) -> Result<Self, NetError>
    where
        F: Fn(EventFlags, &T) -> SocketEventAction + Send + Sync + 'static,
    {
        let poll = Poll::new().map_err(NetError::Register)?;
        let registry = poll.registry().try_clone().map_err(NetError::Register)?;
        let waker = Waker::new(&registry, WAKE_TOKEN).map_err(NetError::Register)?;
        Ok(SocketEvents {
            inner: Arc::new(Inner {
                poller: Mutex::new(Some(Poller { poll, events: Events::with_capacity(EVENTS_CAPACITY) })),
                registry,
                waker,
                watched: Mutex::new(AHashMap::default()),
                level_pending: Mutex::new(AHashSet::default()),
                handler: Arc::new(handler),
                stopped: AtomicBool::new(false),
                polling_thread: Mutex::new(None),
                poll_thread: Mutex::new(None),
            }),
        })
    }

    /// Starts monitoring `stream`. Watching an already watched stream replaces
    /// its user data and trigger and re-arms it.
    pub fn watch(&self, stream: Arc<dyn ByteStream>, user_data: T, trigger: Trigger) -> Result<(), NetError> {
        if self.is_stopped() {
            return Err(NetError::Stopped);
        }
        let token = Token(stream.id());
        let mut watched = self.inner.watched.lock();
        if watched.contains_key(&token) {
            stream.reregister(&self.inner.registry, token, Interest::READABLE).map_err(NetError::Register)?;
        } else {
            stream.register(&self.inner.registry, token, Interest::READABLE).map_err(NetError::Register)?;
        }
        watched.insert(token, Watch { stream, user_data, trigger, armed: true });
        Ok(())
    }

    /// Stops monitoring `stream`. A no-op if it is not watched.
    pub fn forget(&self, stream: &dyn ByteStream) {
        let token = Token(stream.id());
        if let Some(w) = self.inner.watched.lock().remove(&token) {
            self.deregister(&w);
        }
        self.inner.level_pending.lock().remove(&token);
    }

    #[inline]
    fn deregister(&self, w: &Watch<T>) {
        if let Err(e) = w.stream.deregister(&self.inner.registry) {
            log::debug!("deregister {:?} error, {}", w.stream.peer_addr(), e);
        }
    }

    #[inline]
    pub fn is_watched(&self, stream: &dyn ByteStream) -> bool {
        self.inner.watched.lock().contains_key(&Token(stream.id()))
    }

    /// Number of watched streams
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.watched.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Waits up to `timeout` for readiness and invokes the handler once per
    /// ready stream. Returns the number of handler invocations; a timeout is
    /// not an error.
    pub fn poll(&self, timeout: Duration) -> Result<usize, NetError> {
        let mut poller = self.inner.poller.lock();
        if self.is_stopped() {
            *poller = None;
            return Ok(0);
        }
        let Some(Poller { poll, events }) = poller.as_mut() else {
            return Ok(0);
        };

        let level_ready = self.level_ready();
        let timeout = if level_ready.is_empty() { timeout } else { Duration::ZERO };
        match poll.poll(events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(NetError::Io(e)),
        }

        let mut ready: Vec<(Token, EventFlags)> = Vec::with_capacity(events.iter().count() + level_ready.len());
        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let mut flags = EventFlags::empty();
            if event.is_readable() {
                flags |= EventFlags::DATA;
            }
            if event.is_read_closed() || event.is_write_closed() {
                flags |= EventFlags::HANGUP;
            }
            if event.is_error() {
                flags |= EventFlags::ERROR;
            }
            if !flags.is_empty() {
                ready.push((event.token(), flags));
            }
        }
        for token in level_ready {
            if !ready.iter().any(|(t, _)| *t == token) {
                ready.push((token, EventFlags::DATA));
            }
        }

        *self.inner.polling_thread.lock() = Some(std::thread::current().id());
        let mut fired = 0;
        for (token, flags) in ready {
            if self.is_stopped() {
                break;
            }
            if self.dispatch(token, flags) {
                fired += 1;
            }
        }
        *self.inner.polling_thread.lock() = None;

        if self.is_stopped() {
            *poller = None;
        }
        Ok(fired)
    }

    fn dispatch(&self, token: Token, flags: EventFlags) -> bool {
        let (user_data, trigger) = {
            let mut watched = self.inner.watched.lock();
            let Some(w) = watched.get_mut(&token) else {
                return false;
            };
            if !w.armed {
                return false;
            }
            if w.trigger == Trigger::OneShot {
                w.armed = false;
            }
            (w.user_data.clone(), w.trigger)
        };

        let action = (self.inner.handler)(flags, &user_data);

        match action {
            SocketEventAction::Continue => {
                if trigger == Trigger::LevelTriggered {
                    self.inner.level_pending.lock().insert(token);
                }
            }
            SocketEventAction::Disable => {
                if let Some(w) = self.inner.watched.lock().get_mut(&token) {
                    w.armed = false;
                }
                self.inner.level_pending.lock().remove(&token);
            }
            SocketEventAction::Forget => {
                if let Some(w) = self.inner.watched.lock().remove(&token) {
                    self.deregister(&w);
                }
                self.inner.level_pending.lock().remove(&token);
            }
        }
        true
    }

    /// Level-triggered streams that still have unread data.
    fn level_ready(&self) -> Vec<Token> {
        let pending: Vec<Token> = self.inner.level_pending.lock().iter().copied().collect();
        if pending.is_empty() {
            return Vec::new();
        }
        let mut ready = Vec::new();
        for token in pending {
            let stream = {
                let watched = self.inner.watched.lock();
                match watched.get(&token) {
                    Some(w) if w.armed && w.trigger == Trigger::LevelTriggered => Some(w.stream.clone()),
                    _ => None,
                }
            };
            match stream.map(|s| s.bytes_available()) {
                Some(Ok(n)) if n > 0 => ready.push(token),
                _ => {
                    self.inner.level_pending.lock().remove(&token);
                }
            }
        }
        ready
    }

    /// Runs the poll loop on a dedicated thread until [`stop`](Self::stop).
    pub fn start(&self, name: &str, timeout: Duration) -> Result<(), NetError> {
        let mut poll_thread = self.inner.poll_thread.lock();
        if poll_thread.is_some() {
            return Ok(());
        }
        if self.is_stopped() {
            return Err(NetError::Stopped);
        }
        let this = self.clone();
        let handle = std::thread::Builder::new().name(name.into()).spawn(move || {
            while !this.is_stopped() {
                if let Err(e) = this.poll(timeout) {
                    log::error!("socket events poll error, {}", e);
                    std::thread::sleep(timeout);
                }
            }
            log::debug!("socket events poll loop exited");
        })?;
        *poll_thread = Some(handle);
        Ok(())
    }

    /// Stops the multiplexer. Idempotent and callable from any thread,
    /// including from the handler; once it returns from any other thread no
    /// handler invocation is running or will run.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.inner.waker.wake() {
            log::warn!("socket events wake error, {}", e);
        }

        let current = std::thread::current().id();
        let in_handler = *self.inner.polling_thread.lock() == Some(current);
        if !in_handler {
            // Waits for an in-flight poll to finish its dispatch
            *self.inner.poller.lock() = None;
        }

        let handle = self.inner.poll_thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != current {
                if handle.join().is_err() {
                    log::error!("socket events poll thread panicked");
                }
            }
        }

        let watched: Vec<Watch<T>> = self.inner.watched.lock().drain().map(|(_, w)| w).collect();
        for w in watched.iter() {
            self.deregister(w);
        }
        self.inner.level_pending.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::SocketStream;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;

    struct Pair {
        stream: Arc<SocketStream>,
        peer: std::net::TcpStream,
    }

    fn pair(id: usize) -> Pair {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = SocketStream::connect(id, l.local_addr().unwrap(), Duration::from_secs(1)).unwrap();
        let (peer, _) = l.accept().unwrap();
        Pair { stream: Arc::new(stream), peer }
    }

    fn counting(action: SocketEventAction) -> (SocketEvents<usize>, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let events = SocketEvents::new(move |flags: EventFlags, _: &usize| {
            assert!(flags.contains(EventFlags::DATA));
            h.fetch_add(1, Ordering::SeqCst);
            action
        })
        .unwrap();
        (events, hits)
    }

    fn poll_until(events: &SocketEvents<usize>, hits: &AtomicUsize, n: usize) {
        for _ in 0..50 {
            if hits.load(Ordering::SeqCst) >= n {
                return;
            }
            events.poll(Duration::from_millis(20)).unwrap();
        }
    }

    #[test]
    fn timeout_is_not_an_error() {
        let (events, hits) = counting(SocketEventAction::Continue);
        assert_eq!(events.poll(Duration::from_millis(10)).unwrap(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn one_shot_fires_once_until_rearmed() {
        let (events, hits) = counting(SocketEventAction::Continue);
        let mut p = pair(1);
        events.watch(p.stream.clone(), 1, Trigger::OneShot).unwrap();
        p.peer.write_all(b"a").unwrap();
        poll_until(&events, &hits, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        p.peer.write_all(b"b").unwrap();
        events.poll(Duration::from_millis(50)).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        events.watch(p.stream.clone(), 1, Trigger::OneShot).unwrap();
        poll_until(&events, &hits, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn level_fires_while_data_remains() {
        let (events, hits) = counting(SocketEventAction::Continue);
        let mut p = pair(2);
        events.watch(p.stream.clone(), 2, Trigger::LevelTriggered).unwrap();
        p.peer.write_all(b"unread").unwrap();
        poll_until(&events, &hits, 3);
        assert!(hits.load(Ordering::SeqCst) >= 3);

        let mut buf = [0u8; 16];
        assert_eq!(p.stream.read(&mut buf).unwrap(), 6);
        events.poll(Duration::from_millis(10)).unwrap();
        let settled = hits.load(Ordering::SeqCst);
        events.poll(Duration::from_millis(30)).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), settled);
    }

    #[test]
    fn forget_action_drops_watch() {
        let (events, hits) = counting(SocketEventAction::Forget);
        let mut p = pair(3);
        events.watch(p.stream.clone(), 3, Trigger::EdgeTriggered).unwrap();
        assert_eq!(events.len(), 1);
        p.peer.write_all(b"x").unwrap();
        poll_until(&events, &hits, 1);
        assert_eq!(events.len(), 0);
        assert!(!events.is_watched(&*p.stream));
    }

    #[test]
    fn forget_unwatched_is_noop() {
        let (events, _) = counting(SocketEventAction::Continue);
        let p = pair(4);
        events.forget(&*p.stream);
        events.watch(p.stream.clone(), 4, Trigger::EdgeTriggered).unwrap();
        events.forget(&*p.stream);
        events.forget(&*p.stream);
        assert!(events.is_empty());
    }

    #[test]
    fn hangup_is_reported() {
        let seen = Arc::new(Mutex::new(EventFlags::empty()));
        let s = seen.clone();
        let events = SocketEvents::new(move |flags: EventFlags, _: &()| {
            *s.lock() |= flags;
            SocketEventAction::Continue
        })
        .unwrap();
        let p = pair(5);
        events.watch(p.stream.clone(), (), Trigger::EdgeTriggered).unwrap();
        drop(p.peer);
        for _ in 0..50 {
            if seen.lock().contains(EventFlags::HANGUP) {
                break;
            }
            events.poll(Duration::from_millis(20)).unwrap();
        }
        assert!(seen.lock().contains(EventFlags::HANGUP));
    }

    #[test]
    fn stop_is_idempotent_and_rejects_watches() {
        let (events, hits) = counting(SocketEventAction::Continue);
        events.start("test-poll", Duration::from_millis(10)).unwrap();
        let mut p = pair(6);
        events.watch(p.stream.clone(), 6, Trigger::EdgeTriggered).unwrap();
        p.peer.write_all(b"x").unwrap();
        for _ in 0..100 {
            if hits.load(Ordering::SeqCst) > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        events.stop();
        events.stop();
        assert!(events.is_stopped());
        assert!(events.is_empty());
        assert!(matches!(events.watch(p.stream.clone(), 6, Trigger::EdgeTriggered), Err(NetError::Stopped)));
        assert_eq!(events.poll(Duration::from_millis(10)).unwrap(), 0);

        p.peer.write_all(b"y").unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_from_handler() {
        let slot: Arc<Mutex<Option<SocketEvents<()>>>> = Arc::new(Mutex::new(None));
        let s = slot.clone();
        let events = SocketEvents::new(move |_, _: &()| {
            if let Some(events) = s.lock().as_ref() {
                events.stop();
            }
            SocketEventAction::Continue
        })
        .unwrap();
        *slot.lock() = Some(events.clone());
        let mut p = pair(7);
        events.watch(p.stream.clone(), (), Trigger::EdgeTriggered).unwrap();
        p.peer.write_all(b"x").unwrap();
        for _ in 0..50 {
            if events.is_stopped() {
                break;
            }
            events.poll(Duration::from_millis(20)).unwrap();
        }
        assert!(events.is_stopped());
        slot.lock().take();
    }
}
