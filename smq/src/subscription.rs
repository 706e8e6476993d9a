use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

use smq_codec::Message;
use smq_utils::{read_for, write_for, LockTimeout};

use crate::error::SmqError;
use crate::types::{ConnectionId, Destination, DestinationType, QoS};

/// Cursor value meaning "no member selected yet"
const END: usize = usize::MAX;

/// Sink a subscription hands each delivery to, resolving the member id to
/// its live connection.
pub trait Deliver: Send + Sync {
    fn deliver(&self, id: ConnectionId, msg: &Message) -> Result<(), SmqError>;
}

/// Membership and delivery state of one destination.
///
/// Members are kept in insertion order. For a queue, `cursor` is either
/// [`END`] or the index of the member that receives the next message.
pub struct Subscription {
    name: Destination,
    typ: DestinationType,
    qos: QoS,
    members: RwLock<Vec<ConnectionId>>,
    cursor: AtomicUsize,
    lock_timeout: Duration,
}

impl Subscription {
    pub fn new(name: Destination, typ: DestinationType, qos: QoS, lock_timeout: Duration) -> Self {
        Subscription { name, typ, qos, members: RwLock::new(Vec::new()), cursor: AtomicUsize::new(END), lock_timeout }
    }

    #[inline]
    pub fn name(&self) -> &Destination {
        &self.name
    }

    #[inline]
    pub fn typ(&self) -> DestinationType {
        self.typ
    }

    #[inline]
    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Adds `id` as a member, returns false if it already was one.
    pub fn add_connection(&self, id: ConnectionId) -> Result<bool, LockTimeout> {
        let mut members = write_for(&self.members, self.lock_timeout)?;
        if members.contains(&id) {
            return Ok(false);
        }
        members.push(id);
        Ok(true)
    }

    /// Removes `id`, keeping the queue cursor on a live member or at [`END`].
    pub fn remove_connection(&self, id: ConnectionId) -> Result<bool, LockTimeout> {
        let mut members = write_for(&self.members, self.lock_timeout)?;
        let Some(pos) = members.iter().position(|m| *m == id) else {
            return Ok(false);
        };
        members.remove(pos);

        let cursor = self.cursor.load(Ordering::SeqCst);
        if cursor != END {
            if pos < cursor {
                self.cursor.store(cursor - 1, Ordering::SeqCst);
            } else if pos == cursor && cursor >= members.len() {
                self.cursor.store(END, Ordering::SeqCst);
            }
        }
        Ok(true)
    }

    /// Delivers `msg` according to the destination type and returns the
    /// number of members that accepted it.
    ///
    /// A topic attempts every member once; a failing member is logged and
    /// skipped. A queue hands the message to the member under the cursor and
    /// advances it; with no members the message is dropped. Deliveries only
    /// take the shared lock, so concurrent deliveries to one queue may read
    /// the same cursor and repeat or skip a member.
    pub fn deliver_message(&self, msg: &Message, sink: &dyn Deliver) -> Result<usize, LockTimeout> {
        let members = read_for(&self.members, self.lock_timeout)?;
        match self.typ {
            DestinationType::Topic => {
                let mut delivered = 0;
                for id in members.iter() {
                    if self.deliver_to(*id, msg, sink) {
                        delivered += 1;
                    }
                }
                Ok(delivered)
            }
            DestinationType::Queue => {
                if members.is_empty() {
                    log::debug!("queue {} has no members, message dropped", self.name);
                    return Ok(0);
                }
                let mut pos = self.cursor.load(Ordering::SeqCst);
                if pos == END || pos >= members.len() {
                    pos = 0;
                }
                let next = pos + 1;
                self.cursor.store(if next >= members.len() { END } else { next }, Ordering::SeqCst);
                Ok(usize::from(self.deliver_to(members[pos], msg, sink)))
            }
        }
    }

    fn deliver_to(&self, id: ConnectionId, msg: &Message, sink: &dyn Deliver) -> bool {
        match sink.deliver(id, msg) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("{} delivery to connection {} failed, {}", self.name, id, e);
                false
            }
        }
    }

    pub fn members(&self) -> Result<Vec<ConnectionId>, LockTimeout> {
        Ok(read_for(&self.members, self.lock_timeout)?.clone())
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("typ", &self.typ)
            .field("qos", &self.qos)
            .field("members", &self.len())
            .finish()
    }
}
