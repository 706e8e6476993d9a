use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use smq_codec::{header, Message, MessageType};
use smq_conf::Settings;
use smq_net::{ByteStream, EventFlags, SocketEventAction, SocketEvents, Trigger};
use smq_utils::timestamp_millis;

use crate::connection::{Connection, Frames, LastWill};
use crate::error::SmqError;
use crate::executor::WorkerPool;
use crate::registry::{Delivery, SubscriptionRegistry};
use crate::store::MessageStore;
use crate::types::{ClientId, DestinationType, MessageId, QoS};
use crate::Result;

/// What the read loop does after a frame was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Disconnect,
}

/// Shared broker state, handed to every task.
#[derive(Clone)]
pub struct ServerContext {
    inner: Arc<ServerContextInner>,
}

pub struct ServerContextInner {
    pub settings: Settings,
    pub pool: WorkerPool,
    pub store: MessageStore,
    pub registry: SubscriptionRegistry,
    pub events: SocketEvents<Watcher>,
    next_message_id: AtomicU64,
}

impl Deref for ServerContext {
    type Target = ServerContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

/// Per-stream data carried by the multiplexer.
#[derive(Clone)]
pub struct Watcher {
    ctx: Weak<ServerContextInner>,
    conn: Arc<Connection>,
}

impl Watcher {
    /// Runs on the poll thread, so it only queues work.
    fn on_event(&self, flags: EventFlags) -> SocketEventAction {
        let Some(inner) = self.ctx.upgrade() else {
            return SocketEventAction::Forget;
        };
        let ctx = ServerContext { inner };
        let conn = self.conn.clone();
        let task_ctx = ctx.clone();
        let res = if flags.contains(EventFlags::ERROR) && !flags.contains(EventFlags::DATA) {
            ctx.pool.execute(move || task_ctx.teardown(&conn, true))
        } else {
            ctx.pool.execute(move || task_ctx.on_readable(&conn))
        };
        match res {
            Ok(()) => SocketEventAction::Continue,
            Err(e) => {
                log::warn!("{} dropped, {}", self.conn, e);
                SocketEventAction::Forget
            }
        }
    }
}

impl ServerContext {
    pub fn new(settings: Settings) -> Result<Self> {
        let pool = WorkerPool::new("smq-worker", settings.task.workers, settings.task.idle_timeout)?;
        let events = SocketEvents::new(|flags, w: &Watcher| w.on_event(flags))?;
        let registry = SubscriptionRegistry::new(settings.broker.lock_timeout);
        Ok(ServerContext {
            inner: Arc::new(ServerContextInner {
                settings,
                pool,
                store: MessageStore::new(),
                registry,
                events,
                next_message_id: AtomicU64::new(1),
            }),
        })
    }

    #[inline]
    fn watcher(&self, conn: &Arc<Connection>) -> Watcher {
        Watcher { ctx: Arc::downgrade(&self.inner), conn: conn.clone() }
    }

    /// Registers a freshly accepted stream and starts watching it.
    pub fn add_connection(&self, stream: Arc<dyn ByteStream>) -> Result<Arc<Connection>, SmqError> {
        let conn = Arc::new(Connection::new(stream, self.settings.listener.max_packet_size.as_u32()));
        self.registry.add_connection(conn.clone());
        if let Err(e) = self.events.watch(conn.stream().clone(), self.watcher(&conn), Trigger::OneShot) {
            self.registry.remove_connection(conn.id());
            conn.close();
            return Err(e.into());
        }
        log::debug!("{} accepted", conn);
        Ok(conn)
    }

    /// Reads from `conn`, handles every complete frame and re-arms the
    /// watch. Frames that arrived before a read or decode failure are
    /// still handled before the connection is torn down.
    fn on_readable(&self, conn: &Arc<Connection>) {
        if conn.is_closed() {
            return;
        }
        let Frames { messages, error, eof, more } = conn.read_frames();

        for msg in messages {
            log::trace!("{} recv {}", conn, msg.typ);
            match self.handle(conn, msg) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Disconnect) => {
                    self.teardown(conn, false);
                    return;
                }
                Err(e) if e.is_fatal() => {
                    log::info!("{} {}", conn, e);
                    self.teardown(conn, true);
                    return;
                }
                Err(e) => log::warn!("{} {}", conn, e),
            }
        }

        if let Some(e) = error {
            log::info!("{} {}", conn, e);
            self.teardown(conn, true);
            return;
        }
        if eof {
            self.teardown(conn, true);
            return;
        }
        if more {
            let (ctx, c) = (self.clone(), conn.clone());
            if let Err(e) = self.pool.execute(move || ctx.on_readable(&c)) {
                log::warn!("{} read requeue failed, {}", conn, e);
                self.teardown(conn, !self.events.is_stopped());
            }
            return;
        }
        if let Err(e) = self.events.watch(conn.stream().clone(), self.watcher(conn), Trigger::OneShot) {
            log::warn!("{} re-arm failed, {}", conn, e);
            self.teardown(conn, !self.events.is_stopped());
        }
    }

    fn handle(&self, conn: &Arc<Connection>, msg: Message) -> Result<Flow, SmqError> {
        let typ = msg.typ;
        if typ != MessageType::Connect && !conn.is_connected() {
            return Err(SmqError::Protocol(format!("{} before CONNECT", typ)));
        }
        match typ {
            MessageType::Connect => self.on_connect(conn, &msg)?,
            MessageType::Subscribe => self.on_subscribe(conn, &msg)?,
            MessageType::Unsubscribe => self.on_unsubscribe(conn, &msg)?,
            MessageType::Message => {
                self.publish(msg)?;
            }
            MessageType::Ack => self.on_ack(conn, &msg),
            MessageType::Ping => {}
            MessageType::Disconnect => return Ok(Flow::Disconnect),
            MessageType::ConnectAck
            | MessageType::SubscribeAck
            | MessageType::UnsubscribeAck
            | MessageType::PublishAck
            | MessageType::PingAck => {
                return Err(SmqError::Protocol(format!("unexpected {} from client", typ)));
            }
        }
        self.reply(conn, typ)?;
        Ok(Flow::Continue)
    }

    fn on_connect(&self, conn: &Arc<Connection>, msg: &Message) -> Result<(), SmqError> {
        if conn.is_connected() {
            return Err(SmqError::Protocol("duplicate CONNECT".into()));
        }

        let broker = &self.settings.broker;
        let username = msg.get_header(header::USERNAME);
        if !broker.allow_anonymous()
            && (username != Some(broker.username.as_str())
                || msg.get_header(header::PASSWORD) != Some(broker.password.as_str()))
        {
            log::info!("{} authentication failed, username: {:?}", conn, username);
            return Err(SmqError::NotAuthorized);
        }

        let client_id = match msg.get_header(header::CLIENT_ID).filter(|c| !c.is_empty()) {
            Some(client_id) => ClientId::from(client_id),
            None => ClientId::from(format!("smq-{}-{}", conn.id(), timestamp_millis())),
        };
        self.registry.register_client_id(conn.id(), &client_id)?;

        let last_will = msg.get_header(header::LAST_WILL_DESTINATION).filter(|d| !d.is_empty()).map(|d| LastWill {
            destination: d.into(),
            message: msg.get_header(header::LAST_WILL_MESSAGE).unwrap_or_default().into(),
        });
        conn.set_connected(client_id, username.map(|u| u.to_owned()), last_will);
        log::info!("{} Connected, peer: {:?}", conn, conn.peer_addr());
        Ok(())
    }

    fn on_subscribe(&self, conn: &Arc<Connection>, msg: &Message) -> Result<(), SmqError> {
        let names = msg.get_destination().ok_or_else(|| SmqError::Protocol("SUBSCRIBE without destination".into()))?;
        let typ = match msg.get_header(header::TYPE) {
            Some(typ) => typ.parse()?,
            None => DestinationType::Topic,
        };
        let qos = match msg.get_header(header::QOS) {
            Some(qos) => qos.parse()?,
            None => QoS::AtMostOnce,
        };
        for name in split_destinations(names) {
            let sub = self.registry.subscribe(conn.id(), name, typ, qos)?;
            log::debug!("{} subscribed to {} {}", conn, sub.typ(), name);
        }
        Ok(())
    }

    /// Without a destination the connection leaves every destination.
    fn on_unsubscribe(&self, conn: &Arc<Connection>, msg: &Message) -> Result<(), SmqError> {
        let names: Vec<String> = match msg.get_destination() {
            Some(names) => split_destinations(names).map(str::to_owned).collect(),
            None => conn.destinations().iter().map(|d| d.to_string()).collect(),
        };
        for name in names {
            if self.registry.unsubscribe(conn.id(), &name)? {
                log::debug!("{} unsubscribed from {}", conn, name);
            }
        }
        Ok(())
    }

    fn on_ack(&self, conn: &Arc<Connection>, msg: &Message) {
        match msg.message_id() {
            Some(id) => {
                if self.store.erase(id).is_none() {
                    log::debug!("{} ack for unknown message {}", conn, id);
                }
            }
            None => log::warn!("{} ACK without message_id", conn),
        }
    }

    /// Assigns the next message id, stores and routes `msg`. Messages that
    /// no QoS 1 destination took are erased from the store right away.
    pub fn publish(&self, mut msg: Message) -> Result<(MessageId, Delivery), SmqError> {
        if msg.get_destination().is_none() {
            return Err(SmqError::Protocol("MESSAGE without destination".into()));
        }
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        msg.headers.insert(header::MESSAGE_ID.into(), id.to_string());
        let msg = Arc::new(msg);
        self.store.store(id, msg.clone());

        let delivery = self.registry.deliver(&msg)?;
        if delivery.qos != Some(QoS::AtLeastOnce) || delivery.delivered == 0 {
            self.store.erase(id);
        }
        Ok((id, delivery))
    }

    /// Answers a `typ` request with its acknowledgement. PING is answered
    /// even when acks are turned off.
    #[inline]
    fn reply(&self, conn: &Connection, typ: MessageType) -> Result<(), SmqError> {
        match typ.ack() {
            Some(ack) if self.settings.broker.send_acks || typ == MessageType::Ping => conn.send(&Message::new(ack)),
            _ => Ok(()),
        }
    }

    /// Removes `conn` from the multiplexer and every destination, closes it
    /// and, on abnormal termination, publishes its last will. Runs at most
    /// once per connection.
    pub fn teardown(&self, conn: &Arc<Connection>, abnormal: bool) {
        if !conn.close() {
            return;
        }
        self.events.forget(conn.stream().as_ref());
        self.registry.remove_connection(conn.id());

        if abnormal {
            if let Some(will) = conn.take_last_will() {
                match self.publish(will.to_message()) {
                    Ok((_, delivery)) => {
                        log::debug!("{} last will to {}, delivered: {}", conn, will.destination, delivery.delivered)
                    }
                    Err(e) => log::warn!("{} last will to {} failed, {}", conn, will.destination, e),
                }
            }
        }

        if conn.is_connected() {
            log::info!("{} Disconnected", conn);
        } else {
            log::debug!("{} closed before CONNECT", conn);
        }
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ServerContext ...")?;
        Ok(())
    }
}

#[inline]
fn split_destinations(names: &str) -> impl Iterator<Item = &str> {
    names.split(',').map(str::trim).filter(|n| !n.is_empty())
}
