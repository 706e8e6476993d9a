use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;

use smq_codec::Message;

use crate::connection::Connection;
use crate::error::SmqError;
use crate::subscription::{Deliver, Subscription};
use crate::types::{ClientId, ConnectionId, DashMap, Destination, DestinationType, QoS};

/// Outcome of routing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// QoS of the destination, `None` when the destination does not exist
    pub qos: Option<QoS>,
}

/// Owns the subscriptions by destination name and the live connections by id.
///
/// Subscriptions refer to members by [`ConnectionId`] and connections to
/// their subscriptions by destination name; both are resolved here.
pub struct SubscriptionRegistry {
    subscriptions: DashMap<Destination, Arc<Subscription>>,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    client_ids: DashMap<ClientId, ConnectionId>,
    lock_timeout: Duration,
}

impl SubscriptionRegistry {
    pub fn new(lock_timeout: Duration) -> Self {
        SubscriptionRegistry {
            subscriptions: DashMap::default(),
            connections: DashMap::default(),
            client_ids: DashMap::default(),
            lock_timeout,
        }
    }

    #[inline]
    pub fn add_connection(&self, conn: Arc<Connection>) {
        self.connections.insert(conn.id(), conn);
    }

    #[inline]
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|c| c.value().clone())
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|c| c.value().clone()).collect()
    }

    #[inline]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Claims `client_id` for connection `id`.
    pub fn register_client_id(&self, id: ConnectionId, client_id: &ClientId) -> Result<(), SmqError> {
        match self.client_ids.entry(client_id.clone()) {
            Entry::Occupied(e) if *e.get() != id => Err(SmqError::IdentifierRejected(client_id.clone())),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(e) => {
                e.insert(id);
                Ok(())
            }
        }
    }

    /// Adds connection `id` to `name`, creating the destination with `typ`
    /// and `qos` if it does not exist yet. An existing destination keeps its
    /// type.
    pub fn subscribe(
        &self,
        id: ConnectionId,
        name: &str,
        typ: DestinationType,
        qos: QoS,
    ) -> Result<Arc<Subscription>, SmqError> {
        let conn = self.connection(id).ok_or(SmqError::ConnectionGone(id))?;
        let name = Destination::from(name);
        let sub = self
            .subscriptions
            .entry(name.clone())
            .or_insert_with(|| {
                log::debug!("create {} {}, qos: {:?}", typ, name, qos);
                Arc::new(Subscription::new(name.clone(), typ, qos, self.lock_timeout))
            })
            .value()
            .clone();
        if sub.typ() != typ {
            log::warn!("{} subscribes to {} as {}, but it is a {}", conn, name, typ, sub.typ());
        }
        sub.add_connection(id)?;
        conn.add_destination(name);
        Ok(sub)
    }

    /// Returns false if the connection was not a member.
    pub fn unsubscribe(&self, id: ConnectionId, name: &str) -> Result<bool, SmqError> {
        let sub = self.subscriptions.get(name).map(|s| s.value().clone());
        let removed = match sub {
            Some(sub) => sub.remove_connection(id)?,
            None => false,
        };
        if let Some(conn) = self.connection(id) {
            conn.remove_destination(name);
        }
        Ok(removed)
    }

    /// Routes `msg` to the subscription named by its destination.
    pub fn deliver(&self, msg: &Message) -> Result<Delivery, SmqError> {
        let name = msg.get_destination().ok_or_else(|| SmqError::Protocol("message without destination".into()))?;
        let sub = self.subscriptions.get(name).map(|s| s.value().clone());
        match sub {
            Some(sub) => {
                let delivered = sub.deliver_message(msg, self)?;
                Ok(Delivery { delivered, qos: Some(sub.qos()) })
            }
            None => {
                log::debug!("no subscription for {}, message dropped", name);
                Ok(Delivery { delivered: 0, qos: None })
            }
        }
    }

    /// Forgets the connection and withdraws it from every destination it
    /// belonged to.
    pub fn remove_connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let (_, conn) = self.connections.remove(&id)?;
        if let Some(client_id) = conn.client_id() {
            self.client_ids.remove_if(&client_id, |_, owner| *owner == id);
        }
        for name in conn.take_destinations() {
            let sub = self.subscriptions.get(&name).map(|s| s.value().clone());
            if let Some(sub) = sub {
                if let Err(e) = sub.remove_connection(id) {
                    log::warn!("{} unsubscribe from {} failed, {}", conn, name, e);
                }
            }
        }
        Some(conn)
    }

    /// Drops destination `name`, unsubscribing every remaining member.
    pub fn remove(&self, name: &str) -> Option<Arc<Subscription>> {
        let (_, sub) = self.subscriptions.remove(name)?;
        let members = match sub.members() {
            Ok(members) => members,
            Err(e) => {
                log::warn!("remove {}, {}", name, e);
                return Some(sub);
            }
        };
        for id in members {
            if let Some(conn) = self.connection(id) {
                conn.remove_destination(name);
            }
            if let Err(e) = sub.remove_connection(id) {
                log::warn!("remove {}, {}", name, e);
            }
        }
        log::debug!("removed {} {}", sub.typ(), name);
        Some(sub)
    }

    /// Removes every destination.
    pub fn clear(&self) {
        let names: Vec<Destination> = self.subscriptions.iter().map(|s| s.key().clone()).collect();
        for name in names {
            self.remove(&name);
        }
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<Arc<Subscription>> {
        self.subscriptions.get(name).map(|s| s.value().clone())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

impl Deliver for SubscriptionRegistry {
    fn deliver(&self, id: ConnectionId, msg: &Message) -> Result<(), SmqError> {
        let conn = self.connection(id).ok_or(SmqError::ConnectionGone(id))?;
        conn.send(msg)
    }
}
