//! Blocking SMQ client.
//!
//! A reader thread decodes everything the broker sends: MESSAGE frames go to
//! the inbound queue, acknowledgements to the request that waits for them.

use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use smq_codec::{encode, header, read_message, Message, MessageType, SmqCodec};

use crate::error::ClientError;
use crate::types::{DestinationType, MessageId, QoS};

pub struct SmqClient {
    writer: Mutex<TcpStream>,
    inbox: Receiver<Message>,
    acks: Receiver<Message>,
    closed: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    timeout: Duration,
}

impl SmqClient {
    /// Opens the TCP connection without sending CONNECT. `timeout` bounds
    /// writes and every wait for an acknowledgement.
    pub fn open(addr: SocketAddr, timeout: Duration) -> Result<Self, ClientError> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(timeout))?;
        let reader_stream = stream.try_clone()?;

        let (inbox_tx, inbox) = unbounded();
        let (acks_tx, acks) = unbounded();
        let closed = Arc::new(AtomicBool::new(false));
        let reader_closed = closed.clone();
        let reader = std::thread::Builder::new()
            .name("smq-client-reader".into())
            .spawn(move || read_loop(reader_stream, inbox_tx, acks_tx, reader_closed))?;

        Ok(SmqClient {
            writer: Mutex::new(stream),
            inbox,
            acks,
            closed,
            reader: Mutex::new(Some(reader)),
            timeout,
        })
    }

    /// Opens the connection and logs in. An empty `username` connects
    /// anonymously.
    pub fn connect(
        addr: SocketAddr,
        client_id: &str,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let mut connect = Message::connect(client_id);
        if !username.is_empty() {
            connect = connect.header(header::USERNAME, username).header(header::PASSWORD, password);
        }
        let client = Self::open(addr, timeout)?;
        client.handshake(connect)?;
        Ok(client)
    }

    /// Sends a prepared CONNECT, e.g. one carrying a last will, and waits
    /// for the broker to accept it.
    pub fn handshake(&self, connect: Message) -> Result<(), ClientError> {
        self.request(&connect, MessageType::ConnectAck)
    }

    pub fn subscribe(&self, destination: &str, typ: DestinationType, qos: QoS) -> Result<(), ClientError> {
        let msg = Message::subscribe(destination)
            .header(header::TYPE, &typ.to_string())
            .header(header::QOS, &(qos as u8).to_string());
        self.request(&msg, MessageType::SubscribeAck)
    }

    pub fn unsubscribe(&self, destination: &str) -> Result<(), ClientError> {
        self.request(&Message::unsubscribe(destination), MessageType::UnsubscribeAck)
    }

    /// Publishes `body` to `destination` and waits for the broker to take it.
    pub fn send<B: Into<Bytes>>(&self, destination: &str, body: B) -> Result<(), ClientError> {
        self.request(&Message::publish(destination, body), MessageType::PublishAck)
    }

    /// Releases a QoS 1 message held by the broker.
    pub fn ack(&self, message_id: MessageId) -> Result<(), ClientError> {
        self.send_message(&Message::ack(message_id))
    }

    pub fn ping(&self) -> Result<(), ClientError> {
        self.request(&Message::new(MessageType::Ping), MessageType::PingAck)
    }

    /// Leaves politely, so the last will is not published.
    pub fn disconnect(&self) -> Result<(), ClientError> {
        self.send_message(&Message::new(MessageType::Disconnect))
    }

    /// Next inbound message, waiting up to `timeout`.
    pub fn get_message(&self, timeout: Duration) -> Option<Message> {
        self.inbox.recv_timeout(timeout).ok()
    }

    /// Number of inbound messages waiting
    #[inline]
    pub fn has_messages(&self) -> usize {
        self.inbox.len()
    }

    /// Writes one frame without waiting for an answer.
    pub fn send_message(&self, msg: &Message) -> Result<(), ClientError> {
        let frame = encode(msg.destination.as_deref().unwrap_or_default(), msg)?;
        self.write_raw(&frame)
    }

    pub fn write_raw(&self, data: &[u8]) -> Result<(), ClientError> {
        self.writer.lock().write_all(data)?;
        Ok(())
    }

    /// Waits for the next acknowledgement, which must be `expected`.
    pub fn wait_for(&self, expected: MessageType) -> Result<Message, ClientError> {
        match self.acks.recv_timeout(self.timeout) {
            Ok(msg) if msg.typ == expected => Ok(msg),
            Ok(msg) => Err(ClientError::Unexpected { expected, got: msg.typ }),
            Err(RecvTimeoutError::Timeout) => Err(ClientError::Timeout(expected)),
            Err(RecvTimeoutError::Disconnected) => Err(ClientError::Closed),
        }
    }

    fn request(&self, msg: &Message, ack: MessageType) -> Result<(), ClientError> {
        self.send_message(msg)?;
        self.wait_for(ack).map(|_| ())
    }

    /// True once the broker has closed the connection
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Waits up to `timeout` for the broker to close the connection,
    /// discarding acknowledgements that arrive meanwhile.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        loop {
            match self.acks.recv_timeout(timeout) {
                Ok(_) => continue,
                Err(RecvTimeoutError::Disconnected) => return true,
                Err(RecvTimeoutError::Timeout) => return self.is_closed(),
            }
        }
    }

    /// Drops the connection without DISCONNECT.
    pub fn close(&self) {
        if let Err(e) = self.writer.lock().shutdown(Shutdown::Both) {
            log::debug!("smq client shutdown error, {}", e);
        }
        if let Some(reader) = self.reader.lock().take() {
            if reader.join().is_err() {
                log::error!("smq client reader panicked");
            }
        }
    }
}

impl Drop for SmqClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_loop(mut stream: TcpStream, inbox: Sender<Message>, acks: Sender<Message>, closed: Arc<AtomicBool>) {
    let mut codec = SmqCodec::new(0);
    loop {
        let res = match read_message(&mut stream, &mut codec) {
            Ok(msg) if msg.typ == MessageType::Message => inbox.send(msg).is_ok(),
            Ok(msg) => acks.send(msg).is_ok(),
            Err(e) => {
                log::debug!("smq client reader stopped, {}", e);
                false
            }
        };
        if !res {
            break;
        }
    }
    closed.store(true, Ordering::SeqCst);
}
