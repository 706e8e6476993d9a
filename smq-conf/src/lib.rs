#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use smq_utils::deserialize_duration;

pub use self::listener::Listener;
pub use self::logging::Log;
pub use self::options::Options;

pub mod listener;
pub mod logging;
pub mod options;

pub type Result<T> = anyhow::Result<T>;

/// Broker settings, loaded once at startup and handed to the server.
#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub listener: Listener,
    #[serde(default)]
    pub broker: Broker,
    #[serde(default)]
    pub task: Task,
    #[serde(default)]
    pub log: Log,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings(Arc::new(Inner::default()))
    }
}

impl Settings {
    /// Loads `/etc/smq/smq.*`, `./smq.*`, the `-f` file and `SMQ_*`
    /// environment variables, later sources overriding earlier ones.
    pub fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/smq/smq").required(false))
            .add_source(File::with_name("smq").required(false));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(true));
        }

        builder = builder
            .add_source(Environment::with_prefix("smq").prefix_separator("_").separator("__").try_parsing(true));

        let inner: Inner = builder.build()?.try_deserialize()?;
        Ok(Self::with_options(inner, opts))
    }

    /// Applies command line overrides on top of already loaded settings.
    pub fn with_options(mut inner: Inner, opts: Options) -> Self {
        if let Some(laddr) = opts.laddr {
            inner.listener.addr = laddr;
        }
        if let Some(workers) = opts.workers {
            inner.task.workers = workers;
        }
        inner.opts = opts;
        Self(Arc::new(inner))
    }

    #[inline]
    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("listener is {} on {}", self.listener.name, self.listener.addr);
        log::info!("task.workers is {}", self.task.workers);
        log::info!("task.idle_timeout is {:?}", self.task.idle_timeout);
        log::info!("broker.message_expiry is {:?}", self.broker.message_expiry);
        if self.broker.username.is_empty() {
            log::info!("anonymous connections are allowed");
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

/// `[task]` section, sizing of the worker pool
#[derive(Debug, Clone, Deserialize)]
pub struct Task {
    //Worker thread limit, 0 means unlimited.
    #[serde(default = "Task::workers_default")]
    pub workers: usize,

    //How long an idle worker thread lingers before exiting.
    #[serde(default = "Task::idle_timeout_default", deserialize_with = "deserialize_duration")]
    pub idle_timeout: Duration,
}

impl Default for Task {
    #[inline]
    fn default() -> Self {
        Self { workers: Self::workers_default(), idle_timeout: Self::idle_timeout_default() }
    }
}

impl Task {
    fn workers_default() -> usize {
        16
    }
    fn idle_timeout_default() -> Duration {
        Duration::from_secs(60)
    }
}

/// `[broker]` section
#[derive(Debug, Clone, Deserialize)]
pub struct Broker {
    //Credentials required on CONNECT, empty username allows anonymous clients.
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,

    //Upper bound of one multiplexer poll cycle.
    #[serde(default = "Broker::poll_timeout_default", deserialize_with = "deserialize_duration")]
    pub poll_timeout: Duration,

    //How long membership changes and deliveries wait for a subscription lock.
    #[serde(default = "Broker::lock_timeout_default", deserialize_with = "deserialize_duration")]
    pub lock_timeout: Duration,

    //Unacknowledged messages older than this are swept from the store, 0 means never.
    #[serde(default = "Broker::message_expiry_default", deserialize_with = "deserialize_duration")]
    pub message_expiry: Duration,

    #[serde(default = "Broker::store_sweep_interval_default", deserialize_with = "deserialize_duration")]
    pub store_sweep_interval: Duration,

    //Answer requests with acknowledgement frames.
    #[serde(default = "Broker::send_acks_default")]
    pub send_acks: bool,
}

impl Default for Broker {
    #[inline]
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            poll_timeout: Self::poll_timeout_default(),
            lock_timeout: Self::lock_timeout_default(),
            message_expiry: Self::message_expiry_default(),
            store_sweep_interval: Self::store_sweep_interval_default(),
            send_acks: Self::send_acks_default(),
        }
    }
}

impl Broker {
    fn poll_timeout_default() -> Duration {
        Duration::from_millis(100)
    }
    fn lock_timeout_default() -> Duration {
        Duration::from_secs(1)
    }
    fn message_expiry_default() -> Duration {
        Duration::from_secs(5 * 60)
    }
    fn store_sweep_interval_default() -> Duration {
        Duration::from_secs(10)
    }
    fn send_acks_default() -> bool {
        true
    }

    #[inline]
    pub fn allow_anonymous(&self) -> bool {
        self.username.is_empty()
    }
}
