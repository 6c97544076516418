//! The client connection pool.
//!
//! All `pool_size` TCP connections are opened eagerly at construction.
//! Sessions check a connection out and return it on drop; a connection that
//! suffers any I/O failure is closed and permanently removed, so the pool
//! only ever shrinks after errors.

use std::{
    collections::VecDeque,
    net::{TcpStream, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use log::{debug, error, info};
use parking_lot::{Condvar, Mutex};

use crate::{error::SinewError, session::Session};

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub pool_size: usize,
    /// How long [`Client::session`] waits for a free connection.
    pub connect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 9876,
            pool_size: 5,
            connect_timeout: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug)]
pub(crate) struct PoolState {
    pub(crate) idle: VecDeque<TcpStream>,
    /// Connections still alive, checked out or idle.
    pub(crate) live: usize,
}

#[derive(Debug)]
pub(crate) struct PoolInner {
    pub(crate) state: Mutex<PoolState>,
    pub(crate) available: Condvar,
    timeout: Duration,
}

impl PoolInner {
    /// Block until a connection frees up, up to the configured timeout.
    pub(crate) fn checkout(&self) -> Result<TcpStream, SinewError> {
        let mut state = self.state.lock();
        loop {
            if let Some(stream) = state.idle.pop_front() {
                return Ok(stream);
            }
            if self
                .available
                .wait_for(&mut state, self.timeout)
                .timed_out()
            {
                return Err(SinewError::ConnectionTimeout(self.timeout));
            }
        }
    }

    pub(crate) fn checkin(&self, stream: TcpStream) {
        self.state.lock().idle.push_back(stream);
        self.available.notify_one();
    }

    /// A connection died mid-use: drop it from the pool entirely.
    pub(crate) fn discard(&self) {
        let mut state = self.state.lock();
        state.live = state.live.saturating_sub(1);
        error!("connection dropped from pool; {} remain", state.live);
    }
}

/// Thread-safe TissDB client. Cloning shares the pool.
#[derive(Clone)]
pub struct Client {
    inner: Arc<PoolInner>,
}

impl Client {
    /// Open `pool_size` connections to the configured server. Any failure
    /// aborts construction.
    pub fn connect(config: Config) -> Result<Self, SinewError> {
        let address = (config.host.as_str(), config.port);
        let mut idle = VecDeque::with_capacity(config.pool_size);
        for n in 0..config.pool_size {
            let addrs = address
                .to_socket_addrs()
                .map_err(|e| SinewError::ConnectionInit(format!("resolve {}: {e}", config.host)))?;
            let mut last_err = None;
            let mut stream = None;
            for addr in addrs {
                match TcpStream::connect_timeout(&addr, config.connect_timeout) {
                    Ok(s) => {
                        stream = Some(s);
                        break;
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            let stream = stream.ok_or_else(|| {
                SinewError::ConnectionInit(format!(
                    "connect {}:{}: {}",
                    config.host,
                    config.port,
                    last_err.map_or_else(|| "no addresses".to_owned(), |e| e.to_string())
                ))
            })?;
            stream
                .set_nodelay(true)
                .map_err(|e| SinewError::ConnectionInit(e.to_string()))?;
            debug!("pool connection {n} established");
            idle.push_back(stream);
        }
        info!(
            "connected pool of {} to {}:{}",
            config.pool_size, config.host, config.port
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    live: idle.len(),
                    idle,
                }),
                available: Condvar::new(),
                timeout: config.connect_timeout,
            }),
        })
    }

    /// Check a connection out of the pool. The session holds it until
    /// dropped.
    pub fn session(&self) -> Result<Session, SinewError> {
        let stream = self.inner.checkout()?;
        Ok(Session::new(stream, self.inner.clone()))
    }

    /// Connections currently alive (idle or checked out).
    pub fn live_connections(&self) -> usize {
        self.inner.state.lock().live
    }
}
