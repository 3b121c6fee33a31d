//! Bounded connection pool for the broker.
//!
//! Borrowing blocks when every connection is handed out; returned
//! connections are kept idle and revalidated with a PING when they have
//! been parked long enough that the broker may have dropped them.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;
use url::Url;

use crate::error::{Result, ZbusError};

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections handed out plus idle, at most.
    pub max_active: usize,
    /// Idle connections older than this are discarded on borrow.
    pub idle_timeout: Duration,
    /// Idle connections parked longer than this are PINGed on borrow.
    pub test_threshold: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: 100,
            idle_timeout: Duration::from_secs(60),
            test_threshold: Duration::from_secs(10),
        }
    }
}

struct Idle {
    conn: MultiplexedConnection,
    since: Instant,
}

struct Inner {
    client: redis::Client,
    config: PoolConfig,
    slots: Arc<Semaphore>,
    idle: Mutex<VecDeque<Idle>>,
}

/// Shared handle to a bounded broker connection pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

impl Pool {
    /// Build a pool for a broker address with default tuning.
    ///
    /// Supported address forms are `tcp://host:port` and
    /// `unix:///path/to/socket`; a password, when needed, rides in the
    /// userinfo part (`tcp://secret@host:port`).
    pub fn connect(address: &str) -> Result<Self> {
        Self::with_config(address, PoolConfig::default())
    }

    /// Build a pool with explicit tuning.
    pub fn with_config(address: &str, config: PoolConfig) -> Result<Self> {
        let client = redis::Client::open(redis_url(address)?)?;

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                slots: Arc::new(Semaphore::new(config.max_active)),
                config,
                idle: Mutex::new(VecDeque::new()),
            }),
        })
    }

    /// Borrow a connection, waiting when the pool is exhausted.
    ///
    /// The connection returns to the pool when the guard drops.
    pub async fn get(&self) -> Result<PooledConnection> {
        let permit = self
            .inner
            .slots
            .clone()
            .acquire_owned()
            .await
            .expect("pool semaphore closed");

        loop {
            let idle = match self.inner.idle.lock().pop_front() {
                Some(idle) => idle,
                None => break,
            };
            let parked = idle.since.elapsed();
            if parked > self.inner.config.idle_timeout {
                trace!("discarding connection idle for {:?}", parked);
                continue;
            }

            let mut conn = idle.conn;
            if parked > self.inner.config.test_threshold
                && redis::cmd("PING")
                    .query_async::<_, String>(&mut conn)
                    .await
                    .is_err()
            {
                trace!("discarding dead idle connection");
                continue;
            }

            return Ok(PooledConnection {
                conn: Some(conn),
                pool: self.inner.clone(),
                _permit: permit,
            });
        }

        let conn = self.inner.client.get_multiplexed_async_connection().await?;
        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// The underlying client, for connections that must not be shared
    /// (subscriptions take over a whole connection).
    pub(crate) fn client(&self) -> &redis::Client {
        &self.inner.client
    }
}

/// A borrowed broker connection; returns to the pool on drop.
pub struct PooledConnection {
    conn: Option<MultiplexedConnection>,
    pool: Arc<Inner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = MultiplexedConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection already returned")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection already returned")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.idle.lock().push_back(Idle {
                conn,
                since: Instant::now(),
            });
        }
    }
}

/// Map a bus address onto a redis connection URL.
fn redis_url(address: &str) -> Result<String> {
    let url = Url::parse(address)?;

    let password = if url.username().is_empty() {
        None
    } else {
        Some(url.username().to_string())
    };

    match url.scheme() {
        "tcp" => {
            let host = url
                .host_str()
                .ok_or_else(|| ZbusError::InvalidScheme("tcp".to_string()))?;
            let port = url.port().unwrap_or(6379);
            match password {
                Some(password) => Ok(format!("redis://:{}@{}:{}", password, host, port)),
                None => Ok(format!("redis://{}:{}", host, port)),
            }
        }
        "unix" => match password {
            Some(password) => Ok(format!("redis+unix://{}?pass={}", url.path(), password)),
            None => Ok(format!("redis+unix://{}", url.path())),
        },
        scheme => Err(ZbusError::InvalidScheme(scheme.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.max_active, 100);
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.test_threshold, Duration::from_secs(10));
    }

    #[test]
    fn test_tcp_address() {
        assert_eq!(
            redis_url("tcp://localhost:6379").unwrap(),
            "redis://localhost:6379"
        );
    }

    #[test]
    fn test_tcp_address_default_port() {
        assert_eq!(redis_url("tcp://localhost").unwrap(), "redis://localhost:6379");
    }

    #[test]
    fn test_tcp_address_with_password() {
        assert_eq!(
            redis_url("tcp://secret@localhost:6379").unwrap(),
            "redis://:secret@localhost:6379"
        );
    }

    #[test]
    fn test_unix_address() {
        assert_eq!(
            redis_url("unix:///var/run/redis.sock").unwrap(),
            "redis+unix:///var/run/redis.sock"
        );
    }

    #[test]
    fn test_unknown_scheme() {
        let err = redis_url("http://localhost").unwrap_err();
        assert_eq!(err.to_string(), "unknown scheme 'http' expecting tcp or unix");
    }

    #[test]
    fn test_pool_builds_without_broker() {
        // opening a client performs no I/O
        assert!(Pool::connect("tcp://localhost:6379").is_ok());
    }
}
