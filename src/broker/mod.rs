//! Redis broker adapter.
//!
//! The broker carries three kinds of traffic, all named after the module
//! and object:
//!
//! - request queues `{module}.{object}` consumed with blocking pops,
//! - reply queues keyed by the caller-chosen `reply_to` (pushed with a
//!   five minute TTL so abandoned replies drain themselves),
//! - event channels `{module}.{object}.{method}` fanned out over
//!   pub/sub.
//!
//! [`RedisServer`] plugs a [`BaseServer`] into those queues;
//! [`RedisClient`] is the caller side.

mod pool;

pub use pool::{Pool, PoolConfig, PooledConnection};

use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{Result, ZbusError};
use crate::object::Surrogate;
use crate::protocol::{
    status_object_id, Arguments, Event, ObjectID, Output, Request, Response, Status, Values,
};
use crate::server::{BaseServer, WorkerPool};

const PULL_TIMEOUT_SECS: usize = 10;
const RESPONSE_TTL_SECS: usize = 300;
const REPLY_POLL_SECS: usize = 1;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Bus server bound to a Redis broker.
pub struct RedisServer {
    base: BaseServer,
    module: String,
    pool: Pool,
    workers: usize,
    running: Mutex<bool>,
}

impl RedisServer {
    /// Build a server for `module`, verifying the broker is reachable.
    ///
    /// # Errors
    ///
    /// `workers` must be at least one and the broker must answer a PING.
    pub async fn new(module: impl Into<String>, address: &str, workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(ZbusError::InvalidWorkerCount);
        }

        let pool = Pool::connect(address)?;
        {
            let mut conn = pool.get().await?;
            redis::cmd("PING")
                .query_async::<_, String>(&mut *conn)
                .await?;
        }

        Ok(Self {
            base: BaseServer::new(),
            module: module.into(),
            pool,
            workers,
            running: Mutex::new(false),
        })
    }

    /// Register an object under an id. Only allowed before [`run`].
    ///
    /// [`run`]: RedisServer::run
    pub fn register(&self, id: ObjectID, object: Surrogate) -> Result<()> {
        if *self.running.lock() {
            return Err(ZbusError::AlreadyRunning);
        }
        self.base.register(id, object)
    }

    /// Serve requests until the token cancels.
    ///
    /// The loop reserves a worker slot before every blocking pop, so
    /// nothing is pulled off the broker without a worker ready to take
    /// it. On cancellation, in-flight requests finish before workers
    /// exit.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        {
            let mut running = self.running.lock();
            if *running {
                return Err(ZbusError::AlreadyRunning);
            }
            *running = true;
        }

        let queues: Vec<String> = self
            .base
            .objects()
            .iter()
            .map(|id| format!("{}.{}", self.module, id))
            .collect();

        let worker_token = token.child_token();

        let mut events = self.base.start_streams(worker_token.clone());
        let event_pool = self.pool.clone();
        let event_module = self.module.clone();
        tokio::spawn(async move {
            while let Some((key, data)) = events.recv().await {
                if let Err(err) = publish_event(&event_pool, &event_module, &key, &data).await {
                    error!("failed to send event: {}", err);
                }
            }
        });

        tokio::spawn(status_handler(
            self.base.clone(),
            self.pool.clone(),
            self.module.clone(),
            worker_token.clone(),
        ));

        let WorkerPool {
            requests,
            mut responses,
            slots,
            handles,
        } = self.base.start(worker_token.clone(), self.workers)?;

        let response_pool = self.pool.clone();
        let publisher = tokio::spawn(async move {
            while let Some((request, response)) = responses.recv().await {
                if let Err(err) = publish_response(&response_pool, &request, &response).await {
                    error!("failed to send response: {}", err);
                }
            }
        });

        if queues.is_empty() {
            // nothing to poll; the status handler still serves
            token.cancelled().await;
        }

        while !token.is_cancelled() && !queues.is_empty() {
            let permit = tokio::select! {
                _ = token.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let payload = match pop(&self.pool, &queues, PULL_TIMEOUT_SECS).await {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(err) => {
                    error!("failed to get next job: {}, retrying in 1 second", err);
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            };

            if token.is_cancelled() {
                break;
            }

            let request = match Request::decode(&payload) {
                Ok(request) => request,
                Err(err) => {
                    error!("failed to load request object: {}", err);
                    continue;
                }
            };

            debug!("request {} for [{}].{}()", request.id, request.object, request.method);

            // the worker returns the slot once the request completes
            permit.forget();
            if requests.send(request).await.is_err() {
                break;
            }
        }

        worker_token.cancel();
        drop(requests);
        for handle in handles {
            let _ = handle.await;
        }
        let _ = publisher.await;

        Ok(())
    }
}

/// Answers status requests on the reserved `{module}.zbus@1.0` queue
/// with a snapshot of the worker pool, through the common response path.
async fn status_handler(base: BaseServer, pool: Pool, module: String, token: CancellationToken) {
    let queue = format!("{}.{}", module, status_object_id());

    loop {
        let result = tokio::select! {
            _ = token.cancelled() => return,
            result = pop(&pool, std::slice::from_ref(&queue), PULL_TIMEOUT_SECS) => result,
        };

        let payload = match result {
            Ok(Some(payload)) => payload,
            Ok(None) => continue,
            Err(err) => {
                error!("failed to get next status request: {}", err);
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
        };

        let request = match Request::decode(&payload) {
            Ok(request) => request,
            Err(err) => {
                error!("failed to load status request: {}", err);
                continue;
            }
        };

        let response = match status_response(&request, &base.status()) {
            Ok(response) => response,
            Err(err) => {
                error!("failed to encode status: {}", err);
                continue;
            }
        };

        if let Err(err) = publish_response(&pool, &request, &response).await {
            error!("failed to send status response: {}", err);
        }
    }
}

fn status_response(request: &Request, status: &Status) -> Result<Response> {
    Ok(Response::new(
        &request.id,
        Output {
            data: Values::single(status)?,
            error: None,
        },
    ))
}

/// Blocking pop across queues; `None` on timeout.
async fn pop(pool: &Pool, queues: &[String], timeout: usize) -> Result<Option<Vec<u8>>> {
    let mut conn = pool.get().await?;

    let mut cmd = redis::cmd("BLPOP");
    for queue in queues {
        cmd.arg(queue);
    }
    cmd.arg(timeout);

    let reply: Option<(String, Vec<u8>)> = cmd.query_async(&mut *conn).await?;
    Ok(reply.map(|(_, payload)| payload))
}

async fn publish_response(pool: &Pool, request: &Request, response: &Response) -> Result<()> {
    let payload = response.encode()?;
    let mut conn = pool.get().await?;

    redis::cmd("RPUSH")
        .arg(&request.reply_to)
        .arg(payload)
        .query_async::<_, ()>(&mut *conn)
        .await?;
    redis::cmd("EXPIRE")
        .arg(&request.reply_to)
        .arg(RESPONSE_TTL_SECS)
        .query_async::<_, ()>(&mut *conn)
        .await?;

    Ok(())
}

async fn publish_event(pool: &Pool, module: &str, key: &str, data: &[u8]) -> Result<()> {
    let channel = format!("{}.{}", module, key);
    let mut conn = pool.get().await?;

    redis::cmd("PUBLISH")
        .arg(&channel)
        .arg(data)
        .query_async::<_, ()>(&mut *conn)
        .await?;

    Ok(())
}

/// Bus client bound to a Redis broker.
#[derive(Clone)]
pub struct RedisClient {
    pool: Pool,
}

impl RedisClient {
    /// Build a client for a broker address.
    pub fn new(address: &str) -> Result<Self> {
        Ok(Self {
            pool: Pool::connect(address)?,
        })
    }

    /// Invoke `object.method` hosted by `module` and wait for the reply.
    pub async fn request(
        &self,
        module: &str,
        object: ObjectID,
        method: &str,
        args: impl Arguments,
    ) -> Result<Response> {
        self.request_with_context(&CancellationToken::new(), module, object, method, args)
            .await
    }

    /// Like [`request`], polling the reply queue until a response
    /// arrives or the token cancels.
    ///
    /// Cancellation latency is bounded by the one second poll. A
    /// response arriving after the caller gave up stays on the broker
    /// until its TTL expires.
    ///
    /// [`request`]: RedisClient::request
    pub async fn request_with_context(
        &self,
        token: &CancellationToken,
        module: &str,
        object: ObjectID,
        method: &str,
        args: impl Arguments,
    ) -> Result<Response> {
        let id = Uuid::new_v4().to_string();
        let queue = format!("{}.{}", module, object);
        let request = Request::new(id.clone(), id.clone(), object, method, args)?;
        let payload = request.encode()?;

        {
            let mut conn = self.pool.get().await?;
            redis::cmd("RPUSH")
                .arg(&queue)
                .arg(payload)
                .query_async::<_, ()>(&mut *conn)
                .await?;
        }

        loop {
            if token.is_cancelled() {
                return Err(ZbusError::Cancelled);
            }

            let reply = pop(&self.pool, std::slice::from_ref(&request.reply_to), REPLY_POLL_SECS)
                .await?;
            let Some(payload) = reply else { continue };

            let response = Response::decode(&payload)?;
            if let Some(error) = &response.error {
                return Err(ZbusError::Protocol(error.clone()));
            }

            return Ok(response);
        }
    }

    /// Subscribe to the events of `object.event` hosted by `module`.
    ///
    /// The subscription takes a dedicated connection. Events are never
    /// dropped: a slow consumer backpressures the broker. Cancelling the
    /// token drops the connection, which unsubscribes and closes the
    /// returned channel.
    pub async fn stream(
        &self,
        token: CancellationToken,
        module: &str,
        object: ObjectID,
        event: &str,
    ) -> Result<mpsc::Receiver<Event>> {
        let channel = format!("{}.{}.{}", module, object, event);

        let conn = self.pool.client().get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(&channel).await?;

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                let message = tokio::select! {
                    _ = token.cancelled() => return,
                    message = messages.next() => match message {
                        Some(message) => message,
                        None => return,
                    },
                };

                let event = Event(Bytes::from(message.get_payload_bytes().to_vec()));
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    /// Current status of the server running `module`: registered objects
    /// and worker occupancy.
    pub async fn status(&self, token: &CancellationToken, module: &str) -> Result<Status> {
        let response = self
            .request_with_context(token, module, status_object_id(), "", ())
            .await?;
        response.output.decode_at(0)
    }
}
