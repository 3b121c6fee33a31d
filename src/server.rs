//! Bounded worker pool executing requests against registered objects.
//!
//! [`BaseServer`] is the broker-agnostic half of a bus server: it owns
//! the object registry, schedules requests over a fixed set of worker
//! tasks and runs the stream workers. A broker adapter feeds it requests
//! and drains responses and events; anyone building a server on a
//! different broker starts here.

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::error::{Result, ZbusError};
use crate::object::Surrogate;
use crate::protocol::{ObjectID, Output, Request, Response, Status, WorkerStatus};

/// A running worker pool.
///
/// `requests` feeds the workers; `responses` pairs every processed
/// request with its response. `slots` is the admission semaphore: a
/// front-end reserves a slot before polling its broker and forgets the
/// permit on hand-off, the worker returns the slot once the request
/// completes. Polling only after a reservation guarantees a worker is
/// available for everything pulled off the broker.
pub struct WorkerPool {
    pub requests: mpsc::Sender<Request>,
    pub responses: mpsc::Receiver<(Request, Response)>,
    pub slots: Arc<Semaphore>,
    pub handles: Vec<JoinHandle<()>>,
}

/// Object registry plus worker scheduling, independent of any broker.
#[derive(Clone, Default)]
pub struct BaseServer {
    objects: Arc<RwLock<HashMap<ObjectID, Arc<Surrogate>>>>,
    status: Arc<RwLock<Vec<WorkerStatus>>>,
}

impl BaseServer {
    /// Create an empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object under an id.
    ///
    /// # Errors
    ///
    /// The built-in `zbus@1.0` id is reserved, and an id can only be
    /// registered once.
    pub fn register(&self, id: ObjectID, object: Surrogate) -> Result<()> {
        if id == crate::protocol::status_object_id() {
            return Err(ZbusError::ReservedObjectId);
        }

        let mut objects = self.objects.write();
        if objects.contains_key(&id) {
            return Err(ZbusError::ObjectExists);
        }

        objects.insert(id, Arc::new(object));
        Ok(())
    }

    /// Ids of every registered object.
    pub fn objects(&self) -> Vec<ObjectID> {
        self.objects.read().keys().cloned().collect()
    }

    /// Snapshot of the registered objects and per-worker status.
    pub fn status(&self) -> Status {
        Status {
            objects: self.objects(),
            workers: self.status.read().clone(),
        }
    }

    /// Start `workers` worker tasks consuming from a shared channel.
    ///
    /// Workers exit when the token cancels or the request channel
    /// closes; an in-flight request is always finished first.
    ///
    /// # Errors
    ///
    /// `workers` must be at least one.
    pub fn start(&self, token: CancellationToken, workers: usize) -> Result<WorkerPool> {
        if workers == 0 {
            return Err(ZbusError::InvalidWorkerCount);
        }

        *self.status.write() = (0..workers).map(|_| WorkerStatus::free()).collect();

        let (request_tx, request_rx) = mpsc::channel(1);
        let (response_tx, response_rx) = mpsc::channel(workers);
        let slots = Arc::new(Semaphore::new(workers));
        let feed = Arc::new(Mutex::new(request_rx));

        let handles = (0..workers)
            .map(|id| {
                tokio::spawn(self.clone().worker(
                    id,
                    token.clone(),
                    feed.clone(),
                    response_tx.clone(),
                    slots.clone(),
                ))
            })
            .collect();

        Ok(WorkerPool {
            requests: request_tx,
            responses: response_rx,
            slots,
            handles,
        })
    }

    /// Start one worker task per registered stream method.
    ///
    /// Every value a stream yields is forwarded on the returned channel
    /// keyed `object.method`, already encoded. Sends are blocking end to
    /// end: a slow consumer backpressures the streams.
    pub fn start_streams(&self, token: CancellationToken) -> mpsc::Receiver<(String, Bytes)> {
        let (tx, rx) = mpsc::channel(1);

        let objects = self.objects.read();
        for (id, surrogate) in objects.iter() {
            for (name, mut source) in surrogate.run_streams(&token) {
                let key = format!("{}.{}", id, name);
                let tx = tx.clone();
                let token = token.clone();

                tokio::spawn(async move {
                    loop {
                        let data = tokio::select! {
                            _ = token.cancelled() => return,
                            data = source.recv() => match data {
                                Some(data) => data,
                                None => return,
                            },
                        };

                        if tx.send((key.clone(), data)).await.is_err() {
                            return;
                        }
                    }
                });
            }
        }

        rx
    }

    fn surrogate(&self, id: &ObjectID) -> Option<Arc<Surrogate>> {
        self.objects.read().get(id).cloned()
    }

    fn status_in(&self, id: usize, request: &Request) {
        let mut status = self.status.write();
        if let Some(slot) = status.get_mut(id) {
            *slot = WorkerStatus::busy(format!("[{}].{}()", request.object, request.method));
        }
    }

    fn status_out(&self, id: usize) {
        let mut status = self.status.write();
        if let Some(slot) = status.get_mut(id) {
            *slot = WorkerStatus::free();
        }
    }

    async fn call(&self, request: &Request) -> Result<Output> {
        let surrogate = self
            .surrogate(&request.object)
            .ok_or(ZbusError::UnknownObject)?;

        let call = surrogate.call(&request.method, request.inputs.clone());
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = format!(
                    "remote method call {}.{}() paniced: {}",
                    request.object,
                    request.method,
                    panic_reason(&panic)
                );
                error!("{}\n{}", message, Backtrace::force_capture());
                Err(ZbusError::Protocol(message))
            }
        }
    }

    async fn process(&self, request: &Request) -> Response {
        match self.call(request).await {
            Ok(output) => Response::new(&request.id, output),
            Err(err) => Response::with_error(&request.id, err.to_string()),
        }
    }

    async fn worker(
        self,
        id: usize,
        token: CancellationToken,
        feed: Arc<Mutex<mpsc::Receiver<Request>>>,
        out: mpsc::Sender<(Request, Response)>,
        slots: Arc<Semaphore>,
    ) {
        loop {
            let request = {
                let mut feed = feed.lock().await;
                tokio::select! {
                    _ = token.cancelled() => return,
                    request = feed.recv() => match request {
                        Some(request) => request,
                        None => return,
                    },
                }
            };

            if request.is_no_op() {
                continue;
            }

            self.status_in(id, &request);
            let response = self.process(&request).await;
            self.status_out(id);

            let delivered = out.send((request, response)).await.is_ok();
            slots.add_permits(1);
            if !delivered {
                return;
            }
        }
    }
}

fn panic_reason(panic: &(dyn std::any::Any + Send)) -> String {
    macro_rules! try_ty {
        ($t:ty) => {
            if panic.is::<$t>() {
                eprintln!("DEBUG matched type: {}", stringify!($t));
            }
        };
    }
    try_ty!(&str);
    try_ty!(String);
    try_ty!(Box<str>);
    try_ty!(std::borrow::Cow<'static, str>);
    try_ty!(std::fmt::Arguments);
    try_ty!(std::sync::Arc<str>);
    try_ty!(std::boxed::Box<dyn std::fmt::Display + Send>);
    try_ty!(std::boxed::Box<dyn std::any::Any + Send>);

    if let Some(inner) = panic.downcast_ref::<Box<dyn std::any::Any + Send>>() {
        if let Some(s) = inner.downcast_ref::<&str>() {
            eprintln!("DEBUG inner str: {}", s);
        } else if let Some(s) = inner.downcast_ref::<String>() {
            eprintln!("DEBUG inner String: {}", s);
        } else {
            eprintln!("DEBUG inner unknown");
        }
    }
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
