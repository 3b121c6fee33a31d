//! Stream method plumbing.
//!
//! A stream method takes a cancellation token and returns a channel of
//! typed values; the handler here erases the element type by encoding
//! every value as it flows through. Sends are always blocking: a slow
//! consumer backpressures the producing method, events are never
//! dropped.

use std::marker::PhantomData;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::codec::MsgPackCodec;

/// Type-erased stream entry: runs the method and yields its values
/// already encoded.
pub(crate) trait StreamHandler: Send + Sync {
    fn run(&self, token: CancellationToken) -> mpsc::Receiver<Bytes>;
}

pub(crate) struct TypedStream<F, T> {
    stream: F,
    _marker: PhantomData<fn() -> T>,
}

impl<F, T> TypedStream<F, T> {
    pub(crate) fn new(stream: F) -> Self {
        Self {
            stream,
            _marker: PhantomData,
        }
    }
}

impl<F, T> StreamHandler for TypedStream<F, T>
where
    F: Fn(CancellationToken) -> mpsc::Receiver<T> + Send + Sync + 'static,
    T: Serialize + Send + 'static,
{
    fn run(&self, token: CancellationToken) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(1);
        let mut source = (self.stream)(token.clone());

        tokio::spawn(async move {
            loop {
                let value = tokio::select! {
                    _ = token.cancelled() => return,
                    value = source.recv() => match value {
                        Some(value) => value,
                        None => return,
                    },
                };

                let data = match MsgPackCodec::encode(&value) {
                    Ok(data) => Bytes::from(data),
                    Err(err) => {
                        error!("failed to encode event: {}", err);
                        continue;
                    }
                };

                if tx.send(data).await.is_err() {
                    return;
                }
            }
        });

        rx
    }
}
