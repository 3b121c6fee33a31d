//! Per-object dispatch tables.
//!
//! A [`Surrogate`] stands in for a service object: it maps wire method
//! names to typed thunks that validate, decode, invoke and encode. The
//! table is assembled once through [`ObjectBuilder`] and immutable after
//! registration, which is what lets workers dispatch against it without
//! coordination.
//!
//! # Example
//!
//! ```ignore
//! let calculator = Surrogate::builder()
//!     .handle_variadic("Add", |values: Vec<f64>| async move {
//!         (values.iter().sum::<f64>(),)
//!     })
//!     .handle("Divide", |a: f64, b: f64| async move {
//!         if b == 0.0 {
//!             return Err(CallError::new("division by zero"));
//!         }
//!         Ok((a / b,))
//!     })
//!     .stream("TikTok", |token| { /* mpsc::Receiver of timestamps */ })
//!     .build();
//!
//! server.register(ObjectID::new("calculator", "1.0"), calculator)?;
//! ```

mod handler;
mod stream;

use std::collections::HashMap;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ZbusError};
use crate::protocol::{Output, Tuple};

use handler::{FixedHandler, MethodHandler, VariadicHandler};
use stream::{StreamHandler, TypedStream};

pub use handler::{BoxFuture, FromInputs, FromVariadicInputs, IntoOutput, Method, ReturnValues};

/// Dispatch table for one registered object.
pub struct Surrogate {
    methods: HashMap<String, Box<dyn MethodHandler>>,
    streams: HashMap<String, Box<dyn StreamHandler>>,
}

impl Surrogate {
    /// Start assembling an object's method table.
    pub fn builder() -> ObjectBuilder {
        ObjectBuilder {
            methods: HashMap::new(),
            streams: HashMap::new(),
        }
    }

    /// Dispatch a call to the named method.
    ///
    /// # Errors
    ///
    /// Protocol-level only: "not a function" for an unknown name, arity
    /// or argument type mismatches from the thunk. The callee's own
    /// error, if any, rides inside the returned output.
    pub async fn call(&self, method: &str, inputs: Tuple) -> Result<Output> {
        let handler = self.methods.get(method).ok_or(ZbusError::NotAFunction)?;
        handler.call(inputs).await
    }

    /// Names of the registered stream methods, in no particular order.
    pub fn streams(&self) -> Vec<&str> {
        self.streams.keys().map(String::as_str).collect()
    }

    /// Run every stream method, returning each paired with its name.
    pub(crate) fn run_streams(
        &self,
        token: &CancellationToken,
    ) -> Vec<(String, mpsc::Receiver<Bytes>)> {
        self.streams
            .iter()
            .map(|(name, handler)| (name.clone(), handler.run(token.clone())))
            .collect()
    }
}

/// Builder assembling a [`Surrogate`].
///
/// Method closures are async and typed; the builder wraps each one in a
/// decode-invoke-encode thunk keyed by its wire name. Return values are
/// positional tuples (`()`, `(T0,)`, …); a method with a trailing error
/// returns `Result<tuple, error>` instead.
pub struct ObjectBuilder {
    methods: HashMap<String, Box<dyn MethodHandler>>,
    streams: HashMap<String, Box<dyn StreamHandler>>,
}

impl ObjectBuilder {
    /// Register a method with a fixed parameter list.
    pub fn handle<F, Args, R>(mut self, name: &str, method: F) -> Self
    where
        F: Method<Args, R>,
        Args: FromInputs + 'static,
        R: IntoOutput + Send + 'static,
    {
        self.methods
            .insert(name.to_string(), Box::new(FixedHandler::new(method)));
        self
    }

    /// Register a method whose last parameter is a variadic tail: the
    /// closure receives every remaining wire input collected in a `Vec`.
    pub fn handle_variadic<F, Args, R>(mut self, name: &str, method: F) -> Self
    where
        F: Method<Args, R>,
        Args: FromVariadicInputs + 'static,
        R: IntoOutput + Send + 'static,
    {
        self.methods
            .insert(name.to_string(), Box::new(VariadicHandler::new(method)));
        self
    }

    /// Register a stream method: given a cancellation token it returns a
    /// channel of values, each published as an event under
    /// `object.name`. The method must stop producing once the token
    /// cancels.
    pub fn stream<F, T>(mut self, name: &str, stream: F) -> Self
    where
        F: Fn(CancellationToken) -> mpsc::Receiver<T> + Send + Sync + 'static,
        T: Serialize + Send + 'static,
    {
        self.streams
            .insert(name.to_string(), Box::new(TypedStream::new(stream)));
        self
    }

    /// Finish the table.
    pub fn build(self) -> Surrogate {
        Surrogate {
            methods: self.methods,
            streams: self.streams,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Arguments, CallError};

    fn object() -> Surrogate {
        Surrogate::builder()
            .handle("GetName", || async { ("my-name".to_string(),) })
            .handle("Add", |a: i64, b: i64| async move { (a + b,) })
            .handle_variadic("Concat", |parts: Vec<String>| async move {
                (parts.concat(),)
            })
            .handle_variadic("Join", |sep: String, parts: Vec<String>| async move {
                (parts.join(&sep),)
            })
            .handle("MakeError", || async {
                let result: std::result::Result<(i64,), CallError> =
                    Err(CallError::new("we made an error"));
                result
            })
            .stream("TikTok", |token: CancellationToken| {
                let (tx, rx) = mpsc::channel(1);
                tokio::spawn(async move {
                    let mut i = 0i64;
                    loop {
                        i += 1;
                        tokio::select! {
                            _ = token.cancelled() => return,
                            sent = tx.send(i) => if sent.is_err() { return },
                        }
                    }
                });
                rx
            })
            .build()
    }

    fn args(args: impl Arguments) -> Tuple {
        args.into_tuple().unwrap()
    }

    #[tokio::test]
    async fn test_call_unknown_method() {
        let err = object().call("NotDefined", Tuple::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "not a function");
    }

    #[tokio::test]
    async fn test_call_with_arguments() {
        let output = object().call("Add", args((10i64, 20i64))).await.unwrap();
        assert_eq!(output.decode_at::<i64>(0).unwrap(), 30);
    }

    #[tokio::test]
    async fn test_call_variadic() {
        let output = object()
            .call("Concat", args(("hello", "world")))
            .await
            .unwrap();
        assert_eq!(output.decode_at::<String>(0).unwrap(), "helloworld");
    }

    #[tokio::test]
    async fn test_call_variadic_with_leading_arguments() {
        let output = object()
            .call("Join", args(("/", "hello", "world")))
            .await
            .unwrap();
        assert_eq!(output.decode_at::<String>(0).unwrap(), "hello/world");
    }

    #[tokio::test]
    async fn test_call_variadic_with_wrong_types() {
        let err = object()
            .call("Join", args(("/", "hello", 10i64)))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid argument type [2] expecting alloc::string::String"
        );
    }

    #[tokio::test]
    async fn test_call_wrong_arity() {
        let err = object()
            .call("MakeError", args((10i64,)))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid number of arguments expecting 0 got 1"
        );
    }

    #[tokio::test]
    async fn test_call_error_return() {
        let output = object().call("MakeError", Tuple::new()).await.unwrap();
        assert_eq!(output.call_error().unwrap().message, "we made an error");
        assert_eq!(output.decode_at::<i64>(0).unwrap(), 0);
    }

    #[test]
    fn test_streams_lists_stream_methods_only() {
        let object = object();
        let streams = object.streams();
        assert_eq!(streams, vec!["TikTok"]);
    }

    #[tokio::test]
    async fn test_stream_run_and_cancel() {
        let object = object();
        let token = CancellationToken::new();
        let (name, mut events) = object.run_streams(&token).into_iter().next().unwrap();
        assert_eq!(name, "TikTok");

        let mut seen = 0i64;
        while let Some(data) = events.recv().await {
            let value: i64 = crate::codec::MsgPackCodec::decode(&data).unwrap();
            assert!(value > seen);
            seen = value;
            if seen == 3 {
                token.cancel();
            }
        }

        assert!(seen >= 3);
    }
}
