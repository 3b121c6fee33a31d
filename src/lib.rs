//! # zbus
//!
//! RPC and event bus over a Redis broker.
//!
//! Services register named, versioned objects whose methods become
//! remotely callable; clients invoke those methods by name with typed
//! arguments and receive typed results. Objects may also expose event
//! streams clients subscribe to.
//!
//! ## Architecture
//!
//! - **Wire format**: everything is MessagePack. Call arguments and
//!   returns travel as tuples of independently encoded elements, so the
//!   server decodes each argument only after resolving its declared
//!   parameter type.
//! - **Dispatch**: a [`Surrogate`] per object holds a table of typed
//!   decode-invoke-encode thunks built at registration time.
//! - **Scheduling**: a bounded worker pool with admission control. The
//!   broker is only polled once a worker slot is reserved, so requests
//!   never queue inside the process.
//! - **Events**: stream methods yield values that are published over
//!   broker pub/sub under `{module}.{object}.{method}`.
//!
//! ## Example
//!
//! ```ignore
//! use zbus::{ObjectID, RedisClient, RedisServer, Surrogate};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> zbus::Result<()> {
//!     let server = RedisServer::new("server", "tcp://localhost:6379", 3).await?;
//!     server.register(
//!         ObjectID::new("calculator", "1.0"),
//!         Surrogate::builder()
//!             .handle_variadic("Add", |values: Vec<f64>| async move {
//!                 (values.iter().sum::<f64>(),)
//!             })
//!             .build(),
//!     )?;
//!     tokio::spawn(async move { server.run(CancellationToken::new()).await });
//!
//!     let client = RedisClient::new("tcp://localhost:6379")?;
//!     let response = client
//!         .request("server", ObjectID::new("calculator", "1.0"), "Add", (1.0, 2.0))
//!         .await?;
//!     let sum: f64 = response.output.decode_at(0)?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod codec;
pub mod error;
pub mod object;
pub mod protocol;
pub mod server;

pub use broker::{Pool, PoolConfig, RedisClient, RedisServer};
pub use error::{Result, ZbusError};
pub use object::{ObjectBuilder, Surrogate};
pub use protocol::{
    status_object_id, Arguments, CallError, Event, ObjectID, Output, Request, Response, Status,
    Tuple, Values, WorkerState, WorkerStatus,
};
pub use server::{BaseServer, WorkerPool};
