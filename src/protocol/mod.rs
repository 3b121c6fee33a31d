//! Wire records exchanged over the broker.
//!
//! Requests, responses and events are MessagePack records whose payload
//! values travel as [`Tuple`]s: ordered sequences of *independently*
//! encoded byte strings. Encoding each element on its own lets the
//! receiving side resolve the target parameter type first and only then
//! decode the bytes at that position, so the wire never carries type
//! tags beyond what MessagePack itself provides.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_bytes::ByteBuf;
use thiserror::Error;

use crate::codec::MsgPackCodec;
use crate::error::{Result, ZbusError};

/// Name and version pair identifying an object on a module.
///
/// The string form is `name@version`, or just `name` when the version is
/// empty; it is the key component of every broker queue and channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectID {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Version")]
    pub version: String,
}

impl ObjectID {
    /// Create an object id from name and version parts.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ObjectID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.version.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}@{}", self.name, self.version)
        }
    }
}

impl FromStr for ObjectID {
    type Err = std::convert::Infallible;

    /// Parse `name@version`, splitting on the first `@`. A bare name
    /// yields an empty version.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((name, version)) => Ok(ObjectID::new(name, version)),
            None => Ok(ObjectID::new(s, "")),
        }
    }
}

/// Identity of the built-in status object every server exposes.
///
/// Registering an object under this id is rejected.
pub fn status_object_id() -> ObjectID {
    ObjectID::new("zbus", "1.0")
}

/// Ordered sequence of independently encoded values.
///
/// Each position holds one value already encoded to MsgPack bytes;
/// [`Tuple::decode_at`] decodes a single position into a concrete type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tuple(Vec<ByteBuf>);

impl Tuple {
    /// Create an empty tuple.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the tuple holds no elements.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encode a value and append it.
    pub fn push<T: Serialize>(&mut self, value: &T) -> Result<()> {
        self.0.push(ByteBuf::from(MsgPackCodec::encode(value)?));
        Ok(())
    }

    /// Append already encoded bytes.
    pub fn push_raw(&mut self, bytes: Vec<u8>) {
        self.0.push(ByteBuf::from(bytes));
    }

    /// Raw bytes at position `i`.
    pub fn get(&self, i: usize) -> Option<&[u8]> {
        self.0.get(i).map(|raw| raw.as_ref())
    }

    /// Decode the element at position `i` into `T`.
    ///
    /// # Errors
    ///
    /// "index out of range" when `i` is not in `[0, len)`, or a decode
    /// error when the bytes do not describe a `T`.
    pub fn decode_at<T: DeserializeOwned>(&self, i: usize) -> Result<T> {
        let raw = self.0.get(i).ok_or(ZbusError::IndexOutOfRange)?;
        MsgPackCodec::decode(raw)
    }
}

/// Positional call arguments, each encoded independently.
///
/// Implemented for value tuples up to six elements and for [`Tuple`]
/// itself, so call sites can pass `(a, b, c)` directly or assemble a
/// tuple by hand (the way generated stubs handle variadic tails).
pub trait Arguments {
    /// Encode the arguments into a wire tuple.
    fn into_tuple(self) -> Result<Tuple>;
}

impl Arguments for Tuple {
    fn into_tuple(self) -> Result<Tuple> {
        Ok(self)
    }
}

impl Arguments for () {
    fn into_tuple(self) -> Result<Tuple> {
        Ok(Tuple::new())
    }
}

macro_rules! arguments_for_tuple {
    ($($ty:ident : $idx:tt),+) => {
        impl<$($ty: Serialize),+> Arguments for ($($ty,)+) {
            fn into_tuple(self) -> Result<Tuple> {
                let mut tuple = Tuple::new();
                $(tuple.push(&self.$idx)?;)+
                Ok(tuple)
            }
        }
    };
}

arguments_for_tuple!(A0: 0);
arguments_for_tuple!(A0: 0, A1: 1);
arguments_for_tuple!(A0: 0, A1: 1, A2: 2);
arguments_for_tuple!(A0: 0, A1: 1, A2: 2, A3: 3);
arguments_for_tuple!(A0: 0, A1: 1, A2: 2, A3: 3, A4: 4);
arguments_for_tuple!(A0: 0, A1: 1, A2: 2, A3: 3, A4: 4, A5: 5);

/// A single method invocation.
///
/// Created by a client, consumed once by exactly one worker. The id is a
/// caller-generated unique token; `reply_to` is the broker key the
/// server pushes the response onto, by convention equal to the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Inputs")]
    pub inputs: Tuple,
    #[serde(rename = "Object")]
    pub object: ObjectID,
    #[serde(rename = "ReplyTo")]
    pub reply_to: String,
    #[serde(rename = "Method")]
    pub method: String,
}

impl Request {
    /// Build a request, encoding each argument separately.
    pub fn new(
        id: impl Into<String>,
        reply_to: impl Into<String>,
        object: ObjectID,
        method: impl Into<String>,
        args: impl Arguments,
    ) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            inputs: args.into_tuple()?,
            object,
            reply_to: reply_to.into(),
            method: method.into(),
        })
    }

    /// The sentinel request used only as a worker availability probe.
    /// Workers recognize it and never dispatch it.
    pub fn no_op() -> Self {
        Self {
            id: String::new(),
            inputs: Tuple::new(),
            object: ObjectID::new("", ""),
            reply_to: String::new(),
            method: String::new(),
        }
    }

    /// True for the [`Request::no_op`] sentinel.
    pub fn is_no_op(&self) -> bool {
        self.id.is_empty() && self.method.is_empty() && self.object.name.is_empty()
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        MsgPackCodec::encode(self)
    }

    /// Decode from wire bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        MsgPackCodec::decode(data)
    }
}

/// A method's own error, produced by the callee rather than the
/// invocation framework.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct CallError {
    #[serde(rename = "Message")]
    pub message: String,
}

impl CallError {
    /// Wrap a message into a call error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Non-error return values of a call.
///
/// A method with exactly one non-error return encodes it as a single
/// value; zero or several returns travel as a positional tuple. Both
/// shapes are self-describing on the wire (bin versus array), so the
/// decoder distinguishes them without out-of-band hints.
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    /// Exactly one return value.
    Value(ByteBuf),
    /// Zero or several positional return values.
    Tuple(Tuple),
}

impl Values {
    /// Encode one value into the single-return shape.
    pub fn single<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Values::Value(ByteBuf::from(MsgPackCodec::encode(value)?)))
    }

    /// Number of values carried.
    pub fn len(&self) -> usize {
        match self {
            Values::Value(_) => 1,
            Values::Tuple(tuple) => tuple.len(),
        }
    }

    /// True when no values are carried.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode the value at position `i`.
    pub fn decode_at<T: DeserializeOwned>(&self, i: usize) -> Result<T> {
        match self {
            Values::Value(raw) if i == 0 => MsgPackCodec::decode(raw),
            Values::Value(_) => Err(ZbusError::IndexOutOfRange),
            Values::Tuple(tuple) => tuple.decode_at(i),
        }
    }
}

impl Default for Values {
    fn default() -> Self {
        Values::Tuple(Tuple::new())
    }
}

impl Serialize for Values {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Values::Value(raw) => serializer.serialize_bytes(raw),
            Values::Tuple(tuple) => tuple.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Values {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        struct ValuesVisitor;

        impl<'de> Visitor<'de> for ValuesVisitor {
            type Value = Values;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a binary value or an array of binary values")
            }

            fn visit_bytes<E: serde::de::Error>(
                self,
                v: &[u8],
            ) -> std::result::Result<Values, E> {
                Ok(Values::Value(ByteBuf::from(v.to_vec())))
            }

            fn visit_byte_buf<E: serde::de::Error>(
                self,
                v: Vec<u8>,
            ) -> std::result::Result<Values, E> {
                Ok(Values::Value(ByteBuf::from(v)))
            }

            fn visit_unit<E: serde::de::Error>(self) -> std::result::Result<Values, E> {
                Ok(Values::default())
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<Values, A::Error> {
                let mut elements = Vec::new();
                while let Some(element) = seq.next_element::<ByteBuf>()? {
                    elements.push(element);
                }
                Ok(Values::Tuple(Tuple(elements)))
            }
        }

        deserializer.deserialize_any(ValuesVisitor)
    }
}

/// What a method call produced: its return values plus, for methods with
/// a trailing error, the error the callee returned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Output {
    #[serde(rename = "Data")]
    pub data: Values,
    #[serde(rename = "Error")]
    pub error: Option<CallError>,
}

impl Output {
    /// Decode the non-error return at position `i`.
    pub fn decode_at<T: DeserializeOwned>(&self, i: usize) -> Result<T> {
        self.data.decode_at(i)
    }

    /// The callee's trailing error, if it returned one. Generated stubs
    /// map this back to the method's natural error return.
    pub fn call_error(&self) -> Option<CallError> {
        self.error.clone()
    }
}

/// Reply to a single request, correlated by id.
///
/// `error` is *protocol-level*: unknown object or method, argument
/// mismatch, or a panic inside the method. It is disjoint from the
/// callee's own error inside [`Output`]; when set, the output data is
/// empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Output")]
    pub output: Output,
    #[serde(rename = "Error")]
    pub error: Option<String>,
}

impl Response {
    /// Successful response carrying the call output.
    pub fn new(id: impl Into<String>, output: Output) -> Self {
        Self {
            id: id.into(),
            output,
            error: None,
        }
    }

    /// Protocol failure response; the output stays empty.
    pub fn with_error(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            output: Output::default(),
            error: Some(error.into()),
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        MsgPackCodec::encode(self)
    }

    /// Decode from wire bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        MsgPackCodec::decode(data)
    }

    /// Panic when the response carries a protocol-level error.
    ///
    /// Generated client stubs call this before decoding returns: a
    /// protocol failure means the call site itself is broken (wrong
    /// method, wrong argument types), not that the method failed.
    pub fn panic_on_error(&self) {
        if let Some(error) = &self.error {
            panic!("{}", error);
        }
    }
}

/// One event published by a stream method: the raw encoded bytes of a
/// single element.
#[derive(Debug, Clone)]
pub struct Event(pub Bytes);

impl Event {
    /// Decode the event into its element type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        MsgPackCodec::decode(&self.0)
    }
}

/// Worker occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Free,
    Busy,
}

/// Snapshot of one worker: its state, when the state was entered, and
/// the `[object].Method()` it is busy with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    #[serde(rename = "State")]
    pub state: WorkerState,
    #[serde(rename = "Time")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "Action")]
    pub action: String,
}

impl WorkerStatus {
    /// A free worker as of now.
    pub fn free() -> Self {
        Self {
            state: WorkerState::Free,
            start_time: Utc::now(),
            action: String::new(),
        }
    }

    /// A worker busy with the given action as of now.
    pub fn busy(action: impl Into<String>) -> Self {
        Self {
            state: WorkerState::Busy,
            start_time: Utc::now(),
            action: action.into(),
        }
    }
}

/// What the built-in status object reports: every registered object id
/// and a copy of each worker's status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Status {
    #[serde(rename = "Objects")]
    pub objects: Vec<ObjectID>,
    #[serde(rename = "Workers")]
    pub workers: Vec<WorkerStatus>,
}
