//! Typed decode-invoke-encode thunks.
//!
//! Dynamic method dispatch collapses into a table of these thunks, built
//! at registration time: each one validates arity, decodes every wire
//! input against its declared parameter type, invokes the registered
//! closure and encodes the returns back to wire form. Validation
//! failures are protocol-level and carry the exact wire messages.

use std::any::type_name;
use std::fmt::Display;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, ZbusError};
use crate::protocol::{CallError, Output, Tuple, Values};

/// Boxed future for type-erased dispatch.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Type-erased entry in a method table.
pub(crate) trait MethodHandler: Send + Sync {
    /// Validate and decode `inputs`, invoke, encode. An `Err` is a
    /// protocol-level failure; the callee's own error rides inside the
    /// output.
    fn call(&self, inputs: Tuple) -> BoxFuture<Result<Output>>;
}

/// Async method implementations.
///
/// Implemented for `Fn(A0, …) -> impl Future` closures of up to five
/// parameters; the parameter types ride along as the `Args` tuple.
pub trait Method<Args, R>: Send + Sync + 'static {
    /// Invoke with already decoded arguments.
    fn invoke(&self, args: Args) -> BoxFuture<R>;
}

macro_rules! impl_method {
    ($($ty:ident),*) => {
        impl<F, Fut, R, $($ty),*> Method<($($ty,)*), R> for F
        where
            F: Fn($($ty),*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = R> + Send + 'static,
        {
            #[allow(non_snake_case)]
            fn invoke(&self, args: ($($ty,)*)) -> BoxFuture<R> {
                let ($($ty,)*) = args;
                Box::pin((self)($($ty),*))
            }
        }
    };
}

impl_method!();
impl_method!(A0);
impl_method!(A0, A1);
impl_method!(A0, A1, A2);
impl_method!(A0, A1, A2, A3);
impl_method!(A0, A1, A2, A3, A4);

fn decode_arg<T: DeserializeOwned>(inputs: &Tuple, index: usize) -> Result<T> {
    inputs.decode_at(index).map_err(|_| ZbusError::ArgumentType {
        index,
        expected: type_name::<T>(),
    })
}

/// Decoding of wire inputs into a typed parameter tuple.
///
/// The input count must match the parameter count exactly.
pub trait FromInputs: Sized {
    /// Decode all inputs positionally.
    fn from_inputs(inputs: &Tuple) -> Result<Self>;
}

macro_rules! impl_from_inputs {
    ($count:expr; $($ty:ident : $idx:tt),*) => {
        impl<$($ty: DeserializeOwned),*> FromInputs for ($($ty,)*) {
            fn from_inputs(inputs: &Tuple) -> Result<Self> {
                if inputs.len() != $count {
                    return Err(ZbusError::ArgumentCount {
                        expected: $count,
                        got: inputs.len(),
                    });
                }
                Ok(($(decode_arg::<$ty>(inputs, $idx)?,)*))
            }
        }
    };
}

impl_from_inputs!(0;);
impl_from_inputs!(1; A0: 0);
impl_from_inputs!(2; A0: 0, A1: 1);
impl_from_inputs!(3; A0: 0, A1: 1, A2: 2);
impl_from_inputs!(4; A0: 0, A1: 1, A2: 2, A3: 3);
impl_from_inputs!(5; A0: 0, A1: 1, A2: 2, A3: 3, A4: 4);

/// Like [`FromInputs`] for methods with a variadic tail: the closure's
/// last parameter is a `Vec` collecting every input past the fixed ones.
///
/// At least as many inputs as fixed parameters must be present; each
/// remaining input decodes against the tail element type.
pub trait FromVariadicInputs: Sized {
    /// Decode the fixed inputs positionally and the rest into the tail.
    fn from_inputs(inputs: &Tuple) -> Result<Self>;
}

macro_rules! impl_from_variadic_inputs {
    ($count:expr; $($ty:ident : $idx:tt),*) => {
        impl<$($ty: DeserializeOwned,)* V: DeserializeOwned> FromVariadicInputs
            for ($($ty,)* Vec<V>,)
        {
            fn from_inputs(inputs: &Tuple) -> Result<Self> {
                if inputs.len() < $count {
                    return Err(ZbusError::ArgumentCount {
                        expected: $count,
                        got: inputs.len(),
                    });
                }
                let mut tail = Vec::with_capacity(inputs.len() - $count);
                for index in $count..inputs.len() {
                    tail.push(decode_arg::<V>(inputs, index)?);
                }
                Ok(($(decode_arg::<$ty>(inputs, $idx)?,)* tail,))
            }
        }
    };
}

impl<V: DeserializeOwned> FromVariadicInputs for (Vec<V>,) {
    fn from_inputs(inputs: &Tuple) -> Result<Self> {
        let mut tail = Vec::with_capacity(inputs.len());
        for index in 0..inputs.len() {
            tail.push(decode_arg::<V>(inputs, index)?);
        }
        Ok((tail,))
    }
}

impl_from_variadic_inputs!(1; A0: 0);
impl_from_variadic_inputs!(2; A0: 0, A1: 1);

/// Positional return values, one wire slot per declared return.
///
/// Exactly one return encodes as a single value, anything else as a
/// positional tuple; the two shapes stay distinguishable on the wire.
pub trait ReturnValues {
    /// Encode every return value.
    fn encode(&self) -> Result<Values>;
}

impl ReturnValues for () {
    fn encode(&self) -> Result<Values> {
        Ok(Values::Tuple(Tuple::new()))
    }
}

impl<T0: Serialize> ReturnValues for (T0,) {
    fn encode(&self) -> Result<Values> {
        Values::single(&self.0)
    }
}

macro_rules! impl_return_values {
    ($($ty:ident : $idx:tt),+) => {
        impl<$($ty: Serialize),+> ReturnValues for ($($ty,)+) {
            fn encode(&self) -> Result<Values> {
                let mut tuple = Tuple::new();
                $(tuple.push(&self.$idx)?;)+
                Ok(Values::Tuple(tuple))
            }
        }
    };
}

impl_return_values!(T0: 0, T1: 1);
impl_return_values!(T0: 0, T1: 1, T2: 2);
impl_return_values!(T0: 0, T1: 1, T2: 2, T3: 3);
impl_return_values!(T0: 0, T1: 1, T2: 2, T3: 3, T4: 4);

/// Conversion of a handler's return into a wire [`Output`].
///
/// Infallible methods return their values directly. Methods with a
/// trailing error return `Result<values, error>`: on `Err` the display
/// form travels in [`Output::error`] while the data slots keep their
/// default values, so positional decoding on the caller side still
/// works.
pub trait IntoOutput {
    /// Encode into an output record.
    fn into_output(self) -> Result<Output>;
}

macro_rules! impl_into_output {
    ($($ty:ident),*) => {
        impl<$($ty: Serialize),*> IntoOutput for ($($ty,)*) {
            fn into_output(self) -> Result<Output> {
                Ok(Output {
                    data: self.encode()?,
                    error: None,
                })
            }
        }
    };
}

impl_into_output!();
impl_into_output!(T0);
impl_into_output!(T0, T1);
impl_into_output!(T0, T1, T2);
impl_into_output!(T0, T1, T2, T3);
impl_into_output!(T0, T1, T2, T3, T4);

impl<R, E> IntoOutput for std::result::Result<R, E>
where
    R: ReturnValues + Default,
    E: Display,
{
    fn into_output(self) -> Result<Output> {
        match self {
            Ok(values) => Ok(Output {
                data: values.encode()?,
                error: None,
            }),
            Err(error) => Ok(Output {
                data: R::default().encode()?,
                error: Some(CallError::new(error.to_string())),
            }),
        }
    }
}

/// Thunk around a method with a fixed parameter list.
pub(crate) struct FixedHandler<F, Args, R> {
    method: F,
    _marker: PhantomData<fn(Args) -> R>,
}

impl<F, Args, R> FixedHandler<F, Args, R> {
    pub(crate) fn new(method: F) -> Self {
        Self {
            method,
            _marker: PhantomData,
        }
    }
}

impl<F, Args, R> MethodHandler for FixedHandler<F, Args, R>
where
    F: Method<Args, R>,
    Args: FromInputs,
    R: IntoOutput + Send + 'static,
{
    fn call(&self, inputs: Tuple) -> BoxFuture<Result<Output>> {
        let args = match Args::from_inputs(&inputs) {
            Ok(args) => args,
            Err(err) => return Box::pin(async move { Err(err) }),
        };

        let fut = self.method.invoke(args);
        Box::pin(async move { fut.await.into_output() })
    }
}

/// Thunk around a method with a variadic tail.
pub(crate) struct VariadicHandler<F, Args, R> {
    method: F,
    _marker: PhantomData<fn(Args) -> R>,
}

impl<F, Args, R> VariadicHandler<F, Args, R> {
    pub(crate) fn new(method: F) -> Self {
        Self {
            method,
            _marker: PhantomData,
        }
    }
}

impl<F, Args, R> MethodHandler for VariadicHandler<F, Args, R>
where
    F: Method<Args, R>,
    Args: FromVariadicInputs,
    R: IntoOutput + Send + 'static,
{
    fn call(&self, inputs: Tuple) -> BoxFuture<Result<Output>> {
        let args = match Args::from_inputs(&inputs) {
            Ok(args) => args,
            Err(err) => return Box::pin(async move { Err(err) }),
        };

        let fut = self.method.invoke(args);
        Box::pin(async move { fut.await.into_output() })
    }
}
