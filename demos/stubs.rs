//! Hand-written client stub for the demo calculator, the shape a stub
//! generator emits: encode the arguments, panic on protocol errors
//! (those mean the call site itself is broken), decode positional
//! returns and surface the trailing error.

use tokio_util::sync::CancellationToken;

use zbus::{CallError, ObjectID, RedisClient, Response, Tuple};

pub struct CalculatorStub {
    client: RedisClient,
    module: String,
    object: ObjectID,
}

impl CalculatorStub {
    pub fn new(client: RedisClient) -> Self {
        Self {
            client,
            module: "server".to_string(),
            object: ObjectID::new("calculator", "1.0"),
        }
    }

    async fn call(&self, token: &CancellationToken, method: &str, args: Tuple) -> Response {
        let response = self
            .client
            .request_with_context(token, &self.module, self.object.clone(), method, args)
            .await
            .unwrap_or_else(|err| panic!("remote call failed: {}", err));
        response.panic_on_error();
        response
    }

    pub async fn add(&self, token: &CancellationToken, values: &[f64]) -> f64 {
        let mut args = Tuple::new();
        for value in values {
            args.push(value).expect("encode argument");
        }
        let result = self.call(token, "Add", args).await;
        result.output.decode_at(0).expect("decode return")
    }

    pub async fn avg(&self, token: &CancellationToken, values: Vec<f64>) -> f64 {
        let mut args = Tuple::new();
        args.push(&values).expect("encode argument");
        let result = self.call(token, "Avg", args).await;
        result.output.decode_at(0).expect("decode return")
    }

    pub async fn divide(
        &self,
        token: &CancellationToken,
        a: f64,
        b: f64,
    ) -> (f64, Option<CallError>) {
        let mut args = Tuple::new();
        args.push(&a).expect("encode argument");
        args.push(&b).expect("encode argument");
        let result = self.call(token, "Divide", args).await;
        (
            result.output.decode_at(0).expect("decode return"),
            result.output.call_error(),
        )
    }

    pub async fn pow(&self, token: &CancellationToken, a: f64, b: f64) -> f64 {
        let mut args = Tuple::new();
        args.push(&a).expect("encode argument");
        args.push(&b).expect("encode argument");
        let result = self.call(token, "Pow", args).await;
        result.output.decode_at(0).expect("decode return")
    }
}
