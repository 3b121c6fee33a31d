//! Integration tests driving a full server through its channel surface,
//! the way a broker adapter does, plus live-broker round trips that run
//! only when a Redis is available (`cargo test -- --ignored`).

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use zbus::codec::MsgPackCodec;
use zbus::{
    Arguments, BaseServer, CallError, ObjectID, Request, Surrogate, Tuple, WorkerState,
};

fn calculator() -> Surrogate {
    Surrogate::builder()
        .handle_variadic("Add", |values: Vec<f64>| async move {
            (values.iter().sum::<f64>(),)
        })
        .handle("Divide", |a: f64, b: f64| async move {
            if b == 0.0 {
                return Err(CallError::new("division by zero"));
            }
            Ok((a / b,))
        })
        .handle("Tuple", || async { (10i64, "hello world".to_string(), 0.5f64) })
        .handle::<_, _, ()>("Panic", || async {
            panic!("let it crash");
        })
        .handle("Capitalize", |text: String| async move {
            (text.to_uppercase(),)
        })
        .stream("TikTok", |token: CancellationToken| {
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(10));
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = interval.tick() => {}
                    }
                    if tx.send(chrono::Utc::now()).await.is_err() {
                        return;
                    }
                }
            });
            rx
        })
        .build()
}

fn calculator_id() -> ObjectID {
    ObjectID::new("calculator", "1.0")
}

fn server() -> BaseServer {
    let server = BaseServer::new();
    server.register(calculator_id(), calculator()).unwrap();
    server
}

fn request(id: &str, method: &str, args: impl Arguments) -> Request {
    Request::new(id, id, calculator_id(), method, args).unwrap()
}

/// Variadic call: `Add(1, 2, 3, 4)` sums everything.
#[tokio::test]
async fn test_add_variadic() {
    let mut pool = server().start(CancellationToken::new(), 1).unwrap();

    pool.requests
        .send(request("r1", "Add", (1.0f64, 2.0f64, 3.0f64, 4.0f64)))
        .await
        .unwrap();

    let (_, response) = pool.responses.recv().await.unwrap();
    assert!(response.error.is_none());
    assert!(response.output.call_error().is_none());
    assert_eq!(response.output.decode_at::<f64>(0).unwrap(), 10.0);
}

/// A trailing error return travels beside the (defaulted) data slots.
#[tokio::test]
async fn test_divide_error() {
    let mut pool = server().start(CancellationToken::new(), 1).unwrap();

    pool.requests
        .send(request("r1", "Divide", (2.0f64, 0.0f64)))
        .await
        .unwrap();

    let (_, response) = pool.responses.recv().await.unwrap();
    assert!(response.error.is_none());
    assert_eq!(
        response.output.call_error().unwrap().message,
        "division by zero"
    );
    assert_eq!(response.output.decode_at::<f64>(0).unwrap(), 0.0);
}

/// Several returns decode positionally on the caller side.
#[tokio::test]
async fn test_tuple_returns() {
    let mut pool = server().start(CancellationToken::new(), 1).unwrap();

    pool.requests.send(request("r1", "Tuple", ())).await.unwrap();

    let (_, response) = pool.responses.recv().await.unwrap();
    assert!(response.error.is_none());
    assert!(response.output.call_error().is_none());
    assert_eq!(response.output.decode_at::<i64>(0).unwrap(), 10);
    assert_eq!(
        response.output.decode_at::<String>(1).unwrap(),
        "hello world"
    );
    assert_eq!(response.output.decode_at::<f64>(2).unwrap(), 0.5);
}

/// Unknown method names fail with a protocol error and empty data.
#[tokio::test]
async fn test_unknown_method() {
    let mut pool = server().start(CancellationToken::new(), 1).unwrap();

    pool.requests.send(request("r1", "Nope", ())).await.unwrap();

    let (_, response) = pool.responses.recv().await.unwrap();
    assert_eq!(response.error.as_deref(), Some("not a function"));
    assert!(response.output.data.is_empty());
}

/// A panicking method neither kills the worker nor leaks the panic.
#[tokio::test]
async fn test_panic_then_recover() {
    let server = server();
    let mut pool = server.start(CancellationToken::new(), 1).unwrap();

    pool.requests.send(request("r1", "Panic", ())).await.unwrap();
    let (_, response) = pool.responses.recv().await.unwrap();
    assert!(response.error.unwrap().contains("paniced"));

    pool.requests
        .send(request("r2", "Capitalize", ("x",)))
        .await
        .unwrap();
    let (_, response) = pool.responses.recv().await.unwrap();
    assert_eq!(response.id, "r2");
    assert_eq!(response.output.decode_at::<String>(0).unwrap(), "X");

    assert!(server
        .status()
        .workers
        .iter()
        .all(|worker| worker.state == WorkerState::Free));
}

/// Responses are correlated by request id, not by completion order.
#[tokio::test]
async fn test_reply_correlation() {
    let mut pool = server().start(CancellationToken::new(), 2).unwrap();

    pool.requests
        .send(request("first", "Capitalize", ("a",)))
        .await
        .unwrap();
    pool.requests
        .send(request("second", "Capitalize", ("b",)))
        .await
        .unwrap();

    for _ in 0..2 {
        let (sent, response) = pool.responses.recv().await.unwrap();
        assert_eq!(response.id, sent.id);
    }
}

/// Requests survive an encode/decode cycle before dispatch, the way
/// they arrive from the broker.
#[tokio::test]
async fn test_dispatch_after_wire_round_trip() {
    let mut pool = server().start(CancellationToken::new(), 1).unwrap();

    let original = request("r1", "Add", (1.5f64, 2.5f64));
    let decoded = Request::decode(&original.encode().unwrap()).unwrap();
    assert_eq!(decoded, original);

    pool.requests.send(decoded).await.unwrap();
    let (_, response) = pool.responses.recv().await.unwrap();
    assert_eq!(response.output.decode_at::<f64>(0).unwrap(), 4.0);
}

/// Stream methods publish under `object.method` until cancelled, then
/// the sequence closes.
#[tokio::test]
async fn test_stream_emits_then_closes() {
    let server = server();
    let token = CancellationToken::new();
    let mut events = server.start_streams(token.clone());

    let mut stamps: Vec<chrono::DateTime<chrono::Utc>> = Vec::new();
    while stamps.len() < 4 {
        let (key, data) = events.recv().await.unwrap();
        assert_eq!(key, "calculator@1.0.TikTok");
        stamps.push(MsgPackCodec::decode(&data).unwrap());
    }

    for pair in stamps.windows(2) {
        assert!(pair[0] <= pair[1]);
    }

    token.cancel();
    while events.recv().await.is_some() {}
}

/// The NoOP sentinel probes worker availability without being
/// dispatched: status stays free and no response is produced.
#[tokio::test]
async fn test_no_op_probe() {
    let server = server();
    let mut pool = server.start(CancellationToken::new(), 1).unwrap();

    pool.requests.send(Request::no_op()).await.unwrap();

    pool.requests
        .send(request("r1", "Capitalize", ("ok",)))
        .await
        .unwrap();
    let (_, response) = pool.responses.recv().await.unwrap();
    assert_eq!(response.id, "r1");
    assert_eq!(response.output.decode_at::<String>(0).unwrap(), "OK");
}

mod live {
    //! Round trips against a real broker on localhost:6379.

    use super::*;
    use zbus::{RedisClient, RedisServer};

    const ADDRESS: &str = "tcp://localhost:6379";

    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "needs a running redis"]
    async fn test_request_round_trip() {
        let server = RedisServer::new("itest", ADDRESS, 2).await.unwrap();
        server.register(calculator_id(), calculator()).unwrap();

        let token = CancellationToken::new();
        let run_token = token.clone();
        let handle = tokio::spawn(async move { server.run(run_token).await });

        let client = RedisClient::new(ADDRESS).unwrap();
        let response = client
            .request("itest", calculator_id(), "Add", (1.0f64, 2.0f64, 3.0f64, 4.0f64))
            .await
            .unwrap();
        assert_eq!(response.output.decode_at::<f64>(0).unwrap(), 10.0);

        let err = client
            .request("itest", calculator_id(), "Nope", ())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "not a function");

        let status = client
            .status(&CancellationToken::new(), "itest")
            .await
            .unwrap();
        assert_eq!(status.objects, vec![calculator_id()]);
        assert_eq!(status.workers.len(), 2);

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "needs a running redis"]
    async fn test_stream_subscription() {
        let server = RedisServer::new("itest-stream", ADDRESS, 1).await.unwrap();
        server.register(calculator_id(), calculator()).unwrap();

        let token = CancellationToken::new();
        let run_token = token.clone();
        let handle = tokio::spawn(async move { server.run(run_token).await });

        let client = RedisClient::new(ADDRESS).unwrap();
        let stream_token = CancellationToken::new();
        let mut events = client
            .stream(stream_token.clone(), "itest-stream", calculator_id(), "TikTok")
            .await
            .unwrap();

        let mut seen = 0;
        while seen < 4 {
            let event = events.recv().await.unwrap();
            let _: chrono::DateTime<chrono::Utc> = event.decode().unwrap();
            seen += 1;
        }

        stream_token.cancel();
        while events.recv().await.is_some() {}

        token.cancel();
        handle.await.unwrap().unwrap();
    }
}

/// Arguments assembled by hand (the way generated stubs do for variadic
/// tails) behave like tuple arguments.
#[tokio::test]
async fn test_hand_assembled_arguments() {
    let mut pool = server().start(CancellationToken::new(), 1).unwrap();

    let mut args = Tuple::new();
    for value in [2.0f64, 4.0, 6.0] {
        args.push(&value).unwrap();
    }

    pool.requests.send(request("r1", "Add", args)).await.unwrap();
    let (_, response) = pool.responses.recv().await.unwrap();
    assert_eq!(response.output.decode_at::<f64>(0).unwrap(), 12.0);
}
