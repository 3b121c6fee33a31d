//! Demo service hosting a calculator and a utils object on the module
//! `server`. Run against a local broker:
//!
//! ```sh
//! cargo run --example calc-server
//! ```

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use zbus::{CallError, ObjectID, RedisServer, Surrogate};

fn calculator() -> Surrogate {
    Surrogate::builder()
        .handle_variadic("Add", |values: Vec<f64>| async move {
            (values.iter().sum::<f64>(),)
        })
        .handle("Avg", |values: Vec<f64>| async move {
            if values.is_empty() {
                return (0.0,);
            }
            (values.iter().sum::<f64>() / values.len() as f64,)
        })
        .handle("Divide", |a: f64, b: f64| async move {
            if b == 0.0 {
                return Err(CallError::new("division by zero"));
            }
            Ok((a / b,))
        })
        .handle("Pow", |a: f64, b: f64| async move { (a.powf(b),) })
        .build()
}

fn utils() -> Surrogate {
    Surrogate::builder()
        .handle("Capitalize", |text: String| async move {
            (text.to_uppercase(),)
        })
        .stream("TikTok", |token: CancellationToken| {
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(1));
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

#[tokio::main]
async fn main() -> zbus::Result<()> {
    let server = RedisServer::new("server", "tcp://localhost:6379", 3).await?;

    server.register(ObjectID::new("calculator", "1.0"), calculator())?;
    server.register(ObjectID::new("utils", "1.0"), utils())?;

    println!("serving module 'server' with 3 workers");
    server.run(CancellationToken::new()).await
}
