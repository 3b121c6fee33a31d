//! Demo client exercising the calculator stub and the utils event
//! stream against a running `calc-server`:
//!
//! ```sh
//! cargo run --example calc-client
//! ```

mod stubs;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use stubs::CalculatorStub;
use zbus::{ObjectID, RedisClient};

#[tokio::main]
async fn main() -> zbus::Result<()> {
    let client = RedisClient::new("tcp://localhost:6379")?;
    let token = CancellationToken::new();

    let calculator = CalculatorStub::new(client.clone());

    println!("Add(1, 2, 3, 4) = {}", calculator.add(&token, &[1.0, 2.0, 3.0, 4.0]).await);
    println!("Avg([1, 2, 3]) = {}", calculator.avg(&token, vec![1.0, 2.0, 3.0]).await);
    println!("Pow(2, 10) = {}", calculator.pow(&token, 2.0, 10.0).await);

    let (quotient, error) = calculator.divide(&token, 2.0, 0.0).await;
    match error {
        Some(error) => println!("Divide(2, 0) failed: {}", error),
        None => println!("Divide(2, 0) = {}", quotient),
    }

    let status = client.status(&token, "server").await?;
    println!(
        "module 'server': {} objects, {} workers",
        status.objects.len(),
        status.workers.len()
    );

    // watch the clock stream for a few seconds
    let stream_token = CancellationToken::new();
    let mut events = client
        .stream(
            stream_token.clone(),
            "server",
            ObjectID::new("utils", "1.0"),
            "TikTok",
        )
        .await?;

    let stop = stream_token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        stop.cancel();
    });

    while let Some(event) = events.recv().await {
        let stamp: chrono::DateTime<chrono::Utc> = event.decode()?;
        println!("tick {}", stamp);
    }

    Ok(())
}
