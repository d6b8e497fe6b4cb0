//! Echo service - register one web function and serve it.
//!
//! Connects to a local directory on `127.0.0.1:8861`:
//!
//! ```text
//! RUST_LOG=debug cargo run --example echo
//! ```
//!
//! Once registered, the directory can call `test_hello("world")` and gets
//! back `{"echo": "hello world", "admin": <caller's admin id>}`.

use serde::Serialize;
use servicereg_client::{Context, Service};
use tracing_subscriber::EnvFilter;

/// Reply of the hello function.
#[derive(Serialize, Debug)]
struct EchoOutput {
    echo: String,
    admin: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let service = Service::builder("demo", "test", "123456")
        .web_function("hello", |(name,): (String,), ctx: Context| async move {
            Ok(EchoOutput {
                echo: format!("hello {}", name),
                admin: ctx.admin_id(),
            })
        })
        .build();

    // Only returns once registration fails for good.
    service.connect_to_local_dev("127.0.0.1", 8861).await?;

    Ok(())
}
