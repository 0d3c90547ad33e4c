//! Minimal embedder/widget wiring over the in-process messenger.
//!
//! Run with: `cargo run -p transom --example embedder`

use std::sync::Arc;

use serde_json::json;
use transom::ChannelManager;
use transom_messenger_mem::{LocalHandshake, MemWindow};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let page = MemWindow::new("page", "https://app.example");
    let widget = MemWindow::new("widget", "https://widget.example");

    let embedder = ChannelManager::new(LocalHandshake, page.clone());
    let guest = Arc::new(ChannelManager::new(LocalHandshake, widget.clone()));

    guest.register("greet", |args| async move {
        let name = args
            .first()
            .and_then(|v| v.as_str())
            .unwrap_or("stranger")
            .to_string();
        Ok(json!(format!("hello, {name}")))
    });

    // Issued before the channel exists; drained in order once it does.
    let early = embedder.request("greet", vec![json!("early bird")]);

    let guest_side = tokio::spawn({
        let guest = Arc::clone(&guest);
        let page = page.clone();
        async move { guest.connect_to_parent(page, "https://app.example").await }
    });
    embedder
        .connect_to_child(widget, "https://widget.example", vec![json!({ "api": 1 })])
        .await?;
    guest_side.await??;

    println!("queued call resolved: {}", early.await?);

    let direct = embedder
        .request("greet", vec![json!("direct caller")])
        .await?;
    println!("direct call resolved: {direct}");

    embedder.disconnect();
    Ok(())
}
