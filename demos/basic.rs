use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use webhook_coalescer::{
    Color, Dispatcher, DispatcherConfig, EventKind, InMemoryRegistry, NotificationUnit, SourceId,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let registry = Arc::new(InMemoryRegistry::new());
    let source = SourceId::from(1_234_567_890u64);
    registry
        .register(source.clone(), "https://example.com/api/webhooks/1/token")
        .await;
    registry
        .set_events_from_str(&source, "member_join, member_ban, message_delete")
        .await?;

    let mut dispatcher = Dispatcher::new(DispatcherConfig::default(), registry)?;
    dispatcher.start();

    let unit = NotificationUnit::new("Member joined", Color::Green)
        .with_field("User", "ferris#0001")
        .with_field("Account age", "3 years");
    let outcome = dispatcher.dispatch(&source, EventKind::MemberJoin, unit).await;
    tracing::info!(?outcome, "dispatched");

    dispatcher.shutdown().await;
    Ok(())
}
