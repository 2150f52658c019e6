use chatlink::{ChatClient, ClientEvent, Config};
use chatlink::common::banner;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Falling back to default configuration: {}", e);
        Config::default()
    });

    banner::print_banner(&banner::BannerInfo::default());
    chatlink::common::logger::init(&config);

    let gateway_url =
        std::env::var("CHATLINK_GATEWAY").unwrap_or_else(|_| "wss://gw.chat.example.com".into());
    let token = std::env::var("CHATLINK_TOKEN")
        .map_err(|_| "CHATLINK_TOKEN environment variable is required")?;

    let client = ChatClient::new(config)?;
    let mut events = client.take_events().expect("event receiver already taken");
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::Connected => info!("gateway connected"),
                ClientEvent::Disconnected { expected, reason } => {
                    info!("gateway disconnected (expected={}): {}", expected, reason);
                }
                ClientEvent::Dispatch { t, .. } => info!("dispatch event: {}", t),
                ClientEvent::GatewayClosed { code, reason } => {
                    warn!("gateway closed: code={}, reason='{}'", code, reason);
                }
            }
        }
    });

    client.connect(&gateway_url, &token).await?;
    info!("connected; press ctrl-c to disconnect");

    tokio::signal::ctrl_c().await?;
    client.shutdown().await;
    Ok(())
}
