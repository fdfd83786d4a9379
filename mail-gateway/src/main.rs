//! mail-gateway: HTTP to SMTP relay

use mail_gateway::transport::{LoopbackTransport, MailTransport, SmtpTransport};
use mail_gateway::{GatewayConfig, GatewayServer};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(config: &GatewayConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("mail_gateway={0},tower_http={0}", config.log_level).into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1);
    let config = GatewayConfig::load(config_path.as_deref().map(Path::new))?;

    init_tracing(&config);
    info!("Starting mail-gateway v{}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &config_path {
        info!("Loaded configuration from {}", path);
    }

    let transport: Arc<dyn MailTransport> = if config.dry_run {
        warn!("DRY_RUN enabled: mail is accepted but never relayed");
        Arc::new(LoopbackTransport::new())
    } else {
        Arc::new(SmtpTransport::new(config.transport_timeouts()))
    };

    let server = GatewayServer::new(config, transport)?;
    server.run().await?;

    Ok(())
}
