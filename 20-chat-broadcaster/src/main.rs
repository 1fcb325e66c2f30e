use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use chat_broadcaster::{cli::Cli, server::Server};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Cli::parse().into_config();
    let server = Server::bind(config.clone()).await?;

    // Banners precede all log output.
    println!("chat-broadcaster listening at {}", server.local_addr()?);
    if let Some(addr) = server.tcp_addr() {
        println!("chat-broadcaster tcp listening at {}", addr?);
    }
    info!(
        chat_url = %config.chat_url,
        template = %config.template.display(),
        "serving landing page"
    );

    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("server exited with error: {err:?}");
        return Err(err);
    }

    Ok(())
}
