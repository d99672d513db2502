use anyhow::{Context, Result};
use smol::net::TcpListener;

pub mod cmd;
pub mod init;
mod link;
mod relay;
pub mod start;

pub async fn run() -> Result<()> {
    let args = init::cmd::init()?;
    let shutdown = init::shutdown::init()?;

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind local proxy address {}", args.listen))?;
    start::serve(listener, args.server, &shutdown).await?;
    log::info!("Shutdown complete.");
    Ok(())
}
