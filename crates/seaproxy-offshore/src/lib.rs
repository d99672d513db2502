use anyhow::{Context, Result};
use smol::net::TcpListener;

pub mod cmd;
mod dispatch;
pub mod init;
pub mod start;

pub async fn run() -> Result<()> {
    let args = init::cmd::init()?;
    let shutdown = init::shutdown::init()?;

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind link address {}", args.listen))?;
    start::serve(listener, &shutdown).await?;
    log::info!("Shutdown complete.");
    Ok(())
}
