use std::net::SocketAddr;

use anyhow::Result;
use smol::{
    future,
    net::{TcpListener, TcpStream},
};

use crate::dispatch;
use crate::init::shutdown::GracefulShutdown;

/// Accept the single link from the ship. Only one link is served at a time;
/// a newly accepted connection replaces (and closes) the previous one.
pub async fn serve(listener: TcpListener, shutdown: &GracefulShutdown) -> Result<()> {
    log::info!("offshore listening on {}", listener.local_addr()?);

    let mut current: Option<smol::Task<()>> = None;
    loop {
        let Some((stream, peer)) = accept_or_shutdown(&listener, shutdown).await? else {
            break;
        };

        if let Some(prev) = current.take() {
            log::info!("new link from {peer} replaces the previous one");
            let _ = prev.cancel().await;
        }

        let shutdown = shutdown.clone();
        current = Some(smol::spawn(async move {
            let _guard = shutdown.inflight_guard();
            dispatch::serve_link(stream, peer, &shutdown).await;
        }));
    }

    // stop accepting; the link task sees the shutdown signal itself and
    // drains its active stream before closing the link
    if let Some(task) = current.take() {
        task.await;
    }
    shutdown.wait_inflight_zero().await;
    Ok(())
}

async fn accept_or_shutdown(
    listener: &TcpListener,
    shutdown: &GracefulShutdown,
) -> std::io::Result<Option<(TcpStream, SocketAddr)>> {
    let accept_fut = async { listener.accept().await.map(Some) };
    let shutdown_fut = async {
        shutdown.wait_shutting_down().await;
        Ok(None)
    };
    future::or(accept_fut, shutdown_fut).await
}
