use std::net::SocketAddr;

use anyhow::Result;
use seaproxy_proto::ProtoError;
use seaproxy_proto::http::{self, BodyFraming, RequestHead};
use smol::{
    channel, future,
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
};

use crate::init::shutdown::GracefulShutdown;
use crate::link::LinkSession;
use crate::relay;

/// Pending work the single worker has not adopted yet. Producers block when
/// the queue is full.
const QUEUE_DEPTH: usize = 64;

pub struct WorkItem {
    pub ua: TcpStream,
    pub peer: SocketAddr,
    pub job: Job,
}

pub enum Job {
    /// Plain HTTP request, head parsed and body fully read.
    Request { head: RequestHead, body: Vec<u8> },
    /// CONNECT; `pre_body` is whatever the user agent sent past the head
    /// (typically the start of a TLS ClientHello).
    Tunnel {
        authority: String,
        pre_body: Vec<u8>,
    },
}

/// Accept local proxy connections and serialise them onto the link: one
/// producer task per accepted socket, one FIFO queue, one worker running one
/// stream at a time.
pub async fn serve(
    listener: TcpListener,
    server_addr: SocketAddr,
    shutdown: &GracefulShutdown,
) -> Result<()> {
    log::info!(
        "ship proxy listening on {}, link to offshore {server_addr}",
        listener.local_addr()?
    );

    let (tx, rx) = channel::bounded::<WorkItem>(QUEUE_DEPTH);
    let worker = smol::spawn(worker_loop(rx, server_addr, shutdown.clone()));

    loop {
        let Some((stream, peer)) = accept_or_shutdown(&listener, shutdown).await? else {
            break;
        };

        let tx = tx.clone();
        let shutdown = shutdown.clone();
        smol::spawn(async move {
            let _guard = shutdown.inflight_guard();
            if let Err(err) = admit_client(stream, peer, tx).await {
                log::warn!("peer={peer} error: {err}");
            }
        })
        .detach();
    }

    shutdown.wait_inflight_zero().await;
    drop(tx);
    worker.await;
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

/// Parse and validate one local request, then enqueue it. Malformed input is
/// answered with 400 and never reaches the queue.
async fn admit_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    tx: channel::Sender<WorkItem>,
) -> Result<()> {
    let job = match read_local_request(&mut stream, peer).await {
        Ok(job) => job,
        Err(err) if err.is_client_fault() => {
            log::debug!("peer={peer} bad request: {err}");
            let resp =
                http::plain_error_response(400, "Bad Request", &format!("Bad Request: {err}\n"));
            stream.write_all(&resp).await?;
            stream.flush().await?;
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    let item = WorkItem {
        ua: stream,
        peer,
        job,
    };
    if tx.send(item).await.is_err() {
        // scheduler already stopped; the socket closes on drop
        log::debug!("peer={peer} dropped: shutting down");
    }
    Ok(())
}

async fn read_local_request(stream: &mut TcpStream, peer: SocketAddr) -> Result<Job, ProtoError> {
    let (head_bytes, over_read) = http::read_head(stream, http::MAX_HEAD_BYTES).await?;
    let head = http::parse_request_head(&head_bytes)?;

    if head.method.eq_ignore_ascii_case("CONNECT") {
        return Ok(Job::Tunnel {
            authority: connect_authority(&head.target),
            pre_body: over_read,
        });
    }

    if http::header_value(&head.headers, "expect")
        .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
    {
        stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
        stream.flush().await?;
    }

    let body = match http::request_body_framing(&head.headers)? {
        BodyFraming::Chunked => {
            http::read_chunked_body(stream, over_read, http::MAX_BODY_BYTES).await?
        }
        BodyFraming::Length(len) => {
            http::read_body_exact(stream, over_read, len, http::MAX_BODY_BYTES).await?
        }
        BodyFraming::Empty => {
            if !over_read.is_empty() {
                log::debug!("peer={peer} extra bytes after headers are ignored");
            }
            Vec::new()
        }
    };

    Ok(Job::Request { head, body })
}

/// CONNECT targets are authority-form; clients normally send an explicit
/// port, and a bare host defaults to 443.
fn connect_authority(target: &str) -> String {
    let mut authority = target.to_string();
    if !authority.contains(':') {
        authority.push_str(":443");
    }
    authority
}

/// The single consumer. Runs each work item end-to-end as the next stream on
/// the link; never touches the queue while a stream is live.
async fn worker_loop(
    rx: channel::Receiver<WorkItem>,
    server_addr: SocketAddr,
    shutdown: GracefulShutdown,
) {
    let mut session = LinkSession::new(server_addr);

    loop {
        if shutdown.is_shutting_down() {
            break;
        }
        let next = future::or(async { rx.recv().await.ok() }, async {
            shutdown.wait_shutting_down().await;
            None
        })
        .await;
        let Some(item) = next else {
            break;
        };

        relay::run_item(&mut session, item, &shutdown).await;
    }

    session.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_authority_default_port() {
        assert_eq!(connect_authority("example.com"), "example.com:443");
        assert_eq!(connect_authority("example.com:8443"), "example.com:8443");
        assert_eq!(connect_authority("127.0.0.1:443"), "127.0.0.1:443");
    }
}
