//! Per-stream execution on the ship: marshal one work item onto the link,
//! relay the offshore side's answer back to the user agent, and map link or
//! socket failures to the right local outcome.

use std::net::{Shutdown, SocketAddr};

use seaproxy_proto::frame::{self, Frame, FrameKind, StreamKind};
use seaproxy_proto::http::{self, RequestHead};
use smol::{
    channel, future,
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::init::shutdown::GracefulShutdown;
use crate::link::{Link, LinkSession};
use crate::start::{Job, WorkItem};

pub(crate) enum Outcome {
    Completed,
    LinkLost,
}

pub(crate) async fn run_item(
    session: &mut LinkSession,
    item: WorkItem,
    shutdown: &GracefulShutdown,
) {
    let WorkItem { ua, peer, job } = item;

    if !session.connect_if_needed(shutdown).await {
        // shutting down before the stream could start; the socket closes on drop
        return;
    }
    let id = session.allocate_stream_id();
    let Some(link) = session.link() else {
        return;
    };

    let outcome = match job {
        Job::Request { head, body } => run_request(link, id, ua, peer, head, body).await,
        Job::Tunnel {
            authority,
            pre_body,
        } => run_tunnel(link, id, ua, peer, authority, pre_body).await,
    };

    if matches!(outcome, Outcome::LinkLost) {
        session.discard().await;
    }
}

/// Forward a plain HTTP request and write the response bytes straight back
/// to the user agent.
async fn run_request(
    link: &Link,
    id: u32,
    mut ua: TcpStream,
    peer: SocketAddr,
    head: RequestHead,
    body: Vec<u8>,
) -> Outcome {
    log::info!("peer={peer} stream={id} {} {}", head.method, head.target);

    let inbound = link.open_stream(id).await;
    let head = sanitize_request(head, body.len());
    let wire_request = http::encode_request(&head, &body);

    let sent = async {
        link.writer.send(&Frame::open(id, StreamKind::Request)).await?;
        link.writer
            .send_chunked(id, FrameKind::DataC2s, &wire_request)
            .await?;
        link.writer.send(&Frame::bare(id, FrameKind::EofC2s)).await
    }
    .await;
    if let Err(err) = sent {
        log::warn!("peer={peer} stream={id} link send failed: {err}");
        link.retire_stream().await;
        respond_bad_gateway(&mut ua, "link unavailable").await;
        return Outcome::LinkLost;
    }

    let mut responded = false;
    let outcome = loop {
        match inbound.recv().await {
            Ok(frame) => match frame.kind {
                FrameKind::DataS2c => {
                    if ua.write_all(&frame.payload).await.is_err() {
                        // user agent went away; tell the offshore side to stop
                        let _ = link.writer.send(&Frame::bare(id, FrameKind::Close)).await;
                        break Outcome::Completed;
                    }
                    responded = true;
                }
                FrameKind::EofS2c => {
                    let _ = ua.flush().await;
                    break Outcome::Completed;
                }
                FrameKind::Error => {
                    let (status, reason) = frame::parse_error_payload(&frame.payload);
                    log::debug!("peer={peer} stream={id} upstream error: {status} {reason}");
                    if !responded {
                        respond_bad_gateway(&mut ua, &reason).await;
                    }
                    break Outcome::Completed;
                }
                FrameKind::Close => break Outcome::Completed,
                other => log::debug!("peer={peer} stream={id} unexpected {other:?} frame"),
            },
            Err(_) => {
                if !responded {
                    respond_bad_gateway(&mut ua, "link lost").await;
                }
                break Outcome::LinkLost;
            }
        }
    };

    link.retire_stream().await;
    outcome
}

/// Hop-by-hop hygiene for the forwarded request. `Expect` goes too; the ship
/// has already answered any `100-continue` itself.
fn sanitize_request(mut head: RequestHead, body_len: usize) -> RequestHead {
    let mut headers = http::strip_hop_headers(&head.headers);
    headers.retain(|(name, _)| {
        !name.eq_ignore_ascii_case("expect") && !name.eq_ignore_ascii_case("content-length")
    });
    http::ensure_host(&mut headers, &head.target);
    if body_len > 0 {
        headers.push(("Content-Length".to_string(), body_len.to_string()));
    }
    head.headers = headers;
    head
}

enum UpEnd {
    Eof,
    UaGone,
    LinkLost,
}

enum DownEnd {
    PeerEof,
    Closed,
    UaGone,
    LinkLost,
}

enum Finished {
    Up(UpEnd),
    Down(DownEnd),
}

/// Run a CONNECT tunnel: open the stream, wait for the offshore side's
/// ready signal, acknowledge the user agent, then pump bytes both ways over
/// the one active stream until both directions are done.
async fn run_tunnel(
    link: &Link,
    id: u32,
    ua: TcpStream,
    peer: SocketAddr,
    authority: String,
    pre_body: Vec<u8>,
) -> Outcome {
    let inbound = link.open_stream(id).await;

    let sent = async {
        link.writer.send(&Frame::open(id, StreamKind::Tunnel)).await?;
        link.writer
            .send(&Frame::new(
                id,
                FrameKind::DataC2s,
                authority.clone().into_bytes(),
            ))
            .await
    }
    .await;
    let mut ua = ua;
    if let Err(err) = sent {
        log::warn!("peer={peer} stream={id} link send failed: {err}");
        link.retire_stream().await;
        respond_bad_gateway(&mut ua, "link unavailable").await;
        return Outcome::LinkLost;
    }

    // a zero-length DATA_S2C means the origin connection is up
    let ready = loop {
        match inbound.recv().await {
            Ok(frame) => match frame.kind {
                FrameKind::DataS2c if frame.payload.is_empty() => break Ok(()),
                FrameKind::Error => {
                    let (status, reason) = frame::parse_error_payload(&frame.payload);
                    log::debug!("peer={peer} CONNECT {authority} refused: {status} {reason}");
                    break Err(Some(reason));
                }
                FrameKind::Close => break Err(Some("stream closed".to_string())),
                other => log::debug!("peer={peer} stream={id} unexpected {other:?} frame"),
            },
            Err(_) => break Err(None),
        }
    };
    match ready {
        Ok(()) => {}
        Err(reason) => {
            let link_lost = reason.is_none();
            respond_bad_gateway(&mut ua, reason.as_deref().unwrap_or("link lost")).await;
            link.retire_stream().await;
            return if link_lost {
                Outcome::LinkLost
            } else {
                Outcome::Completed
            };
        }
    }

    if ua
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .is_err()
    {
        let _ = link.writer.send(&Frame::bare(id, FrameKind::Close)).await;
        link.retire_stream().await;
        return Outcome::Completed;
    }
    let _ = ua.flush().await;

    // bytes the user agent sent eagerly after its CONNECT head
    if !pre_body.is_empty()
        && link
            .writer
            .send_chunked(id, FrameKind::DataC2s, &pre_body)
            .await
            .is_err()
    {
        link.retire_stream().await;
        return Outcome::LinkLost;
    }

    log::info!("peer={peer} stream={id} CONNECT {authority}");

    let mut up = smol::spawn(pump_up(ua.clone(), link.writer.clone(), id));
    let mut down = smol::spawn(pump_down(inbound, ua.clone()));

    let first = future::race(
        async { Finished::Up((&mut up).await) },
        async { Finished::Down((&mut down).await) },
    )
    .await;

    let outcome = match first {
        // our half is done; drain the downstream until the origin finishes
        Finished::Up(UpEnd::Eof) => match down.await {
            DownEnd::LinkLost => Outcome::LinkLost,
            DownEnd::UaGone => {
                let _ = link.writer.send(&Frame::bare(id, FrameKind::Close)).await;
                Outcome::Completed
            }
            DownEnd::PeerEof | DownEnd::Closed => Outcome::Completed,
        },
        // pump_up already emitted CLOSE for the dead user agent
        Finished::Up(UpEnd::UaGone) => {
            let _ = down.cancel().await;
            Outcome::Completed
        }
        Finished::Up(UpEnd::LinkLost) => {
            let _ = down.cancel().await;
            Outcome::LinkLost
        }
        // origin is done sending; wait for the user agent's half to drain
        Finished::Down(DownEnd::PeerEof) => match up.await {
            UpEnd::LinkLost => Outcome::LinkLost,
            UpEnd::Eof | UpEnd::UaGone => Outcome::Completed,
        },
        Finished::Down(DownEnd::Closed) => {
            let _ = up.cancel().await;
            Outcome::Completed
        }
        Finished::Down(DownEnd::UaGone) => {
            let _ = link.writer.send(&Frame::bare(id, FrameKind::Close)).await;
            let _ = up.cancel().await;
            Outcome::Completed
        }
        Finished::Down(DownEnd::LinkLost) => {
            let _ = up.cancel().await;
            Outcome::LinkLost
        }
    };

    let _ = ua.shutdown(Shutdown::Both);
    link.retire_stream().await;
    outcome
}

/// user agent -> link. EOF becomes `EOF_C2S`; a read error becomes `CLOSE`.
async fn pump_up(
    mut ua: TcpStream,
    writer: seaproxy_proto::link::FrameWriter<TcpStream>,
    id: u32,
) -> UpEnd {
    let mut buf = vec![0u8; frame::MAX_PAYLOAD];
    loop {
        match ua.read(&mut buf).await {
            Ok(0) => {
                return match writer.send(&Frame::bare(id, FrameKind::EofC2s)).await {
                    Ok(()) => UpEnd::Eof,
                    Err(_) => UpEnd::LinkLost,
                };
            }
            Ok(n) => {
                if writer
                    .send(&Frame::new(id, FrameKind::DataC2s, buf[..n].to_vec()))
                    .await
                    .is_err()
                {
                    return UpEnd::LinkLost;
                }
            }
            Err(_) => {
                let _ = writer.send(&Frame::bare(id, FrameKind::Close)).await;
                return UpEnd::UaGone;
            }
        }
    }
}

/// link -> user agent. `EOF_S2C` half-closes the user-agent socket.
async fn pump_down(inbound: channel::Receiver<Frame>, mut ua: TcpStream) -> DownEnd {
    loop {
        match inbound.recv().await {
            Ok(frame) => match frame.kind {
                FrameKind::DataS2c => {
                    if ua.write_all(&frame.payload).await.is_err() {
                        return DownEnd::UaGone;
                    }
                }
                FrameKind::EofS2c => {
                    let _ = ua.flush().await;
                    let _ = ua.shutdown(Shutdown::Write);
                    return DownEnd::PeerEof;
                }
                FrameKind::Error | FrameKind::Close => return DownEnd::Closed,
                other => log::debug!("tunnel: unexpected {other:?} frame"),
            },
            Err(_) => return DownEnd::LinkLost,
        }
    }
}

async fn respond_bad_gateway(ua: &mut TcpStream, reason: &str) {
    let resp = http::plain_error_response(502, "Bad Gateway", &format!("Bad Gateway: {reason}\n"));
    let _ = ua.write_all(&resp).await;
    let _ = ua.flush().await;
}
