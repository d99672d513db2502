//! Per-link stream dispatcher: reconstructs requests from frames, performs
//! them against origins, and streams the results back.

use std::net::{Shutdown, SocketAddr};

use anyhow::Context;
use seaproxy_proto::frame::{self, Frame, FrameKind, StreamKind};
use seaproxy_proto::http::{self, RequestHead};
use seaproxy_proto::link::FrameWriter;
use seaproxy_proto::ProtoError;
use smol::{
    channel, future,
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::init::shutdown::GracefulShutdown;

/// Bound on the ship->origin byte queue of a tunnel. A full queue stalls the
/// link reader, which is exactly the backpressure we want.
const ORIGIN_QUEUE: usize = 64;

/// Cap on one accumulated REQUEST (head + body) before it is refused.
const MAX_REQUEST_BYTES: usize = http::MAX_HEAD_BYTES + http::MAX_BODY_BYTES;

/// The one stream the link may have open. Dropping a variant drops its task
/// handles, which cancels the tasks and closes any origin socket.
enum ActiveStream {
    /// OPEN seen; accumulating the serialised request until EOF_C2S.
    RequestGather { id: u32, raw: Vec<u8> },
    /// Request handed to the origin task; response frames are on their way.
    RequestRun { id: u32, _task: smol::Task<()> },
    /// OPEN seen for a tunnel; waiting for the target authority.
    TunnelOpen { id: u32 },
    /// Tunnel established (or dialling). `to_origin` feeds the origin socket;
    /// dropping it half-closes the origin write side.
    TunnelRun {
        id: u32,
        to_origin: Option<channel::Sender<Vec<u8>>>,
        _task: smol::Task<()>,
    },
}

impl ActiveStream {
    fn id(&self) -> u32 {
        match self {
            ActiveStream::RequestGather { id, .. }
            | ActiveStream::RequestRun { id, .. }
            | ActiveStream::TunnelOpen { id }
            | ActiveStream::TunnelRun { id, .. } => *id,
        }
    }
}

enum LinkEvent {
    Frame(Result<Option<Frame>, ProtoError>),
    Shutdown,
}

/// Drive one link until it closes, misbehaves, or shutdown is requested.
/// The reader loop is the only owner of the active-stream slot; spawned
/// stream tasks emit frames through the shared writer.
pub async fn serve_link(link: TcpStream, peer: SocketAddr, shutdown: &GracefulShutdown) {
    log::info!("link accepted from {peer}");

    let writer = FrameWriter::new(link.clone());
    let mut reader = link.clone();
    let mut active: Option<ActiveStream> = None;
    let mut draining = false;

    loop {
        let event = future::or(
            async { LinkEvent::Frame(frame::read_frame(&mut reader).await) },
            async {
                shutdown.wait_shutting_down().await;
                LinkEvent::Shutdown
            },
        )
        .await;

        match event {
            LinkEvent::Frame(Ok(Some(frame))) => {
                if let Err(err) = handle_frame(&writer, &mut active, frame).await {
                    log::warn!("link {peer} protocol error: {err}");
                    break;
                }
            }
            LinkEvent::Frame(Ok(None)) => {
                log::info!("ship closed the link ({peer})");
                break;
            }
            LinkEvent::Frame(Err(err)) => {
                log::warn!("link {peer} read error: {err}");
                break;
            }
            LinkEvent::Shutdown => {
                draining = true;
                break;
            }
        }
    }

    if draining {
        // let an in-flight request finish its response; a tunnel has no
        // bounded end and goes down with the link like any link loss
        if let Some(ActiveStream::RequestRun { id, _task }) = active.take() {
            log::info!("link {peer}: letting stream {id} finish before closing");
            _task.await;
        }
    }

    // dropping the active stream cancels its tasks and closes origin sockets
    drop(active);
    let _ = link.shutdown(Shutdown::Both);
}

async fn handle_frame(
    writer: &FrameWriter<TcpStream>,
    active: &mut Option<ActiveStream>,
    frame: Frame,
) -> Result<(), ProtoError> {
    if frame.kind == FrameKind::Open {
        let kind = match frame.payload.as_slice() {
            [tag] => StreamKind::try_from(*tag)?,
            _ => {
                return Err(ProtoError::Violation(
                    "OPEN payload must be a single stream-kind byte",
                ));
            }
        };
        if let Some(prev) = active.take() {
            log::debug!("stream {} superseded by {}", prev.id(), frame.stream_id);
        }
        *active = Some(match kind {
            StreamKind::Request => ActiveStream::RequestGather {
                id: frame.stream_id,
                raw: Vec::new(),
            },
            StreamKind::Tunnel => ActiveStream::TunnelOpen {
                id: frame.stream_id,
            },
        });
        return Ok(());
    }

    let Some(stream) = active.take() else {
        log::debug!("{:?} frame with no active stream dropped", frame.kind);
        return Ok(());
    };
    if stream.id() != frame.stream_id {
        log::debug!("dropping frame for retired stream {}", frame.stream_id);
        *active = Some(stream);
        return Ok(());
    }

    *active = match (stream, frame.kind) {
        (stream, FrameKind::Close) => {
            log::debug!("stream {} closed by the ship", stream.id());
            None
        }
        (stream, FrameKind::Error) => {
            let (status, reason) = frame::parse_error_payload(&frame.payload);
            log::debug!("stream {} errored by the ship: {status} {reason}", stream.id());
            None
        }
        (ActiveStream::RequestGather { id, mut raw }, FrameKind::DataC2s) => {
            raw.extend_from_slice(&frame.payload);
            if raw.len() > MAX_REQUEST_BYTES {
                log::warn!("stream {id}: request exceeds {MAX_REQUEST_BYTES} bytes");
                let _ = writer
                    .send(&Frame::error(id, 502, "request too large"))
                    .await;
                None
            } else {
                Some(ActiveStream::RequestGather { id, raw })
            }
        }
        (ActiveStream::RequestGather { id, raw }, FrameKind::EofC2s) => {
            let task = smol::spawn(perform_request(writer.clone(), id, raw));
            Some(ActiveStream::RequestRun { id, _task: task })
        }
        (ActiveStream::TunnelOpen { id }, FrameKind::DataC2s) => {
            let authority = String::from_utf8_lossy(&frame.payload).to_string();
            let (tx, rx) = channel::bounded(ORIGIN_QUEUE);
            let task = smol::spawn(run_tunnel(writer.clone(), id, authority, rx));
            Some(ActiveStream::TunnelRun {
                id,
                to_origin: Some(tx),
                _task: task,
            })
        }
        (ActiveStream::TunnelOpen { id }, FrameKind::EofC2s) => {
            log::debug!("stream {id}: EOF before a tunnel target; dropping stream");
            None
        }
        (
            ActiveStream::TunnelRun {
                id,
                to_origin,
                _task,
            },
            FrameKind::DataC2s,
        ) => {
            if let Some(tx) = &to_origin {
                // a full queue stalls this reader: backpressure toward the ship
                let _ = tx.send(frame.payload).await;
            }
            Some(ActiveStream::TunnelRun {
                id,
                to_origin,
                _task,
            })
        }
        (ActiveStream::TunnelRun { id, _task, .. }, FrameKind::EofC2s) => {
            // ship half-closed; dropping the sender half-closes the origin
            Some(ActiveStream::TunnelRun {
                id,
                to_origin: None,
                _task,
            })
        }
        (stream, kind) => {
            log::debug!("stream {}: unexpected {kind:?} frame dropped", stream.id());
            Some(stream)
        }
    };
    Ok(())
}

/// Perform an accumulated REQUEST against its origin and relay the response.
async fn perform_request(writer: FrameWriter<TcpStream>, id: u32, raw: Vec<u8>) {
    match origin_round_trip(id, raw).await {
        Ok(response) => {
            let sent = async {
                writer
                    .send_chunked(id, FrameKind::DataS2c, &response)
                    .await?;
                writer.send(&Frame::bare(id, FrameKind::EofS2c)).await
            }
            .await;
            if let Err(err) = sent {
                log::warn!("stream {id}: response relay failed: {err}");
            }
        }
        Err(err) => {
            log::warn!("stream {id}: origin request failed: {err:#}");
            let _ = writer
                .send(&Frame::error(id, 502, &format!("{err:#}")))
                .await;
        }
    }
}

async fn origin_round_trip(id: u32, raw: Vec<u8>) -> anyhow::Result<Vec<u8>> {
    let head_end = http::find_subslice(&raw, b"\r\n\r\n").context("request head incomplete")? + 4;
    let head = http::parse_request_head(&raw[..head_end])?;
    let body = raw[head_end..].to_vec();

    let url = build_target_url(&head.target, &head.headers)?;
    let head_request = head.method.eq_ignore_ascii_case("HEAD");
    log::info!("stream {id}: {} {url}", head.method);

    let response = smol::unblock(move || run_origin_request(head, body, &url)).await?;
    Ok(build_response_bytes(&response, head_request))
}

struct OriginResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

/// Blocking origin round trip; runs on the blocking pool via `smol::unblock`
/// so it never stalls the executor.
fn run_origin_request(
    head: RequestHead,
    body: Vec<u8>,
    url: &str,
) -> anyhow::Result<OriginResponse> {
    let mut builder = ureq::http::Request::builder()
        .method(head.method.as_str())
        .uri(url);

    for (name, value) in &head.headers {
        if should_skip_request_header(name) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder = builder.header("accept-encoding", "identity");
    builder = builder.header("connection", "close");
    builder = builder.header("content-length", body.len().to_string());

    let request = builder.body(body)?;
    let agent: ureq::Agent = ureq::config::Config::builder()
        .proxy(None)
        .max_redirects(0)
        .http_status_as_error(false)
        .build()
        .into();
    let response = agent.run(request)?;

    let status = response.status().as_u16();
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )
        })
        .collect();
    let mut body = response.into_body();
    let body = body.read_to_vec()?;

    Ok(OriginResponse {
        status,
        headers,
        body,
    })
}

/// Rebuild the origin response as plain HTTP/1.1 bytes: the body is already
/// dechunked and decoded, so it goes back length-delimited.
fn build_response_bytes(response: &OriginResponse, head_request: bool) -> Vec<u8> {
    let status = ureq::http::StatusCode::from_u16(response.status)
        .unwrap_or(ureq::http::StatusCode::BAD_GATEWAY);
    let reason = status.canonical_reason().unwrap_or("");

    let mut out: Vec<u8> = Vec::with_capacity(1024 + response.body.len());
    out.extend_from_slice(format!("HTTP/1.1 {} {reason}\r\n", status.as_u16()).as_bytes());

    for (name, value) in &response.headers {
        if should_skip_response_header(name) {
            continue;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }

    let with_body = http::response_body_allowed(response.status, head_request);
    if with_body {
        out.extend_from_slice(format!("Content-Length: {}\r\n", response.body.len()).as_bytes());
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    if with_body {
        out.extend_from_slice(&response.body);
    }
    out
}

/// Resolve the request target into an origin URL: absolute-form is used as
/// is, origin-form is completed from the Host header.
fn build_target_url(target: &str, headers: &[(String, String)]) -> anyhow::Result<String> {
    if target.starts_with("http://") || target.starts_with("https://") {
        return Ok(target.to_string());
    }

    let host = http::header_value(headers, "host").context("missing Host header")?;
    let path = if target.starts_with('/') || target == "*" {
        target.to_string()
    } else {
        format!("/{target}")
    };
    Ok(format!("http://{host}{path}"))
}

/// Headers the origin request must not inherit: hop-by-hop plus the ones the
/// origin client derives itself (Host from the URI, Content-Length from the
/// body, Accept-Encoding forced to identity).
fn should_skip_request_header(name: &str) -> bool {
    http::is_hop_by_hop_header(name)
        || name.eq_ignore_ascii_case("accept-encoding")
        || name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("host")
}

/// Headers that no longer describe the rebuilt response body.
fn should_skip_response_header(name: &str) -> bool {
    http::is_hop_by_hop_header(name)
        || name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("content-encoding")
}

/// Run a TUNNEL stream: dial the authority, signal readiness with an empty
/// DATA_S2C, then pump bytes between the origin socket and the link.
async fn run_tunnel(
    writer: FrameWriter<TcpStream>,
    id: u32,
    authority: String,
    from_ship: channel::Receiver<Vec<u8>>,
) {
    let origin = match TcpStream::connect(authority.as_str()).await {
        Ok(socket) => socket,
        Err(err) => {
            log::warn!("stream {id}: CONNECT {authority} failed: {err}");
            let _ = writer
                .send(&Frame::error(id, 502, &format!("connect {authority}: {err}")))
                .await;
            return;
        }
    };
    log::info!("stream {id}: CONNECT {authority} established");

    if writer
        .send(&Frame::new(id, FrameKind::DataS2c, Vec::new()))
        .await
        .is_err()
    {
        return;
    }

    let mut origin_write = origin.clone();
    let origin_for_shutdown = origin.clone();
    let to_origin = smol::spawn(async move {
        while let Ok(data) = from_ship.recv().await {
            if data.is_empty() {
                continue;
            }
            if origin_write.write_all(&data).await.is_err() {
                break;
            }
        }
        // the ship half-closed (or the stream died): no more bytes this way
        let _ = origin_for_shutdown.shutdown(Shutdown::Write);
    });

    let mut origin_read = origin.clone();
    let mut buf = vec![0u8; frame::MAX_PAYLOAD];
    loop {
        match origin_read.read(&mut buf).await {
            Ok(0) => {
                let _ = writer.send(&Frame::bare(id, FrameKind::EofS2c)).await;
                break;
            }
            Ok(n) => {
                if writer
                    .send(&Frame::new(id, FrameKind::DataS2c, buf[..n].to_vec()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(err) => {
                log::debug!("stream {id}: origin read error: {err}");
                let _ = writer
                    .send(&Frame::error(id, 502, &format!("origin read: {err}")))
                    .await;
                break;
            }
        }
    }

    // keep draining ship->origin until the ship half-closes or the stream is
    // dropped (which cancels this task and the pump with it)
    to_origin.await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_target_url_absolute() {
        let headers = vec![("Host".to_string(), "example.com".to_string())];
        let url = build_target_url("http://example.com/a", &headers).unwrap();
        assert_eq!(url, "http://example.com/a");
    }

    #[test]
    fn test_build_target_url_origin_form() {
        let headers = vec![("Host".to_string(), "example.com:8080".to_string())];
        let url = build_target_url("/hello", &headers).unwrap();
        assert_eq!(url, "http://example.com:8080/hello");

        assert!(build_target_url("/hello", &[]).is_err());
    }

    #[test]
    fn test_skip_request_headers() {
        assert!(should_skip_request_header("Proxy-Connection"));
        assert!(should_skip_request_header("HOST"));
        assert!(should_skip_request_header("content-length"));
        assert!(!should_skip_request_header("user-agent"));
    }

    #[test]
    fn test_skip_response_headers() {
        assert!(should_skip_response_header("Transfer-Encoding"));
        assert!(should_skip_response_header("Content-Encoding"));
        assert!(!should_skip_response_header("content-type"));
    }

    #[test]
    fn test_build_response_bytes() {
        let response = OriginResponse {
            status: 200,
            headers: vec![
                ("Content-Type".to_string(), "text/plain".to_string()),
                ("Connection".to_string(), "keep-alive".to_string()),
            ],
            body: b"hello".to_vec(),
        };
        let text = String::from_utf8(build_response_bytes(&response, false)).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(!text.contains("keep-alive"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn test_build_response_bytes_no_body() {
        let response = OriginResponse {
            status: 304,
            headers: vec![("ETag".to_string(), "\"x\"".to_string())],
            body: Vec::new(),
        };
        let text = String::from_utf8(build_response_bytes(&response, false)).unwrap();
        assert!(text.starts_with("HTTP/1.1 304 Not Modified\r\n"));
        assert!(!text.contains("Content-Length"));
        assert!(text.ends_with("\r\n\r\n"));

        let response = OriginResponse {
            status: 200,
            headers: Vec::new(),
            body: b"ignored for HEAD".to_vec(),
        };
        let text = String::from_utf8(build_response_bytes(&response, true)).unwrap();
        assert!(text.ends_with("\r\n\r\n"));
    }
}
