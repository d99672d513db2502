//! HTTP/1.x head parsing and header hygiene shared by both endpoints.

use smol::io::{AsyncRead, AsyncReadExt};

use crate::error::ProtoError;

pub const MAX_HEAD_BYTES: usize = 32 * 1024;
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const MAX_HEADERS: usize = 64;

/// Parsed request start-line and headers. Headers keep their on-the-wire
/// order, duplicates included; values are trimmed.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    /// HTTP/1.x minor version.
    pub version: u8,
    pub headers: Vec<(String, String)>,
}

/// How the message body is delimited, per the reduced RFC 7230 rules:
/// chunked wins over Content-Length, Content-Length must be a plain decimal,
/// and a request with neither has no body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Chunked,
    Length(usize),
    Empty,
}

/// Read a message head (start-line + headers up to the blank line) from the
/// socket. Returns the head bytes and whatever was over-read past them.
pub async fn read_head<R>(reader: &mut R, cap: usize) -> Result<(Vec<u8>, Vec<u8>), ProtoError>
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut tmp = [0u8; 4096];

    let head_end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > cap {
            return Err(ProtoError::LimitExceeded {
                what: "message head",
                limit: cap,
            });
        }
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            return Err(ProtoError::MalformedHttp(
                "connection closed before end of headers".into(),
            ));
        }
        buf.extend_from_slice(&tmp[..n]);
    };

    let over_read = buf.split_off(head_end);
    Ok((buf, over_read))
}

pub fn parse_request_head(head: &[u8]) -> Result<RequestHead, ProtoError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req
        .parse(head)
        .map_err(|err| ProtoError::MalformedHttp(err.to_string()))?
    {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => {
            return Err(ProtoError::MalformedHttp("incomplete request head".into()));
        }
    }

    let method = req
        .method
        .ok_or_else(|| ProtoError::MalformedHttp("missing method".into()))?;
    let target = req
        .path
        .ok_or_else(|| ProtoError::MalformedHttp("missing request target".into()))?;
    let version = req
        .version
        .ok_or_else(|| ProtoError::MalformedHttp("missing version".into()))?;

    let headers = req
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect();

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version,
        headers,
    })
}

pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Any Transfer-Encoding naming `chunked` makes the body chunked, no matter
/// what Content-Length says.
pub fn is_chunked(headers: &[(String, String)]) -> bool {
    headers.iter().any(|(k, v)| {
        k.eq_ignore_ascii_case("transfer-encoding")
            && v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
    })
}

/// Strict Content-Length: plain decimal digits only, no sign, no spares.
pub fn content_length(headers: &[(String, String)]) -> Result<Option<usize>, ProtoError> {
    let Some(raw) = header_value(headers, "content-length") else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtoError::MalformedHttp(format!(
            "bad Content-Length: {raw:?}"
        )));
    }
    raw.parse::<usize>()
        .map(Some)
        .map_err(|_| ProtoError::MalformedHttp(format!("bad Content-Length: {raw:?}")))
}

pub fn request_body_framing(headers: &[(String, String)]) -> Result<BodyFraming, ProtoError> {
    if is_chunked(headers) {
        return Ok(BodyFraming::Chunked);
    }
    match content_length(headers)? {
        Some(0) | None => Ok(BodyFraming::Empty),
        Some(len) => Ok(BodyFraming::Length(len)),
    }
}

pub fn is_hop_by_hop_header(name: &str) -> bool {
    is_hop_by_hop(&name.to_ascii_lowercase())
}

fn is_hop_by_hop(lower_name: &str) -> bool {
    matches!(
        lower_name,
        "connection"
            | "proxy-connection"
            | "keep-alive"
            | "transfer-encoding"
            | "te"
            | "trailer"
            | "upgrade"
    )
}

/// Drop hop-by-hop headers, every token listed in `Connection`, and
/// `Proxy-Authorization`. `Connection: close, x-foo` strips `x-foo` too.
pub fn strip_hop_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    let connection_listed: Vec<String> = headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case("connection"))
        .flat_map(|(_, v)| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    headers
        .iter()
        .filter(|(k, _)| {
            let lower = k.to_ascii_lowercase();
            !is_hop_by_hop(&lower)
                && lower != "proxy-authorization"
                && !connection_listed.contains(&lower)
        })
        .cloned()
        .collect()
}

/// Add a `Host` header derived from an absolute-form target if none is
/// present.
pub fn ensure_host(headers: &mut Vec<(String, String)>, target: &str) {
    if header_value(headers, "host").is_some() {
        return;
    }
    if let Some(authority) = authority_of(target) {
        headers.push(("Host".to_string(), authority));
    }
}

fn authority_of(target: &str) -> Option<String> {
    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))?;
    let end = rest.find('/').unwrap_or(rest.len());
    let authority = &rest[..end];
    (!authority.is_empty()).then(|| authority.to_string())
}

pub fn encode_request(head: &RequestHead, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", head.method, head.target).as_bytes());
    for (name, value) in &head.headers {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

/// `HEAD` responses and `1xx`/`204`/`304` statuses carry no body regardless
/// of what the headers claim.
pub fn response_body_allowed(status: u16, head_request: bool) -> bool {
    !head_request && !(100..200).contains(&status) && status != 204 && status != 304
}

pub fn plain_error_response(status: u16, reason: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

/// Read a body of exactly `len` bytes, `seed` being bytes already pulled off
/// the socket. Over-read past the body is dropped; the local side never
/// pipelines.
pub async fn read_body_exact<R>(
    reader: &mut R,
    mut seed: Vec<u8>,
    len: usize,
    cap: usize,
) -> Result<Vec<u8>, ProtoError>
where
    R: AsyncRead + Unpin,
{
    if len > cap {
        return Err(ProtoError::LimitExceeded {
            what: "request body",
            limit: cap,
        });
    }
    let mut tmp = [0u8; 4096];
    while seed.len() < len {
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            return Err(ProtoError::MalformedHttp(
                "connection closed while reading body".into(),
            ));
        }
        seed.extend_from_slice(&tmp[..n]);
    }
    seed.truncate(len);
    Ok(seed)
}

/// Decode a chunked body to plain bytes. Trailers are read and discarded.
pub async fn read_chunked_body<R>(
    reader: &mut R,
    seed: Vec<u8>,
    cap: usize,
) -> Result<Vec<u8>, ProtoError>
where
    R: AsyncRead + Unpin,
{
    let mut src = ChunkSource {
        reader,
        buf: seed,
        pos: 0,
    };
    let mut body = Vec::new();

    loop {
        let line = src.line().await?;
        let size_str = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| ProtoError::MalformedHttp(format!("bad chunk size: {size_str:?}")))?;
        if size == 0 {
            break;
        }
        if body.len() + size > cap {
            return Err(ProtoError::LimitExceeded {
                what: "chunked body",
                limit: cap,
            });
        }
        src.exact(size, &mut body).await?;
        src.expect_crlf().await?;
    }

    // trailer section, up to the blank line; bounded like a message head
    let mut trailer_bytes = 0usize;
    loop {
        let line = src.line().await?;
        if line.is_empty() {
            break;
        }
        trailer_bytes += line.len() + 2;
        if trailer_bytes > MAX_HEAD_BYTES {
            return Err(ProtoError::LimitExceeded {
                what: "chunk trailers",
                limit: MAX_HEAD_BYTES,
            });
        }
    }

    Ok(body)
}

struct ChunkSource<'a, R> {
    reader: &'a mut R,
    buf: Vec<u8>,
    pos: usize,
}

impl<R: AsyncRead + Unpin> ChunkSource<'_, R> {
    async fn fill(&mut self) -> Result<(), ProtoError> {
        let mut tmp = [0u8; 4096];
        let n = self.reader.read(&mut tmp).await?;
        if n == 0 {
            return Err(ProtoError::MalformedHttp(
                "connection closed inside chunked body".into(),
            ));
        }
        self.buf.extend_from_slice(&tmp[..n]);
        Ok(())
    }

    async fn line(&mut self) -> Result<String, ProtoError> {
        loop {
            if let Some(i) = find_subslice(&self.buf[self.pos..], b"\r\n") {
                let line = String::from_utf8_lossy(&self.buf[self.pos..self.pos + i]).to_string();
                self.pos += i + 2;
                return Ok(line);
            }
            if self.buf.len() - self.pos > 16 * 1024 {
                return Err(ProtoError::MalformedHttp("chunk line too long".into()));
            }
            self.fill().await?;
        }
    }

    async fn exact(&mut self, n: usize, out: &mut Vec<u8>) -> Result<(), ProtoError> {
        while self.buf.len() - self.pos < n {
            self.fill().await?;
        }
        out.extend_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(())
    }

    async fn expect_crlf(&mut self) -> Result<(), ProtoError> {
        while self.buf.len() - self.pos < 2 {
            self.fill().await?;
        }
        if &self.buf[self.pos..self.pos + 2] != b"\r\n" {
            return Err(ProtoError::MalformedHttp("missing CRLF after chunk".into()));
        }
        self.pos += 2;
        Ok(())
    }
}

pub fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smol::io::Cursor;

    fn hdrs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_read_head_with_over_read() {
        smol::block_on(async {
            let wire = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n\x16\x03\x01".to_vec();
            let mut reader = Cursor::new(wire);
            let (head, over) = read_head(&mut reader, MAX_HEAD_BYTES).await.unwrap();
            assert!(head.ends_with(b"\r\n\r\n"));
            assert_eq!(over, b"\x16\x03\x01");
        });
    }

    #[test]
    fn test_read_head_cap() {
        smol::block_on(async {
            let wire = vec![b'a'; 1024];
            let mut reader = Cursor::new(wire);
            assert!(matches!(
                read_head(&mut reader, 512).await,
                Err(ProtoError::LimitExceeded { .. })
            ));
        });
    }

    #[test]
    fn test_parse_request_head() {
        let head = b"GET http://origin/x HTTP/1.1\r\nHost: origin\r\nAccept: */*\r\n\r\n";
        let parsed = parse_request_head(head).unwrap();
        assert_eq!(parsed.method, "GET");
        assert_eq!(parsed.target, "http://origin/x");
        assert_eq!(parsed.version, 1);
        assert_eq!(parsed.headers.len(), 2);
        assert_eq!(header_value(&parsed.headers, "HOST"), Some("origin"));
    }

    #[test]
    fn test_parse_garbage_head() {
        assert!(parse_request_head(b"\0\0\0\r\n\r\n").is_err());
    }

    #[test]
    fn test_content_length_strictness() {
        assert_eq!(
            content_length(&hdrs(&[("Content-Length", "42")])).unwrap(),
            Some(42)
        );
        assert!(content_length(&hdrs(&[("Content-Length", "+5")])).is_err());
        assert!(content_length(&hdrs(&[("Content-Length", "-1")])).is_err());
        assert!(content_length(&hdrs(&[("Content-Length", "4 2")])).is_err());
        assert!(content_length(&hdrs(&[("Content-Length", "")])).is_err());
        assert_eq!(content_length(&hdrs(&[("Accept", "*/*")])).unwrap(), None);
    }

    #[test]
    fn test_chunked_wins_over_content_length() {
        let headers = hdrs(&[
            ("Content-Length", "10"),
            ("Transfer-Encoding", "gzip, chunked"),
        ]);
        assert_eq!(request_body_framing(&headers).unwrap(), BodyFraming::Chunked);

        let headers = hdrs(&[("Content-Length", "10")]);
        assert_eq!(
            request_body_framing(&headers).unwrap(),
            BodyFraming::Length(10)
        );

        assert_eq!(request_body_framing(&[]).unwrap(), BodyFraming::Empty);
    }

    #[test]
    fn test_strip_hop_headers() {
        let headers = hdrs(&[
            ("Connection", "close, x-foo"),
            ("X-Foo", "1"),
            ("Keep-Alive", "timeout=5"),
            ("Proxy-Connection", "keep-alive"),
            ("Proxy-Authorization", "Basic abc"),
            ("TE", "trailers"),
            ("Content-Type", "text/plain"),
        ]);
        let kept = strip_hop_headers(&headers);
        assert_eq!(kept, hdrs(&[("Content-Type", "text/plain")]));
    }

    #[test]
    fn test_ensure_host() {
        let mut headers = hdrs(&[("Accept", "*/*")]);
        ensure_host(&mut headers, "http://origin:8080/path?q=1");
        assert_eq!(header_value(&headers, "host"), Some("origin:8080"));

        let mut headers = hdrs(&[("Host", "already")]);
        ensure_host(&mut headers, "http://origin/");
        assert_eq!(header_value(&headers, "host"), Some("already"));

        let mut headers = vec![];
        ensure_host(&mut headers, "/origin-form");
        assert!(headers.is_empty());
    }

    #[test]
    fn test_response_body_allowed() {
        assert!(response_body_allowed(200, false));
        assert!(!response_body_allowed(200, true));
        assert!(!response_body_allowed(101, false));
        assert!(!response_body_allowed(204, false));
        assert!(!response_body_allowed(304, false));
        assert!(response_body_allowed(404, false));
    }

    #[test]
    fn test_encode_request() {
        let head = RequestHead {
            method: "POST".into(),
            target: "http://origin/p".into(),
            version: 1,
            headers: hdrs(&[("Host", "origin"), ("Content-Length", "4")]),
        };
        let bytes = encode_request(&head, b"ping");
        assert_eq!(
            bytes,
            b"POST http://origin/p HTTP/1.1\r\nHost: origin\r\nContent-Length: 4\r\n\r\nping".to_vec()
        );
    }

    #[test]
    fn test_read_body_exact_with_seed() {
        smol::block_on(async {
            let mut reader = Cursor::new(b"ng-extra".to_vec());
            let body = read_body_exact(&mut reader, b"pi".to_vec(), 4, MAX_BODY_BYTES)
                .await
                .unwrap();
            assert_eq!(body, b"ping");
        });
    }

    #[test]
    fn test_read_chunked_body() {
        smol::block_on(async {
            let wire = b"4\r\nping\r\n6;ext=1\r\n-pong!\r\n0\r\nX-Trailer: t\r\n\r\n".to_vec();
            let mut reader = Cursor::new(wire);
            let body = read_chunked_body(&mut reader, Vec::new(), MAX_BODY_BYTES)
                .await
                .unwrap();
            assert_eq!(body, b"ping-pong!");
        });
    }

    #[test]
    fn test_read_chunked_body_trailer_cap() {
        smol::block_on(async {
            let mut wire = b"0\r\n".to_vec();
            let junk = format!("X-Junk: {}\r\n", "a".repeat(8 * 1024));
            for _ in 0..5 {
                wire.extend_from_slice(junk.as_bytes());
            }
            wire.extend_from_slice(b"\r\n");

            let mut reader = Cursor::new(wire);
            assert!(matches!(
                read_chunked_body(&mut reader, Vec::new(), MAX_BODY_BYTES).await,
                Err(ProtoError::LimitExceeded { .. })
            ));
        });
    }

    #[test]
    fn test_read_chunked_body_bad_size() {
        smol::block_on(async {
            let mut reader = Cursor::new(b"zz\r\n\r\n".to_vec());
            assert!(
                read_chunked_body(&mut reader, Vec::new(), MAX_BODY_BYTES)
                    .await
                    .is_err()
            );
        });
    }

    #[test]
    fn test_plain_error_response() {
        let bytes = plain_error_response(502, "Bad Gateway", "Bad Gateway: no route\n");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(text.contains("Content-Type: text/plain"));
        assert!(text.ends_with("\r\n\r\nBad Gateway: no route\n"));
    }
}
