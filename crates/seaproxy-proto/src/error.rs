use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("link i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown frame kind 0x{0:02x}")]
    UnknownKind(u8),
    #[error("unknown stream kind 0x{0:02x}")]
    UnknownStreamKind(u8),
    #[error("frame payload of {len} bytes exceeds the {max} byte cap")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("link closed inside a frame")]
    TruncatedFrame,
    #[error("protocol violation: {0}")]
    Violation(&'static str),
    #[error("malformed http message: {0}")]
    MalformedHttp(String),
    #[error("{what} exceeds {limit} bytes")]
    LimitExceeded { what: &'static str, limit: usize },
}

impl ProtoError {
    /// True for errors caused by the peer's bytes rather than our own I/O.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            ProtoError::MalformedHttp(_) | ProtoError::LimitExceeded { .. }
        )
    }
}
