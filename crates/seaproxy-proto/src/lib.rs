//! Wire protocol shared by the ship and offshore halves of seaproxy.
//!
//! Everything between the two processes travels over a single long-lived TCP
//! connection as length-prefixed frames:
//!
//! ```text
//! [stream_id: u32 BE][kind: u8][len: u32 BE][payload: len bytes]
//! ```
//!
//! Frame kinds:
//! - `OPEN` (1): ship->offshore, starts a stream. Payload = one byte stream
//!   kind, `0` = REQUEST, `1` = TUNNEL.
//! - `DATA_C2S` (2): ship->offshore payload bytes. For a REQUEST stream the
//!   serialised HTTP request; for a TUNNEL stream the first one carries the
//!   `host:port` target, later ones raw tunnel bytes.
//! - `DATA_S2C` (3): offshore->ship payload bytes. A zero-length `DATA_S2C`
//!   on a TUNNEL stream is the tunnel-ready signal; inside an established
//!   tunnel zero-length data frames are never sent.
//! - `EOF_C2S` (4) / `EOF_S2C` (5): half-close of one direction.
//! - `CLOSE` (6): immediate terminal close from either side.
//! - `ERROR` (7): terminal close with an ASCII `"<status> <reason>"` payload.
//!
//! At most one stream is live on the link at a time. Stream ids are assigned
//! by the ship, strictly increasing per link, and restart at 1 after a
//! reconnect; frames carrying any other id are dropped by the receiver.

pub mod error;
pub mod frame;
pub mod http;
pub mod link;

pub use error::ProtoError;
pub use frame::{Frame, FrameKind, StreamKind};
pub use link::FrameWriter;
