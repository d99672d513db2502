use std::net::{Shutdown, SocketAddr};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use mea::mutex::Mutex;
use seaproxy_proto::frame::{self, Frame};
use seaproxy_proto::link::FrameWriter;
use smol::{Timer, channel, future, net::TcpStream};

use crate::init::shutdown::GracefulShutdown;

const BACKOFF_START: Duration = Duration::from_millis(250);
const BACKOFF_MAX: Duration = Duration::from_secs(4);

/// Capacity of the active stream's inbound frame buffer. When it fills, the
/// link reader stops pulling frames and TCP backpressure reaches the peer.
const INBOUND_DEPTH: usize = 64;

/// The stream the link reader currently routes inbound frames to.
type ActiveSlot = Arc<Mutex<Option<(u32, channel::Sender<Frame>)>>>;

/// The worker's handle on the single upstream connection. Owns reconnection
/// and stream-id allocation; ids restart at 1 on every fresh link.
pub struct LinkSession {
    server_addr: SocketAddr,
    link: Option<Link>,
    next_stream_id: u32,
}

impl LinkSession {
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            link: None,
            next_stream_id: 1,
        }
    }

    /// Make sure a live link exists, reconnecting with exponential backoff.
    /// Returns false only when shutdown interrupts the wait.
    pub async fn connect_if_needed(&mut self, shutdown: &GracefulShutdown) -> bool {
        if self
            .link
            .as_ref()
            .is_some_and(|link| !link.dead.load(Ordering::Acquire))
        {
            return true;
        }
        if let Some(old) = self.link.take() {
            old.close().await;
        }

        let mut delay = BACKOFF_START;
        loop {
            if shutdown.is_shutting_down() {
                return false;
            }
            match TcpStream::connect(self.server_addr).await {
                Ok(socket) => {
                    log::info!("link to offshore {} established", self.server_addr);
                    self.next_stream_id = 1;
                    self.link = Some(Link::start(socket));
                    return true;
                }
                Err(err) => {
                    log::warn!(
                        "link connect {} failed: {err}; retrying in {delay:?}",
                        self.server_addr
                    );
                    let interrupted = future::or(
                        async {
                            Timer::after(delay).await;
                            false
                        },
                        async {
                            shutdown.wait_shutting_down().await;
                            true
                        },
                    )
                    .await;
                    if interrupted {
                        return false;
                    }
                    delay = (delay * 2).min(BACKOFF_MAX);
                }
            }
        }
    }

    pub fn link(&self) -> Option<&Link> {
        self.link.as_ref()
    }

    pub fn allocate_stream_id(&mut self) -> u32 {
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        id
    }

    /// Tear the current link down; the next work item reconnects.
    pub async fn discard(&mut self) {
        if let Some(link) = self.link.take() {
            link.close().await;
        }
    }

    pub async fn close(&mut self) {
        self.discard().await;
    }
}

pub struct Link {
    pub writer: FrameWriter<TcpStream>,
    socket: TcpStream,
    active: ActiveSlot,
    dead: Arc<AtomicBool>,
    reader: smol::Task<()>,
}

impl Link {
    fn start(socket: TcpStream) -> Self {
        let writer = FrameWriter::new(socket.clone());
        let active: ActiveSlot = Arc::new(Mutex::new(None));
        let dead = Arc::new(AtomicBool::new(false));
        let reader = smol::spawn(read_loop(socket.clone(), active.clone(), dead.clone()));
        Self {
            writer,
            socket,
            active,
            dead,
            reader,
        }
    }

    /// Install `id` as the active stream and hand back its inbound frames.
    /// A closed receiver later means the link died under the stream.
    pub async fn open_stream(&self, id: u32) -> channel::Receiver<Frame> {
        let (tx, rx) = channel::bounded(INBOUND_DEPTH);
        *self.active.lock().await = Some((id, tx));
        rx
    }

    /// Retire the active stream; late frames for its id get dropped by the
    /// reader from now on.
    pub async fn retire_stream(&self) {
        self.active.lock().await.take();
    }

    async fn close(self) {
        let _ = self.socket.shutdown(Shutdown::Both);
        let _ = self.reader.cancel().await;
    }
}

/// Dedicated frame reader: decodes frames off the link and routes them to
/// the active stream, dropping anything with a stale id. On link failure it
/// drops the active sender so the stream sees a closed channel.
async fn read_loop(mut socket: TcpStream, active: ActiveSlot, dead: Arc<AtomicBool>) {
    loop {
        match frame::read_frame(&mut socket).await {
            Ok(Some(frame)) => {
                let tx = {
                    let slot = active.lock().await;
                    match slot.as_ref() {
                        Some((id, tx)) if *id == frame.stream_id => Some(tx.clone()),
                        _ => None,
                    }
                };
                match tx {
                    Some(tx) => {
                        let _ = tx.send(frame).await;
                    }
                    None => log::debug!("dropping frame for retired stream {}", frame.stream_id),
                }
            }
            Ok(None) => {
                log::info!("offshore closed the link");
                break;
            }
            Err(err) => {
                log::warn!("link read error: {err}");
                break;
            }
        }
    }
    dead.store(true, Ordering::Release);
    active.lock().await.take();
}
