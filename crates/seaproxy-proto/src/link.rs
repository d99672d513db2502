use std::sync::Arc;

use mea::mutex::Mutex;
use smol::io::AsyncWrite;

use crate::error::ProtoError;
use crate::frame::{self, Frame, FrameKind};

/// Clonable handle to the link's write half. All frame emission goes through
/// the one mutex so frames from concurrent tasks land contiguously on the
/// wire.
pub struct FrameWriter<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> Clone for FrameWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    pub async fn send(&self, frame: &Frame) -> Result<(), ProtoError> {
        let mut writer = self.inner.lock().await;
        frame::write_frame(&mut *writer, frame).await
    }

    /// Send `bytes` as one or more `kind` frames, splitting at the payload
    /// cap. Zero bytes produce zero frames.
    pub async fn send_chunked(
        &self,
        stream_id: u32,
        kind: FrameKind,
        bytes: &[u8],
    ) -> Result<(), ProtoError> {
        for chunk in bytes.chunks(frame::MAX_PAYLOAD) {
            self.send(&Frame::new(stream_id, kind, chunk.to_vec()))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{MAX_PAYLOAD, read_frame};
    use smol::io::Cursor;

    #[test]
    fn test_send_chunked_splits_at_cap() {
        smol::block_on(async {
            let writer = FrameWriter::new(Cursor::new(Vec::new()));
            let bytes = vec![0xabu8; MAX_PAYLOAD + 10];
            writer
                .send_chunked(3, FrameKind::DataC2s, &bytes)
                .await
                .unwrap();
            writer.send(&Frame::bare(3, FrameKind::EofC2s)).await.unwrap();

            let wire = writer.inner.lock().await.get_ref().clone();
            let mut reader = Cursor::new(wire);
            let first = read_frame(&mut reader).await.unwrap().unwrap();
            assert_eq!(first.payload.len(), MAX_PAYLOAD);
            let second = read_frame(&mut reader).await.unwrap().unwrap();
            assert_eq!(second.payload.len(), 10);
            let third = read_frame(&mut reader).await.unwrap().unwrap();
            assert_eq!(third.kind, FrameKind::EofC2s);
            assert!(read_frame(&mut reader).await.unwrap().is_none());
        });
    }

    #[test]
    fn test_send_chunked_empty_is_silent() {
        smol::block_on(async {
            let writer = FrameWriter::new(Cursor::new(Vec::new()));
            writer
                .send_chunked(1, FrameKind::DataS2c, &[])
                .await
                .unwrap();
            assert!(writer.inner.lock().await.get_ref().is_empty());
        });
    }
}
