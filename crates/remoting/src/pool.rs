//! # Buffers and Shared Streams
//!
//! Supporting pieces for the frame path:
//!
//! - `BufferPool` keeps encode buffers alive between frames.
//! - `PooledBuffer` hands its buffer back to the pool when dropped.
//! - `SharedWriter` lets many tasks write whole frames to one stream.

use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

/// Buffers larger than this are dropped instead of pooled.
const MAX_RETAINED_CAPACITY: usize = 1024 * 1024;

/// A bounded free-list of byte buffers.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self { free: Mutex::new(Vec::with_capacity(capacity)), capacity })
    }

    /// Takes an empty buffer, reusing a returned one when available.
    pub fn take(&self) -> Vec<u8> {
        let reused = self.free.lock().unwrap_or_else(|e| e.into_inner()).pop();
        let mut buf = reused.unwrap_or_default();
        buf.clear();
        buf
    }

    /// Returns a buffer to the pool.
    pub fn give(&self, buf: Vec<u8>) {
        if buf.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < self.capacity {
            free.push(buf);
        }
    }

    /// Wraps a filled buffer so it returns here once the frame is sent.
    pub fn wrap(self: &Arc<Self>, buf: Vec<u8>) -> PooledBuffer {
        PooledBuffer { buf, pool: self.clone() }
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// A buffer on loan from a `BufferPool`.
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.give(std::mem::take(&mut self.buf));
    }
}

/// A reference-counted write half.
///
/// Each `write_frame` holds the lock across prefix, body and flush, so frames
/// from concurrent writers never interleave.
pub struct SharedWriter<W> {
    inner: Arc<tokio::sync::Mutex<W>>,
}

impl<W> Clone for SharedWriter<W> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<W: AsyncWrite + Unpin + Send> SharedWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { inner: Arc::new(tokio::sync::Mutex::new(writer)) }
    }

    /// Writes `[len: u32 LE][payload]` and flushes.
    pub async fn write_frame(&self, payload: &[u8]) -> std::io::Result<()> {
        let len = u32::try_from(payload.len())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame exceeds u32::MAX"))?;
        let mut writer = self.inner.lock().await;
        writer.write_all(&len.to_le_bytes()).await?;
        writer.write_all(payload).await?;
        writer.flush().await
    }

    pub async fn shutdown(&self) -> std::io::Result<()> {
        self.inner.lock().await.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pooled_buffer_returns_on_drop() {
        let pool = BufferPool::new(2);
        let mut buf = pool.take();
        buf.extend_from_slice(b"frame");
        assert_eq!(pool.available(), 0);

        let pooled = pool.wrap(buf);
        assert_eq!(&pooled[..], b"frame");
        drop(pooled);
        assert_eq!(pool.available(), 1);

        // handed out cleared
        assert!(pool.take().is_empty());
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool = BufferPool::new(1);
        pool.give(Vec::with_capacity(8));
        pool.give(Vec::with_capacity(8));
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_shared_writer_frames_do_not_interleave() -> std::io::Result<()> {
        let writer = SharedWriter::new(Vec::new());
        let a = writer.clone();
        let b = writer.clone();
        let (ra, rb) = tokio::join!(a.write_frame(b"aaaa"), b.write_frame(b"bb"));
        ra?;
        rb?;

        let bytes = writer.inner.lock().await.clone();
        assert_eq!(bytes.len(), 4 + 4 + 4 + 2);
        let first_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let first = &bytes[4..4 + first_len];
        assert!(first == b"aaaa" || first == b"bb");
        Ok(())
    }
}
