//! TCP transport with a 4-byte little-endian length prefix per frame.

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::net::ToSocketAddrs;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tracing::debug;

use crate::pool::SharedWriter;
use crate::transport;
use crate::transport::Transport;

pub struct TcpTransport {
    reader: tokio::sync::Mutex<OwnedReadHalf>,
    writer: SharedWriter<OwnedWriteHalf>,
    max_frame_len: usize,
}

impl TcpTransport {
    pub async fn connect(addr: impl ToSocketAddrs, max_frame_len: usize) -> transport::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(stream, max_frame_len))
    }

    pub fn from_stream(stream: TcpStream, max_frame_len: usize) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {}", e);
        }
        let (reader, writer) = stream.into_split();
        Self {
            reader: tokio::sync::Mutex::new(reader),
            writer: SharedWriter::new(writer),
            max_frame_len,
        }
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        if payload.len() > self.max_frame_len {
            return Err(transport::Error::PayloadTooLarge(payload.len()));
        }
        self.writer.write_frame(payload).await?;
        Ok(())
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;

        let mut prefix = [0u8; 4];
        match reader.read_exact(&mut prefix).await {
            Ok(_) => {}
            // closed cleanly at a frame boundary
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_le_bytes(prefix) as usize;
        if len > self.max_frame_len {
            return Err(transport::Error::PayloadTooLarge(len));
        }

        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame).await?;
        Ok(Some(frame))
    }

    async fn close(&self) -> transport::Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_length_prefixed_roundtrip() -> transport::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let transport = TcpTransport::from_stream(stream, 1024);
            let frame = transport.recv().await?;
            if let Some(frame) = &frame {
                transport.send(frame).await?;
            }
            transport.close().await?;
            Ok::<_, transport::Error>(frame)
        });

        let client = TcpTransport::connect(addr, 1024).await?;
        client.send(b"hello frame").await?;
        assert_eq!(client.recv().await?, Some(b"hello frame".to_vec()));
        assert_eq!(client.recv().await?, None);

        let echoed = server.await.map_err(|e| transport::Error::Io(e.to_string()))??;
        assert_eq!(echoed, Some(b"hello frame".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() -> transport::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let client = TcpTransport::connect(addr, 4).await?;
        match client.send(b"too long").await {
            Err(transport::Error::PayloadTooLarge(8)) => Ok(()),
            other => panic!("expected PayloadTooLarge, got {:?}", other),
        }
    }
}
