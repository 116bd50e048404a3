//! In-process transport over tokio channels.
//!
//! Used by the test suite and by hosts that run both sides in one process.

use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::transport;
use crate::transport::Transport;

/// One end of a duplex channel pair.
///
/// Frames sent on one end appear on the other end's `recv()`, in order.
pub struct DuplexTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

/// Creates a pair of transports connected to each other.
pub fn duplex() -> (DuplexTransport, DuplexTransport) {
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();

    let a = DuplexTransport {
        tx: Mutex::new(Some(tx_a)),
        rx: tokio::sync::Mutex::new(rx_b),
    };
    let b = DuplexTransport {
        tx: Mutex::new(Some(tx_b)),
        rx: tokio::sync::Mutex::new(rx_a),
    };

    (a, b)
}

impl DuplexTransport {
    fn sender(&self) -> Option<mpsc::UnboundedSender<Vec<u8>>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait::async_trait]
impl Transport for DuplexTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        let tx = self
            .sender()
            .ok_or_else(|| transport::Error::ConnectionLost("Channel closed locally".into()))?;
        tx.send(payload.to_vec())
            .map_err(|_| transport::Error::ConnectionLost("Channel closed".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn close(&self) -> transport::Result<()> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_cross_in_order() -> transport::Result<()> {
        let (a, b) = duplex();
        a.send(b"one").await?;
        a.send(b"two").await?;
        b.send(b"back").await?;

        assert_eq!(b.recv().await?, Some(b"one".to_vec()));
        assert_eq!(b.recv().await?, Some(b"two".to_vec()));
        assert_eq!(a.recv().await?, Some(b"back".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn test_close_ends_peer_stream() -> transport::Result<()> {
        let (a, b) = duplex();
        a.send(b"last").await?;
        a.close().await?;

        assert_eq!(b.recv().await?, Some(b"last".to_vec()));
        assert_eq!(b.recv().await?, None);
        assert!(a.send(b"late").await.is_err());
        Ok(())
    }
}
