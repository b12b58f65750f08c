//! In-memory socket pair.
//!
//! Connects a server-side [`FrameSink`] / [`FrameSource`] to a
//! [`MemoryClient`] through bounded channels. Used by tests and by embedders
//! that run a device in the same process.

use async_trait::async_trait;
use synclink_protocol::{ClientFrame, ServerFrame};
use tokio::sync::mpsc;

use crate::traits::{FrameSink, FrameSource, TransportError};

/// Create a connected socket pair.
///
/// `capacity` bounds the number of server frames the client may leave unread
/// before sends start to wait, which is how a stalled socket is modelled.
#[must_use]
pub fn pair(capacity: usize) -> (MemorySink, MemorySource, MemoryClient) {
    let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
    let (in_tx, in_rx) = mpsc::channel(capacity.max(1));

    (
        MemorySink { tx: Some(out_tx) },
        MemorySource { rx: in_rx },
        MemoryClient {
            tx: Some(in_tx),
            rx: out_rx,
        },
    )
}

/// Server-side write half.
#[derive(Debug)]
pub struct MemorySink {
    tx: Option<mpsc::Sender<ServerFrame>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: &ServerFrame) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame.clone())
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

/// Server-side read half.
#[derive(Debug)]
pub struct MemorySource {
    rx: mpsc::Receiver<ClientFrame>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<ClientFrame>, TransportError> {
        Ok(self.rx.recv().await)
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }
}

/// The device end of an in-memory socket.
#[derive(Debug)]
pub struct MemoryClient {
    tx: Option<mpsc::Sender<ClientFrame>>,
    rx: mpsc::Receiver<ServerFrame>,
}

impl MemoryClient {
    /// Send a control frame to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if either side has closed the socket.
    pub async fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Wait for the next frame from the server.
    ///
    /// Returns `None` once the server has closed the socket and every frame
    /// written before that has been read.
    pub async fn recv(&mut self) -> Option<ServerFrame> {
        self.rx.recv().await
    }

    /// Take a frame if one is already waiting.
    pub fn try_recv(&mut self) -> Option<ServerFrame> {
        self.rx.try_recv().ok()
    }

    /// Close the device's side, ending the server's read half.
    pub fn close(&mut self) {
        self.tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synclink_protocol::Reply;

    #[tokio::test]
    async fn test_pair_moves_frames_both_ways() {
        let (mut sink, mut source, mut client) = pair(4);

        client.send(ClientFrame::ping()).await.unwrap();
        assert_eq!(source.recv().await.unwrap(), Some(ClientFrame::ping()));

        let frame: ServerFrame = Reply::Subscribed { topic: "t".into() }.into();
        sink.send(&frame).await.unwrap();
        assert_eq!(client.recv().await, Some(frame));
    }

    #[tokio::test]
    async fn test_close_ends_both_halves() {
        let (mut sink, mut source, mut client) = pair(4);

        sink.close().await.unwrap();
        sink.close().await.unwrap();
        assert!(client.recv().await.is_none());

        client.close();
        assert_eq!(source.recv().await.unwrap(), None);
    }
}
