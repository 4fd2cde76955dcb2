//! Handles and messages that cross bundle task boundaries.
//!
//! A producer transceiver publishes inbound media on a `broadcast` channel;
//! each subscription is a forwarder task that pushes those packets into the
//! consumer bundle's command channel. Feedback flows the other way through
//! the producer bundle's command channel.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use super::error::{Error, Result};
use super::transceiver::MediaKind;

/// Capacity of the per-transceiver media fan-out channel.
pub const MEDIA_CHANNEL_CAPACITY: usize = 512;

/// Capacity of a bundle's command queue.
pub const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// Codec identity used to reconcile payload types across peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodecId {
    /// Lowercase encoding name, e.g. `vp8`.
    pub name: Arc<str>,
    pub clock_rate: u32,
}

/// What a producer publishes to its subscribers.
#[derive(Debug, Clone)]
pub enum MediaPacket {
    /// Decrypted RTP as received from the producing client.
    Rtp { codec: CodecId, data: Arc<[u8]> },
    /// A Sender Report (no report blocks) about the producing client's stream.
    SenderReport(Arc<[u8]>),
}

/// Feedback a consumer's client asked the producer's client for.
#[derive(Debug, Clone, PartialEq)]
pub enum Feedback {
    /// Sequence numbers in the producer's numbering.
    Nack(Vec<u16>),
    KeyFrame,
}

pub enum BundleCommand {
    /// Forward a producer's packet to our client on `mid`.
    SendMedia { mid: String, packet: MediaPacket },
    /// Relay consumer feedback to our client about the stream it sends on `mid`.
    FeedbackForClient { mid: String, feedback: Feedback },
    /// Attach (or detach) the stream our client receives on `mid`.
    ReplaceStream {
        mid: String,
        source: Option<MediaSource>,
    },
    /// Ask our client for a key frame on `mid`.
    RequestKeyFrame { mid: String },
    Close,
}

impl fmt::Debug for BundleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BundleCommand::SendMedia { mid, .. } => write!(f, "SendMedia({})", mid),
            BundleCommand::FeedbackForClient { mid, feedback } => {
                write!(f, "FeedbackForClient({}, {:?})", mid, feedback)
            }
            BundleCommand::ReplaceStream { mid, source } => write!(
                f,
                "ReplaceStream({}, {:?})",
                mid,
                source.as_ref().map(|s| &s.mid)
            ),
            BundleCommand::RequestKeyFrame { mid } => write!(f, "RequestKeyFrame({})", mid),
            BundleCommand::Close => write!(f, "Close"),
        }
    }
}

/// Cloneable address of a running bundle task.
#[derive(Clone)]
pub struct BundleHandle {
    id: Arc<str>,
    tx: mpsc::Sender<BundleCommand>,
}

impl fmt::Debug for BundleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BundleHandle({})", self.id)
    }
}

impl BundleHandle {
    pub fn new(id: &str, tx: mpsc::Sender<BundleCommand>) -> Self {
        Self { id: id.into(), tx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn send(&self, command: BundleCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| Error::InvalidState(format!("bundle {} is closed", self.id)))
    }

    /// Non-blocking send; the command is dropped when the queue is full.
    pub fn try_send(&self, command: BundleCommand) -> Result<()> {
        self.tx.try_send(command).map_err(|e| {
            Error::InvalidState(format!("bundle {} not accepting commands: {}", self.id, e))
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A producer transceiver's stream as seen by subscribers.
#[derive(Clone)]
pub struct MediaSource {
    pub mid: String,
    pub kind: MediaKind,
    pub media: broadcast::Sender<MediaPacket>,
    pub bundle: BundleHandle,
}

impl MediaSource {
    pub fn subscribe(&self) -> broadcast::Receiver<MediaPacket> {
        self.media.subscribe()
    }

    /// Where feedback about this stream must be sent.
    pub fn feedback_target(&self) -> FeedbackTarget {
        FeedbackTarget {
            bundle: self.bundle.clone(),
            mid: self.mid.clone(),
        }
    }
}

/// Producer-side address for relaying feedback.
#[derive(Clone, Debug)]
pub struct FeedbackTarget {
    pub bundle: BundleHandle,
    pub mid: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_send_and_close() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = BundleHandle::new("0 1", tx);
        handle
            .send(BundleCommand::RequestKeyFrame { mid: "1".into() })
            .await
            .unwrap();
        match rx.recv().await {
            Some(BundleCommand::RequestKeyFrame { mid }) => assert_eq!(mid, "1"),
            other => panic!("unexpected {:?}", other),
        }
        drop(rx);
        assert!(handle.is_closed());
        assert!(handle.send(BundleCommand::Close).await.is_err());
        assert!(handle.try_send(BundleCommand::Close).is_err());
    }

    #[tokio::test]
    async fn test_media_source_fan_out() {
        let (tx, _rx) = mpsc::channel(1);
        let (media, _) = broadcast::channel(8);
        let source = MediaSource {
            mid: "0".into(),
            kind: MediaKind::Audio,
            media,
            bundle: BundleHandle::new("0", tx),
        };
        let mut a = source.subscribe();
        let mut b = source.subscribe();
        source
            .media
            .send(MediaPacket::SenderReport(Arc::from(vec![1u8, 2, 3])))
            .unwrap();
        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                MediaPacket::SenderReport(data) => assert_eq!(&data[..], &[1, 2, 3]),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(source.feedback_target().mid, "0");
    }
}
