//! Error taxonomy for the protocol stack.
//!
//! Packet-level variants are recoverable: callers drop the offending datagram
//! and keep the session. Negotiation and handshake failures leave the peer
//! unusable until signalling starts over with a fresh offer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Truncated or structurally invalid binary input.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// SRTP/SRTCP authentication tag mismatch.
    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),

    /// The remote offer cannot be answered.
    #[error("negotiation rejected: {0}")]
    NegotiationRejected(String),

    #[error("DTLS handshake failure: {0}")]
    HandshakeFailure(String),

    /// Operation not allowed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedPacket(msg.into())
    }

    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::HandshakeFailure(msg.into())
    }
}
