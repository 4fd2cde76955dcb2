//! WebRTC media plane: ICE, DTLS-SRTP, RTP/RTCP sessions and the
//! per-peer negotiation that ties them together.
//!
//! ```text
//! PeerContext ── Bundle task ── Bundle ── IceAgent / DtlsContext / SrtpContext
//!                                  └──── Transceiver ── RtpReceiver / RtpSender
//! ```

pub mod bundle;
pub mod certificate;
pub mod crypto;
pub mod cursor;
pub mod dtls;
pub mod error;
pub mod ice;
pub mod peer;
pub mod receiver;
pub mod rtcp;
pub mod rtp;
pub mod sdp;
pub mod sender;
pub mod srtp;
pub mod stream;
pub mod stun;
pub mod transceiver;
pub mod transport;

pub use error::{Error, Result};
