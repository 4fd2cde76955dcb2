//! ICE agent: local candidates, STUN binding responder and the selected pair.
//!
//! The server is always the controlled side: it never sends connectivity
//! checks, it only answers the browser's Binding Requests and latches the
//! pair the browser nominates with USE-CANDIDATE.
//!
//! The agent owns the UDP sockets of one bundle until the transport task takes
//! them; everything else is sans-IO. Outgoing datagrams are queued as
//! [`Transmit`]s tagged with the local socket they must leave from.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr, UdpSocket};

use super::crypto::random_token;
use super::error::Result;
use super::stun;
use crate::config::ServerConfig;

/// Foundation shared by every candidate we advertise.
const CANDIDATE_FOUNDATION: u32 = 121418589;

/// Priority of the host candidate.
const HOST_PRIORITY: u32 = 2122260224;

/// Priority of the server-reflexive candidate.
const SRFLX_PRIORITY: u32 = 2122250224;

const UFRAG_LEN: usize = 4;
const PWD_LEN: usize = 24;

/// Which local socket a datagram arrived on or must leave from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Host,
    ServerReflexive,
}

/// A datagram ready to be written to the network.
#[derive(Debug, Clone, PartialEq)]
pub struct Transmit {
    pub local: SocketKind,
    pub remote: SocketAddr,
    pub payload: Vec<u8>,
}

/// The nominated candidate pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectedPair {
    pub local: SocketKind,
    pub remote: SocketAddr,
}

/// A bound local socket together with the address advertised for it.
#[derive(Debug)]
pub struct LocalSocket {
    pub kind: SocketKind,
    pub socket: UdpSocket,
    pub advertised: SocketAddr,
}

pub struct IceAgent {
    local_ufrag: String,
    local_pwd: String,
    remote_ufrag: Option<String>,
    remote_pwd: Option<String>,
    candidates: Vec<(SocketKind, SocketAddr)>,
    sockets: Vec<LocalSocket>,
    selected: Option<SelectedPair>,
    transmits: VecDeque<Transmit>,
}

impl IceAgent {
    /// Bind the host socket (and a server-reflexive one when a public IP is
    /// configured) and generate fresh local credentials.
    pub fn bind(config: &ServerConfig) -> Result<Self> {
        let mut sockets = Vec::new();

        let host = UdpSocket::bind(SocketAddr::new(config.bind_ip, 0))?;
        let host_port = host.local_addr()?.port();
        let host_ip = match config.host_ip {
            Some(ip) => ip,
            None => detect_host_ip(host.local_addr()?.ip()),
        };
        sockets.push(LocalSocket {
            kind: SocketKind::Host,
            socket: host,
            advertised: SocketAddr::new(host_ip, host_port),
        });

        if let Some(public_ip) = config.public_ip {
            let srflx = UdpSocket::bind(SocketAddr::new(config.bind_ip, 0))?;
            let port = srflx.local_addr()?.port();
            sockets.push(LocalSocket {
                kind: SocketKind::ServerReflexive,
                socket: srflx,
                advertised: SocketAddr::new(public_ip, port),
            });
        }

        let candidates = sockets.iter().map(|s| (s.kind, s.advertised)).collect();
        let agent = Self {
            local_ufrag: random_token(UFRAG_LEN),
            local_pwd: random_token(PWD_LEN),
            remote_ufrag: None,
            remote_pwd: None,
            candidates,
            sockets,
            selected: None,
            transmits: VecDeque::new(),
        };
        tracing::debug!(
            "ICE agent bound: ufrag={} candidates={:?}",
            agent.local_ufrag,
            agent.candidates
        );
        Ok(agent)
    }

    pub fn local_ufrag(&self) -> &str {
        &self.local_ufrag
    }

    pub fn local_pwd(&self) -> &str {
        &self.local_pwd
    }

    pub fn remote_credentials(&self) -> Option<(&str, &str)> {
        Some((self.remote_ufrag.as_deref()?, self.remote_pwd.as_deref()?))
    }

    pub fn set_remote_credentials(&mut self, ufrag: &str, pwd: &str) {
        self.remote_ufrag = Some(ufrag.to_string());
        self.remote_pwd = Some(pwd.to_string());
    }

    /// Candidate attribute values (without the `a=` prefix).
    pub fn local_candidates(&self) -> Vec<String> {
        self.candidates
            .iter()
            .map(|(kind, addr)| {
                let (priority, typ) = match kind {
                    SocketKind::Host => (HOST_PRIORITY, "host"),
                    SocketKind::ServerReflexive => (SRFLX_PRIORITY, "srflx"),
                };
                format!(
                    "candidate:{} 1 udp {} {} {} typ {}",
                    CANDIDATE_FOUNDATION,
                    priority,
                    addr.ip(),
                    addr.port(),
                    typ
                )
            })
            .collect()
    }

    /// Hand the bound sockets over to the transport task.
    pub fn take_sockets(&mut self) -> Vec<LocalSocket> {
        std::mem::take(&mut self.sockets)
    }

    pub fn selected_pair(&self) -> Option<SelectedPair> {
        self.selected
    }

    /// Answer a Binding Request received on `local` from `from`.
    ///
    /// Returns the newly selected pair when the request nominated one.
    pub fn handle_stun(
        &mut self,
        local: SocketKind,
        from: SocketAddr,
        data: &[u8],
    ) -> Result<Option<SelectedPair>> {
        if !stun::is_binding_request(data) {
            tracing::trace!("Ignoring non-request STUN message from {}", from);
            return Ok(None);
        }
        let request = stun::parse_binding_request(data)?;

        if self.local_pwd.is_empty() {
            tracing::debug!("No local ICE password, dropping STUN request from {}", from);
            return Ok(None);
        }

        let authentic =
            stun::verify_message_integrity(data, &request, self.local_pwd.as_bytes());
        if !authentic {
            tracing::debug!("STUN request from {} failed MESSAGE-INTEGRITY check", from);
        }
        // USERNAME is "<our ufrag>:<their ufrag>"
        if let Some(username) = &request.username {
            if username.split(':').next() != Some(self.local_ufrag.as_str()) {
                tracing::debug!("STUN request from {} for unknown ufrag {}", from, username);
            }
        }

        let response =
            stun::build_binding_response(&request.transaction_id, from, self.local_pwd.as_bytes())?;
        self.transmits.push_back(Transmit {
            local,
            remote: from,
            payload: response,
        });

        if request.use_candidate && authentic {
            let pair = SelectedPair {
                local,
                remote: from,
            };
            if self.selected != Some(pair) {
                tracing::info!("ICE selected pair: {:?} -> {}", local, from);
                self.selected = Some(pair);
                return Ok(Some(pair));
            }
        }
        Ok(None)
    }

    /// Queue a datagram on the selected pair. Dropped (and logged) when no
    /// pair has been nominated yet.
    pub fn send(&mut self, payload: Vec<u8>) {
        match self.selected {
            Some(pair) => self.transmits.push_back(Transmit {
                local: pair.local,
                remote: pair.remote,
                payload,
            }),
            None => tracing::debug!("No selected ICE pair yet, dropping {} bytes", payload.len()),
        }
    }

    /// Queue a datagram to an explicit remote.
    pub fn send_to(&mut self, local: SocketKind, remote: SocketAddr, payload: Vec<u8>) {
        self.transmits.push_back(Transmit {
            local,
            remote,
            payload,
        });
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }
}

/// Find the address other hosts reach us on when bound to the wildcard.
///
/// Uses the "connect to 8.8.8.8" trick to find the default outbound IP.
fn detect_host_ip(bound: IpAddr) -> IpAddr {
    if !bound.is_unspecified() {
        return bound;
    }
    let outbound = UdpSocket::bind("0.0.0.0:0").and_then(|socket| {
        socket.connect("8.8.8.8:80")?;
        socket.local_addr()
    });
    match outbound {
        Ok(addr) => addr.ip(),
        Err(e) => {
            tracing::warn!("Could not detect host IP ({}), advertising loopback", e);
            IpAddr::from([127, 0, 0, 1])
        }
    }
}
