//! Bundle task: owns one [`Bundle`] and its sockets and drives it.
//!
//! Everything touching a bundle happens on its task, so the sans-IO state
//! needs no locks. Other tasks talk to it through its [`BundleHandle`].

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::bundle::{Bundle, BundleEvent};
use super::error::{Error, Result};
use super::ice::SocketKind;
use super::stream::{BundleCommand, BundleHandle, MediaPacket, MediaSource, COMMAND_CHANNEL_CAPACITY};

/// Large enough for any RTP packet a browser sends.
const RECV_BUFFER_SIZE: usize = 2048;

/// A spawned bundle task.
pub struct BundleTask {
    pub handle: BundleHandle,
    pub join: JoinHandle<()>,
}

/// Move `bundle` onto its own task.
pub fn spawn(peer_id: &str, mut bundle: Bundle) -> Result<BundleTask> {
    let id = format!("{}/{}", peer_id, bundle.id());
    let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let handle = BundleHandle::new(&id, tx);

    let mut host = None;
    let mut srflx = None;
    for local in bundle.take_sockets() {
        local.socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(local.socket)?;
        match local.kind {
            SocketKind::Host => host = Some(socket),
            SocketKind::ServerReflexive => srflx = Some(socket),
        }
    }
    let host = host.ok_or_else(|| Error::InvalidState(format!("bundle {} has no host socket", id)))?;

    let actor = BundleActor {
        id,
        bundle,
        host,
        srflx,
        commands: rx,
        handle: handle.clone(),
        forwarders: HashMap::new(),
    };
    let join = tokio::spawn(actor.run());
    Ok(BundleTask { handle, join })
}

struct BundleActor {
    id: String,
    bundle: Bundle,
    host: UdpSocket,
    srflx: Option<UdpSocket>,
    commands: mpsc::Receiver<BundleCommand>,
    /// Our own address, handed to forwarder tasks.
    handle: BundleHandle,
    /// One forwarder per mid our client receives media on.
    forwarders: HashMap<String, JoinHandle<()>>,
}

impl BundleActor {
    async fn run(mut self) {
        tracing::info!("Bundle {} started", self.id);
        let mut host_buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut srflx_buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            let deadline = self.bundle.poll_timeout();
            tokio::select! {
                res = self.host.recv_from(&mut host_buf) => match res {
                    Ok((n, from)) => {
                        self.bundle.handle_datagram(SocketKind::Host, from, &host_buf[..n], Instant::now());
                    }
                    Err(e) => tracing::debug!("Bundle {}: host recv error: {}", self.id, e),
                },
                res = recv_from_optional(self.srflx.as_ref(), &mut srflx_buf) => match res {
                    Ok((n, from)) => {
                        self.bundle.handle_datagram(
                            SocketKind::ServerReflexive,
                            from,
                            &srflx_buf[..n],
                            Instant::now(),
                        );
                    }
                    Err(e) => tracing::debug!("Bundle {}: srflx recv error: {}", self.id, e),
                },
                command = self.commands.recv() => match command {
                    None | Some(BundleCommand::Close) => break,
                    Some(command) => self.handle_command(command),
                },
                _ = sleep_until_optional(deadline) => {
                    self.bundle.handle_timeout(Instant::now());
                }
            }

            if !self.flush().await {
                break;
            }
        }

        for (_, forwarder) in self.forwarders.drain() {
            forwarder.abort();
        }
        tracing::info!("Bundle {} stopped", self.id);
    }

    fn handle_command(&mut self, command: BundleCommand) {
        match command {
            BundleCommand::SendMedia { mid, packet } => {
                self.bundle.send_media(&mid, &packet, Instant::now());
            }
            BundleCommand::FeedbackForClient { mid, feedback } => {
                self.bundle.feedback_for_client(&mid, feedback);
            }
            BundleCommand::ReplaceStream { mid, source } => self.replace_stream(mid, source),
            BundleCommand::RequestKeyFrame { mid } => self.bundle.request_key_frame(&mid),
            BundleCommand::Close => {}
        }
    }

    fn replace_stream(&mut self, mid: String, source: Option<MediaSource>) {
        if let Some(old) = self.forwarders.remove(&mid) {
            old.abort();
        }
        self.bundle
            .set_source(&mid, source.as_ref().map(MediaSource::feedback_target));
        let Some(source) = source else {
            tracing::info!("Bundle {}: mid {} detached", self.id, mid);
            return;
        };
        tracing::info!(
            "Bundle {}: mid {} now receives {} mid {}",
            self.id,
            mid,
            source.bundle.id(),
            source.mid
        );
        let forwarder = tokio::spawn(forward(source.subscribe(), self.handle.clone(), mid.clone()));
        self.forwarders.insert(mid, forwarder);
    }

    /// Write queued datagrams and dispatch feedback and events. Returns
    /// false when the bundle is dead.
    async fn flush(&mut self) -> bool {
        while let Some(transmit) = self.bundle.poll_transmit() {
            let socket = match transmit.local {
                SocketKind::ServerReflexive => self.srflx.as_ref().unwrap_or(&self.host),
                SocketKind::Host => &self.host,
            };
            if let Err(e) = socket.send_to(&transmit.payload, transmit.remote).await {
                tracing::debug!("Bundle {}: send to {} failed: {}", self.id, transmit.remote, e);
            }
        }

        while let Some((target, feedback)) = self.bundle.poll_feedback() {
            // Never block on another bundle's queue
            let command = BundleCommand::FeedbackForClient {
                mid: target.mid.clone(),
                feedback,
            };
            if let Err(e) = target.bundle.try_send(command) {
                tracing::debug!("Bundle {}: feedback dropped: {}", self.id, e);
            }
        }

        let mut alive = true;
        while let Some(event) = self.bundle.poll_event() {
            match event {
                BundleEvent::Connected(pair) => {
                    tracing::info!("Bundle {}: connected via {:?} {}", self.id, pair.local, pair.remote);
                }
                BundleEvent::SecureReady => {
                    tracing::info!("Bundle {}: media path secured", self.id);
                }
                BundleEvent::Failed(reason) => {
                    tracing::warn!("Bundle {}: failed: {}", self.id, reason);
                    alive = false;
                }
                BundleEvent::Closed => alive = false,
            }
        }
        alive
    }
}

/// Pump a producer's stream into a consumer bundle's queue.
async fn forward(mut media: broadcast::Receiver<MediaPacket>, consumer: BundleHandle, mid: String) {
    loop {
        match media.recv().await {
            Ok(packet) => {
                let command = BundleCommand::SendMedia {
                    mid: mid.clone(),
                    packet,
                };
                if consumer.send(command).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!("{} mid {}: forwarder lagged by {} packets", consumer.id(), mid, n);
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::debug!("{} mid {}: producer gone", consumer.id(), mid);
                break;
            }
        }
    }
}

async fn recv_from_optional(
    socket: Option<&UdpSocket>,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_optional(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
