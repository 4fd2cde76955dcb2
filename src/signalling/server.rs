//! WebSocket signalling server.
//!
//! One reader loop per connection; replies and broadcasts go through a
//! per-connection outbox drained by a writer task, so any task can message
//! any user without touching the socket.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{accept_async, tungstenite::Message};

use super::messages::{
    self, BroadcastEvent, LoginParams, LoginReply, OfferParams, Request, SdpReply, SubscribeParams,
    UserDetails,
};
use crate::config::ServerConfig;
use crate::webrtc::certificate::Certificate;
use crate::webrtc::peer::{self, PeerContext, SignallingState};
use crate::webrtc::transceiver::MediaKind;

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

/// A logged-in user and their peer connection.
pub struct User {
    pub id: String,
    outbox: mpsc::UnboundedSender<String>,
    state: watch::Receiver<SignallingState>,
    peer: tokio::sync::Mutex<PeerContext>,
}

impl User {
    fn is_stable(&self) -> bool {
        *self.state.borrow() == SignallingState::Stable
    }

    fn send(&self, text: String) {
        if self.outbox.send(text).is_err() {
            tracing::debug!("User {}: outbox closed", self.id);
        }
    }
}

/// Everyone connected to this server, in login order.
#[derive(Default)]
pub struct Room {
    users: Mutex<Vec<Arc<User>>>,
}

impl Room {
    fn users(&self) -> Vec<Arc<User>> {
        self.users.lock().map(|u| u.clone()).unwrap_or_default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<User>> {
        self.users().into_iter().find(|u| u.id == id)
    }

    pub fn len(&self) -> usize {
        self.users().len()
    }

    /// Fails when `user.id` is taken.
    fn insert(&self, user: Arc<User>) -> bool {
        let Ok(mut users) = self.users.lock() else {
            return false;
        };
        if users.iter().any(|u| u.id == user.id) {
            return false;
        }
        users.push(user);
        true
    }

    fn remove(&self, id: &str) {
        if let Ok(mut users) = self.users.lock() {
            users.retain(|u| u.id != id);
        }
    }

    /// Ids of users whose negotiation has completed.
    pub fn stable_user_ids(&self) -> Vec<String> {
        self.users()
            .iter()
            .filter(|u| u.is_stable())
            .map(|u| u.id.clone())
            .collect()
    }

    fn broadcast(&self, event: &BroadcastEvent, except: &str) {
        let text = match messages::broadcast(event) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Failed to encode broadcast: {}", e);
                return;
            }
        };
        for user in self.users().iter().filter(|u| u.id != except) {
            user.send(text.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct SignallingServer {
    config: Arc<ServerConfig>,
    certificate: Arc<Certificate>,
    room: Arc<Room>,
}

/// Per-connection state.
struct Session {
    addr: SocketAddr,
    outbox: mpsc::UnboundedSender<String>,
    user: Option<Arc<User>>,
}

impl SignallingServer {
    pub fn new(config: Arc<ServerConfig>, certificate: Arc<Certificate>) -> Arc<Self> {
        Arc::new(Self {
            config,
            certificate,
            room: Arc::new(Room::default()),
        })
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    /// Bind `signalling_addr` and serve until the listener fails.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.config.signalling_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.signalling_addr))?;
        tracing::info!("Signalling listening on ws://{}", self.config.signalling_addr);
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await.context("accept failed")?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    tracing::warn!("Connection {}: {:#}", addr, e);
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let ws = accept_async(stream)
            .await
            .context("WebSocket handshake failed")?;
        tracing::info!("Connection {} opened", addr);
        let (mut sink, mut incoming) = ws.split();

        let (outbox, mut rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let mut session = Session {
            addr,
            outbox,
            user: None,
        };
        while let Some(msg) = incoming.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if let Err(e) = self.handle_text(&mut session, &text).await {
                        tracing::warn!("Connection {}: {:#}", addr, e);
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("Connection {}: read error: {}", addr, e);
                    break;
                }
            }
        }

        if let Some(user) = session.user.take() {
            self.leave(&user).await;
        }
        // The writer ends once the last outbox sender is gone
        drop(session);
        drop(writer);
        tracing::info!("Connection {} closed", addr);
        Ok(())
    }

    async fn handle_text(&self, session: &mut Session, text: &str) -> Result<()> {
        let request: Request = serde_json::from_str(text).context("Invalid signalling message")?;
        tracing::debug!("Connection {}: {}", session.addr, request.method);
        match request.method.as_str() {
            messages::METHOD_LOGIN => self.login(session, &request),
            messages::METHOD_SDP_EXCHANGE => self.sdp_exchange(session, &request).await,
            messages::METHOD_SUBSCRIBE => self.subscribe(session, &request),
            other => bail!("unknown method {}", other),
        }
    }

    // -----------------------------------------------------------------------
    // Methods
    // -----------------------------------------------------------------------

    fn login(&self, session: &mut Session, request: &Request) -> Result<()> {
        if session.user.is_some() {
            bail!("already logged in");
        }
        let params: LoginParams = serde_json::from_value(request.params.clone()).unwrap_or_default();
        let id = params
            .user_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let peer = PeerContext::new(&id, Arc::clone(&self.config), Arc::clone(&self.certificate));
        let user = Arc::new(User {
            id: id.clone(),
            outbox: session.outbox.clone(),
            state: peer.subscribe_state(),
            peer: tokio::sync::Mutex::new(peer),
        });

        let users_list = self.room.stable_user_ids();
        let reply = if self.room.insert(Arc::clone(&user)) {
            tracing::info!("User {} logged in from {}", id, session.addr);
            session.user = Some(user);
            LoginReply::Success {
                user_id: id,
                users_list,
            }
        } else {
            LoginReply::Error {
                reason: format!("user id {} is taken", id),
            }
        };
        let _ = session.outbox.send(request.reply(reply)?);
        Ok(())
    }

    async fn sdp_exchange(&self, session: &Session, request: &Request) -> Result<()> {
        let user = session.user.as_ref().context("sdp-exchange before login")?;
        let offer: OfferParams =
            serde_json::from_value(request.params.clone()).context("Invalid offer")?;
        if let Some(kind) = offer.kind.as_deref().filter(|k| *k != "offer") {
            bail!("expected an offer, got {}", kind);
        }

        let answer = {
            let mut peer = user.peer.lock().await;
            peer.set_remote_description(&offer.sdp)
                .and_then(|_| peer.generate_answer())
        };
        match answer {
            Ok(sdp) => {
                user.send(request.reply(SdpReply::Answer { sdp })?);
                self.room.broadcast(
                    &BroadcastEvent::UserJoined {
                        user_id: user.id.clone(),
                        user_details: UserDetails {
                            user_id: user.id.clone(),
                        },
                    },
                    &user.id,
                );
                Ok(())
            }
            Err(e) => {
                user.send(request.reply(SdpReply::Error {
                    reason: e.to_string(),
                })?);
                Err(e).with_context(|| format!("negotiation with {} failed", user.id))
            }
        }
    }

    /// Runs in the background: the subscriber may still be negotiating.
    fn subscribe(&self, session: &Session, request: &Request) -> Result<()> {
        let user = Arc::clone(session.user.as_ref().context("subscribe before login")?);
        let params: SubscribeParams =
            serde_json::from_value(request.params.clone()).context("Invalid subscribe params")?;
        let room = Arc::clone(&self.room);
        tokio::spawn(async move {
            if let Err(e) = subscribe(&room, &user, &params).await {
                tracing::warn!("User {} subscribing to {}: {:#}", user.id, params.producer_id, e);
            }
        });
        Ok(())
    }

    async fn leave(&self, user: &User) {
        self.room.remove(&user.id);
        user.peer.lock().await.close();
        tracing::info!("User {} left", user.id);
        self.room.broadcast(
            &BroadcastEvent::UserLeft {
                user_id: user.id.clone(),
            },
            &user.id,
        );
    }
}

/// Point `subscriber`'s receive MIDs at `producer_id`'s audio and video.
async fn subscribe(room: &Room, subscriber: &User, params: &SubscribeParams) -> Result<()> {
    peer::wait_for_stable(subscriber.state.clone()).await?;
    let producer = room
        .get(&params.producer_id)
        .with_context(|| format!("unknown producer {}", params.producer_id))?;
    peer::wait_for_stable(producer.state.clone()).await?;

    let (audio, video) = {
        let peer = producer.peer.lock().await;
        (
            peer.source_of_kind(MediaKind::Audio),
            peer.source_of_kind(MediaKind::Video),
        )
    };
    let key_frame_mid = video.as_ref().map(|s| s.mid.clone());

    {
        let peer = subscriber.peer.lock().await;
        peer.replace_stream(&params.audio_mid.as_mid(), audio).await?;
        peer.replace_stream(&params.video_mid.as_mid(), video).await?;
    }
    tracing::info!("User {} now receives {}", subscriber.id, producer.id);

    if let Some(mid) = key_frame_mid {
        producer.peer.lock().await.request_key_frame(&mid).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::sdp::tests::browser_offer;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start() -> (Arc<SignallingServer>, String) {
        let config = ServerConfig {
            bind_ip: "127.0.0.1".parse().unwrap(),
            ..ServerConfig::default()
        };
        let server = SignallingServer::new(
            Arc::new(config),
            Arc::new(Certificate::generate().unwrap()),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(Arc::clone(&server).serve(listener));
        (server, url)
    }

    async fn call(client: &mut Client, id: &str, method: &str, params: Value) {
        let text = json!({"id": id, "method": method, "params": params}).to_string();
        client.send(Message::Text(text)).await.unwrap();
    }

    async fn next_json(client: &mut Client) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn login(url: &str, user_id: &str) -> (Client, Value) {
        let (mut client, _) = connect_async(url).await.unwrap();
        call(&mut client, "l1", "login", json!({"userId": user_id})).await;
        let reply = next_json(&mut client).await;
        (client, reply)
    }

    async fn negotiate(client: &mut Client) -> Value {
        let sdp = browser_offer("sendrecv", true);
        call(client, "s1", "sdp-exchange", json!({"type": "offer", "sdp": sdp})).await;
        next_json(client).await
    }

    #[tokio::test]
    async fn test_login_reply_lists_stable_users() {
        let (server, url) = start().await;

        let (mut alice, reply) = login(&url, "alice").await;
        assert_eq!(reply["id"], "l1");
        assert_eq!(reply["method"], "login");
        assert_eq!(reply["params"]["status"], "success");
        assert_eq!(reply["params"]["usersList"], json!([]));

        let answer = negotiate(&mut alice).await;
        assert_eq!(answer["method"], "sdp-exchange");
        assert_eq!(answer["params"]["type"], "answer");
        assert!(answer["params"]["sdp"].as_str().unwrap().starts_with("v=0"));

        let (_bob, reply) = login(&url, "bob").await;
        assert_eq!(reply["params"]["usersList"], json!(["alice"]));
        assert_eq!(server.room().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_user_id_rejected() {
        let (_server, url) = start().await;
        let (_alice, _) = login(&url, "alice").await;
        let (_other, reply) = login(&url, "alice").await;
        assert_eq!(reply["params"]["status"], "error");
    }

    #[tokio::test]
    async fn test_join_and_leave_are_broadcast() {
        let (server, url) = start().await;
        let (mut alice, _) = login(&url, "alice").await;
        let (mut bob, _) = login(&url, "bob").await;

        negotiate(&mut bob).await;
        let joined = next_json(&mut alice).await;
        assert_eq!(joined["method"], "broadcast");
        assert_eq!(joined["params"]["type"], "user-joined");
        assert_eq!(joined["params"]["userId"], "bob");

        bob.close(None).await.unwrap();
        let left = next_json(&mut alice).await;
        assert_eq!(left["params"]["type"], "user-left");
        assert_eq!(left["params"]["userId"], "bob");
        assert!(server.room().get("bob").is_none());
    }

    #[tokio::test]
    async fn test_bad_offer_gets_error_reply() {
        let (_server, url) = start().await;
        let (mut alice, _) = login(&url, "alice").await;
        call(&mut alice, "s1", "sdp-exchange", json!({"type": "offer", "sdp": "v=0\r\n"})).await;
        let reply = next_json(&mut alice).await;
        assert_eq!(reply["params"]["type"], "error");
    }

    #[tokio::test]
    async fn test_subscribe_wires_producer_into_subscriber() {
        let (server, url) = start().await;
        let (mut alice, _) = login(&url, "alice").await;
        let (mut bob, _) = login(&url, "bob").await;

        // Subscribing before negotiating waits for the answer
        call(
            &mut bob,
            "x1",
            "subscribe",
            json!({"producerId": "alice", "audioMid": 0, "videoMid": "1"}),
        )
        .await;
        negotiate(&mut alice).await;
        negotiate(&mut bob).await;

        let alice_user = server.room().get("alice").unwrap();
        let video = alice_user
            .peer
            .lock()
            .await
            .source_of_kind(MediaKind::Video)
            .unwrap();
        for _ in 0..200 {
            if video.media.receiver_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(video.media.receiver_count(), 1);
    }
}
