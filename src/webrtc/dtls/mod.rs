//! Server-side DTLS 1.2 handshake engine (RFC 6347) for DTLS-SRTP.
//!
//! Fixed to ECDHE-ECDSA-AES128-GCM-SHA256 on secp256r1 with a mandatory
//! client certificate whose fingerprint must match the SDP offer. The engine
//! is sans-IO: datagrams go in through [`DtlsContext::handle_datagram`],
//! outgoing datagrams and [`DtlsEvent`]s are drained by the caller, and
//! flight retransmission is driven by [`DtlsContext::poll_timeout`] /
//! [`DtlsContext::handle_timeout`].
//!
//! ```text
//! AwaitClientHello --ClientHello--> AwaitClientFinished --Finished--> Established
//! ```

pub mod handshake;
pub mod record;

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;

use self::handshake::{ClientHello, Message, Reassembler};
use self::record::{RecordCipher, CONTENT_ALERT, CONTENT_CHANGE_CIPHER_SPEC, CONTENT_HANDSHAKE};
use super::certificate::{fingerprint_of, Certificate};
use super::crypto::{prf, random_bytes, sha256, to_hex};
use super::error::{Error, Result};
use super::srtp::SrtpProfile;

const MASTER_SECRET_LEN: usize = 48;
const KEY_BLOCK_LEN: usize = 40;
const VERIFY_DATA_LEN: usize = 12;

const ALERT_FATAL: u8 = 2;
const ALERT_CLOSE_NOTIFY: u8 = 0;

const INITIAL_RETRANSMIT: Duration = Duration::from_secs(1);
const MAX_RETRANSMITS: u32 = 6;

/// Output of a completed handshake, consumed by SRTP key derivation.
#[derive(Clone)]
pub struct DtlsParams {
    pub master_secret: [u8; MASTER_SECRET_LEN],
    pub client_random: [u8; 32],
    pub server_random: [u8; 32],
    pub srtp_profile: SrtpProfile,
}

impl std::fmt::Debug for DtlsParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtlsParams")
            .field("srtp_profile", &self.srtp_profile)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum DtlsEvent {
    ParamsReady(DtlsParams),
    /// The peer sent an alert; the association is gone.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsState {
    AwaitClientHello,
    AwaitClientFinished,
    Established,
    Failed,
    Closed,
}

/// A record of the last flight, re-encoded with fresh sequence numbers
/// whenever it is (re)sent.
#[derive(Clone)]
struct FlightRecord {
    content_type: u8,
    epoch: u16,
    payload: Vec<u8>,
}

struct Retransmit {
    deadline: Instant,
    interval: Duration,
    attempts: u32,
}

pub struct DtlsContext {
    certificate: Arc<Certificate>,
    /// `sha-256` fingerprint from the offer, uppercase.
    remote_fingerprint: Option<String>,
    key_log: Option<PathBuf>,

    state: DtlsState,
    reassembler: Reassembler,
    /// Canonical encodings of every handshake message so far.
    transcript: Vec<u8>,
    next_server_seq: u16,
    record_seq: [u64; 2],

    client_random: [u8; 32],
    server_random: [u8; 32],
    srtp_profile: Option<SrtpProfile>,
    ecdh_secret: Option<EphemeralSecret>,
    master_secret: Option<[u8; MASTER_SECRET_LEN]>,
    cipher: Option<RecordCipher>,
    client_certificate_seen: bool,

    flight: Vec<FlightRecord>,
    retransmit: Option<Retransmit>,
    output: VecDeque<Vec<u8>>,
    events: VecDeque<DtlsEvent>,
}

impl DtlsContext {
    pub fn new(
        certificate: Arc<Certificate>,
        remote_fingerprint: Option<String>,
        key_log: Option<PathBuf>,
    ) -> Self {
        Self {
            certificate,
            remote_fingerprint: remote_fingerprint.map(|fp| fp.to_ascii_uppercase()),
            key_log,
            state: DtlsState::AwaitClientHello,
            reassembler: Reassembler::default(),
            transcript: Vec::new(),
            next_server_seq: 0,
            record_seq: [0; 2],
            client_random: [0; 32],
            server_random: [0; 32],
            srtp_profile: None,
            ecdh_secret: None,
            master_secret: None,
            cipher: None,
            client_certificate_seen: false,
            flight: Vec::new(),
            retransmit: None,
            output: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> DtlsState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == DtlsState::Established
    }

    /// Feed one datagram. Only a `HandshakeFailure` moves the context to
    /// `Failed`; other errors reject just this datagram.
    pub fn handle_datagram(&mut self, data: &[u8], now: Instant) -> Result<()> {
        match self.state {
            DtlsState::Failed | DtlsState::Closed => {
                tracing::trace!("DTLS datagram after close, ignoring");
                return Ok(());
            }
            _ => {}
        }
        let result = self.process_datagram(data, now);
        if let Err(e) = &result {
            if matches!(e, Error::HandshakeFailure(_)) {
                tracing::warn!("DTLS handshake failed: {}", e);
                self.fail();
            }
        }
        result
    }

    fn process_datagram(&mut self, data: &[u8], now: Instant) -> Result<()> {
        let mut replay = false;

        for record in record::parse_records(data)? {
            let plaintext = if record.epoch == 0 {
                record.fragment.to_vec()
            } else {
                let Some(cipher) = &self.cipher else {
                    tracing::debug!("Epoch {} record before key exchange, dropping", record.epoch);
                    continue;
                };
                match cipher.open(&record) {
                    Ok(plaintext) => plaintext,
                    Err(e) => {
                        tracing::debug!("Dropping DTLS record: {}", e);
                        continue;
                    }
                }
            };

            match record.content_type {
                CONTENT_HANDSHAKE => {
                    for fragment in handshake::parse_fragments(&plaintext)? {
                        if self.reassembler.is_retransmission(&fragment) {
                            replay = true;
                            continue;
                        }
                        for message in self.reassembler.push(&fragment)? {
                            self.handle_message(message, now)?;
                        }
                    }
                }
                CONTENT_CHANGE_CIPHER_SPEC => {
                    tracing::trace!("Client ChangeCipherSpec");
                }
                CONTENT_ALERT => {
                    // Unauthenticated once keys exist
                    if record.epoch == 0 && self.cipher.is_some() {
                        tracing::debug!("Ignoring plaintext DTLS alert after key exchange");
                        continue;
                    }
                    let &[level, description, ..] = plaintext.as_slice() else {
                        tracing::debug!("Truncated DTLS alert, dropping");
                        continue;
                    };
                    tracing::info!("DTLS alert level={} description={}", level, description);
                    if level != ALERT_FATAL && description != ALERT_CLOSE_NOTIFY {
                        continue;
                    }
                    self.state = DtlsState::Closed;
                    self.retransmit = None;
                    self.events.push_back(DtlsEvent::Closed);
                    return Ok(());
                }
                other => {
                    tracing::debug!("Ignoring DTLS record of content type {}", other);
                }
            }
        }

        if replay && !self.flight.is_empty() {
            tracing::debug!("Client retransmitted its flight, resending ours");
            self.send_flight()?;
        }
        Ok(())
    }

    fn handle_message(&mut self, message: Message, now: Instant) -> Result<()> {
        tracing::debug!(
            "DTLS <- {} (seq {}, {} bytes)",
            handshake::message_name(message.msg_type),
            message.message_seq,
            message.body.len()
        );
        match (self.state, message.msg_type) {
            (DtlsState::AwaitClientHello, handshake::CLIENT_HELLO) => {
                self.handle_client_hello(&message, now)
            }
            (DtlsState::AwaitClientFinished, handshake::CERTIFICATE) => {
                self.handle_client_certificate(&message.body)?;
                self.transcript.extend(message.encode());
                Ok(())
            }
            (DtlsState::AwaitClientFinished, handshake::CLIENT_KEY_EXCHANGE) => {
                self.handle_client_key_exchange(&message.body)?;
                self.transcript.extend(message.encode());
                Ok(())
            }
            // Signature is not checked; the certificate is pinned by fingerprint
            (DtlsState::AwaitClientFinished, handshake::CERTIFICATE_VERIFY) => {
                self.transcript.extend(message.encode());
                Ok(())
            }
            (DtlsState::AwaitClientFinished, handshake::FINISHED) => {
                self.handle_client_finished(&message)
            }
            (DtlsState::Established, msg_type) => {
                tracing::debug!(
                    "Ignoring {} after handshake completion",
                    handshake::message_name(msg_type)
                );
                Ok(())
            }
            (state, msg_type) => Err(Error::handshake(format!(
                "unexpected {} in state {:?}",
                handshake::message_name(msg_type),
                state
            ))),
        }
    }

    fn handle_client_hello(&mut self, message: &Message, now: Instant) -> Result<()> {
        let hello = ClientHello::parse(&message.body)?;
        if !hello.cipher_suites.contains(&handshake::CIPHER_SUITE) {
            tracing::debug!("ClientHello does not list 0xc02b, proposing it anyway");
        }

        let offered = hello.srtp_profiles()?;
        let profile = [SrtpProfile::Aes128CmHmacSha1_80, SrtpProfile::AeadAes128Gcm]
            .into_iter()
            .find(|p| offered.contains(&p.id()))
            .ok_or_else(|| {
                Error::handshake(format!("no common SRTP profile in {:04x?}", offered))
            })?;

        self.client_random = hello.random;
        self.server_random = random_bytes::<32>();
        self.srtp_profile = Some(profile);

        let secret = EphemeralSecret::random(&mut OsRng);
        let public = secret.public_key().to_encoded_point(false);
        self.ecdh_secret = Some(secret);

        self.transcript.extend(message.encode());

        let bodies = [
            (
                handshake::SERVER_HELLO,
                handshake::server_hello(&self.server_random, &hello, profile.id()),
            ),
            (
                handshake::CERTIFICATE,
                handshake::certificate(self.certificate.der()),
            ),
            (
                handshake::SERVER_KEY_EXCHANGE,
                handshake::server_key_exchange(
                    &self.client_random,
                    &self.server_random,
                    public.as_bytes(),
                    self.certificate.signing_key(),
                ),
            ),
            (
                handshake::CERTIFICATE_REQUEST,
                handshake::certificate_request(),
            ),
            (handshake::SERVER_HELLO_DONE, Vec::new()),
        ];

        self.flight.clear();
        for (msg_type, body) in bodies {
            let encoded = self.next_message(msg_type, body);
            self.transcript.extend_from_slice(&encoded);
            self.flight.push(FlightRecord {
                content_type: CONTENT_HANDSHAKE,
                epoch: 0,
                payload: encoded,
            });
        }

        tracing::info!("DTLS ClientHello accepted, SRTP profile {:?}", profile);
        self.send_flight()?;
        self.retransmit = Some(Retransmit {
            deadline: now + INITIAL_RETRANSMIT,
            interval: INITIAL_RETRANSMIT,
            attempts: 0,
        });
        self.state = DtlsState::AwaitClientFinished;
        Ok(())
    }

    fn handle_client_certificate(&mut self, body: &[u8]) -> Result<()> {
        let Some(der) = handshake::parse_certificate(body)? else {
            return Err(Error::handshake("client sent an empty certificate list"));
        };
        let actual = fingerprint_of(&der);
        match &self.remote_fingerprint {
            Some(expected) if *expected != actual => {
                return Err(Error::handshake(format!(
                    "client certificate fingerprint {} does not match offer {}",
                    actual, expected
                )));
            }
            Some(_) => tracing::debug!("Client certificate matches offered fingerprint"),
            None => tracing::debug!("No sha-256 fingerprint to verify client certificate against"),
        }
        self.client_certificate_seen = true;
        Ok(())
    }

    fn handle_client_key_exchange(&mut self, body: &[u8]) -> Result<()> {
        let point = handshake::parse_client_key_exchange(body)?;
        let client_public = PublicKey::from_sec1_bytes(&point)
            .map_err(|_| Error::handshake("unexpected ECDH point in ClientKeyExchange"))?;
        let secret = self
            .ecdh_secret
            .take()
            .ok_or_else(|| Error::handshake("ClientKeyExchange without ServerKeyExchange"))?;
        let shared = secret.diffie_hellman(&client_public);

        let seed = [self.client_random, self.server_random].concat();
        let master = prf(
            shared.raw_secret_bytes().as_slice(),
            "master secret",
            &seed,
            MASTER_SECRET_LEN,
        )?;
        let mut master_secret = [0u8; MASTER_SECRET_LEN];
        master_secret.copy_from_slice(&master);

        let seed = [self.server_random, self.client_random].concat();
        let key_block = prf(&master_secret, "key expansion", &seed, KEY_BLOCK_LEN)?;
        let (client_keys, server_keys) = record::split_key_block(&key_block)?;

        self.master_secret = Some(master_secret);
        self.cipher = Some(RecordCipher::new(server_keys, client_keys));
        Ok(())
    }

    fn handle_client_finished(&mut self, message: &Message) -> Result<()> {
        let master_secret = self
            .master_secret
            .ok_or_else(|| Error::handshake("Finished before ClientKeyExchange"))?;
        if !self.client_certificate_seen {
            return Err(Error::handshake("client did not present a certificate"));
        }
        let profile = self
            .srtp_profile
            .ok_or_else(|| Error::handshake("no SRTP profile negotiated"))?;

        let expected = prf(
            &master_secret,
            "client finished",
            &sha256(&self.transcript),
            VERIFY_DATA_LEN,
        )?;
        if message.body != expected {
            return Err(Error::handshake("client Finished verify_data mismatch"));
        }
        self.transcript.extend(message.encode());

        let verify_data = prf(
            &master_secret,
            "server finished",
            &sha256(&self.transcript),
            VERIFY_DATA_LEN,
        )?;
        let finished = self.next_message(handshake::FINISHED, verify_data);
        self.flight = vec![
            FlightRecord {
                content_type: CONTENT_CHANGE_CIPHER_SPEC,
                epoch: 0,
                payload: vec![1],
            },
            FlightRecord {
                content_type: CONTENT_HANDSHAKE,
                epoch: 1,
                payload: finished,
            },
        ];
        self.send_flight()?;
        self.retransmit = None;
        self.state = DtlsState::Established;
        tracing::info!("DTLS handshake complete");

        self.write_key_log(&master_secret);
        self.events.push_back(DtlsEvent::ParamsReady(DtlsParams {
            master_secret,
            client_random: self.client_random,
            server_random: self.server_random,
            srtp_profile: profile,
        }));
        Ok(())
    }

    fn next_message(&mut self, msg_type: u8, body: Vec<u8>) -> Vec<u8> {
        let message = Message::new(msg_type, self.next_server_seq, body);
        self.next_server_seq = self.next_server_seq.wrapping_add(1);
        message.encode()
    }

    /// Encode the cached flight into one datagram.
    fn send_flight(&mut self) -> Result<()> {
        let mut datagram = Vec::new();
        for rec in &self.flight {
            let epoch = rec.epoch as usize;
            let seq = self.record_seq[epoch];
            self.record_seq[epoch] += 1;
            let encoded = if rec.epoch == 0 {
                record::encode_record(rec.content_type, 0, seq, &rec.payload)
            } else {
                let cipher = self
                    .cipher
                    .as_ref()
                    .ok_or_else(|| Error::InvalidState("epoch 1 flight without keys".into()))?;
                cipher.seal(rec.content_type, rec.epoch, seq, &rec.payload)?
            };
            datagram.extend(encoded);
        }
        self.output.push_back(datagram);
        Ok(())
    }

    fn write_key_log(&self, master_secret: &[u8]) {
        let Some(path) = &self.key_log else {
            return;
        };
        let line = format!(
            "CLIENT_RANDOM {} {}\n",
            to_hex(&self.client_random),
            to_hex(master_secret)
        );
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(e) = result {
            tracing::warn!("Failed to write DTLS key log {}: {}", path.display(), e);
        }
    }

    fn fail(&mut self) {
        self.state = DtlsState::Failed;
        self.retransmit = None;
        self.flight.clear();
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.retransmit.as_ref().map(|r| r.deadline)
    }

    /// Resend the pending flight when its timer expired.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        let Some(retransmit) = &mut self.retransmit else {
            return Ok(());
        };
        if retransmit.deadline > now {
            return Ok(());
        }
        if retransmit.attempts >= MAX_RETRANSMITS {
            self.fail();
            return Err(Error::handshake("no response from client, giving up"));
        }
        retransmit.attempts += 1;
        retransmit.interval *= 2;
        retransmit.deadline = now + retransmit.interval;
        tracing::debug!("DTLS retransmitting flight (attempt {})", retransmit.attempts);
        self.send_flight()
    }

    pub fn poll_output(&mut self) -> Option<Vec<u8>> {
        self.output.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<DtlsEvent> {
        self.events.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::handshake::tests::client_hello_body;
    use super::record::{parse_records, WriteKeys};
    use super::*;
    use crate::webrtc::cursor::WriteExt;
    use p256::ecdsa::signature::Verifier;
    use p256::ecdsa::Signature;

    /// Minimal browser-side handshake driver.
    struct TestClient {
        certificate: Certificate,
        transcript: Vec<u8>,
        server_random: [u8; 32],
        server_public: Option<PublicKey>,
        master_secret: [u8; 48],
        cipher: Option<RecordCipher>,
    }

    impl TestClient {
        fn new() -> Self {
            Self {
                certificate: Certificate::generate().unwrap(),
                transcript: Vec::new(),
                server_random: [0; 32],
                server_public: None,
                master_secret: [0; 48],
                cipher: None,
            }
        }

        fn client_hello(&mut self, profiles: &[u16]) -> Vec<u8> {
            let msg = Message::new(handshake::CLIENT_HELLO, 0, client_hello_body(profiles)).encode();
            self.transcript.extend_from_slice(&msg);
            record::encode_record(CONTENT_HANDSHAKE, 0, 0, &msg)
        }

        fn read_server_flight(&mut self, datagram: &[u8]) {
            for rec in parse_records(datagram).unwrap() {
                for frag in handshake::parse_fragments(rec.fragment).unwrap() {
                    let msg = Message::new(frag.msg_type, frag.message_seq, frag.body.to_vec());
                    self.transcript.extend(msg.encode());
                    match frag.msg_type {
                        handshake::SERVER_HELLO => {
                            self.server_random.copy_from_slice(&frag.body[2..34]);
                        }
                        handshake::SERVER_KEY_EXCHANGE => {
                            let len = frag.body[3] as usize;
                            self.server_public =
                                Some(PublicKey::from_sec1_bytes(&frag.body[4..4 + len]).unwrap());
                        }
                        _ => {}
                    }
                }
            }
        }

        fn second_flight(&mut self) -> Vec<u8> {
            let secret = EphemeralSecret::random(&mut OsRng);
            let public = secret.public_key().to_encoded_point(false);
            let shared = secret.diffie_hellman(self.server_public.as_ref().unwrap());
            let client_random = [0xAB; 32];
            let seed = [client_random, self.server_random].concat();
            let master = prf(shared.raw_secret_bytes().as_slice(), "master secret", &seed, 48).unwrap();
            self.master_secret.copy_from_slice(&master);
            let seed = [self.server_random, client_random].concat();
            let block = prf(&self.master_secret, "key expansion", &seed, 40).unwrap();
            let (client_keys, server_keys): (WriteKeys, WriteKeys) =
                record::split_key_block(&block).unwrap();
            self.cipher = Some(RecordCipher::new(client_keys, server_keys));

            let cert = Message::new(
                handshake::CERTIFICATE,
                1,
                handshake::certificate(self.certificate.der()),
            )
            .encode();
            let mut cke_body: Vec<u8> = Vec::new();
            cke_body.put_u8(65);
            cke_body.put_slice(public.as_bytes());
            let cke = Message::new(handshake::CLIENT_KEY_EXCHANGE, 2, cke_body).encode();
            let verify = Message::new(handshake::CERTIFICATE_VERIFY, 3, vec![4, 3, 0, 0]).encode();
            for m in [&cert, &cke, &verify] {
                self.transcript.extend_from_slice(m);
            }

            let verify_data = prf(
                &self.master_secret,
                "client finished",
                &sha256(&self.transcript),
                12,
            )
            .unwrap();
            let finished = Message::new(handshake::FINISHED, 4, verify_data).encode();
            self.transcript.extend_from_slice(&finished);

            let mut datagram = record::encode_record(CONTENT_HANDSHAKE, 0, 1, &cert);
            datagram.extend(record::encode_record(CONTENT_HANDSHAKE, 0, 2, &cke));
            datagram.extend(record::encode_record(CONTENT_HANDSHAKE, 0, 3, &verify));
            datagram.extend(record::encode_record(CONTENT_CHANGE_CIPHER_SPEC, 0, 4, &[1]));
            let sealed = self
                .cipher
                .as_ref()
                .unwrap()
                .seal(CONTENT_HANDSHAKE, 1, 0, &finished)
                .unwrap();
            datagram.extend(sealed);
            datagram
        }

        /// Check the server's CCS + Finished.
        fn verify_server_finished(&self, datagram: &[u8]) {
            let records = parse_records(datagram).unwrap();
            assert_eq!(records.len(), 2);
            assert_eq!(records[0].content_type, CONTENT_CHANGE_CIPHER_SPEC);
            assert_eq!(records[1].epoch, 1);
            let plain = self.cipher.as_ref().unwrap().open(&records[1]).unwrap();
            let frag = &handshake::parse_fragments(&plain).unwrap()[0];
            assert_eq!(frag.msg_type, handshake::FINISHED);
            assert_eq!(frag.message_seq, 5);
            let expected = prf(
                &self.master_secret,
                "server finished",
                &sha256(&self.transcript),
                12,
            )
            .unwrap();
            assert_eq!(frag.body, expected.as_slice());
        }
    }

    fn server_for(client: &TestClient) -> DtlsContext {
        let server_cert = Arc::new(Certificate::generate().unwrap());
        DtlsContext::new(
            server_cert,
            Some(client.certificate.fingerprint().to_lowercase()),
            None,
        )
    }

    #[test]
    fn test_full_handshake() {
        let mut client = TestClient::new();
        let mut server = server_for(&client);
        let now = Instant::now();

        server.handle_datagram(&client.client_hello(&[0x0001]), now).unwrap();
        assert_eq!(server.state(), DtlsState::AwaitClientFinished);
        let flight = server.poll_output().unwrap();
        assert!(server.poll_output().is_none());
        let records = parse_records(&flight).unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[4].sequence, 4);
        client.read_server_flight(&flight);

        server.handle_datagram(&client.second_flight(), now).unwrap();
        assert!(server.is_established());
        assert!(server.poll_timeout().is_none());
        client.verify_server_finished(&server.poll_output().unwrap());

        match server.poll_event() {
            Some(DtlsEvent::ParamsReady(params)) => {
                assert_eq!(params.master_secret, client.master_secret);
                assert_eq!(params.client_random, [0xAB; 32]);
                assert_eq!(params.server_random, client.server_random);
                assert_eq!(params.srtp_profile, SrtpProfile::Aes128CmHmacSha1_80);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_gcm_profile_when_only_choice() {
        let mut client = TestClient::new();
        let mut server = server_for(&client);
        let now = Instant::now();
        server.handle_datagram(&client.client_hello(&[0x0007]), now).unwrap();
        client.read_server_flight(&server.poll_output().unwrap());
        server.handle_datagram(&client.second_flight(), now).unwrap();
        server.poll_output().unwrap();
        match server.poll_event() {
            Some(DtlsEvent::ParamsReady(params)) => {
                assert_eq!(params.srtp_profile, SrtpProfile::AeadAes128Gcm)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_no_common_srtp_profile_fails() {
        let mut client = TestClient::new();
        let mut server = server_for(&client);
        let err = server
            .handle_datagram(&client.client_hello(&[0x0002]), Instant::now())
            .unwrap_err();
        assert!(matches!(err, Error::HandshakeFailure(_)));
        assert_eq!(server.state(), DtlsState::Failed);
    }

    #[test]
    fn test_fingerprint_mismatch_fails() {
        let mut client = TestClient::new();
        let other = TestClient::new();
        let mut server = server_for(&other);
        let now = Instant::now();
        server.handle_datagram(&client.client_hello(&[0x0001]), now).unwrap();
        client.read_server_flight(&server.poll_output().unwrap());
        assert!(server.handle_datagram(&client.second_flight(), now).is_err());
        assert_eq!(server.state(), DtlsState::Failed);
        assert!(server.poll_event().is_none());
    }

    #[test]
    fn test_bad_finished_fails() {
        let mut client = TestClient::new();
        let mut server = server_for(&client);
        let now = Instant::now();
        server.handle_datagram(&client.client_hello(&[0x0001]), now).unwrap();
        client.read_server_flight(&server.poll_output().unwrap());
        // Corrupt the transcript so verify_data comes out wrong
        client.transcript.push(0);
        assert!(server.handle_datagram(&client.second_flight(), now).is_err());
        assert_eq!(server.state(), DtlsState::Failed);
    }

    #[test]
    fn test_retransmitted_client_hello_replays_flight() {
        let mut client = TestClient::new();
        let mut server = server_for(&client);
        let now = Instant::now();
        let hello = client.client_hello(&[0x0001]);
        server.handle_datagram(&hello, now).unwrap();
        let first = server.poll_output().unwrap();

        server.handle_datagram(&hello, now).unwrap();
        let second = server.poll_output().unwrap();
        assert_eq!(first.len(), second.len());
        // Same messages, fresh record sequence numbers
        let records = parse_records(&second).unwrap();
        assert_eq!(records[0].sequence, 5);
        assert_eq!(records[0].fragment, parse_records(&first).unwrap()[0].fragment);
        assert_eq!(server.state(), DtlsState::AwaitClientFinished);
    }

    /// Run a full handshake and drain its output and events.
    fn established(client: &mut TestClient) -> DtlsContext {
        let mut server = server_for(client);
        let now = Instant::now();
        server.handle_datagram(&client.client_hello(&[0x0001]), now).unwrap();
        client.read_server_flight(&server.poll_output().unwrap());
        server.handle_datagram(&client.second_flight(), now).unwrap();
        while server.poll_output().is_some() {}
        assert!(matches!(server.poll_event(), Some(DtlsEvent::ParamsReady(_))));
        server
    }

    #[test]
    fn test_plaintext_alert_after_key_exchange_ignored() {
        let mut client = TestClient::new();
        let mut server = established(&mut client);
        let now = Instant::now();

        let spoofed = record::encode_record(CONTENT_ALERT, 0, 9, &[1, 0]);
        server.handle_datagram(&spoofed, now).unwrap();
        assert!(server.poll_event().is_none());
        assert!(server.is_established());

        // The same close_notify under the epoch 1 keys closes the association
        let sealed = client
            .cipher
            .as_ref()
            .unwrap()
            .seal(CONTENT_ALERT, 1, 1, &[1, 0])
            .unwrap();
        server.handle_datagram(&sealed, now).unwrap();
        assert!(matches!(server.poll_event(), Some(DtlsEvent::Closed)));
        assert_eq!(server.state(), DtlsState::Closed);
    }

    #[test]
    fn test_warning_alert_does_not_close() {
        let mut client = TestClient::new();
        let mut server = established(&mut client);
        // Warning-level no_renegotiation
        let sealed = client
            .cipher
            .as_ref()
            .unwrap()
            .seal(CONTENT_ALERT, 1, 1, &[1, 100])
            .unwrap();
        server.handle_datagram(&sealed, Instant::now()).unwrap();
        assert!(server.poll_event().is_none());
        assert!(server.is_established());
    }

    #[test]
    fn test_malformed_datagram_keeps_established_session() {
        let mut client = TestClient::new();
        let mut server = established(&mut client);
        let err = server
            .handle_datagram(&[0x16, 0xfe, 0xfd], Instant::now())
            .unwrap_err();
        assert!(matches!(err, Error::MalformedPacket(_)));
        assert!(server.is_established());
        assert!(server.poll_event().is_none());
    }

    #[test]
    fn test_stray_handshake_message_after_completion_ignored() {
        let mut client = TestClient::new();
        let mut server = established(&mut client);
        let stray = Message::new(handshake::CLIENT_KEY_EXCHANGE, 5, vec![0]).encode();
        let datagram = record::encode_record(CONTENT_HANDSHAKE, 0, 10, &stray);
        server.handle_datagram(&datagram, Instant::now()).unwrap();
        assert!(server.is_established());
    }

    #[test]
    fn test_retransmit_timer_backoff_and_give_up() {
        let mut client = TestClient::new();
        let mut server = server_for(&client);
        let start = Instant::now();
        server.handle_datagram(&client.client_hello(&[0x0001]), start).unwrap();
        server.poll_output().unwrap();

        assert_eq!(server.poll_timeout(), Some(start + Duration::from_secs(1)));
        let mut now = start;
        for _ in 0..MAX_RETRANSMITS {
            now = server.poll_timeout().unwrap();
            server.handle_timeout(now).unwrap();
            assert!(server.poll_output().is_some());
        }
        assert_eq!(server.poll_timeout(), Some(now + Duration::from_secs(64)));
        now = server.poll_timeout().unwrap();
        assert!(server.handle_timeout(now).is_err());
        assert_eq!(server.state(), DtlsState::Failed);
        assert!(server.poll_timeout().is_none());
    }

    #[test]
    fn test_key_log_line() {
        let dir = std::env::temp_dir().join(format!("sfu-keylog-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("keylog.log");
        let _ = std::fs::remove_file(&path);

        let mut client = TestClient::new();
        let mut server = DtlsContext::new(
            Arc::new(Certificate::generate().unwrap()),
            Some(client.certificate.fingerprint().to_string()),
            Some(path.clone()),
        );
        let now = Instant::now();
        server.handle_datagram(&client.client_hello(&[0x0001]), now).unwrap();
        client.read_server_flight(&server.poll_output().unwrap());
        server.handle_datagram(&client.second_flight(), now).unwrap();

        let log = std::fs::read_to_string(&path).unwrap();
        let expected = format!(
            "CLIENT_RANDOM {} {}\n",
            to_hex(&[0xAB; 32]),
            to_hex(&client.master_secret)
        );
        assert_eq!(log, expected);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_server_key_exchange_signature() {
        let mut client = TestClient::new();
        let mut server = server_for(&client);
        let verifying_key = server.certificate.signing_key().verifying_key().clone();
        server
            .handle_datagram(&client.client_hello(&[0x0001]), Instant::now())
            .unwrap();
        let flight = server.poll_output().unwrap();
        client.read_server_flight(&flight);

        let records = parse_records(&flight).unwrap();
        let ske = &handshake::parse_fragments(records[2].fragment).unwrap()[0];
        assert_eq!(ske.msg_type, handshake::SERVER_KEY_EXCHANGE);
        let params = &ske.body[..4 + 65];
        assert_eq!(&params[..4], &[3, 0, 0x17, 65]);
        assert_eq!(&ske.body[69..71], &[4, 3]);
        let sig_len = u16::from_be_bytes([ske.body[71], ske.body[72]]) as usize;
        let signature = Signature::from_der(&ske.body[73..73 + sig_len]).unwrap();

        let signed = [[0xAB; 32].as_slice(), client.server_random.as_slice(), params].concat();
        verifying_key.verify(&signed, &signature).unwrap();
    }
}
