//! EncryptedChannel - Drives a [`SecureSession`] over a [`Transport`]
//!
//! Lifecycle: `connecting -> open -> closing -> closed`. Opening runs the
//! handshake under a deadline; a failed or late handshake closes the
//! transport with a protocol-error code. After an abnormal closure a channel
//! created through a [`Connector`] reconnects with exponential backoff and
//! runs a fresh handshake each time.

use crate::crypto::{b64_decode, b64_encode};
use crate::error::{ChannelError, Result};
use crate::metrics::{EncryptionMetrics, MetricsSnapshot};
use crate::reconnect::Backoff;
use crate::session::{HandshakeState, Role, SecureSession, SessionInfo};
use crate::transport::{close_code, is_clean_close, Connector, Frame, Transport};
use crate::wire::{DataMessage, Envelope};
use parking_lot::Mutex;
use serde::Serialize;
use shared::{Clock, EncryptionConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Notifications for observers of a channel
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Secured(Arc<SessionInfo>),
    KeyRotated { key_id: String },
    DecryptionFailed { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    Closed { code: u16, reason: String },
}

pub struct EncryptedChannel {
    role: Role,
    config: EncryptionConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<ChannelState>,
    session: Mutex<SecureSession>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    connector: Option<Arc<dyn Connector>>,
    metrics: EncryptionMetrics,
    /// Serializes encrypt+send against rotate+announce
    outbound: tokio::sync::Mutex<()>,
    inbox_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    inbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    events: broadcast::Sender<ChannelEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed_locally: AtomicBool,
    /// Set once the terminal `Closed` event has gone out
    finished: AtomicBool,
}

impl EncryptedChannel {
    fn build(
        role: Role,
        config: EncryptionConfig,
        clock: Arc<dyn Clock>,
        connector: Option<Arc<dyn Connector>>,
    ) -> Result<Self> {
        let session = SecureSession::new(role, config.clone(), clock.clone())?;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);

        Ok(Self {
            role,
            config,
            clock,
            state: Mutex::new(ChannelState::Connecting),
            session: Mutex::new(session),
            transport: Mutex::new(None),
            connector,
            metrics: EncryptionMetrics::new(),
            outbound: tokio::sync::Mutex::new(()),
            inbox_tx: Mutex::new(Some(inbox_tx)),
            inbox_rx: tokio::sync::Mutex::new(inbox_rx),
            events,
            tasks: Mutex::new(Vec::new()),
            closed_locally: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        })
    }

    /// Secure an already-connected transport. No reconnection.
    pub async fn open(
        transport: Arc<dyn Transport>,
        role: Role,
        config: EncryptionConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        let channel = Arc::new(Self::build(role, config, clock, None)?);
        channel.establish(transport, false).await?;
        channel.start();
        Ok(channel)
    }

    /// Connect through `connector` and reconnect on abnormal closure
    pub async fn connect(
        connector: Arc<dyn Connector>,
        role: Role,
        config: EncryptionConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        let channel = Arc::new(Self::build(role, config, clock, Some(connector.clone()))?);
        let transport = connector.connect().await?;
        channel.establish(transport, false).await?;
        channel.start();
        Ok(channel)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.session.lock().state()
    }

    pub fn session_info(&self) -> Option<Arc<SessionInfo>> {
        self.session.lock().info()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Encrypt and send application data
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        if self.state() != ChannelState::Open {
            return Err(ChannelError::NotSecured);
        }
        let _outbound = self.outbound.lock().await;

        let keys = self.session.lock().keys().ok_or(ChannelError::NotSecured)?;
        let transport = self.current_transport().ok_or(ChannelError::NotSecured)?;

        let started = Instant::now();
        let sealed = match keys.encrypt(payload) {
            Ok(sealed) => sealed,
            Err(e) => {
                self.metrics.record_encrypt_error();
                return Err(e);
            }
        };
        self.metrics.record_encrypt(payload.len(), started.elapsed());

        let frame = if self.config.binary_frames {
            Frame::Binary(sealed)
        } else {
            Frame::Text(
                Envelope::Data(DataMessage {
                    key_id: keys.current_key_id().to_string(),
                    payload: b64_encode(&sealed),
                })
                .to_text()?,
            )
        };
        transport.send(frame).await
    }

    /// Serialize `value` as JSON and send it encrypted
    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| ChannelError::Encryption(e.to_string()))?;
        self.send(&bytes).await
    }

    /// Next decrypted message; `None` once the channel is closed for good
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.inbox_rx.lock().await.recv().await
    }

    /// Rotate the session key now and announce it to the peer
    pub async fn rotate_key(&self) -> Result<String> {
        let _outbound = self.outbound.lock().await;
        let transport = self.current_transport().ok_or(ChannelError::NotSecured)?;

        let rotation = self.session.lock().rotate()?;
        let key_id = rotation.key_id.clone();
        transport
            .send(Frame::Text(Envelope::KeyRotation(rotation).to_text()?))
            .await?;

        self.metrics.record_rotation();
        let _ = self.events.send(ChannelEvent::KeyRotated {
            key_id: key_id.clone(),
        });
        Ok(key_id)
    }

    /// Close the channel; no reconnection follows
    pub async fn close(&self, code: u16, reason: &str) {
        if !self.finished.load(Ordering::SeqCst) {
            self.closed_locally.store(true, Ordering::SeqCst);
            self.set_state(ChannelState::Closing);

            let transport = self.transport.lock().take();
            if let Some(transport) = transport {
                let _ = transport.close(code, reason).await;
            }
            self.finish(code, reason);
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
    }

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().clone()
    }

    fn finish(&self, code: u16, reason: &str) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ChannelState::Closed);
        self.inbox_tx.lock().take();
        info!(code, reason, "channel closed");
        let _ = self.events.send(ChannelEvent::Closed {
            code,
            reason: reason.to_string(),
        });
    }

    fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        let reader = Arc::clone(self);
        tasks.push(tokio::spawn(async move { reader.run().await }));

        if self.role == Role::Initiator && self.config.rotation_interval_secs > 0 {
            let weak = Arc::downgrade(self);
            let period = Duration::from_secs(self.config.rotation_interval_secs);
            tasks.push(tokio::spawn(rotation_timer(weak, period)));
        }
    }

    async fn establish(&self, transport: Arc<dyn Transport>, reconnecting: bool) -> Result<()> {
        self.set_state(ChannelState::Connecting);
        *self.transport.lock() = Some(transport.clone());

        let deadline = self.config.handshake_timeout();
        let result = match tokio::time::timeout(deadline, self.handshake(transport.as_ref())).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Handshake(format!(
                "no handshake within {}ms",
                deadline.as_millis()
            ))),
        };

        match result {
            Ok(()) => {
                self.set_state(ChannelState::Open);
                self.metrics.record_handshake();
                if reconnecting {
                    self.metrics.record_reconnect();
                }
                let info = self.session.lock().info();
                if let Some(info) = info {
                    let _ = self.events.send(ChannelEvent::Secured(info));
                }
                Ok(())
            }
            Err(err) => {
                let err = match err {
                    ChannelError::Handshake(_) => err,
                    other => ChannelError::Handshake(other.to_string()),
                };
                warn!(error = %err, "handshake failed, closing transport");
                let _ = transport.close(close_code::PROTOCOL_ERROR, &err.to_string()).await;
                self.transport.lock().take();
                self.session.lock().reset();
                self.set_state(ChannelState::Closed);
                Err(err)
            }
        }
    }

    async fn handshake(&self, transport: &dyn Transport) -> Result<()> {
        match self.role {
            Role::Initiator => {
                let init = self.session.lock().begin()?;
                transport
                    .send(Frame::Text(Envelope::HandshakeInit(init).to_text()?))
                    .await?;

                match next_envelope(transport).await? {
                    Envelope::HandshakeResponse(response) => self.session.lock().complete(response),
                    other => Err(ChannelError::Handshake(format!(
                        "expected handshake-response, got {}",
                        other.kind()
                    ))),
                }
            }
            Role::Responder => match next_envelope(transport).await? {
                Envelope::HandshakeInit(init) => {
                    let response = self.session.lock().accept(init)?;
                    transport
                        .send(Frame::Text(Envelope::HandshakeResponse(response).to_text()?))
                        .await
                }
                other => Err(ChannelError::Handshake(format!(
                    "expected handshake-init, got {}",
                    other.kind()
                ))),
            },
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            let Some(transport) = self.current_transport() else {
                break;
            };
            let (code, reason) = self.read_until_closed(transport.as_ref()).await;
            if self.closed_locally.load(Ordering::SeqCst) {
                break;
            }
            self.transport.lock().take();

            let can_reconnect = self.config.reconnect.enabled && self.connector.is_some();
            if is_clean_close(code) || !can_reconnect {
                self.finish(code, &reason);
                break;
            }

            warn!(code, reason = %reason, "channel dropped, reconnecting");
            if !self.reconnect().await {
                if !self.closed_locally.load(Ordering::SeqCst) {
                    self.finish(close_code::ABNORMAL, "reconnection failed");
                }
                break;
            }
        }
    }

    async fn read_until_closed(&self, transport: &dyn Transport) -> (u16, String) {
        loop {
            match transport.recv().await {
                Some(Frame::Text(text)) => {
                    if let Some(closed) = self.handle_text(&text) {
                        return closed;
                    }
                }
                Some(Frame::Binary(bytes)) => self.handle_ciphertext(&bytes, None),
                Some(Frame::Close { code, reason }) => return (code, reason),
                None => return (close_code::ABNORMAL, "transport dropped".to_string()),
            }
        }
    }

    /// Returns the close code and reason if the peer sent a `close` envelope
    fn handle_text(&self, text: &str) -> Option<(u16, String)> {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "ignoring malformed control message");
                return None;
            }
        };

        match envelope {
            Envelope::Data(data) => match b64_decode(&data.payload, "payload") {
                Ok(bytes) => self.handle_ciphertext(&bytes, Some(&data.key_id)),
                Err(e) => self.decryption_failed(e),
            },
            Envelope::KeyRotation(rotation) => {
                let key_id = rotation.key_id.clone();
                let applied = self.session.lock().apply_rotation(rotation);
                match applied {
                    Ok(true) => {
                        self.metrics.record_rotation();
                        let _ = self.events.send(ChannelEvent::KeyRotated { key_id });
                    }
                    Ok(false) => debug!(key_id = %key_id, "peer rotation superseded by ours"),
                    Err(e) => warn!(error = %e, "rejected key rotation"),
                }
            }
            Envelope::Close(close) => return Some((close.code, close.reason)),
            other => debug!(kind = other.kind(), "ignoring handshake message on secured channel"),
        }
        None
    }

    fn handle_ciphertext(&self, sealed: &[u8], key_id: Option<&str>) {
        let Some(keys) = self.session.lock().keys() else {
            self.decryption_failed(ChannelError::NotSecured);
            return;
        };

        let started = Instant::now();
        match keys.decrypt(sealed, key_id, self.clock.now()) {
            Ok(plain) => {
                self.metrics.record_decrypt(plain.len(), started.elapsed());
                if let Some(tx) = self.inbox_tx.lock().as_ref() {
                    let _ = tx.send(plain);
                }
            }
            Err(e) => self.decryption_failed(e),
        }
    }

    fn decryption_failed(&self, err: ChannelError) {
        self.metrics.record_decrypt_error();
        warn!(error = %err, "dropping undecryptable message");
        let _ = self.events.send(ChannelEvent::DecryptionFailed {
            reason: err.to_string(),
        });
    }

    async fn reconnect(&self) -> bool {
        let Some(connector) = self.connector.clone() else {
            return false;
        };
        let mut backoff = Backoff::new(&self.config.reconnect);

        while let Some(delay) = backoff.next_delay() {
            let attempt = backoff.attempts();
            let _ = self.events.send(ChannelEvent::Reconnecting { attempt, delay });
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
            tokio::time::sleep(delay).await;

            if self.closed_locally.load(Ordering::SeqCst) {
                return false;
            }

            match connector.connect().await {
                Ok(transport) => match self.establish(transport, true).await {
                    Ok(()) => return true,
                    Err(e) => warn!(attempt, error = %e, "reconnect handshake failed"),
                },
                Err(e) => warn!(attempt, error = %e, "reconnect failed"),
            }
        }
        false
    }
}

impl Drop for EncryptedChannel {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn next_envelope(transport: &dyn Transport) -> Result<Envelope> {
    match transport.recv().await {
        Some(Frame::Text(text)) => Envelope::parse(&text).map_err(|e| ChannelError::Handshake(e.to_string())),
        Some(Frame::Binary(_)) => Err(ChannelError::Handshake("binary frame before handshake".to_string())),
        Some(Frame::Close { code, reason }) => Err(ChannelError::Handshake(format!(
            "peer closed ({code}) during handshake: {reason}"
        ))),
        None => Err(ChannelError::Handshake("transport dropped during handshake".to_string())),
    }
}

async fn rotation_timer(channel: Weak<EncryptedChannel>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(channel) = channel.upgrade() else {
            break;
        };
        if channel.state() != ChannelState::Open {
            continue;
        }
        if let Err(e) = channel.rotate_key().await {
            warn!(error = %e, "scheduled key rotation failed");
        }
    }
}
