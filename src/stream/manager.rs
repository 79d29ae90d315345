use super::state::{
    transition, ConnectionEvent, ConnectionState, ConnectionStatus, Effect, EventKind, Input,
    ReconnectPolicy,
};
use super::transport::{StreamTarget, Transport, TransportFrame, TransportSession, WebSocketTransport};
use crate::error::StreamError;
use crate::events::{HandlerId, SubscriberRegistry};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Owns one logical push stream. Cloning shares the same stream.
///
/// Lifecycle: create, `connect`, `disconnect`, drop. `connect` spawns the
/// driver onto the current tokio runtime. Call `disconnect` before dropping
/// the last handle; the driver keeps the stream alive otherwise.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    events: SubscriberRegistry<EventKind, ConnectionEvent>,
    control: Mutex<Control>,
}

#[derive(Default)]
struct Control {
    state: ConnectionState,
    target: Option<StreamTarget>,
    cancel: Option<CancellationToken>,
}

impl ConnectionManager {
    pub fn new(transport: impl Transport, policy: ReconnectPolicy) -> Self {
        Self::with_shared_transport(Arc::new(transport), policy)
    }

    pub fn with_shared_transport(transport: Arc<dyn Transport>, policy: ReconnectPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                policy,
                events: SubscriberRegistry::new(),
                control: Mutex::new(Control::default()),
            }),
        }
    }

    pub fn websocket(url: Url, policy: ReconnectPolicy) -> Self {
        Self::new(WebSocketTransport::new(url), policy)
    }

    /// No-op while connecting, open or waiting to reconnect. From idle,
    /// closed or failed it starts a fresh driver with a reset attempt count.
    pub fn connect(
        &self,
        credential: impl Into<String>,
        company_lab: impl Into<String>,
        machine_id: impl Into<String>,
    ) {
        let target = StreamTarget::new(credential, company_lab, machine_id);
        let (effects, cancel) = {
            let mut control = self.inner.lock();
            if control.state.status.is_active() {
                if control.target.as_ref() != Some(&target) {
                    tracing::warn!(
                        active = ?control.target,
                        requested = ?target,
                        "connect ignored; stream already active"
                    );
                }
                return;
            }
            let effects = self.inner.apply(&mut control, Input::ConnectRequested);
            let cancel = CancellationToken::new();
            if let Some(previous) = control.cancel.replace(cancel.clone()) {
                previous.cancel();
            }
            control.target = Some(target.clone());
            (effects, cancel)
        };

        let remaining = self.inner.dispatch(effects);
        if remaining.contains(&Effect::OpenTransport) {
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.drive(target, cancel).await });
        }
    }

    /// Closes the stream and cancels any pending reconnect. Safe to call at
    /// any time, repeatedly, and from inside an event handler.
    pub fn disconnect(&self) {
        let effects = {
            let mut control = self.inner.lock();
            if let Some(cancel) = control.cancel.take() {
                cancel.cancel();
            }
            self.inner.apply(&mut control, Input::DisconnectRequested)
        };
        self.inner.dispatch(effects);
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, handler)
    }

    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        self.inner.events.off(&kind, id)
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Open
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock().state.status
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state.clone()
    }

    pub fn target(&self) -> Option<StreamTarget> {
        self.inner.lock().target.clone()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn apply(&self, control: &mut Control, input: Input) -> Vec<Effect> {
        let (next, effects) = transition(&control.state, input, &self.policy);
        if next.status != control.state.status {
            tracing::debug!(
                from = control.state.status.as_str(),
                to = next.status.as_str(),
                attempt = next.attempt,
                target = ?control.target,
                "stream state transition"
            );
        }
        control.state = next;
        effects
    }

    /// Applies `input` unless this driver has been cancelled.
    fn step(&self, cancel: &CancellationToken, input: Input) -> Option<Vec<Effect>> {
        let effects = {
            let mut control = self.lock();
            if cancel.is_cancelled() {
                return None;
            }
            self.apply(&mut control, input)
        };
        Some(self.dispatch(effects))
    }

    /// Emits events outside the lock and hands back the remaining effects.
    fn dispatch(&self, effects: Vec<Effect>) -> Vec<Effect> {
        let mut remaining = Vec::with_capacity(effects.len());
        for effect in effects {
            match effect {
                Effect::Emit(event) => {
                    self.events.emit(&event.kind(), &event);
                }
                other => remaining.push(other),
            }
        }
        remaining
    }

    async fn drive(self: Arc<Self>, target: StreamTarget, cancel: CancellationToken) {
        loop {
            let opened = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.transport.open(&target) => result,
            };

            let after = match opened {
                Ok(session) => match self.step(&cancel, Input::Opened) {
                    Some(effects) if !effects.contains(&Effect::CloseTransport) => {
                        tracing::info!(
                            company_lab = %target.company_lab,
                            machine = %target.machine_id,
                            "stream open"
                        );
                        self.pump(session, &cancel).await
                    }
                    _ => {
                        session.close().await;
                        return;
                    }
                },
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        company_lab = %target.company_lab,
                        machine = %target.machine_id,
                        "stream connect failed"
                    );
                    self.step(&cancel, Input::TransportFailed(err))
                }
            };

            let Some(delay) = after.as_deref().and_then(reconnect_delay) else {
                return;
            };
            let attempt = self.lock().state.attempt;
            tracing::info!(
                delay_ms = delay.as_millis() as u64,
                attempt,
                machine = %target.machine_id,
                "stream reconnect scheduled"
            );
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.step(&cancel, Input::ReconnectDue) {
                Some(effects) if effects.contains(&Effect::OpenTransport) => continue,
                _ => return,
            }
        }
    }

    /// Delivers frames until the transport closes, fails or we are cancelled.
    async fn pump(
        &self,
        mut session: TransportSession,
        cancel: &CancellationToken,
    ) -> Option<Vec<Effect>> {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => None,
                frame = session.next_frame() => Some(frame),
            };
            let Some(frame) = frame else {
                session.close().await;
                return None;
            };

            match frame {
                Some(TransportFrame::Text(text)) => self.deliver(cancel, text.into_bytes()),
                Some(TransportFrame::Binary(bytes)) => self.deliver(cancel, bytes),
                Some(TransportFrame::Closed { code, reason }) => {
                    tracing::info!(code = ?code, reason = %reason, "stream closed by remote");
                    return self.step(cancel, Input::Closed { code, reason });
                }
                Some(TransportFrame::Failed(err)) => {
                    tracing::warn!(error = %err, "stream transport failed");
                    return self.step(cancel, Input::TransportFailed(err));
                }
                None => {
                    return self.step(
                        cancel,
                        Input::Closed {
                            code: None,
                            reason: "stream ended".to_string(),
                        },
                    );
                }
            }
        }
    }

    fn deliver(&self, cancel: &CancellationToken, mut bytes: Vec<u8>) {
        if cancel.is_cancelled() {
            return;
        }
        let event = match simd_json::serde::from_slice::<Value>(&mut bytes) {
            Ok(value) => ConnectionEvent::Data(value),
            Err(err) => {
                tracing::warn!(error = %err, len = bytes.len(), "dropping undecodable frame");
                ConnectionEvent::Error(StreamError::Decode(err.to_string()))
            }
        };
        self.events.emit(&event.kind(), &event);
    }
}

fn reconnect_delay(effects: &[Effect]) -> Option<Duration> {
    effects.iter().find_map(|effect| match effect {
        Effect::ScheduleReconnect(delay) => Some(*delay),
        _ => None,
    })
}
