use crate::error::StreamError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

const CLIENT_CLOSE_CODE: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Open,
    Closed,
    Reconnecting,
    Failed,
}

impl ConnectionStatus {
    /// A driver task owns the stream in these states.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connecting | ConnectionStatus::Open | ConnectionStatus::Reconnecting
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Open => "open",
            ConnectionStatus::Closed => "closed",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Consecutive failed connections since the last successful open.
    pub attempt: u32,
    pub last_error: Option<StreamError>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Idle,
            attempt: 0,
            last_error: None,
        }
    }
}

/// Fixed-delay retry policy. `max_attempts` bounds consecutive failures; the
/// failure that reaches it is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RECONNECT_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    Data,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Disconnect {
    pub code: Option<u16>,
    pub reason: String,
    pub initiated_by_client: bool,
    pub will_reconnect: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected(Disconnect),
    /// Decoded frame, not yet normalized.
    Data(Value),
    Error(StreamError),
}

impl ConnectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConnectionEvent::Connected => EventKind::Connected,
            ConnectionEvent::Disconnected(_) => EventKind::Disconnected,
            ConnectionEvent::Data(_) => EventKind::Data,
            ConnectionEvent::Error(_) => EventKind::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    ConnectRequested,
    Opened,
    Closed { code: Option<u16>, reason: String },
    TransportFailed(StreamError),
    ReconnectDue,
    DisconnectRequested,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    OpenTransport,
    CloseTransport,
    ScheduleReconnect(Duration),
    CancelReconnect,
    Emit(ConnectionEvent),
}

/// Pure lifecycle transition. Inputs that do not apply to the current status
/// leave the state untouched and produce no effects, except a late `Opened`
/// which asks for the stray transport to be closed.
///
/// A remote close or transport failure passes through `Closed` within a
/// single step: the returned state is already `Reconnecting` (or `Failed`
/// once the budget is spent), and the close itself is reported through the
/// emitted `Disconnected` event. `Closed` is only observable as a resting
/// status after a caller-initiated disconnect.
pub fn transition(
    state: &ConnectionState,
    input: Input,
    policy: &ReconnectPolicy,
) -> (ConnectionState, Vec<Effect>) {
    use ConnectionStatus::*;

    match (state.status, input) {
        (Idle | Closed | Failed, Input::ConnectRequested) => (
            ConnectionState {
                status: Connecting,
                attempt: 0,
                last_error: None,
            },
            vec![Effect::OpenTransport],
        ),
        (Connecting, Input::Opened) => (
            ConnectionState {
                status: Open,
                attempt: 0,
                last_error: None,
            },
            vec![Effect::Emit(ConnectionEvent::Connected)],
        ),
        (_, Input::Opened) => (state.clone(), vec![Effect::CloseTransport]),
        (Open | Connecting, Input::Closed { code, reason }) => {
            dropped(state, code, reason, Vec::new(), state.last_error.clone(), policy)
        }
        (Open | Connecting, Input::TransportFailed(err)) => {
            let reason = err.to_string();
            let effects = vec![Effect::Emit(ConnectionEvent::Error(err.clone()))];
            dropped(state, None, reason, effects, Some(err), policy)
        }
        (Reconnecting, Input::ReconnectDue) => (
            ConnectionState {
                status: Connecting,
                ..state.clone()
            },
            vec![Effect::OpenTransport],
        ),
        (status, Input::DisconnectRequested) => {
            let mut effects = Vec::new();
            if status.is_active() {
                effects.push(Effect::CancelReconnect);
                effects.push(Effect::CloseTransport);
            }
            if status == Open {
                effects.push(Effect::Emit(ConnectionEvent::Disconnected(Disconnect {
                    code: Some(CLIENT_CLOSE_CODE),
                    reason: "client disconnect".to_string(),
                    initiated_by_client: true,
                    will_reconnect: false,
                })));
            }
            (
                ConnectionState {
                    status: Closed,
                    attempt: 0,
                    last_error: state.last_error.clone(),
                },
                effects,
            )
        }
        _ => (state.clone(), Vec::new()),
    }
}

fn dropped(
    state: &ConnectionState,
    code: Option<u16>,
    reason: String,
    mut effects: Vec<Effect>,
    last_error: Option<StreamError>,
    policy: &ReconnectPolicy,
) -> (ConnectionState, Vec<Effect>) {
    let attempt = state.attempt.saturating_add(1);
    let will_reconnect = attempt < policy.max_attempts;

    effects.push(Effect::Emit(ConnectionEvent::Disconnected(Disconnect {
        code,
        reason,
        initiated_by_client: false,
        will_reconnect,
    })));

    if will_reconnect {
        effects.push(Effect::ScheduleReconnect(policy.delay));
        return (
            ConnectionState {
                status: ConnectionStatus::Reconnecting,
                attempt,
                last_error,
            },
            effects,
        );
    }

    let exhausted = StreamError::ReconnectExhausted { attempts: attempt };
    effects.push(Effect::Emit(ConnectionEvent::Error(exhausted.clone())));
    (
        ConnectionState {
            status: ConnectionStatus::Failed,
            attempt,
            last_error: Some(exhausted),
        },
        effects,
    )
}
