mod manager;
mod state;
mod transport;


pub use manager::ConnectionManager;
pub use state::{
    transition, ConnectionEvent, ConnectionState, ConnectionStatus, Disconnect, Effect, EventKind,
    Input, ReconnectPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_RECONNECT_DELAY,
};
pub use transport::{StreamTarget, Transport, TransportFrame, TransportSession, WebSocketTransport};
