// jumpgate-session: per-session state and the session multiplexer
//
// A session owns everything attached to one live connection: the channel
// bundle wiring producers to the multiplexer, the frozen permission set,
// the observer table, the command parser, and the recorder. The registry
// is the process-wide authority on which sessions are online.

mod channels;
mod error;
mod gate;
mod model;
mod mux;
mod observer;
mod registry;
mod session;

pub use channels::{session_channels, ChannelHandles, ChannelReceivers, WindowSize};
pub use error::{ApiError, ErrorCode};
pub use gate::{
    check_access_window, check_access_window_at, AccessGate, AuthAction, AuthResult, Directory,
    MemoryStore, SecretVault, SessionStore,
};
pub use model::{
    AccessAuth, AccessRange, Account, Asset, AuthMethod, Gateway, SessionKind, SessionRecord,
    SessionStatus,
};
pub use mux::{
    offline_session, run_session, ClientTransport, Localizer, MuxDeps, PlainLocalizer, TargetIo,
};
pub use observer::{observer_key, BufferSink, ObserverSink};
pub use registry::Registry;
pub use session::{Session, SessionMeta, PermissionSet};
