//! profiler-net: agent connections over TCP.
//!
//! The socket-backed codec, the protocol state machine in its server and
//! replay roles, the observer capability, and the agent-side client.

pub mod agent;
pub mod capture;
pub mod error;
pub mod observer;
pub mod protocol;
pub mod server;
pub mod socket;

pub use agent::AgentConnection;
pub use capture::{replay_bytes, replay_capture, ReplayError};
pub use error::ProtocolError;
pub use observer::{CountingObserver, NoopObserver, Observer, TracingObserver};
pub use protocol::{replay, PodSink, ReplaySummary, Request, StreamOpened, StreamRegistration};
pub use server::{ConnectionHandler, ConnectionOptions, ServeOutcome, ServerParams};
pub use socket::{SocketReader, SocketWriter};
