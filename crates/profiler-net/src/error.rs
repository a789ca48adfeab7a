use std::time::Duration;

use profiler_core::CodecError;

/// Failures on an agent connection, in either role.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("unknown command 0x{op:02x} at pos {pos}")]
    UnknownOpcode { op: u8, pos: u64 },

    #[error("invalid acknowledgement 0x{byte:02x} at pos {pos}")]
    InvalidAck { byte: u8, pos: u64 },

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("not connected")]
    NotConnected,

    #[error("connection cancelled")]
    Cancelled,

    #[error("observer reports connection not alive")]
    NotAlive,
}

impl ProtocolError {
    /// Stream offset the error was observed at, when it came off the wire.
    pub fn pos(&self) -> Option<u64> {
        match self {
            ProtocolError::Codec(e) => Some(e.pos()),
            ProtocolError::UnknownOpcode { pos, .. } | ProtocolError::InvalidAck { pos, .. } => Some(*pos),
            _ => None,
        }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, ProtocolError::Codec(e) if e.is_eof())
    }
}
