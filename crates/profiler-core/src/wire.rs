//! Profiler wire format: opcodes, stream handles, and stream types.
//!
//! Every command on an agent connection starts with one opcode byte followed
//! by big-endian fixed fields. These values are shared with deployed agents;
//! changing any of them is a breaking change.

use std::fmt;
use std::str::FromStr;

// ── Commands ──────────────────────────────────────────────────────────────────

/// One protocol command, identified by its opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// No-op filler.
    Skip = 0x00,

    /// Deprecated stream open: namespace, service, pod strings. No response.
    InitStream = 0x01,

    /// Data delivery: handle(uuid) + payload. Acked with one byte.
    RcvData = 0x02,

    /// Graceful end of the session.
    Close = 0x04,

    /// Deprecated version exchange: a single long in each direction.
    GetProtocolVersion = 0x08,

    /// Asks the collector to ack and flush everything received so far.
    RequestAckFlush = 0x11,

    /// Fire-and-forget result of a collector-issued command.
    ReportCommandResult = 0x13,

    /// Identity handshake: version, pod, service, namespace.
    GetProtocolVersionV2 = 0x14,

    /// Stream open: type, requested sequence, reset flag.
    /// Response carries handle, rotation policy, and rolling sequence.
    InitStreamV2 = 0x15,
}

impl Command {
    pub fn name(self) -> &'static str {
        match self {
            Command::Skip => "SKIP",
            Command::InitStream => "INIT_STREAM",
            Command::RcvData => "RCV_DATA",
            Command::Close => "CLOSE",
            Command::GetProtocolVersion => "GET_PROTOCOL_VERSION",
            Command::RequestAckFlush => "REQUEST_ACK_FLUSH",
            Command::ReportCommandResult => "REPORT_COMMAND_RESULT",
            Command::GetProtocolVersionV2 => "GET_PROTOCOL_VERSION_V2",
            Command::InitStreamV2 => "INIT_STREAM_V2",
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Command::Skip),
            0x01 => Ok(Command::InitStream),
            0x02 => Ok(Command::RcvData),
            0x04 => Ok(Command::Close),
            0x08 => Ok(Command::GetProtocolVersion),
            0x11 => Ok(Command::RequestAckFlush),
            0x13 => Ok(Command::ReportCommandResult),
            0x14 => Ok(Command::GetProtocolVersionV2),
            0x15 => Ok(Command::InitStreamV2),
            other => Err(WireError::UnknownOpcode(other)),
        }
    }
}

impl From<Command> for u8 {
    fn from(c: Command) -> u8 {
        c as u8
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// 16-byte opaque id naming one chunk instance.
///
/// Rendered as colon-separated upper-case hex, e.g. `95:D3:22:0F:...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Handle(pub [u8; 16]);

impl Handle {
    pub const NIL: Handle = Handle([0u8; 16]);

    /// Fresh random handle for a newly registered stream.
    pub fn random() -> Self {
        Handle(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<[u8; 16]> for Handle {
    fn from(bytes: [u8; 16]) -> Self {
        Handle(bytes)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            f.write_str(&hex::encode_upper([*b]))?;
        }
        Ok(())
    }
}

impl FromStr for Handle {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| *c != ':').collect();
        let bytes = hex::decode(&compact).map_err(|_| WireError::InvalidHandle(s.to_string()))?;
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| WireError::InvalidHandle(s.to_string()))?;
        Ok(Handle(arr))
    }
}

// ── Stream types ──────────────────────────────────────────────────────────────

/// Telemetry category carried by one stream.
///
/// Agents may open streams the collector does not decode (`gc`,
/// `posDictionary`, ...). Those are kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamType {
    Dictionary,
    Params,
    Suspend,
    Calls,
    Trace,
    Sql,
    Xml,
    Other(String),
}

impl StreamType {
    pub fn as_str(&self) -> &str {
        match self {
            StreamType::Dictionary => "dictionary",
            StreamType::Params => "params",
            StreamType::Suspend => "suspend",
            StreamType::Calls => "calls",
            StreamType::Trace => "trace",
            StreamType::Sql => "sql",
            StreamType::Xml => "xml",
            StreamType::Other(name) => name,
        }
    }

    /// True for the closed set of types the collector knows how to decode.
    pub fn is_known(&self) -> bool {
        !matches!(self, StreamType::Other(_))
    }
}

impl From<&str> for StreamType {
    fn from(name: &str) -> Self {
        match name {
            "dictionary" => StreamType::Dictionary,
            "params" => StreamType::Params,
            "suspend" => StreamType::Suspend,
            "calls" => StreamType::Calls,
            "trace" => StreamType::Trace,
            "sql" => StreamType::Sql,
            "xml" => StreamType::Xml,
            other => StreamType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Positive acknowledgement byte. Any other value is a protocol violation.
pub const ACK_OK: u8 = 0x00;

/// Maximum RCV_DATA payload sent by an agent in one command.
pub const MAX_BUF_SIZE: usize = 1024;

/// Protocol version a collector reports by default.
pub const DEFAULT_PROTOCOL_VERSION: i64 = 100_605;

/// Agents at this version ship the dictionary as a `posDictionary` stream.
pub const POS_DICTIONARY_VERSION: i64 = 100_705;

/// Stream name used for the dictionary by `POS_DICTIONARY_VERSION` agents.
pub const POS_DICTIONARY_STREAM: &str = "posDictionary";

/// Upper bound on a varstring length, in characters. Longer prefixes
/// decode to an empty string.
pub const MAX_VAR_STRING_CHARS: usize = 10 * 1024 * 1024;

/// Marker in the top 32 bits of the first calls-stream long announcing a
/// record generation in the low 32 bits.
pub const CALLS_FORMAT_MARKER: u64 = 0xFFFE_FDFC;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown opcode: 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("invalid handle: {0}")]
    InvalidHandle(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes_are_bit_exact() {
        assert_eq!(u8::from(Command::Skip), 0x00);
        assert_eq!(u8::from(Command::InitStream), 0x01);
        assert_eq!(u8::from(Command::RcvData), 0x02);
        assert_eq!(u8::from(Command::Close), 0x04);
        assert_eq!(u8::from(Command::GetProtocolVersion), 0x08);
        assert_eq!(u8::from(Command::RequestAckFlush), 0x11);
        assert_eq!(u8::from(Command::ReportCommandResult), 0x13);
        assert_eq!(u8::from(Command::GetProtocolVersionV2), 0x14);
        assert_eq!(u8::from(Command::InitStreamV2), 0x15);
    }

    #[test]
    fn command_try_from_covers_every_opcode() {
        for op in [0x00u8, 0x01, 0x02, 0x04, 0x08, 0x11, 0x13, 0x14, 0x15] {
            let cmd = Command::try_from(op).unwrap();
            assert_eq!(u8::from(cmd), op);
        }
        assert_eq!(Command::try_from(0x03), Err(WireError::UnknownOpcode(0x03)));
        assert_eq!(Command::try_from(0xff), Err(WireError::UnknownOpcode(0xff)));
    }

    #[test]
    fn unknown_opcode_error_message() {
        let err = Command::try_from(0xAB).unwrap_err();
        assert!(err.to_string().contains("0xab"));
    }

    #[test]
    fn handle_renders_colon_separated_hex() {
        let h = Handle([
            0x95, 0xD3, 0x22, 0x0F, 0xCD, 0x08, 0x41, 0x55, 0xB3, 0xD0, 0x79, 0xA0, 0x06, 0xD9,
            0xEB, 0xC6,
        ]);
        assert_eq!(h.to_string(), "95:D3:22:0F:CD:08:41:55:B3:D0:79:A0:06:D9:EB:C6");
        assert_eq!(h.to_string().parse::<Handle>().unwrap(), h);
    }

    #[test]
    fn handle_parse_rejects_wrong_length() {
        assert!("01:02:03".parse::<Handle>().is_err());
        assert!("zz".parse::<Handle>().is_err());
    }

    #[test]
    fn random_handles_differ() {
        assert_ne!(Handle::random(), Handle::random());
    }

    #[test]
    fn stream_type_names_round_trip() {
        for name in ["dictionary", "params", "suspend", "calls", "trace", "sql", "xml"] {
            let t = StreamType::from(name);
            assert!(t.is_known());
            assert_eq!(t.as_str(), name);
        }
        let gc = StreamType::from("gc");
        assert_eq!(gc, StreamType::Other("gc".into()));
        assert!(!gc.is_known());
        assert_eq!(gc.to_string(), "gc");
    }
}
