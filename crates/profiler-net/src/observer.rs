//! Observer: the telemetry capability injected into every connection.
//!
//! Protocol code never talks to a metrics sink directly. It reports each
//! command, each socket read and write, and each error to an `Observer`, and
//! asks it whether the connection may keep sending.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use profiler_core::{CodecError, Command};

use crate::ProtocolError;

pub trait Observer: Send + Sync {
    /// A command finished, successfully or not.
    fn command(&self, _cmd: Command, _elapsed: Duration, _err: Option<&ProtocolError>) {}

    /// One socket read completed.
    fn read(&self, _bytes: usize, _elapsed: Duration, _err: Option<&CodecError>) {}

    /// One socket write or flush completed.
    fn write(&self, _bytes: usize, _elapsed: Duration, _err: Option<&CodecError>) {}

    fn error(&self, _err: &ProtocolError) {}

    /// Checked before every send. Returning false rejects the send.
    fn is_alive(&self) -> bool {
        true
    }
}

// ── NoopObserver ──────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

// ── CountingObserver ──────────────────────────────────────────────────────────

/// Counts everything it sees. Used by tests and the status API.
#[derive(Debug)]
pub struct CountingObserver {
    commands: [AtomicU64; 256],
    command_errors: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    errors: AtomicU64,
    alive: AtomicBool,
}

impl Default for CountingObserver {
    fn default() -> Self {
        Self {
            commands: std::array::from_fn(|_| AtomicU64::new(0)),
            command_errors: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            alive: AtomicBool::new(true),
        }
    }
}

impl CountingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self, cmd: Command) -> u64 {
        self.commands[u8::from(cmd) as usize].load(Ordering::Relaxed)
    }

    pub fn total_commands(&self) -> u64 {
        self.commands.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    pub fn command_errors(&self) -> u64 {
        self.command_errors.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }
}

impl Observer for CountingObserver {
    fn command(&self, cmd: Command, _elapsed: Duration, err: Option<&ProtocolError>) {
        self.commands[u8::from(cmd) as usize].fetch_add(1, Ordering::Relaxed);
        if err.is_some() {
            self.command_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn read(&self, bytes: usize, _elapsed: Duration, _err: Option<&CodecError>) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn write(&self, bytes: usize, _elapsed: Duration, _err: Option<&CodecError>) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn error(&self, _err: &ProtocolError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }
}

// ── TracingObserver ───────────────────────────────────────────────────────────

/// Emits every observation as a tracing event under the `profiler::io` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn command(&self, cmd: Command, elapsed: Duration, err: Option<&ProtocolError>) {
        match err {
            None => tracing::debug!(target: "profiler::io", command = %cmd, ?elapsed, "command"),
            Some(e) => tracing::debug!(target: "profiler::io", command = %cmd, ?elapsed, error = %e, "command failed"),
        }
    }

    fn read(&self, bytes: usize, elapsed: Duration, err: Option<&CodecError>) {
        tracing::trace!(target: "profiler::io", bytes, ?elapsed, failed = err.is_some(), "read");
    }

    fn write(&self, bytes: usize, elapsed: Duration, err: Option<&CodecError>) {
        tracing::trace!(target: "profiler::io", bytes, ?elapsed, failed = err.is_some(), "write");
    }

    fn error(&self, err: &ProtocolError) {
        tracing::warn!(target: "profiler::io", error = %err, pos = ?err.pos(), "connection error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_observer_tallies_per_command() {
        let obs = CountingObserver::new();
        obs.command(Command::RcvData, Duration::ZERO, None);
        obs.command(Command::RcvData, Duration::ZERO, None);
        obs.command(Command::Close, Duration::ZERO, Some(&ProtocolError::NotConnected));
        obs.read(10, Duration::ZERO, None);
        obs.write(4, Duration::ZERO, None);

        assert_eq!(obs.commands(Command::RcvData), 2);
        assert_eq!(obs.commands(Command::Close), 1);
        assert_eq!(obs.total_commands(), 3);
        assert_eq!(obs.command_errors(), 1);
        assert_eq!(obs.bytes_read(), 10);
        assert_eq!(obs.bytes_written(), 4);
    }

    #[test]
    fn aliveness_is_switchable() {
        let obs = CountingObserver::new();
        assert!(obs.is_alive());
        obs.set_alive(false);
        assert!(!obs.is_alive());
        assert!(NoopObserver.is_alive());
    }
}
