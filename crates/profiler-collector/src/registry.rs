//! Pod registry: every pod that has connected since startup.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use profiler_core::Handle;
use profiler_net::{PodSink, StreamRegistration};
use profiler_streams::PodDump;

/// Tracked state for one pod, keyed by `namespace:service:pod`.
#[derive(Debug, Clone, Serialize)]
pub struct PodEntry {
    pub namespace: String,
    pub service: String,
    pub pod: String,
    pub protocol_version: i64,
    pub peer: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub live: bool,
    /// Streams opened across all connections of this pod.
    pub streams: u64,
    pub data_bytes: u64,
    pub commands: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub pods_total: usize,
    pub pods_live: usize,
    pub streams: u64,
    pub data_bytes: u64,
}

/// In-memory registry shared by the listener and the status API.
#[derive(Clone, Default)]
pub struct PodRegistry {
    pods: Arc<DashMap<String, PodEntry>>,
}

impl PodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a handshake. A reconnecting pod reuses its entry.
    pub fn connect(&self, dump: &PodDump, peer: Option<SocketAddr>) {
        let now = Utc::now();
        let mut entry = self.pods.entry(dump.name()).or_insert_with(|| PodEntry {
            namespace: dump.namespace.clone(),
            service: dump.service.clone(),
            pod: dump.pod.clone(),
            protocol_version: dump.protocol_version,
            peer: None,
            connected_at: now,
            disconnected_at: None,
            live: true,
            streams: 0,
            data_bytes: 0,
            commands: 0,
            last_error: None,
        });
        entry.protocol_version = dump.protocol_version;
        entry.peer = peer.map(|p| p.to_string());
        entry.connected_at = now;
        entry.disconnected_at = None;
        entry.live = true;
    }

    pub fn stream_opened(&self, name: &str) {
        if let Some(mut entry) = self.pods.get_mut(name) {
            entry.streams += 1;
        }
    }

    pub fn data_received(&self, name: &str, bytes: usize) {
        if let Some(mut entry) = self.pods.get_mut(name) {
            entry.data_bytes += bytes as u64;
        }
    }

    /// Marks the pod's connection finished.
    pub fn disconnect(&self, name: &str, commands: u64, error: Option<String>) {
        if let Some(mut entry) = self.pods.get_mut(name) {
            entry.live = false;
            entry.disconnected_at = Some(Utc::now());
            entry.commands += commands;
            entry.last_error = error;
        }
    }

    pub fn get(&self, name: &str) -> Option<PodEntry> {
        self.pods.get(name).map(|e| e.value().clone())
    }

    /// All pods sorted by key.
    pub fn list(&self) -> Vec<(String, PodEntry)> {
        let mut list: Vec<_> = self
            .pods
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    pub fn stats(&self) -> RegistryStats {
        self.pods.iter().fold(RegistryStats::default(), |mut s, e| {
            s.pods_total += 1;
            if e.live {
                s.pods_live += 1;
            }
            s.streams += e.streams;
            s.data_bytes += e.data_bytes;
            s
        })
    }
}

// ── RegistrySink ──────────────────────────────────────────────────────────────

/// Collects one connection's pod data and mirrors its progress into the
/// registry as it happens.
pub struct RegistrySink {
    dump: PodDump,
    registry: PodRegistry,
    peer: Option<SocketAddr>,
    name: Option<String>,
}

impl RegistrySink {
    pub fn new(registry: PodRegistry, peer: Option<SocketAddr>) -> Self {
        Self {
            dump: PodDump::new(),
            registry,
            peer,
            name: None,
        }
    }

    /// Registry key, once the pod has identified itself.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn dump(&self) -> &PodDump {
        &self.dump
    }

    pub fn into_dump(self) -> PodDump {
        self.dump
    }
}

impl PodSink for RegistrySink {
    fn register_pod(&mut self, version: i64, namespace: &str, service: &str, pod: &str) {
        PodSink::register_pod(&mut self.dump, version, namespace, service, pod);
        self.registry.connect(&self.dump, self.peer);
        self.name = Some(self.dump.name());
    }

    fn register_stream(&mut self, stream: &StreamRegistration) {
        PodSink::register_stream(&mut self.dump, stream);
        if let Some(name) = &self.name {
            self.registry.stream_opened(name);
        }
    }

    fn append_data(&mut self, handle: &Handle, data: &[u8]) -> usize {
        let n = PodSink::append_data(&mut self.dump, handle, data);
        if let Some(name) = &self.name {
            self.registry.data_received(name, n);
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use profiler_core::StreamType;
    use profiler_net::StreamOpened;

    fn registration(handle: Handle) -> StreamRegistration {
        StreamRegistration {
            stream_type: StreamType::Calls,
            requested_seq: 0,
            reset_required: false,
            opened: StreamOpened {
                handle,
                rotation_period: 1,
                rotation_size: 1,
                rolling_seq: 0,
            },
        }
    }

    #[test]
    fn sink_mirrors_progress_into_registry() {
        let registry = PodRegistry::new();
        let mut sink = RegistrySink::new(registry.clone(), None);
        sink.register_pod(100_605, "ns", "svc", "pod-a");
        let h = Handle([1; 16]);
        sink.register_stream(&registration(h));
        assert_eq!(sink.append_data(&h, b"12345"), 5);
        assert_eq!(sink.append_data(&Handle([2; 16]), b"xx"), 0);

        let entry = registry.get("ns:svc:pod-a").unwrap();
        assert!(entry.live);
        assert_eq!(entry.streams, 1);
        assert_eq!(entry.data_bytes, 5);
        assert_eq!(sink.dump().total_bytes(), 5);

        registry.disconnect("ns:svc:pod-a", 4, None);
        let stats = registry.stats();
        assert_eq!(stats.pods_total, 1);
        assert_eq!(stats.pods_live, 0);
        assert_eq!(stats.data_bytes, 5);
        assert_eq!(registry.get("ns:svc:pod-a").unwrap().commands, 4);
    }

    #[test]
    fn reconnect_reuses_entry() {
        let registry = PodRegistry::new();
        let mut dump = PodDump::new();
        dump.register_pod(100_605, "ns", "svc", "p");
        registry.connect(&dump, None);
        registry.data_received("ns:svc:p", 10);
        registry.disconnect("ns:svc:p", 1, Some("boom".into()));
        registry.connect(&dump, None);

        let list = registry.list();
        assert_eq!(list.len(), 1);
        assert!(list[0].1.live);
        assert_eq!(list[0].1.data_bytes, 10);
    }

    #[test]
    fn data_before_handshake_is_not_tracked() {
        let registry = PodRegistry::new();
        let mut sink = RegistrySink::new(registry.clone(), None);
        sink.append_data(&Handle([1; 16]), b"abc");
        assert!(sink.name().is_none());
        assert_eq!(registry.stats().pods_total, 0);
    }
}
