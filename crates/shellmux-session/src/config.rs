use std::collections::BTreeMap;
use std::time::Duration;

use shellmux_mux::MuxConfig;

use crate::protocol::PROTOCOL_VERSION;

/// Timeouts and identity settings shared by every session of a registry.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Time allowed for the peer's hello after spawn. Default: 10s.
    pub handshake_timeout: Duration,
    /// Time allowed for an interrupt acknowledgement before the process is killed. Default: 3s.
    pub interrupt_grace: Duration,
    /// Default: 3s.
    pub introspect_timeout: Duration,
    /// Default: 3s.
    pub ping_timeout: Duration,
    /// Time `terminate` waits for the process to exit before killing it. Default: 2s.
    pub terminate_grace: Duration,
    /// How often the process handle is polled for liveness. Default: 500ms.
    pub liveness_interval: Duration,
    /// Protocol version announced and enforced by the controller. Default: "1.0".
    pub protocol_version: String,
    /// Environment markers handed to every spawned interpreter.
    pub markers: BTreeMap<String, String>,
    pub mux: MuxConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            interrupt_grace: Duration::from_secs(3),
            introspect_timeout: Duration::from_secs(3),
            ping_timeout: Duration::from_secs(3),
            terminate_grace: Duration::from_secs(2),
            liveness_interval: Duration::from_millis(500),
            protocol_version: PROTOCOL_VERSION.to_string(),
            markers: BTreeMap::new(),
            mux: MuxConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_interrupt_grace(mut self, grace: Duration) -> Self {
        self.interrupt_grace = grace;
        self
    }

    pub fn with_introspect_timeout(mut self, timeout: Duration) -> Self {
        self.introspect_timeout = timeout;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    /// Add one environment marker.
    pub fn with_marker(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.markers.insert(key.into(), value.into());
        self
    }

    pub fn with_mux(mut self, mux: MuxConfig) -> Self {
        self.mux = mux;
        self
    }
}
