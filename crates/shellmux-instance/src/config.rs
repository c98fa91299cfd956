use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default payload limit for command frames: 1 MiB.
pub const DEFAULT_MAX_COMMAND_PAYLOAD: usize = 1024 * 1024;

/// Where and how launches find the running instance.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Application name; part of the rendezvous path and checked in probe replies.
    pub app_name: String,
    /// Version announced by the server's greeting.
    pub version: String,
    /// Socket path. Default: `<runtime dir>/<app>-<uid>.sock`.
    pub rendezvous: PathBuf,
    /// Budget for a probe round-trip. Default: 500ms.
    pub probe_timeout: Duration,
    /// Budget for forwarding a command and reading the ack. Default: 2s.
    pub forward_timeout: Duration,
    pub max_payload_size: usize,
}

impl InstanceConfig {
    pub fn new(app_name: impl Into<String>) -> Self {
        let app_name = app_name.into();
        Self {
            rendezvous: default_rendezvous(&app_name),
            app_name,
            version: env!("CARGO_PKG_VERSION").to_string(),
            probe_timeout: Duration::from_millis(500),
            forward_timeout: Duration::from_secs(2),
            max_payload_size: DEFAULT_MAX_COMMAND_PAYLOAD,
        }
    }

    pub fn with_rendezvous(mut self, path: impl Into<PathBuf>) -> Self {
        self.rendezvous = path.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_forward_timeout(mut self, timeout: Duration) -> Self {
        self.forward_timeout = timeout;
        self
    }

    pub fn with_max_payload_size(mut self, max: usize) -> Self {
        self.max_payload_size = max;
        self
    }

    /// The advisory lock file guarding the rendezvous: `<rendezvous>.lock`.
    pub fn lock_path(&self) -> PathBuf {
        lock_path_for(&self.rendezvous)
    }
}

fn lock_path_for(rendezvous: &Path) -> PathBuf {
    let mut path = rendezvous.as_os_str().to_owned();
    path.push(".lock");
    PathBuf::from(path)
}

/// `$XDG_RUNTIME_DIR` when it names an existing directory, else the temp dir.
pub fn runtime_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .filter(|dir| dir.is_dir())
        .unwrap_or_else(std::env::temp_dir)
}

/// Per-user rendezvous path for `app_name`.
pub fn default_rendezvous(app_name: &str) -> PathBuf {
    runtime_dir().join(format!("{app_name}-{}.sock", current_uid()))
}

fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendezvous_is_per_user() {
        let config = InstanceConfig::new("editor");
        let name = config
            .rendezvous
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        assert_eq!(name, format!("editor-{}.sock", current_uid()));
    }

    #[test]
    fn lock_path_sits_next_to_the_socket() {
        let config = InstanceConfig::new("editor").with_rendezvous("/run/user/1/editor.sock");
        assert_eq!(config.lock_path(), PathBuf::from("/run/user/1/editor.sock.lock"));
    }

    #[test]
    fn defaults() {
        let config = InstanceConfig::new("editor");
        assert_eq!(config.probe_timeout, Duration::from_millis(500));
        assert_eq!(config.forward_timeout, Duration::from_secs(2));
        assert_eq!(config.max_payload_size, DEFAULT_MAX_COMMAND_PAYLOAD);
    }
}
