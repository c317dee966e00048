//! Connection and authentication settings.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use lazy_static::lazy_static;

use crate::sasl::Mechanism;

/// Environment variable that turns on native 32-bit float support.
pub const FLOAT_SUPPORT_VAR: &str = "DBUS_ENDPOINT_FLOATS";

pub const DEFAULT_SYSTEM_BUS: &str = "unix:path=/var/run/dbus/system_bus_socket";

lazy_static! {
    static ref FLOAT_SUPPORT: bool = env::var_os(FLOAT_SUPPORT_VAR).is_some();
}

/// Whether floats travel as `f` on the wire. Resolved once per process;
/// when off, floats are widened to doubles.
pub fn float_support() -> bool {
    *FLOAT_SUPPORT
}

/// SASL settings for one handshake.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Mechanisms offered (server) or allowed (client), in preference order.
    pub mechanisms: Vec<Mechanism>,
    /// Ask for / agree to out-of-band file descriptor passing.
    pub unix_fd: bool,
    /// Overrides `$HOME/.dbus-keyrings`.
    pub keyring_dir: Option<PathBuf>,
    /// Overrides the uid asserted (client) or expected (server).
    pub uid: Option<u32>,
    /// Server guid sent with `OK`; generated when absent.
    pub guid: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            mechanisms: vec![Mechanism::External, Mechanism::CookieSha1, Mechanism::Anonymous],
            unix_fd: false,
            keyring_dir: None,
            uid: None,
            guid: None,
        }
    }
}

impl AuthConfig {
    pub fn mechanisms(mut self, mechanisms: &[Mechanism]) -> Self {
        self.mechanisms = mechanisms.to_vec();
        self
    }

    pub fn unix_fd(mut self, enabled: bool) -> Self {
        self.unix_fd = enabled;
        self
    }

    pub fn keyring_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.keyring_dir = Some(dir.into());
        self
    }

    pub fn uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn guid<S: Into<String>>(mut self, guid: S) -> Self {
        self.guid = Some(guid.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub worker_threads: usize,
    /// How long disconnect waits for queued work before forcing the pool down.
    pub shutdown_timeout: Duration,
    /// Send `Hello` after authenticating (bus connections only).
    pub register: bool,
    pub auth: AuthConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            worker_threads: 4,
            shutdown_timeout: Duration::from_secs(10),
            register: true,
            auth: AuthConfig::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n.max(1);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn register(mut self, register: bool) -> Self {
        self.register = register;
        self
    }

    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }
}

/// Address of the session bus, from `DBUS_SESSION_BUS_ADDRESS`.
pub fn session_bus_address() -> Option<String> {
    env::var("DBUS_SESSION_BUS_ADDRESS").ok()
}

/// Address of the system bus, from `DBUS_SYSTEM_BUS_ADDRESS` or the
/// well-known default socket.
pub fn system_bus_address() -> String {
    env::var("DBUS_SYSTEM_BUS_ADDRESS").unwrap_or_else(|_| DEFAULT_SYSTEM_BUS.to_owned())
}

#[test]
fn test_defaults() {
    let c = ConnectionConfig::default().worker_threads(0);
    assert_eq!(c.worker_threads, 1);
    assert!(c.register);
    assert_eq!(c.auth.mechanisms.len(), 3);
    assert_eq!(c.shutdown_timeout, Duration::from_secs(10));
}
