//! Network and filesystem resource allocation for a cluster instance.
//!
//! Picks a free loopback TCP port and a unique local-socket directory.
//! Sandboxed environments may forbid binding TCP sockets entirely; in
//! that case allocation falls back to a Unix-socket-only configuration
//! where the "host" is the socket directory itself.

use std::io::ErrorKind;
use std::net::TcpListener;
use std::path::PathBuf;

use tracing::debug;

use crate::error::{Error, Result};

/// Prefix for socket directories under the system temp root.
const SOCKET_DIR_PREFIX: &str = "pgcradle_";

/// Allocated connection endpoint for one cluster instance.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Host clients connect to: `127.0.0.1`, or the socket directory
    /// path in socket-only mode.
    pub host: String,
    /// Discovered TCP port; `None` when the environment forbids TCP
    /// binds and the server will listen on a Unix socket only.
    pub tcp_port: Option<u16>,
    /// Directory holding the server's Unix socket. Deliberately outside
    /// the cluster base directory so the two can be torn down
    /// independently.
    pub socket_dir: PathBuf,
}

impl Endpoint {
    /// True when no TCP listener will be configured.
    #[must_use]
    pub fn socket_only(&self) -> bool {
        self.tcp_port.is_none()
    }
}

/// Allocate an endpoint for a new instance.
///
/// The port is discovered by binding an ephemeral loopback socket and
/// immediately releasing it. This is advisory, not a reservation: a
/// concurrent allocator could grab the same port before the server
/// binds it. Accepted as a known limitation: the server must be free
/// to bind the port itself, so no hold is kept.
///
/// `namespace` scopes the socket directory name (truncated to 16
/// characters); a random suffix keeps concurrent or leftover instances
/// sharing the temp root from colliding. The directory is created on
/// disk as a side effect.
pub fn allocate(namespace: &str) -> Result<Endpoint> {
    let socket_dir = unique_socket_dir(namespace);
    std::fs::create_dir_all(&socket_dir)
        .map_err(|e| Error::io(format!("creating socket dir {}", socket_dir.display()), e))?;

    match find_free_port() {
        Ok(port) => {
            debug!(port, "allocated loopback endpoint");
            Ok(Endpoint {
                host: "127.0.0.1".to_string(),
                tcp_port: Some(port),
                socket_dir,
            })
        },
        // Sandboxes may forbid binding TCP sockets; fall back to a Unix
        // socket only configuration in that case.
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            debug!("TCP bind not permitted, falling back to socket-only mode");
            Ok(Endpoint {
                host: socket_dir.display().to_string(),
                tcp_port: None,
                socket_dir,
            })
        },
        Err(e) => Err(Error::io("binding ephemeral loopback port", e)),
    }
}

/// Bind `127.0.0.1:0` to discover a free port, then release it.
fn find_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

fn unique_socket_dir(namespace: &str) -> PathBuf {
    let mut fragment: String = namespace.chars().take(16).collect();
    if fragment.is_empty() {
        fragment.push_str("cluster");
    }
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    std::env::temp_dir().join(format!("{SOCKET_DIR_PREFIX}{fragment}_{}", &suffix[..8]))
}
