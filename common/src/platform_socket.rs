use std::{
    io,
    os::unix::net::{UnixListener, UnixStream},
    path::Path,
};

use anyhow::{anyhow, Context, Result};
#[cfg(any(target_os = "linux", target_os = "android"))]
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials as PeerCredentialsOpt};

use crate::config::SocketAddress;

/// Identity of the process on the other end of a connection, as reported by the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Process ID of the peer, where the platform reports it
    pub pid: Option<u32>,
    /// User ID of the peer
    pub uid: u32,
    /// Group ID of the peer
    pub gid: u32,
}

impl PeerCredentials {
    /// Extract the peer credentials of a connected stream
    pub fn from_stream(stream: &UnixStream) -> Result<Self> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            let creds = getsockopt(stream, PeerCredentialsOpt)
                .context("Failed to get peer credentials")?;

            Ok(Self {
                pid: u32::try_from(creds.pid()).ok().filter(|pid| *pid != 0),
                uid: creds.uid(),
                gid: creds.gid(),
            })
        }

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            use std::os::unix::io::AsRawFd;

            let mut uid: libc::uid_t = 0;
            let mut gid: libc::gid_t = 0;

            // SAFETY: getpeereid only writes to the two stack variables passed by
            // reference, and the descriptor stays valid for the duration of the borrow.
            let result = unsafe { libc::getpeereid(stream.as_raw_fd(), &mut uid, &mut gid) };

            if result != 0 {
                return Err(anyhow!(
                    "Failed to get peer credentials: {}",
                    io::Error::last_os_error()
                ));
            }

            tracing::debug!("getpeereid credentials: UID={}, GID={}", uid, gid);
            Ok(Self { pid: None, uid, gid })
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn abstract_socket_addr(name: &str) -> io::Result<std::os::unix::net::SocketAddr> {
    #[cfg(target_os = "android")]
    use std::os::android::net::SocketAddrExt;
    #[cfg(target_os = "linux")]
    use std::os::linux::net::SocketAddrExt;

    std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())
}

/// Listening endpoint bound to a [`SocketAddress`].
///
/// Dropping the listener closes the endpoint and removes a filesystem socket node,
/// so the address can be bound again right away.
#[derive(Debug)]
pub struct PlatformListener {
    listener: UnixListener,
    address:  SocketAddress,
}

impl PlatformListener {
    /// Bind the listening socket
    pub fn bind(address: &SocketAddress) -> Result<Self> {
        let listener = match address {
            SocketAddress::Abstract(name) => bind_abstract(name)?,
            SocketAddress::Path(path) => bind_path(path)?,
        };

        tracing::info!("Listening on {}", address);
        Ok(Self {
            listener,
            address: address.clone(),
        })
    }

    /// Block until the next connection arrives
    pub fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept()?;
        // Accepted sockets inherit nothing from the listener, but be explicit
        stream.set_nonblocking(false)?;
        Ok(stream)
    }

    /// Address this listener is bound to
    pub fn address(&self) -> &SocketAddress {
        &self.address
    }

    /// A second handle to the listening socket, without the node cleanup on drop.
    ///
    /// The endpoint stays bound until every handle is closed.
    pub fn try_clone_socket(&self) -> io::Result<UnixListener> {
        self.listener.try_clone()
    }
}

impl Drop for PlatformListener {
    fn drop(&mut self) {
        if let SocketAddress::Path(path) = &self.address {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!("Removed socket file {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove socket file {}: {}", path.display(), e),
            }
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_abstract(name: &str) -> Result<UnixListener> {
    let addr = abstract_socket_addr(name)
        .with_context(|| format!("Invalid abstract socket name: {name}"))?;
    UnixListener::bind_addr(&addr).with_context(|| {
        format!("Failed to bind abstract socket @{name}. Another agent may already be running.")
    })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_abstract(name: &str) -> Result<UnixListener> {
    Err(anyhow!(
        "Abstract socket @{name} is not supported on this platform, use a filesystem path"
    ))
}

fn bind_path(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        // A live agent answers, a stale node from a crashed one does not
        if UnixStream::connect(path).is_ok() {
            return Err(anyhow!(
                "Socket '{}' is in use by a running agent",
                path.display()
            ));
        }
        tracing::warn!("Existing socket file found, removing it...");
        std::fs::remove_file(path).with_context(|| {
            format!(
                "Could not remove existing socket file '{}'. You may need to remove it manually.",
                path.display()
            )
        })?;
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        let metadata = std::fs::metadata(parent)
            .with_context(|| format!("Cannot access parent directory '{}'", parent.display()))?;
        if !metadata.is_dir() {
            return Err(anyhow!(
                "Parent path '{}' exists but is not a directory",
                parent.display()
            ));
        }
    }

    UnixListener::bind(path).map_err(|e| {
        let hint = match e.kind() {
            io::ErrorKind::PermissionDenied => "check parent directory permissions",
            io::ErrorKind::AddrInUse => "another agent may be running",
            _ => "see the OS error",
        };
        anyhow!("Failed to bind socket '{}' ({}): {}", path.display(), hint, e)
    })
}

/// Connect to a listening agent
pub fn connect(address: &SocketAddress) -> Result<UnixStream> {
    tracing::debug!("Connecting to {}", address);
    match address {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        SocketAddress::Abstract(name) => {
            let addr = abstract_socket_addr(name)
                .with_context(|| format!("Invalid abstract socket name: {name}"))?;
            UnixStream::connect_addr(&addr)
                .with_context(|| format!("Failed to connect to @{name}. Is the agent running?"))
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        SocketAddress::Abstract(name) => Err(anyhow!(
            "Abstract socket @{name} is not supported on this platform"
        )),
        SocketAddress::Path(path) => UnixStream::connect(path).with_context(|| {
            format!("Failed to connect to '{}'. Is the agent running?", path.display())
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_listener_accepts_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let address = SocketAddress::Path(dir.path().join("agent.sock"));

        let listener = PlatformListener::bind(&address).unwrap();
        let _client = connect(&address).unwrap();
        let server_side = listener.accept().unwrap();

        let creds = PeerCredentials::from_stream(&server_side).unwrap();
        assert_eq!(creds.uid, nix::unistd::getuid().as_raw());
        assert_eq!(creds.gid, nix::unistd::getgid().as_raw());

        drop(listener);
        assert!(!dir.path().join("agent.sock").exists());
        PlatformListener::bind(&address).unwrap();
    }

    #[test]
    fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        // Bind with std directly so nothing removes the node on drop
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let address = SocketAddress::Path(path);
        PlatformListener::bind(&address).unwrap();
    }

    #[test]
    fn live_socket_file_is_not_stolen() {
        let dir = tempfile::tempdir().unwrap();
        let address = SocketAddress::Path(dir.path().join("live.sock"));
        let _first = PlatformListener::bind(&address).unwrap();
        assert!(PlatformListener::bind(&address).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn abstract_listener_is_released_on_drop() {
        let name = format!("dtf-test-{}", std::process::id());
        let address = SocketAddress::Abstract(name);

        let listener = PlatformListener::bind(&address).unwrap();
        assert!(PlatformListener::bind(&address).is_err());
        drop(listener);
        PlatformListener::bind(&address).unwrap();
    }
}
