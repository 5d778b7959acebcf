use std::{
    io,
    net::Shutdown,
    os::unix::{
        io::AsRawFd,
        net::{UnixListener, UnixStream},
    },
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use dtf_common::{
    platform_socket::{self, PlatformListener},
    PeerCredentials, SocketAddress,
};
use nix::sys::socket;
use uuid::Uuid;

use crate::{
    config::ServerConfig,
    dispatch::{Connection, Dispatcher},
    executor::ShellExecutor,
};

/// Pause after a failed accept so a persistent error does not spin the thread
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Running flag shared between a [`ServerHandle`] and its accept thread
#[derive(Debug)]
struct ServerState {
    running: AtomicBool,
}

/// The agent's IPC server.
///
/// One accept thread serves connections strictly one at a time: each is
/// authenticated, dispatched and closed before the next `accept`.
#[derive(Debug, Clone)]
pub struct IpcServer {
    config:     ServerConfig,
    dispatcher: Arc<Dispatcher>,
}

impl IpcServer {
    pub fn new(config: ServerConfig) -> Self {
        let dispatcher = Dispatcher::new(
            config.policy.clone(),
            ShellExecutor::new(config.shell.clone()),
        );
        Self {
            config,
            dispatcher: Arc::new(dispatcher),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the listening socket and starts the accept thread.
    pub fn start(&self) -> Result<ServerHandle> {
        tracing::info!("Starting dtf agent on {}", self.config.address);

        let listener = PlatformListener::bind(&self.config.address)
            .with_context(|| format!("Failed to bind to socket: {}", self.config.address))?;

        let interrupt = listener
            .try_clone_socket()
            .context("Failed to duplicate the listening socket")?;

        let state = Arc::new(ServerState {
            running: AtomicBool::new(true),
        });

        let thread = {
            let state = Arc::clone(&state);
            let dispatcher = Arc::clone(&self.dispatcher);
            let io_timeout = self.config.io_timeout;
            thread::Builder::new()
                .name("dtf-accept".to_string())
                .spawn(move || accept_loop(listener, &state, &dispatcher, io_timeout))
                .context("Failed to spawn accept thread")?
        };

        Ok(ServerHandle {
            address: self.config.address.clone(),
            state,
            interrupt: Some(interrupt),
            thread: Some(thread),
        })
    }
}

fn accept_loop(
    listener: PlatformListener,
    state: &ServerState,
    dispatcher: &Dispatcher,
    io_timeout: Option<Duration>,
) {
    tracing::info!("Accept loop running on {}", listener.address());

    while state.running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok(stream) => {
                if !state.running.load(Ordering::SeqCst) {
                    tracing::debug!("Woken up for shutdown");
                    break;
                }
                handle_connection(dispatcher, stream, io_timeout);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!("Connection error: {}", e);
                thread::sleep(ACCEPT_BACKOFF);
            }
        }
    }

    // Closing the listener frees the address for the next start
    drop(listener);
    tracing::info!("Socket thread is exiting");
}

fn handle_connection(dispatcher: &Dispatcher, stream: UnixStream, io_timeout: Option<Duration>) {
    let id = Uuid::new_v4();
    let span = tracing::info_span!("connection", %id);
    let _entered = span.enter();

    if io_timeout.is_some() {
        if let Err(e) = stream
            .set_read_timeout(io_timeout)
            .and_then(|()| stream.set_write_timeout(io_timeout))
        {
            tracing::warn!("Failed to set socket timeouts: {}", e);
        }
    }

    let peer = match PeerCredentials::from_stream(&stream) {
        Ok(peer) => peer,
        Err(e) => {
            tracing::warn!("Dropping connection without peer credentials: {:#}", e);
            return;
        }
    };

    let mut conn = Connection::new(stream, peer);
    match dispatcher.serve(&mut conn) {
        Ok(outcome) => tracing::info!("Connection finished: {}", outcome),
        Err(e) if e.is_disconnect() => tracing::info!("Client disconnected: {}", e),
        Err(e) => tracing::error!("Connection aborted: {}", e),
    }

    tracing::debug!("Closing connection with client");
    let stream = conn.into_stream();
    if let Err(e) = stream.shutdown(Shutdown::Both) {
        if e.kind() != io::ErrorKind::NotConnected {
            tracing::debug!("Shutdown after close failed: {}", e);
        }
    }
}

/// Handle to a running server; stopping it (or dropping it) ends the accept thread.
#[derive(Debug)]
pub struct ServerHandle {
    address:   SocketAddress,
    state:     Arc<ServerState>,
    /// Duplicate of the listening socket, shut down if the wake-up connection fails
    interrupt: Option<UnixListener>,
    thread:    Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn address(&self) -> &SocketAddress {
        &self.address
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
            && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stops accepting and waits for the accept thread to exit.
    ///
    /// A connection in progress is finished first. Once this returns the listening
    /// address is free again.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };

        tracing::info!("Stopping dtf agent on {}", self.address);
        self.state.running.store(false, Ordering::SeqCst);

        // A thread parked in accept only notices the flag once a connection arrives
        let interrupt = self.interrupt.take();
        let woken = match platform_socket::connect(&self.address) {
            Ok(wake) => {
                drop(wake);
                true
            }
            Err(e) => {
                tracing::warn!("Wake-up connection failed, shutting the listener down: {:#}", e);
                interrupt.as_ref().is_some_and(|listener| {
                    socket::shutdown(listener.as_raw_fd(), socket::Shutdown::Both)
                        .map_err(|errno| tracing::error!("Listener shutdown failed: {}", errno))
                        .is_ok()
                })
            }
        };
        if !woken {
            return Err(anyhow!(
                "Accept thread on {} could not be interrupted, leaving it detached",
                self.address
            ));
        }

        thread
            .join()
            .map_err(|_| anyhow!("Accept thread panicked"))?;
        // The endpoint is released once the last handle to it closes
        drop(interrupt);
        tracing::info!("dtf agent stopped");
        Ok(())
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("Failed to stop server: {:#}", e);
        }
    }
}
