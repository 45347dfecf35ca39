//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Inlet.
//
// Inlet is free software: you can  redistribute it and/or  modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Inlet is distributed  in the hope that  it will  be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Inlet. If not, see <http://www.gnu.org/licenses/>.

//! Listeners and the thread-backed controller.
//!
//! The frontend accepts TCP or UNIX-domain connections and gives each one
//! its own thread running a current-thread async runtime; the connection
//! task owns its session, envelope and socket exclusively, so nothing here
//! needs synchronization beyond the shared handler. An accepted socket
//! optionally goes through an implicit TLS handshake before the SMTP
//! banner (SMTPS); such a listener never also offers STARTTLS.

use std::any::Any;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use log::{error, info, warn};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};

use crate::smtp::handler::Handler;
use crate::smtp::server;
use crate::support::async_io::ConnIo;
use crate::support::config::{ServerConfig, TlsConfig};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

pub const DEFAULT_PORT: u16 = 8025;

const DEFAULT_READY_TIMEOUT: f64 = 5.0;
const READY_TIMEOUT_VAR: &str = "INLET_CONTROLLER_TIMEOUT";

/// Where a server should listen.
pub enum Bind {
    /// A TCP listener. `host: None` binds the IPv6 loopback; an empty host
    /// string binds the wildcard address (dual-stack where the OS allows).
    Tcp { host: Option<String>, port: u16 },
    /// A UNIX-domain listener at the given path. A stale socket file is
    /// removed first.
    Unix { path: PathBuf },
}

impl Default for Bind {
    fn default() -> Self {
        Bind::Tcp { host: None, port: DEFAULT_PORT }
    }
}

/// Builds a TLS acceptor from PEM key material, with a contemporary
/// server-side profile.
pub fn create_ssl_acceptor(tls: &TlsConfig) -> Result<SslAcceptor, Error> {
    let mut acceptor =
        SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
    acceptor.set_private_key_file(&tls.private_key, SslFiletype::PEM)?;
    acceptor.set_certificate_chain_file(&tls.certificate_chain)?;
    acceptor.check_private_key()?;
    Ok(acceptor.build())
}

/// The host name to report: the configured one, else the system's.
pub fn resolve_host_name(config: &ServerConfig) -> String {
    if !config.hostname.is_empty() {
        return config.hostname.clone();
    }

    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_owned())
}

enum WakeAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

/// A running server.
///
/// `start()` returns once the listener is accepting connections (or the
/// ready timeout, overridable through the `INLET_CONTROLLER_TIMEOUT`
/// environment variable in float seconds, expires). `stop()` closes the
/// listener and joins the accept thread; connections already in flight run
/// to completion on their own threads.
pub struct Controller {
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<thread::JoinHandle<()>>,
    wake: WakeAddr,
    local_addr: Option<SocketAddr>,
}

impl Controller {
    pub fn start<H: Handler>(
        bind: Bind,
        config: Arc<ServerConfig>,
        handler: Arc<H>,
        implicit_tls: bool,
    ) -> Result<Self, Error> {
        config.validate()?;

        let tls_acceptor = match config.tls {
            Some(ref tls) => Some(create_ssl_acceptor(tls)?),
            None => None,
        };
        if implicit_tls && tls_acceptor.is_none() {
            return Err(Error::Config(
                "implicit TLS requires TLS key material".to_owned(),
            ));
        }

        let host_name = resolve_host_name(&config);
        let shutdown = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();

        let accept_shutdown = Arc::clone(&shutdown);
        let accept_thread = thread::spawn(move || {
            accept_loop(
                bind,
                config,
                handler,
                tls_acceptor,
                implicit_tls,
                host_name,
                accept_shutdown,
                ready_tx,
            )
        });

        match ready_rx
            .recv_timeout(Duration::from_secs_f64(ready_timeout()))
        {
            Ok(Ok((wake, local_addr))) => Ok(Controller {
                shutdown,
                accept_thread: Some(accept_thread),
                wake,
                local_addr,
            }),
            Ok(Err(e)) => {
                let _ = accept_thread.join();
                Err(e)
            },
            Err(_) => {
                shutdown.store(true, Ordering::SeqCst);
                Err(Error::ListenerNotReady)
            },
        }
    }

    /// The bound address of a TCP listener; useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn stop(mut self) {
        self.stop_impl();
    }

    fn stop_impl(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);

        // Unblock the accept loop so it notices the flag.
        match self.wake {
            WakeAddr::Tcp(addr) => {
                let _ = TcpStream::connect(addr);
            },
            WakeAddr::Unix(ref path) => {
                let _ = UnixStream::connect(path);
            },
        }

        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }

        if let WakeAddr::Unix(ref path) = self.wake {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if self.accept_thread.is_some() {
            self.stop_impl();
        }
    }
}

fn ready_timeout() -> f64 {
    std::env::var(READY_TIMEOUT_VAR)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(DEFAULT_READY_TIMEOUT)
}

type ReadySignal = Result<(WakeAddr, Option<SocketAddr>), Error>;

#[allow(clippy::too_many_arguments)]
fn accept_loop<H: Handler>(
    bind: Bind,
    config: Arc<ServerConfig>,
    handler: Arc<H>,
    tls_acceptor: Option<SslAcceptor>,
    implicit_tls: bool,
    host_name: String,
    shutdown: Arc<AtomicBool>,
    ready_tx: mpsc::Sender<ReadySignal>,
) {
    match bind {
        Bind::Tcp { host, port } => {
            let host = match host.as_deref() {
                None => "::1".to_owned(),
                Some("") => "::".to_owned(),
                Some(host) => host.to_owned(),
            };

            let listener =
                match std::net::TcpListener::bind((host.as_str(), port)) {
                    Ok(listener) => listener,
                    Err(e) => {
                        let _ = ready_tx.send(Err(Error::Io(e)));
                        return;
                    },
                };
            let local_addr = match listener.local_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    let _ = ready_tx.send(Err(Error::Io(e)));
                    return;
                },
            };

            info!("Listening on {}", local_addr);
            let _ = ready_tx
                .send(Ok((WakeAddr::Tcp(local_addr), Some(local_addr))));

            loop {
                match listener.accept() {
                    Ok((sock, peer)) => {
                        if shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        spawn_connection(
                            sock,
                            peer.to_string(),
                            Arc::clone(&config),
                            Arc::clone(&handler),
                            tls_acceptor.clone(),
                            implicit_tls,
                            host_name.clone(),
                        );
                    },
                    Err(e) => {
                        if shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        warn!("Failed to accept connection: {}", e);
                    },
                }
            }
        },

        Bind::Unix { path } => {
            if path.exists() {
                let _ = std::fs::remove_file(&path);
            }

            let listener = match UnixListener::bind(&path) {
                Ok(listener) => listener,
                Err(e) => {
                    let _ = ready_tx.send(Err(Error::Io(e)));
                    return;
                },
            };

            info!("Listening on {}", path.display());
            let _ =
                ready_tx.send(Ok((WakeAddr::Unix(path.clone()), None)));

            loop {
                match listener.accept() {
                    Ok((sock, _)) => {
                        if shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        spawn_connection(
                            sock,
                            path.display().to_string(),
                            Arc::clone(&config),
                            Arc::clone(&handler),
                            tls_acceptor.clone(),
                            implicit_tls,
                            host_name.clone(),
                        );
                    },
                    Err(e) => {
                        if shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        warn!("Failed to accept connection: {}", e);
                    },
                }
            }
        },
    }

    info!("Listener stopped");
}

fn spawn_connection<H: Handler, S: AsRawFd + Any + Send>(
    sock: S,
    peer: String,
    config: Arc<ServerConfig>,
    handler: Arc<H>,
    tls_acceptor: Option<SslAcceptor>,
    implicit_tls: bool,
    host_name: String,
) {
    thread::spawn(move || {
        run_connection(
            sock,
            peer,
            config,
            handler,
            tls_acceptor,
            implicit_tls,
            host_name,
        )
    });
}

#[tokio::main(flavor = "current_thread")]
async fn run_connection<H: Handler, S: AsRawFd + Any>(
    sock: S,
    peer: String,
    config: Arc<ServerConfig>,
    handler: Arc<H>,
    tls_acceptor: Option<SslAcceptor>,
    implicit_tls: bool,
    host_name: String,
) {
    let protocol = match (config.lmtp, implicit_tls) {
        (false, false) => "smtp",
        (false, true) => "smtps",
        (true, false) => "lmtp",
        (true, true) => "lmtps",
    };
    let log_prefix = LogPrefix::new(format!("{}:{}", protocol, peer));
    info!("{} Connection established", log_prefix);

    let io = match ConnIo::new_owned_socket(sock) {
        Ok(io) => io,
        Err(e) => {
            error!(
                "{} Unable to put socket into non-blocking mode: {}",
                log_prefix, e,
            );
            return;
        },
    };

    let starttls_acceptor = if implicit_tls {
        let acceptor = tls_acceptor.expect("implicit TLS without acceptor");
        match tokio::time::timeout(
            Duration::from_secs(30),
            io.tls_accept(&acceptor),
        )
        .await
        {
            Ok(Ok(())) => (),
            Ok(Err(e)) => {
                warn!("{} TLS handshake failed: {}", log_prefix, e);
                return;
            },
            Err(_timeout) => {
                warn!("{} TLS handshake timed out", log_prefix);
                return;
            },
        }

        // A listener that starts in TLS has no use for STARTTLS.
        None
    } else {
        tls_acceptor
    };

    let result = server::serve(
        io,
        config,
        handler,
        log_prefix.clone(),
        starttls_acceptor,
        host_name,
        peer,
    )
    .await;

    match result {
        Ok(()) => info!("{} Normal client disconnect", log_prefix),
        Err(ref e) if e.is_disconnect() => {
            info!("{} Client disconnect: {}", log_prefix, e)
        },
        Err(e) => warn!("{} Abnormal client disconnect: {}", log_prefix, e),
    }
}

#[cfg(test)]
mod test {
    use std::io::{BufRead, BufReader, Write};

    use super::*;

    struct SinkHandler;
    impl Handler for SinkHandler {}

    fn speak_smtp(io: impl std::io::Read + Write) {
        let mut io = BufReader::new(io);
        let mut line = String::new();
        io.read_line(&mut line).unwrap();
        assert!(line.starts_with("220 "), "bad greeting: {:?}", line);

        io.get_mut().write_all(b"EHLO controller-test\r\n").unwrap();
        loop {
            line.clear();
            io.read_line(&mut line).unwrap();
            assert!(line.starts_with("250"), "bad EHLO reply: {:?}", line);
            if line.starts_with("250 ") {
                break;
            }
        }

        io.get_mut().write_all(b"QUIT\r\n").unwrap();
        line.clear();
        io.read_line(&mut line).unwrap();
        assert!(line.starts_with("221 "), "bad goodbye: {:?}", line);
    }

    #[test]
    fn tcp_controller_lifecycle() {
        crate::init_test_log();

        let controller = Controller::start(
            Bind::Tcp { host: None, port: 0 },
            Arc::new(ServerConfig {
                hostname: "localhost".to_owned(),
                ..ServerConfig::default()
            }),
            Arc::new(SinkHandler),
            false,
        )
        .unwrap();

        let addr = controller.local_addr().unwrap();
        speak_smtp(TcpStream::connect(addr).unwrap());
        // The listener accepts more than one connection.
        speak_smtp(TcpStream::connect(addr).unwrap());

        controller.stop();
        // After stop, connections are refused or reset.
        let gone = TcpStream::connect(addr)
            .map(|s| {
                let mut line = String::new();
                BufReader::new(s).read_line(&mut line).unwrap_or(0) == 0
            })
            .unwrap_or(true);
        assert!(gone);
    }

    #[test]
    fn unix_controller_lifecycle() {
        crate::init_test_log();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inlet.sock");
        let controller = Controller::start(
            Bind::Unix { path: path.clone() },
            Arc::new(ServerConfig {
                hostname: "localhost".to_owned(),
                ..ServerConfig::default()
            }),
            Arc::new(SinkHandler),
            false,
        )
        .unwrap();

        speak_smtp(UnixStream::connect(&path).unwrap());
        controller.stop();
        assert!(!path.exists());
    }
}
