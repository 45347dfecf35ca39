//-
// Copyright (c) 2023, Jason Lingle
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

use std::any::Any;
use std::cell::RefCell;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::rc::Rc;
use std::task;

use openssl::ssl::{SslAcceptor, SslStream};
use tokio::io::{
    unix::{AsyncFd, AsyncFdReadyGuard},
    AsyncRead, AsyncWrite, ReadBuf,
};

use crate::support::error::Error;

/// The I/O handle for one server connection.
///
/// This fulfils two roles:
/// - Supporting switching from cleartext to TLS mid-stream, as STARTTLS
///   requires, without recreating the reader/writer stack.
/// - Owning the accepted socket so it is closed exactly when the last
///   reference goes away.
///
/// Clones of `ConnIo` track the same underlying state, so the handle that
/// performed the TLS upgrade and any clone taken before it see the same
/// mode.
#[derive(Clone)]
pub struct ConnIo {
    fd: Rc<AsyncFd<RawFd>>,
    mode: Rc<RefCell<Mode>>,
    _owned: Rc<dyn Any>,
}

enum Mode {
    Cleartext(FdRw),
    Tls(SslStream<FdRw>),
}

impl ConnIo {
    /// Sets up a `ConnIo` which runs over the given socket.
    ///
    /// The `ConnIo` owns the socket; it is closed when the last clone is
    /// dropped.
    ///
    /// This only fails if making the socket non-blocking fails. It must be
    /// called from within a tokio runtime.
    pub fn new_owned_socket(
        sock: impl AsRawFd + Any,
    ) -> Result<Self, nix::Error> {
        let fd = sock.as_raw_fd();
        nix::fcntl::fcntl(
            fd,
            nix::fcntl::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )?;

        let fd = Rc::new(
            AsyncFd::with_interest(
                fd,
                tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE,
            )
            .unwrap(),
        );

        Ok(Self {
            fd: Rc::clone(&fd),
            mode: Rc::new(RefCell::new(Mode::Cleartext(FdRw(fd)))),
            _owned: Rc::new(sock),
        })
    }

    pub fn is_tls(&self) -> bool {
        matches!(*self.mode.borrow(), Mode::Tls(_))
    }

    /// Describes the negotiated TLS session as `version:cipher:bits`, if TLS
    /// is active.
    pub fn tls_info(&self) -> Option<String> {
        match *self.mode.borrow() {
            Mode::Cleartext(..) => None,
            Mode::Tls(ref stream) => {
                let ssl = stream.ssl();
                let cipher = ssl.current_cipher();
                Some(format!(
                    "{version}:{cipher}:{bits}",
                    version = ssl.version_str(),
                    cipher = cipher.map_or("NONE", |c| c.name()),
                    bits = cipher.map_or(0, |c| c.bits().algorithm),
                ))
            },
        }
    }

    /// Performs the server side of a TLS handshake with the given acceptor.
    ///
    /// On success, all subsequent reads and writes go through the TLS layer.
    /// During the accept flow, concurrent calls to other methods will panic.
    pub async fn tls_accept(
        &self,
        acceptor: &SslAcceptor,
    ) -> Result<(), Error> {
        // Borrow mode immediately so that concurrent access panics.
        #[allow(clippy::await_holding_refcell_ref)] // intentional
        let mut mode = self.mode.borrow_mut();
        let mut result = acceptor.accept(FdRw(Rc::clone(&self.fd)));

        // There's no way to tell Tokio "I just saw that the fd is not ready,
        // block until it's ready again"; nor to know which readiness OpenSSL
        // needs without running one pass of the handshake. So we fetch the
        // guard when Tokio believes the operation is ready (it often isn't,
        // since OpenSSL just told us otherwise, but the await point may have
        // changed that) and run another handshake pass. When we get another
        // WANT_READ/WANT_WRITE while holding the guard, we can finally tell
        // Tokio the fd is not ready and drop the guard.
        let mut read_guard = None::<AsyncFdReadyGuard<'_, _>>;
        let mut write_guard = None::<AsyncFdReadyGuard<'_, _>>;

        loop {
            match result {
                Ok(stream) => {
                    *mode = Mode::Tls(stream);
                    return Ok(());
                },

                Err(openssl::ssl::HandshakeError::SetupFailure(e)) => {
                    return Err(e.into());
                },

                Err(openssl::ssl::HandshakeError::Failure(mhss)) => {
                    return Err(mhss_to_error(mhss));
                },

                Err(openssl::ssl::HandshakeError::WouldBlock(mhss)) => {
                    match mhss.error().code() {
                        openssl::ssl::ErrorCode::WANT_READ => {
                            if let Some(mut read_guard) = read_guard.take() {
                                read_guard.clear_ready();
                            }

                            read_guard = Some(self.fd.readable().await?);
                            result = mhss.handshake();
                        },

                        openssl::ssl::ErrorCode::WANT_WRITE => {
                            if let Some(mut write_guard) = write_guard.take() {
                                write_guard.clear_ready();
                            }

                            write_guard = Some(self.fd.writable().await?);
                            result = mhss.handshake();
                        },

                        _ => return Err(mhss_to_error(mhss)),
                    }
                },
            }
        }
    }

    /// Called when an error is returned from `ssl_read` or `ssl_write`.
    ///
    /// The main purpose of this function is to handle the cases where
    /// OpenSSL returns `WANT_READ` or `WANT_WRITE`: it arranges a readiness
    /// check for the fd and clears its readiness status if currently set. It
    /// is critical that this *only* be called immediately after `ssl_read`
    /// or `ssl_write`, with no await points in between, so that we can be
    /// certain the `WANT_READ`/`WANT_WRITE` means there is absolutely no
    /// data on the socket.
    fn on_rw_ssl_error(
        &self,
        ctx: &mut task::Context<'_>,
        e: openssl::ssl::Error,
    ) -> task::Poll<io::Result<()>> {
        match e.code() {
            openssl::ssl::ErrorCode::WANT_READ => {
                futures::ready!(self.fd.poll_read_ready(ctx))?.clear_ready();
                // Call again to get tokio to actually watch for more changes.
                futures::ready!(self.fd.poll_read_ready(ctx))?.retain_ready();
                // If we get here, the fd has somehow become ready meanwhile.
                task::Poll::Ready(Ok(()))
            },

            openssl::ssl::ErrorCode::WANT_WRITE => {
                futures::ready!(self.fd.poll_write_ready(ctx))?.clear_ready();
                // Call again to get tokio to actually watch for more changes.
                futures::ready!(self.fd.poll_write_ready(ctx))?.retain_ready();
                // If we get here, the fd has somehow become ready meanwhile.
                task::Poll::Ready(Ok(()))
            },

            // As can be seen in the `fmt::Display` implementation of
            // `openssl::ssl::Error`, EOF is represented by the SYSCALL error
            // code with no associated IO error, and into_io_error() doesn't
            // bother to translate that.
            openssl::ssl::ErrorCode::SYSCALL => task::Poll::Ready(Err(e
                .into_io_error()
                .unwrap_or_else(|_| io::ErrorKind::UnexpectedEof.into()))),

            _ => task::Poll::Ready(Err(e
                .into_io_error()
                .unwrap_or_else(|e| io::Error::new(io::ErrorKind::Other, e)))),
        }
    }
}

impl AsyncRead for ConnIo {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let mut mode = self.mode.borrow_mut();
        match *mode {
            Mode::Cleartext(ref mut f) => Pin::new(f).poll_read(ctx, buf),
            Mode::Tls(ref mut ssl) => loop {
                match ssl.ssl_read(buf.initialize_unfilled()) {
                    Ok(n) => {
                        buf.advance(n);
                        return task::Poll::Ready(Ok(()));
                    },

                    Err(e) => futures::ready!(self.on_rw_ssl_error(ctx, e))?,
                }
            },
        }
    }
}

impl AsyncWrite for ConnIo {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        let mut mode = self.mode.borrow_mut();
        match *mode {
            Mode::Cleartext(ref mut f) => Pin::new(f).poll_write(ctx, buf),
            Mode::Tls(ref mut ssl) => loop {
                match ssl.ssl_write(buf) {
                    Ok(n) => return task::Poll::Ready(Ok(n)),
                    Err(e) => futures::ready!(self.on_rw_ssl_error(ctx, e))?,
                }
            },
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        // OpenSSL doesn't buffer anything itself (SslStream::flush() just
        // delegates to the underlying writer without invoking OpenSSL) and
        // we also have no buffers, so there's nothing to do.
        task::Poll::Ready(Ok(()))
    }

    /// If there is a TLS session, the session is shut down, returning the
    /// socket to cleartext.
    ///
    /// During the shutdown process, other reads and writes are not
    /// well-defined.
    fn poll_shutdown(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        let mut mode = self.mode.borrow_mut();
        let done = if let Mode::Tls(ref mut ssl) = *mode {
            loop {
                match ssl.shutdown() {
                    Ok(openssl::ssl::ShutdownResult::Received) => break,
                    Ok(openssl::ssl::ShutdownResult::Sent) => {
                        return task::Poll::Pending;
                    },

                    Err(e) => futures::ready!(self.on_rw_ssl_error(ctx, e))?,
                }
            }

            true
        } else {
            false
        };

        if done {
            *mode = Mode::Cleartext(FdRw(Rc::clone(&self.fd)));
        }

        task::Poll::Ready(Ok(()))
    }
}

/// Implements both the synchronous and asynchronous read and write traits
/// atop the shared raw file descriptor.
///
/// The synchronous implementations exist so that OpenSSL, which knows
/// nothing of async, can drive the descriptor directly; the `WANT_READ` and
/// `WANT_WRITE` results it produces on `EWOULDBLOCK` are translated back
/// into readiness polling by `ConnIo`.
struct FdRw(Rc<AsyncFd<RawFd>>);

impl io::Read for FdRw {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        nix::unistd::read(*self.0.get_ref(), dst).map_err(nix_to_io)
    }
}

impl io::Write for FdRw {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        nix::unistd::write(*self.0.get_ref(), src).map_err(nix_to_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsyncRead for FdRw {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        loop {
            let mut guard = futures::ready!(self.0.poll_read_ready(ctx))?;

            match guard.try_io(|fd| {
                nix::unistd::read(*fd.get_ref(), buf.initialize_unfilled())
                    .map_err(nix_to_io)
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return task::Poll::Ready(Ok(()));
                },

                Ok(Err(e)) => return task::Poll::Ready(Err(e)),

                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for FdRw {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        loop {
            let mut guard = futures::ready!(self.0.poll_write_ready(ctx))?;

            if let Ok(result) = guard.try_io(|fd| {
                nix::unistd::write(*fd.get_ref(), buf).map_err(nix_to_io)
            }) {
                return task::Poll::Ready(result);
            }
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        task::Poll::Ready(Ok(()))
    }
}

fn nix_to_io(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn mhss_to_error<S>(mhss: openssl::ssl::MidHandshakeSslStream<S>) -> Error {
    let e = mhss.into_error();
    if let Some(es) = e.ssl_error() {
        Error::Ssl(es.clone())
    } else {
        match e.into_io_error() {
            Ok(io) => Error::Io(io),
            Err(e) if e.code() == openssl::ssl::ErrorCode::SYSCALL => {
                Error::Io(io::ErrorKind::UnexpectedEof.into())
            },
            Err(e) => Error::Io(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}
