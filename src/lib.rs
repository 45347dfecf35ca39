//-
// Copyright (c) 2023, 2024, Jason Lingle
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

//! An embeddable SMTP/LMTP server core.
//!
//! Inlet terminates SMTP or LMTP connections over TCP or UNIX-domain
//! sockets, speaks the SIZE, 8BITMIME, SMTPUTF8, STARTTLS and AUTH
//! extensions plus the HAProxy PROXY preamble, and leaves every policy
//! decision — acceptance, storage, authentication — to a
//! [`Handler`](smtp::handler::Handler) the embedder supplies. It performs
//! no queueing, routing or onward delivery, which makes it suitable both as
//! a programmable test fixture and as the front door of a real mail
//! system.
//!
//! The quickest start is [`frontend::Controller`], which binds a listener
//! on its own thread; embedders that manage their own sockets and runtimes
//! call [`smtp::server::serve`] directly with one connection at a time.

pub mod frontend;
pub mod smtp;
pub mod support;

pub use crate::frontend::{Bind, Controller};
pub use crate::smtp::handler::{
    AuthResult, Credentials, Handler, HandlerError, HookResult, Reply,
    ServerContext,
};
pub use crate::smtp::proxy::ProxyInfo;
pub use crate::smtp::server::serve;
pub use crate::smtp::session::{Body, Envelope, Session};
pub use crate::support::config::{ServerConfig, TlsConfig};
pub use crate::support::error::Error;

#[cfg(test)]
static INIT_TEST_LOG: std::sync::Once = std::sync::Once::new();

#[cfg(test)]
fn init_test_log() {
    INIT_TEST_LOG.call_once(|| {
        if !std::env::var("TEST_LOG").ok().map_or(false, |v| "1" == v) {
            return;
        }

        let stderr = log4rs::append::console::ConsoleAppender::builder()
            .target(log4rs::append::console::Target::Stderr)
            .encoder(Box::new(log4rs::encode::pattern::PatternEncoder::new(
                "{d(%H:%M:%S%.3f)} [{l}][{t}] {m}{n}",
            )))
            .build();
        let log_config = log4rs::config::Config::builder()
            .appender(
                log4rs::config::Appender::builder()
                    .build("stderr", Box::new(stderr)),
            )
            .build(
                log4rs::config::Root::builder()
                    .appender("stderr")
                    .build(log::LevelFilter::Trace),
            )
            .unwrap();
        log4rs::init_config(log_config).unwrap();
    })
}
