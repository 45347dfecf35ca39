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

//! The contract between the dispatcher and the embedding application.
//!
//! Every hook has a default body, and the defaults together form a server
//! that accepts everything and stores nothing. An embedder overrides only
//! the hooks it cares about. Hooks returning a status are taken verbatim:
//! the returned string must begin with a three-digit reply code and, for
//! multi-line replies, follow the continuation-hyphen convention.
//!
//! Hooks that accept `&mut Session`/`&mut Envelope` are also responsible
//! for the related state change: `handle_mail` records the sender,
//! `handle_rcpt` appends the recipient, and the greeting hooks record the
//! client host name. Declining to record the value (while still returning a
//! 2xx) leaves the state machine where it was, which is how a handler can
//! accept a command socially but not advance the transaction.

use std::sync::Arc;

use crate::smtp::auth::AuthExchange;
use crate::smtp::proxy::ProxyInfo;
use crate::smtp::session::{Envelope, Session};
use crate::support::config::ServerConfig;

/// Errors produced by handler hooks.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// What a hook tells the dispatcher to send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// One reply, sent verbatim.
    Status(String),
    /// Several reply lines, sent verbatim in order. For `handle_ehlo` this
    /// is the capability listing; for `handle_data` under LMTP it is one
    /// status per recipient.
    Lines(Vec<String>),
}

impl Reply {
    pub fn status(status: impl Into<String>) -> Self {
        Reply::Status(status.into())
    }
}

pub type HookResult = Result<Reply, HandlerError>;

/// The outcome of an authentication exchange or credential check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthResult {
    /// Success; the value becomes `session.auth_identity`.
    Identity(String),
    /// The credentials were checked and rejected.
    Invalid,
    /// Send this reply verbatim and end the exchange.
    Status(String),
    /// The hook does not implement this mechanism (or any); let the
    /// built-in machinery, or the generic failure path, take over.
    Unhandled,
}

/// Credentials extracted by the PLAIN and LOGIN mechanisms.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

/// Server identity and configuration, passed to every hook by shared
/// reference.
#[derive(Clone, Debug)]
pub struct ServerContext {
    /// The advertised host name.
    pub hostname: String,
    /// The identification string in the banner.
    pub ident: String,
    pub config: Arc<ServerConfig>,
}

#[allow(async_fn_in_trait)]
pub trait Handler: Send + Sync + 'static {
    async fn handle_helo(
        &self,
        cx: &ServerContext,
        session: &mut Session,
        _envelope: &mut Envelope,
        hostname: &str,
    ) -> HookResult {
        session.host_name = Some(hostname.to_owned());
        Ok(Reply::Status(format!("250 {}", cx.hostname)))
    }

    /// Handles EHLO/LHLO.
    ///
    /// `responses` is the dispatcher's planned reply, one line per entry
    /// with the final line carrying the space continuation. Whatever this
    /// hook returns is sent verbatim; implementations that edit the list
    /// should leave the first line (the server host name) and the final
    /// `250 HELP` alone.
    async fn handle_ehlo(
        &self,
        _cx: &ServerContext,
        session: &mut Session,
        _envelope: &mut Envelope,
        hostname: &str,
        responses: Vec<String>,
    ) -> HookResult {
        session.host_name = Some(hostname.to_owned());
        Ok(Reply::Lines(responses))
    }

    /// Handles MAIL FROM. Must record `envelope.mail_from` on acceptance.
    async fn handle_mail(
        &self,
        _cx: &ServerContext,
        _session: &mut Session,
        envelope: &mut Envelope,
        address: &str,
        mail_options: &[String],
    ) -> HookResult {
        envelope.mail_from = Some(address.to_owned());
        envelope.mail_options.extend(mail_options.iter().cloned());
        Ok(Reply::status("250 OK"))
    }

    /// Handles RCPT TO. Must append to `envelope.rcpt_tos` on acceptance.
    async fn handle_rcpt(
        &self,
        _cx: &ServerContext,
        _session: &mut Session,
        envelope: &mut Envelope,
        address: &str,
        rcpt_options: &[String],
    ) -> HookResult {
        envelope.rcpt_tos.push(address.to_owned());
        envelope.rcpt_options.push(rcpt_options.to_vec());
        Ok(Reply::status("250 OK"))
    }

    /// Handles the completed message.
    ///
    /// In SMTP mode the result is a single status. In LMTP mode, return
    /// `Reply::Lines` with one status per accepted recipient, in the order
    /// they were accepted; a single status is applied to all of them.
    async fn handle_data(
        &self,
        _cx: &ServerContext,
        _session: &mut Session,
        _envelope: &mut Envelope,
    ) -> HookResult {
        Ok(Reply::status("250 OK"))
    }

    async fn handle_rset(
        &self,
        _cx: &ServerContext,
        _session: &mut Session,
        _envelope: &mut Envelope,
    ) -> HookResult {
        Ok(Reply::status("250 OK"))
    }

    async fn handle_noop(
        &self,
        _cx: &ServerContext,
        _session: &mut Session,
        _envelope: &mut Envelope,
    ) -> HookResult {
        Ok(Reply::status("250 OK"))
    }

    async fn handle_quit(
        &self,
        _cx: &ServerContext,
        _session: &mut Session,
        _envelope: &mut Envelope,
    ) -> HookResult {
        Ok(Reply::status("221 Bye"))
    }

    async fn handle_vrfy(
        &self,
        _cx: &ServerContext,
        _session: &mut Session,
        _envelope: &mut Envelope,
        _address: &str,
    ) -> HookResult {
        Ok(Reply::status(
            "252 Cannot VRFY user, but will accept message \
             and attempt delivery",
        ))
    }

    /// Gate called after `STARTTLS` is accepted syntactically but before
    /// the reply and handshake. Returning false refuses the upgrade.
    fn handle_starttls(
        &self,
        _session: &Session,
        _envelope: &Envelope,
    ) -> bool {
        true
    }

    /// Gate called after a valid PROXY header is read, before any banner.
    /// Returning false drops the connection without a reply.
    fn handle_proxy(&self, _session: &Session, _proxy: &ProxyInfo) -> bool {
        true
    }

    /// Translates a failed hook into a reply. Returning `None` makes the
    /// dispatcher log the error and reply with a generic 500.
    fn handle_exception(&self, _error: &HandlerError) -> Option<String> {
        None
    }

    /// Extra SASL mechanism names (beyond the built-in PLAIN and LOGIN)
    /// this handler can run through `handle_auth`.
    fn auth_mechanisms(&self) -> Vec<String> {
        Vec::new()
    }

    /// Runs a custom authentication exchange.
    ///
    /// Called for every AUTH command before the built-in mechanisms.
    /// `exchange` carries the client's initial response, if any, and issues
    /// `334` challenges. Return `Unhandled` to fall through to the
    /// built-ins.
    async fn handle_auth(
        &self,
        _cx: &ServerContext,
        _session: &mut Session,
        _mechanism: &str,
        _exchange: &mut AuthExchange<'_>,
    ) -> Result<AuthResult, HandlerError> {
        Ok(AuthResult::Unhandled)
    }

    /// Checks credentials collected by the built-in PLAIN and LOGIN
    /// mechanisms.
    ///
    /// The default refuses to vouch for anyone, which surfaces to clients
    /// as a temporary authentication failure.
    async fn authenticate(
        &self,
        _cx: &ServerContext,
        _session: &Session,
        _mechanism: &str,
        _credentials: &Credentials,
    ) -> Result<AuthResult, HandlerError> {
        Ok(AuthResult::Unhandled)
    }
}
