//-
// Copyright (c) 2023, 2024, 2025, Jason Lingle
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

//! The per-connection command dispatcher.
//!
//! One `serve()` call owns one connection from banner to close: it consumes
//! an optional PROXY preamble, enforces command sequencing, runs the AUTH
//! engine, performs the STARTTLS upgrade, collects message data, and calls
//! the embedder's [`Handler`](crate::smtp::handler::Handler) hooks at every
//! policy decision. All replies the dispatcher produces itself use the
//! wording clients of this protocol family have come to expect.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use openssl::ssl::SslAcceptor;
use tokio::io::{AsyncWriteExt, BufStream};
use tokio::sync::mpsc;

use crate::smtp::auth::{self, AuthOutcome};
use crate::smtp::handler::{
    AuthResult, Handler, HandlerError, Reply, ServerContext,
};
use crate::smtp::proxy;
use crate::smtp::session::{Body, Envelope, Session};
use crate::smtp::syntax::{self, Command};
use crate::smtp::transport::{self, LineRead};
use crate::support::async_io::ConnIo;
use crate::support::config::ServerConfig;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseKind {
    /// The last in a series of responses.
    ///
    /// Indicates no continuation and forces a flush.
    Final,
    /// A non-final response which needs to be sent immediately.
    Urgent,
    /// A non-final response that is safe to buffer.
    Delayable,
}

impl ResponseKind {
    fn or_final(self, phinal: bool) -> Self {
        if phinal {
            ResponseKind::Final
        } else {
            self
        }
    }
}

use self::ResponseKind::*;

macro_rules! require {
    ($this:expr, $($fns:ident),*) => {
        $(if let Some(r) = $this.$fns().await { return r; })*
    };
}

/// Runs one connection to completion.
///
/// `io` must be in the state the client expects: already TLS for an
/// implicit-TLS listener, cleartext otherwise. `ssl_acceptor` enables
/// STARTTLS; pass `None` on implicit-TLS listeners.
///
/// The returned error describes why the connection ended when it did not
/// end with QUIT; `Error::is_disconnect` distinguishes routine client
/// behavior from real problems.
pub async fn serve<H: Handler>(
    io: ConnIo,
    config: Arc<ServerConfig>,
    handler: Arc<H>,
    log_prefix: LogPrefix,
    ssl_acceptor: Option<SslAcceptor>,
    local_host_name: String,
    peer: String,
) -> Result<(), Error> {
    config.validate()?;

    let (deadline_tx, deadline_rx) = mpsc::channel(1);

    let mut session = Session::new(peer);
    session.tls_active = io.is_tls();
    session.tls_info = io.tls_info();

    let cx = ServerContext {
        hostname: local_host_name,
        ident: config.ident.clone().unwrap_or_else(|| {
            format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
        }),
        config: Arc::clone(&config),
    };

    let command_timeout = Duration::from_secs_f64(config.timeout);
    let mut server = Server {
        io: BufStream::new(io),
        config,
        handler,
        cx,
        log_prefix,
        ssl_acceptor,
        session,
        envelope: Envelope::default(),
        deadline_tx,
        quit: false,
        unix_newlines: false,
    };

    let (timed_out, result) = tokio::select! {
        r = server.run() => (false, r),
        _ = idle_timer(deadline_rx, command_timeout) => (
            true,
            Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "Connection idle timer expired",
            ))),
        ),
    };

    if timed_out {
        // Best effort; the client may already be gone.
        let _ = server.push("421 Timeout waiting for data from client.").await;
    }

    result
}

struct Server<H: Handler> {
    io: BufStream<ConnIo>,
    config: Arc<ServerConfig>,
    handler: Arc<H>,
    cx: ServerContext,
    log_prefix: LogPrefix,
    ssl_acceptor: Option<SslAcceptor>,

    session: Session,
    envelope: Envelope,

    deadline_tx: mpsc::Sender<Instant>,
    quit: bool,
    /// Whether any UNIX newlines have been seen in commands.
    unix_newlines: bool,
}

impl<H: Handler> Server<H> {
    async fn run(&mut self) -> Result<(), Error> {
        if self.config.proxy_protocol_timeout > 0.0
            && !self.consume_proxy_header().await?
        {
            return Ok(());
        }

        self.send_greeting().await?;

        while !self.quit {
            self.run_command().await?;
        }

        Ok(())
    }

    /// Consumes the PROXY preamble required of this connection.
    ///
    /// Returns false if the connection must be dropped; no banner or reply
    /// of any kind is written in that case.
    async fn consume_proxy_header(&mut self) -> Result<bool, Error> {
        let allowed =
            Duration::from_secs_f64(self.config.proxy_protocol_timeout);
        let info = match tokio::time::timeout(
            allowed,
            proxy::read_proxy_header(&mut self.io),
        )
        .await
        {
            Err(_elapsed) => {
                warn!(
                    "{} No PROXY header within {:?}",
                    self.log_prefix, allowed,
                );
                return Ok(false);
            },
            Ok(Err(e)) => {
                warn!("{} Error reading PROXY header: {}", self.log_prefix, e);
                return Ok(false);
            },
            Ok(Ok(info)) => info,
        };

        if !info.valid() {
            warn!(
                "{} Rejected PROXY header: {}",
                self.log_prefix,
                info.error.as_deref().unwrap_or("invalid"),
            );
            return Ok(false);
        }

        if !self.handler.handle_proxy(&self.session, &info) {
            info!(
                "{} Handler rejected proxied connection from {}",
                self.log_prefix,
                info.source_description(),
            );
            return Ok(false);
        }

        info!(
            "{} PROXY header accepted, client is {}",
            self.log_prefix,
            info.source_description(),
        );
        self.session.proxy_data = Some(info);
        Ok(true)
    }

    async fn send_greeting(&mut self) -> Result<(), Error> {
        let greeting =
            format!("220 {} {}", self.cx.hostname, self.cx.ident);
        self.push(&greeting).await
    }

    async fn run_command(&mut self) -> Result<(), Error> {
        let _ = self
            .deadline_tx
            .send(Instant::now() + self.timeout())
            .await;

        let line = match transport::read_line(
            &mut self.io,
            self.config.line_length_limit,
        )
        .await?
        {
            LineRead::TooLong => {
                return self.push("500 Error: line too long").await;
            },
            LineRead::Malformed => {
                return self.push("500 Error: bad syntax").await;
            },
            LineRead::Line { text, crlf } => {
                if !crlf {
                    self.unix_newlines = true;
                }
                text
            },
        };

        let command = syntax::parse_command_line(&line);

        if let Command::Empty = command {
            return self.push("500 Error: bad syntax").await;
        }

        if self.config.require_starttls
            && !self.session.tls_active
            && !allowed_before_tls(&command)
        {
            // RFC 3207 §4
            return self
                .push("530 Must issue a STARTTLS command first")
                .await;
        }

        if self.config.auth_required
            && !self.session.authenticated
            && !allowed_before_auth(&command)
        {
            return self.push("530 5.7.0 Authentication required").await;
        }

        match command {
            Command::Empty => unreachable!(),
            Command::Unknown(verb) => {
                warn!(
                    "{} Received unknown command {:?}",
                    self.log_prefix, verb,
                );
                self.push(&format!(
                    "500 Error: command \"{}\" not recognized",
                    verb
                ))
                .await
            },
            Command::Helo(verb, origin) => self.cmd_helo(verb, origin).await,
            Command::Mail(arg) => self.cmd_mail(&arg).await,
            Command::Rcpt(arg) => self.cmd_rcpt(&arg).await,
            Command::Data(arg) => self.cmd_data(&arg).await,
            Command::Rset(arg) => self.cmd_rset(&arg).await,
            Command::Noop(arg) => self.cmd_noop(&arg).await,
            Command::Quit(arg) => self.cmd_quit(&arg).await,
            Command::Vrfy(arg) => self.cmd_vrfy(&arg).await,
            Command::Expn(_) => self.push("502 EXPN not implemented").await,
            Command::Help(arg) => self.cmd_help(&arg).await,
            Command::StartTls(arg) => self.cmd_starttls(&arg).await,
            Command::Auth(arg) => self.cmd_auth(&arg).await,
        }
    }

    async fn cmd_helo(
        &mut self,
        verb: String,
        origin: String,
    ) -> Result<(), Error> {
        // LMTP has only LHLO; the SMTP greetings do not exist there, and
        // vice versa.
        let wrong_mode = if self.config.lmtp {
            "LHLO" != verb
        } else {
            "LHLO" == verb
        };
        if wrong_mode {
            return self
                .push(&format!(
                    "500 Error: command \"{}\" not recognized",
                    verb
                ))
                .await;
        }

        if origin.is_empty() {
            return self.push(&format!("501 Syntax: {} hostname", verb)).await;
        }

        let extended = "HELO" != verb;

        // A repeated greeting starts the dialogue over.
        self.envelope = Envelope::default();
        self.session.host_name = None;
        self.session.extended_smtp = extended;

        self.log_prefix.set_helo(origin.clone());
        info!("{} {} {}", self.log_prefix, verb, origin);

        let handler = Arc::clone(&self.handler);
        let reply = if extended {
            let responses = self.ehlo_response_lines();
            handler
                .handle_ehlo(
                    &self.cx,
                    &mut self.session,
                    &mut self.envelope,
                    &origin,
                    responses,
                )
                .await
        } else {
            handler
                .handle_helo(
                    &self.cx,
                    &mut self.session,
                    &mut self.envelope,
                    &origin,
                )
                .await
        };

        self.push_reply(reply).await
    }

    /// The planned EHLO/LHLO reply, one line per advertised capability.
    ///
    /// The handler receives this list and may return a replacement, which
    /// is honored verbatim.
    fn ehlo_response_lines(&self) -> Vec<String> {
        let mut lines = vec![format!("250-{}", self.cx.hostname)];

        if self.config.data_size_limit > 0 {
            lines.push(format!("250-SIZE {}", self.config.data_size_limit));
        }
        if !self.config.decode_data {
            lines.push("250-8BITMIME".to_owned());
        }
        if self.config.enable_smtputf8 {
            lines.push("250-SMTPUTF8".to_owned());
        }
        if self.session.tls_active || !self.config.auth_require_tls {
            let mechanisms =
                auth::selectable_mechanisms(&self.config, &*self.handler);
            if !mechanisms.is_empty() {
                lines.push(format!("250-AUTH {}", mechanisms.join(" ")));
            }
        }
        // RFC 3207 requires not offering STARTTLS after TLS has been
        // negotiated.
        if self.ssl_acceptor.is_some() && !self.session.tls_active {
            lines.push("250-STARTTLS".to_owned());
        }
        lines.push("250 HELP".to_owned());

        lines
    }

    async fn cmd_mail(&mut self, arg: &str) -> Result<(), Error> {
        require!(self, need_helo);

        if self.envelope.mail_from.is_some() {
            return self.push("503 Error: nested MAIL command").await;
        }

        let extended = self.session.extended_smtp;
        let syntaxerr = if extended {
            "501 Syntax: MAIL FROM: <address> [SP <mail-parameters>]"
        } else {
            "501 Syntax: MAIL FROM: <address>"
        };

        let Some(parsed) = syntax::parse_mail_arg(arg) else {
            return self.push(syntaxerr).await;
        };
        let Some(params) = syntax::parse_esmtp_params(&parsed.params) else {
            return self.push(syntaxerr).await;
        };

        if !extended && !params.is_empty() {
            // ESMTP parameters have no place after a HELO greeting.
            return self
                .push(
                    "555 MAIL FROM parameters not recognized or \
                     not implemented",
                )
                .await;
        }

        let mut declared_size = None::<u64>;
        for param in &params {
            match param.keyword.as_str() {
                "SIZE" => {
                    match param
                        .value
                        .as_deref()
                        .filter(|v| v.bytes().all(|c| c.is_ascii_digit()))
                        .and_then(|v| v.parse::<u64>().ok())
                    {
                        Some(size) => declared_size = Some(size),
                        None => return self.push(syntaxerr).await,
                    }
                },
                "BODY" => match param.value.as_deref() {
                    Some("7BIT") | Some("8BITMIME") => (),
                    _ => {
                        return self
                            .push(
                                "501 Error: BODY can only be one of \
                                 7BIT, 8BITMIME",
                            )
                            .await;
                    },
                },
                "SMTPUTF8" if self.config.enable_smtputf8 => {
                    if param.value.is_some() {
                        return self
                            .push("501 Error: SMTPUTF8 takes no arguments")
                            .await;
                    }
                },
                // AUTH=<identity> is accepted and recorded but carries no
                // meaning here; relaying decisions are handler policy.
                "AUTH" if param.value.is_some() => (),
                _ => {
                    return self
                        .push(
                            "555 MAIL FROM parameters not recognized or \
                             not implemented",
                        )
                        .await;
                },
            }
        }

        if let Some(size) = declared_size {
            if self.config.data_size_limit > 0
                && size > self.config.data_size_limit
            {
                return self
                    .push(
                        "552 Error: message size exceeds fixed maximum \
                         message size",
                    )
                    .await;
            }
        }

        info!(
            "{} Start mail transaction, from={:?}",
            self.log_prefix, parsed.address,
        );

        let handler = Arc::clone(&self.handler);
        let reply = handler
            .handle_mail(
                &self.cx,
                &mut self.session,
                &mut self.envelope,
                &parsed.address,
                &parsed.params,
            )
            .await;
        self.push_reply(reply).await
    }

    async fn cmd_rcpt(&mut self, arg: &str) -> Result<(), Error> {
        require!(self, need_helo, need_mail_from);

        let extended = self.session.extended_smtp;
        let syntaxerr = if extended {
            "501 Syntax: RCPT TO: <address> [SP <mail-parameters>]"
        } else {
            "501 Syntax: RCPT TO: <address>"
        };

        let Some(parsed) = syntax::parse_rcpt_arg(arg) else {
            return self.push(syntaxerr).await;
        };
        let Some(params) = syntax::parse_esmtp_params(&parsed.params) else {
            return self.push(syntaxerr).await;
        };

        // No RCPT parameters are recognized by the core.
        if !params.is_empty() {
            return self
                .push(
                    "555 RCPT TO parameters not recognized or \
                     not implemented",
                )
                .await;
        }

        let handler = Arc::clone(&self.handler);
        let reply = handler
            .handle_rcpt(
                &self.cx,
                &mut self.session,
                &mut self.envelope,
                &parsed.address,
                &parsed.params,
            )
            .await;
        self.push_reply(reply).await
    }

    async fn cmd_data(&mut self, arg: &str) -> Result<(), Error> {
        require!(self, need_helo, need_recipients);

        if !arg.is_empty() {
            return self.push("501 Syntax: DATA").await;
        }

        self.push("354 End data with <CR><LF>.<CR><LF>").await?;

        let _ = self
            .deadline_tx
            .send(Instant::now() + self.timeout())
            .await;

        let body = transport::read_data_body(
            &mut self.io,
            self.config.data_size_limit,
            // If the client has been speaking SMTP with UNIX newlines,
            // assume the message may be UNIX-delimited as well.
            self.unix_newlines,
            true,
        )
        .await?;

        if body.oversized {
            warn!(
                "{} Message data exceeded the limit of {} bytes",
                self.log_prefix, self.config.data_size_limit,
            );
            self.envelope = Envelope::default();
            return self.push("552 Error: Too much mail data").await;
        }

        info!(
            "{} Received message data, {} bytes",
            self.log_prefix,
            body.content.len(),
        );

        self.envelope.original_content = Some(body.content.clone());
        self.envelope.content = Some(if self.config.decode_data {
            Body::Text(String::from_utf8_lossy(&body.content).into_owned())
        } else {
            Body::Bytes(body.content)
        });

        let recipients = self.envelope.rcpt_tos.len();
        let handler = Arc::clone(&self.handler);
        let reply = handler
            .handle_data(&self.cx, &mut self.session, &mut self.envelope)
            .await;

        let result = if self.config.lmtp {
            self.push_lmtp_statuses(recipients, reply).await
        } else {
            self.push_reply(reply).await
        };

        self.envelope = Envelope::default();
        result
    }

    /// Reports the delivery outcome per recipient, as LMTP requires.
    ///
    /// A single status from the handler applies to every recipient. A
    /// status list is matched up with the accepted recipients in order;
    /// a list that is too short gets the shortfall made explicit rather
    /// than leaving the client waiting on replies that will never come.
    async fn push_lmtp_statuses(
        &mut self,
        recipients: usize,
        reply: Result<Reply, HandlerError>,
    ) -> Result<(), Error> {
        let statuses = match reply {
            Ok(Reply::Lines(lines)) => lines,
            Ok(Reply::Status(status)) => vec![status; recipients],
            Err(e) => {
                let status = self.hook_error_status(&e);
                vec![status; recipients]
            },
        };

        if statuses.len() > recipients {
            warn!(
                "{} Handler returned {} LMTP statuses for {} recipients",
                self.log_prefix,
                statuses.len(),
                recipients,
            );
        }

        for ix in 0..recipients {
            let status = match statuses.get(ix) {
                Some(status) => status.clone(),
                None => {
                    error!(
                        "{} Missing LMTP status for recipient {}",
                        self.log_prefix, ix,
                    );
                    "500 Internal: missing LMTP response".to_owned()
                },
            };
            self.push_kind(Urgent.or_final(ix + 1 == recipients), &status)
                .await?;
        }

        Ok(())
    }

    async fn cmd_rset(&mut self, arg: &str) -> Result<(), Error> {
        if !arg.is_empty() {
            return self.push("501 Syntax: RSET").await;
        }

        self.envelope = Envelope::default();

        let handler = Arc::clone(&self.handler);
        let reply = handler
            .handle_rset(&self.cx, &mut self.session, &mut self.envelope)
            .await;
        self.push_reply(reply).await
    }

    async fn cmd_noop(&mut self, arg: &str) -> Result<(), Error> {
        if !arg.is_empty() {
            return self.push("501 Syntax: NOOP").await;
        }

        let handler = Arc::clone(&self.handler);
        let reply = handler
            .handle_noop(&self.cx, &mut self.session, &mut self.envelope)
            .await;
        self.push_reply(reply).await
    }

    async fn cmd_quit(&mut self, arg: &str) -> Result<(), Error> {
        if !arg.is_empty() {
            return self.push("501 Syntax: QUIT").await;
        }

        let handler = Arc::clone(&self.handler);
        let reply = handler
            .handle_quit(&self.cx, &mut self.session, &mut self.envelope)
            .await;
        let result = self.push_reply(reply).await;
        self.quit = true;
        result
    }

    async fn cmd_vrfy(&mut self, arg: &str) -> Result<(), Error> {
        if arg.is_empty() {
            return self.push("501 Syntax: VRFY <address>").await;
        }

        let Some(address) = syntax::parse_vrfy_arg(arg) else {
            return self.push(&format!("502 Could not VRFY {}", arg)).await;
        };

        let handler = Arc::clone(&self.handler);
        let reply = handler
            .handle_vrfy(
                &self.cx,
                &mut self.session,
                &mut self.envelope,
                &address,
            )
            .await;
        self.push_reply(reply).await
    }

    async fn cmd_help(&mut self, arg: &str) -> Result<(), Error> {
        const SUPPORTED: &str =
            "Supported commands: EHLO HELO MAIL RCPT DATA RSET NOOP QUIT VRFY";

        if arg.is_empty() {
            return self.push(&format!("250 {}", SUPPORTED)).await;
        }

        let extended_params = if self.session.extended_smtp {
            " [SP <mail-parameters>]"
        } else {
            ""
        };
        let status = match arg.to_ascii_uppercase().as_str() {
            "EHLO" => "250 Syntax: EHLO hostname".to_owned(),
            "HELO" => "250 Syntax: HELO hostname".to_owned(),
            "LHLO" => "250 Syntax: LHLO hostname".to_owned(),
            "MAIL" => {
                format!("250 Syntax: MAIL FROM: <address>{}", extended_params)
            },
            "RCPT" => {
                format!("250 Syntax: RCPT TO: <address>{}", extended_params)
            },
            "DATA" => "250 Syntax: DATA".to_owned(),
            "RSET" => "250 Syntax: RSET".to_owned(),
            "NOOP" => "250 Syntax: NOOP".to_owned(),
            "QUIT" => "250 Syntax: QUIT".to_owned(),
            "VRFY" => "250 Syntax: VRFY <address>".to_owned(),
            _ => format!("501 {}", SUPPORTED),
        };
        self.push(&status).await
    }

    async fn cmd_starttls(&mut self, arg: &str) -> Result<(), Error> {
        require!(self, need_helo);

        if !arg.is_empty() {
            return self.push("501 Syntax: STARTTLS").await;
        }

        if self.session.tls_active {
            return self.push("503 Already using TLS").await;
        }

        if self.ssl_acceptor.is_none()
            || !self.handler.handle_starttls(&self.session, &self.envelope)
        {
            return self.push("454 TLS not available").await;
        }

        let acceptor = self.ssl_acceptor.take().unwrap();
        self.push("220 Ready to start TLS").await?;

        // Discard anything the client pipelined ahead of its ClientHello; a
        // client that does that is either broken or trying to smuggle
        // plaintext into the TLS session (RFC 3207 §6).
        let conn = self.io.get_ref().clone();
        self.io = BufStream::new(conn.clone());

        info!("{} Start TLS handshake", self.log_prefix);
        if let Err(e) = conn.tls_accept(&acceptor).await {
            warn!("{} TLS handshake failed: {}", self.log_prefix, e);
            return Err(e);
        }

        let tls_info = conn.tls_info();
        info!(
            "{} TLS handshake completed ({})",
            self.log_prefix,
            tls_info.as_deref().unwrap_or("unknown"),
        );

        // RFC 3207 §4.2: both sides forget everything learned in cleartext.
        self.session.reset_for_tls(tls_info);
        self.envelope = Envelope::default();

        Ok(())
    }

    async fn cmd_auth(&mut self, arg: &str) -> Result<(), Error> {
        require!(self, need_helo);

        if self.envelope.mail_from.is_some() {
            return self.push("503 Error: MAIL transaction in progress").await;
        }

        if self.session.authenticated {
            return self.push("503 Already authenticated").await;
        }

        if self.config.auth_require_tls && !self.session.tls_active {
            warn!(
                "{} Rejected attempt to AUTH without TLS",
                self.log_prefix,
            );
            return self
                .push(
                    "538 5.7.11 Encryption required for requested \
                     authentication mechanism",
                )
                .await;
        }

        let Some((mechanism, initial)) = syntax::parse_auth_arg(arg) else {
            return self
                .push("501 Syntax: AUTH <mechanism> [<initial-response>]")
                .await;
        };

        if !auth::selectable_mechanisms(&self.config, &*self.handler)
            .contains(&mechanism)
        {
            warn!(
                "{} Rejected attempt to AUTH with mechanism {:?}",
                self.log_prefix, mechanism,
            );
            return self
                .push("504 5.5.4 Unrecognized authentication type")
                .await;
        }

        let initial = match initial.as_deref() {
            None => None,
            // "=" is how a client spells an empty initial response.
            Some("=") => Some(Vec::new()),
            Some(text) => match base64::decode(text) {
                Ok(bytes) => Some(bytes),
                Err(_) => {
                    return self.push("501 5.5.2 Can't decode base64").await;
                },
            },
        };

        let handler = Arc::clone(&self.handler);
        let outcome = auth::run_auth_exchange(
            &*handler,
            &self.cx,
            &mut self.session,
            &mut self.io,
            &mechanism,
            initial,
        )
        .await?;

        match outcome {
            AuthOutcome::Result(AuthResult::Identity(identity)) => {
                info!(
                    "{} Authenticated as {:?} via {}",
                    self.log_prefix, identity, mechanism,
                );
                self.log_prefix.set_user(identity.clone());
                self.session.authenticated = true;
                self.session.auth_identity = Some(identity);
                self.push("235 2.7.0 Authentication successful").await
            },
            AuthOutcome::Result(AuthResult::Invalid) | AuthOutcome::Denied => {
                self.auth_failed().await
            },
            AuthOutcome::Result(AuthResult::Status(status)) => {
                self.push(&status).await
            },
            AuthOutcome::Result(AuthResult::Unhandled) => {
                error!(
                    "{} No credential check available for mechanism {}",
                    self.log_prefix, mechanism,
                );
                self.push("454 4.7.0 Temporary authentication failure").await
            },
            AuthOutcome::Aborted => self.push("501 Auth aborted").await,
            AuthOutcome::BadBase64 => {
                self.push("501 5.5.2 Can't decode base64").await
            },
            AuthOutcome::TooLong => {
                self.push("500 Error: line too long").await
            },
            AuthOutcome::MalformedCreds => {
                self.push("501 5.5.2 Can't split auth value").await
            },
            AuthOutcome::Failed(e) => {
                // A hook failing mid-exchange still consumed an attempt.
                self.session.login_failed_count += 1;
                let status = self.hook_error_status(&e);
                self.push(&status).await
            },
        }
    }

    async fn auth_failed(&mut self) -> Result<(), Error> {
        self.session.login_failed_count += 1;
        warn!(
            "{} Authentication failed (attempt {})",
            self.log_prefix, self.session.login_failed_count,
        );

        if self.session.login_failed_count >= self.config.auth_max_attempts {
            self.push("421 4.7.0 Too many failed login attempts").await
        } else {
            self.push("535 5.7.8 Authentication credentials invalid").await
        }
    }

    async fn need_helo(&mut self) -> Option<Result<(), Error>> {
        if self.session.host_name.is_none() {
            Some(self.push("503 Error: send HELO first").await)
        } else {
            None
        }
    }

    async fn need_mail_from(&mut self) -> Option<Result<(), Error>> {
        if self.envelope.mail_from.is_none() {
            Some(self.push("503 Error: need MAIL command").await)
        } else {
            None
        }
    }

    async fn need_recipients(&mut self) -> Option<Result<(), Error>> {
        if self.envelope.rcpt_tos.is_empty() {
            Some(self.push("503 Error: need RCPT command").await)
        } else {
            None
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.config.timeout)
    }

    /// Converts a failed hook into a reply, consulting `handle_exception`.
    fn hook_error_status(&self, error: &HandlerError) -> String {
        match self.handler.handle_exception(error) {
            Some(status) => status,
            None => {
                error!("{} Handler hook failed: {}", self.log_prefix, error);
                "500 Error: internal server error".to_owned()
            },
        }
    }

    async fn push_reply(
        &mut self,
        reply: Result<Reply, HandlerError>,
    ) -> Result<(), Error> {
        match reply {
            Ok(Reply::Status(status)) => self.push(&status).await,
            Ok(Reply::Lines(lines)) => self.push_lines(&lines).await,
            Err(e) => {
                let status = self.hook_error_status(&e);
                self.push(&status).await
            },
        }
    }

    async fn push_lines(&mut self, lines: &[String]) -> Result<(), Error> {
        for (ix, line) in lines.iter().enumerate() {
            self.push_kind(Delayable.or_final(ix + 1 == lines.len()), line)
                .await?;
        }

        Ok(())
    }

    async fn push(&mut self, status: &str) -> Result<(), Error> {
        self.push_kind(Final, status).await
    }

    async fn push_kind(
        &mut self,
        kind: ResponseKind,
        status: &str,
    ) -> Result<(), Error> {
        // 221 and 421 always mean the session is over.
        if status.starts_with("221") || status.starts_with("421") {
            self.quit = true;
        }

        self.io.write_all(status.as_bytes()).await?;
        self.io.write_all(b"\r\n").await?;
        match kind {
            Final | Urgent => self.io.flush().await?,
            Delayable => (),
        }

        Ok(())
    }
}

/// Whether `command` may be used before TLS is negotiated when the server
/// is configured to require STARTTLS.
fn allowed_before_tls(command: &Command) -> bool {
    match *command {
        // The extended greetings are fine; plain HELO is not, since a
        // client that cannot speak ESMTP cannot issue STARTTLS either.
        Command::Helo(ref verb, _) => "HELO" != verb,
        Command::Noop(..)
        | Command::Rset(..)
        | Command::StartTls(..)
        | Command::Quit(..)
        | Command::Help(..) => true,
        _ => false,
    }
}

/// Whether `command` may be used before a successful AUTH when the server
/// requires authentication.
fn allowed_before_auth(command: &Command) -> bool {
    matches!(
        *command,
        Command::Auth(..)
            | Command::Helo(..)
            | Command::Noop(..)
            | Command::Rset(..)
            | Command::StartTls(..)
            | Command::Quit(..)
            | Command::Help(..)
    )
}

// Runs until either the deadline channel is closed or the current deadline
// has expired. Used to force-close idle connections.
async fn idle_timer(
    mut deadline_rx: mpsc::Receiver<Instant>,
    initial: Duration,
) {
    let mut deadline = Instant::now() + initial;

    loop {
        match tokio::time::timeout_at(deadline.into(), deadline_rx.recv())
            .await
        {
            Err(_) => return,   // Timed out
            Ok(None) => return, // Done
            Ok(Some(d)) => deadline = d,
        }
    }
}
