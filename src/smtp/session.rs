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

use crate::smtp::proxy::ProxyInfo;

/// Per-connection state.
///
/// One `Session` is created when a connection is accepted and destroyed when
/// it closes. It survives mail transactions; the only event that resets it
/// is a successful STARTTLS negotiation, which starts the session over with
/// just the peer identity and any PROXY header retained.
#[derive(Clone, Debug, Default)]
pub struct Session {
    /// The remote endpoint, as `host:port` or a socket path.
    pub peer: String,
    /// The host name most recently accepted via HELO/EHLO/LHLO.
    pub host_name: Option<String>,
    /// Whether the greeting was extended (EHLO/LHLO rather than HELO).
    pub extended_smtp: bool,
    /// The PROXY protocol header consumed ahead of the SMTP dialogue, if
    /// the listener expects one.
    pub proxy_data: Option<ProxyInfo>,
    /// Whether TLS is active. Never goes back to false for the lifetime of
    /// the session.
    pub tls_active: bool,
    /// Description of the negotiated TLS session when `tls_active`.
    pub tls_info: Option<String>,
    /// The opaque identity produced by a successful AUTH.
    pub auth_identity: Option<String>,
    pub authenticated: bool,
    /// Failed authentication attempts that reached the credential check.
    pub login_failed_count: u32,
}

impl Session {
    pub fn new(peer: String) -> Self {
        Self { peer, ..Self::default() }
    }

    /// Resets the session after a TLS handshake, per RFC 3207 §4.2.
    ///
    /// Everything learned over cleartext is discarded; only the peer
    /// identity and the PROXY header survive.
    pub(crate) fn reset_for_tls(&mut self, tls_info: Option<String>) {
        let peer = std::mem::take(&mut self.peer);
        let proxy_data = self.proxy_data.take();
        *self = Self {
            peer,
            proxy_data,
            tls_active: true,
            tls_info,
            ..Self::default()
        };
    }
}

/// Message content as presented to the handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Body {
    /// The received bytes, dot-unstuffed and CRLF-normalized.
    Bytes(Vec<u8>),
    /// The same, decoded as UTF-8. Only produced when the server is
    /// configured with `decode_data`.
    Text(String),
}

/// One mail transaction.
///
/// Reset at connection start, after every completed or aborted DATA, on
/// RSET, and by STARTTLS.
#[derive(Clone, Debug, Default)]
pub struct Envelope {
    /// The reverse-path from MAIL FROM. `Some("")` is the null sender.
    pub mail_from: Option<String>,
    /// ESMTP parameters seen on MAIL, in order, uppercased.
    pub mail_options: Vec<String>,
    /// Accepted forward-paths, in order. Duplicates are allowed; deduping
    /// is handler policy.
    pub rcpt_tos: Vec<String>,
    /// Parameters seen on each accepted RCPT, parallel to `rcpt_tos`.
    pub rcpt_options: Vec<Vec<String>>,
    /// The message content in the form the handler asked for.
    pub content: Option<Body>,
    /// The received bytes prior to any decoding.
    pub original_content: Option<Vec<u8>>,
}
