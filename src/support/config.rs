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

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::support::error::Error;

/// Per-server configuration.
///
/// Every knob has a usable default; an embedder that wants a plain SMTP
/// server on the loopback interface only needs `ServerConfig::default()`.
/// The same structure can be loaded from a TOML file with
/// [`ServerConfig::load_toml`].
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// The name the server reports in its banner and HELO/EHLO responses.
    ///
    /// If empty, the system host name is used.
    pub hostname: String,

    /// The identification string appended to the banner after the host name.
    ///
    /// Defaults to the crate name and version.
    pub ident: Option<String>,

    /// Whether this server speaks LMTP instead of SMTP.
    ///
    /// In LMTP mode, `LHLO` replaces `HELO`/`EHLO` and the handler reports
    /// one delivery status per accepted recipient after the message data.
    pub lmtp: bool,

    /// Maximum accepted message size in octets. 0 means unlimited, which
    /// also suppresses the `SIZE` extension.
    pub data_size_limit: u64,

    /// Maximum length of a command line, in octets, including the CRLF.
    pub line_length_limit: usize,

    /// Seconds the server will wait for the client between commands before
    /// giving up on the connection.
    pub timeout: f64,

    /// If greater than zero, every connection must start with a HAProxy
    /// PROXY protocol (v1 or v2) header, which must arrive within this many
    /// seconds.
    pub proxy_protocol_timeout: f64,

    /// Whether to advertise and accept the `SMTPUTF8` extension.
    pub enable_smtputf8: bool,

    /// Whether to present message content to the handler as UTF-8 text
    /// instead of raw bytes. Mutually exclusive with `enable_smtputf8`, and
    /// suppresses the `8BITMIME` advertisement.
    pub decode_data: bool,

    /// If true, reject everything except EHLO/NOOP/RSET/STARTTLS/QUIT/HELP
    /// until the client has negotiated TLS.
    pub require_starttls: bool,

    /// If true, reject mail commands until the client has authenticated.
    pub auth_required: bool,

    /// If true (the default), AUTH is neither advertised nor accepted on an
    /// unencrypted connection.
    pub auth_require_tls: bool,

    /// SASL mechanisms which must not be advertised or used even when they
    /// are otherwise available.
    pub auth_exclude_mechanism: Vec<String>,

    /// How many failed authentication attempts are tolerated before the
    /// connection is dropped with a 421.
    pub auth_max_attempts: u32,

    /// TLS key material. Required for STARTTLS and for implicit-TLS
    /// listeners; without it, STARTTLS is not advertised.
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            ident: None,
            lmtp: false,
            data_size_limit: 33_554_432,
            line_length_limit: 1001,
            timeout: 300.0,
            proxy_protocol_timeout: 0.0,
            enable_smtputf8: false,
            decode_data: false,
            require_starttls: false,
            auth_required: false,
            auth_require_tls: true,
            auth_exclude_mechanism: Vec::new(),
            auth_max_attempts: 3,
            tls: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct TlsConfig {
    /// The path to the TLS private key, which must be in PEM format.
    pub private_key: PathBuf,
    /// The path to the TLS certificate chain, which must be in PEM format.
    pub certificate_chain: PathBuf,
}

impl ServerConfig {
    pub fn load_toml(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(Error::Io)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.decode_data && self.enable_smtputf8 {
            return Err(Error::Config(
                "decode_data and enable_smtputf8 cannot both be set"
                    .to_owned(),
            ));
        }

        if self.line_length_limit < 64 {
            return Err(Error::Config(
                "line_length_limit is too small to read any command"
                    .to_owned(),
            ));
        }

        Ok(())
    }
}
