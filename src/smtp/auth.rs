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

//! The AUTH engine.
//!
//! A SASL mechanism is a small state machine: fed the previous client
//! response (or the initial response, or nothing), it either produces the
//! next challenge or finishes. The engine drives the machine over the
//! connection, handling Base64, the `*` abort token, and the line-length
//! cap, then hands the collected credentials to the handler for the actual
//! check. Custom mechanisms run the same exchange through
//! [`AuthExchange`], which is all of that machinery with the handler in the
//! driver's seat.

use tokio::io::{AsyncWriteExt, BufStream};

use crate::smtp::handler::{
    AuthResult, Credentials, Handler, HandlerError, ServerContext,
};
use crate::smtp::session::Session;
use crate::smtp::transport::{self, LineRead, AUTH_LINE_LIMIT};
use crate::support::async_io::ConnIo;
use crate::support::error::Error;

pub(crate) static BUILTIN_MECHANISMS: &[&str] = &["LOGIN", "PLAIN"];

/// The mechanisms that may actually be selected (and therefore advertised)
/// on this server: built-ins plus the handler's own, minus exclusions.
///
/// EHLO advertisement and AUTH-command acceptance both go through this one
/// function so they cannot disagree.
pub(crate) fn selectable_mechanisms<H: Handler>(
    config: &crate::support::config::ServerConfig,
    handler: &H,
) -> Vec<String> {
    let mut mechanisms: Vec<String> = BUILTIN_MECHANISMS
        .iter()
        .map(|m| (*m).to_owned())
        .collect();

    for mechanism in handler.auth_mechanisms() {
        let mechanism = mechanism.to_ascii_uppercase();
        if !mechanisms.contains(&mechanism) {
            mechanisms.push(mechanism);
        }
    }

    mechanisms.retain(|m| {
        !config
            .auth_exclude_mechanism
            .iter()
            .any(|excluded| excluded.eq_ignore_ascii_case(m))
    });

    mechanisms
}

pub(crate) enum Step {
    /// Send this challenge and read another response.
    Challenge(Vec<u8>),
    /// The exchange is complete; check these credentials.
    Credentials(Credentials),
    /// The exchange is complete and already known to be a failure.
    Denied,
    /// The client response did not have the shape the mechanism requires.
    Malformed,
}

pub(crate) trait Mechanism {
    fn step(&mut self, input: Option<Vec<u8>>) -> Step;
}

pub(crate) fn builtin(mechanism: &str) -> Option<Box<dyn Mechanism>> {
    match mechanism {
        "PLAIN" => Some(Box::new(Plain)),
        "LOGIN" => Some(Box::new(Login { username: None })),
        _ => None,
    }
}

/// RFC 4616. One response: `authzid NUL authcid NUL passwd`.
struct Plain;

impl Mechanism for Plain {
    fn step(&mut self, input: Option<Vec<u8>>) -> Step {
        let Some(data) = input else {
            return Step::Challenge(Vec::new());
        };

        let parts: Vec<&[u8]> = data.split(|&b| 0 == b).collect();
        match parts.as_slice() {
            [authzid, authcid, password] => {
                // Acting on behalf of another identity is not supported.
                if !authzid.is_empty() && authzid != authcid {
                    return Step::Denied;
                }

                Step::Credentials(Credentials {
                    login: String::from_utf8_lossy(authcid).into_owned(),
                    password: String::from_utf8_lossy(password).into_owned(),
                })
            },
            _ => Step::Malformed,
        }
    }
}

/// The venerable LOGIN mechanism: prompt for the username, then the
/// password. An initial response supplies the username.
struct Login {
    username: Option<String>,
}

impl Mechanism for Login {
    fn step(&mut self, input: Option<Vec<u8>>) -> Step {
        let Some(data) = input else {
            return Step::Challenge(b"User Name".to_vec());
        };

        match self.username.take() {
            None => {
                self.username =
                    Some(String::from_utf8_lossy(&data).into_owned());
                Step::Challenge(b"Password".to_vec())
            },
            Some(login) => Step::Credentials(Credentials {
                login,
                password: String::from_utf8_lossy(&data).into_owned(),
            }),
        }
    }
}

/// One decoded client response during an exchange.
pub enum ChallengeOutcome {
    Answer(Vec<u8>),
    /// The client sent the `*` abort token.
    Abort,
    /// The response was not decodable Base64.
    Malformed,
    /// The response line exceeded the cap.
    TooLong,
}

/// The challenge/response plumbing handed to `Handler::handle_auth`.
pub struct AuthExchange<'a> {
    io: &'a mut BufStream<ConnIo>,
    initial: Option<Vec<u8>>,
}

impl<'a> AuthExchange<'a> {
    pub(crate) fn new(
        io: &'a mut BufStream<ConnIo>,
        initial: Option<Vec<u8>>,
    ) -> Self {
        Self { io, initial }
    }

    /// The decoded initial response the client attached to the AUTH
    /// command, if any. A mechanism that can use one should consume it
    /// before issuing its first challenge.
    pub fn take_initial(&mut self) -> Option<Vec<u8>> {
        self.initial.take()
    }

    /// Sends `334 <base64 of challenge>` and reads one client response.
    ///
    /// `Err` is a transport failure; everything the client can do wrong is
    /// in [`ChallengeOutcome`].
    pub async fn challenge(
        &mut self,
        challenge: &[u8],
    ) -> Result<ChallengeOutcome, Error> {
        let line = format!("334 {}\r\n", base64::encode(challenge));
        self.io.write_all(line.as_bytes()).await?;
        self.io.flush().await?;

        match transport::read_line(&mut *self.io, AUTH_LINE_LIMIT).await? {
            LineRead::TooLong => Ok(ChallengeOutcome::TooLong),
            LineRead::Malformed => Ok(ChallengeOutcome::Malformed),
            LineRead::Line { text, .. } => {
                if "*" == text {
                    return Ok(ChallengeOutcome::Abort);
                }

                match base64::decode(&text) {
                    Ok(bytes) => Ok(ChallengeOutcome::Answer(bytes)),
                    Err(_) => Ok(ChallengeOutcome::Malformed),
                }
            },
        }
    }
}

/// How an AUTH command concluded, before it is translated into a reply.
pub(crate) enum AuthOutcome {
    Result(AuthResult),
    Aborted,
    BadBase64,
    TooLong,
    MalformedCreds,
    Denied,
    Failed(HandlerError),
}

/// Runs the exchange for an already-vetted mechanism.
///
/// The handler's `handle_auth` gets the first shot, which is how custom
/// mechanisms and full overrides of the built-ins work; `Unhandled` falls
/// through to the built-in state machines and the handler's credential
/// check.
pub(crate) async fn run_auth_exchange<H: Handler>(
    handler: &H,
    cx: &ServerContext,
    session: &mut Session,
    io: &mut BufStream<ConnIo>,
    mechanism: &str,
    initial: Option<Vec<u8>>,
) -> Result<AuthOutcome, Error> {
    let mut exchange = AuthExchange::new(io, initial);

    match handler.handle_auth(cx, session, mechanism, &mut exchange).await {
        Ok(AuthResult::Unhandled) => (),
        Ok(result) => return Ok(AuthOutcome::Result(result)),
        Err(e) => return Ok(AuthOutcome::Failed(e)),
    }

    let Some(mut mechanism_impl) = builtin(mechanism) else {
        // An advertised custom mechanism the handler then declined to run.
        return Ok(AuthOutcome::Result(AuthResult::Unhandled));
    };

    let mut input = exchange.take_initial();
    loop {
        match mechanism_impl.step(input.take()) {
            Step::Challenge(challenge) => {
                match exchange.challenge(&challenge).await? {
                    ChallengeOutcome::Answer(bytes) => input = Some(bytes),
                    ChallengeOutcome::Abort => {
                        return Ok(AuthOutcome::Aborted);
                    },
                    ChallengeOutcome::Malformed => {
                        return Ok(AuthOutcome::BadBase64);
                    },
                    ChallengeOutcome::TooLong => {
                        return Ok(AuthOutcome::TooLong);
                    },
                }
            },

            Step::Credentials(credentials) => {
                return Ok(match handler
                    .authenticate(cx, session, mechanism, &credentials)
                    .await
                {
                    Ok(result) => AuthOutcome::Result(result),
                    Err(e) => AuthOutcome::Failed(e),
                });
            },

            Step::Denied => return Ok(AuthOutcome::Denied),
            Step::Malformed => return Ok(AuthOutcome::MalformedCreds),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::support::config::ServerConfig;

    #[test]
    fn plain_mechanism() {
        let mut mechanism = Plain;
        let Step::Challenge(c) = mechanism.step(None) else {
            panic!("expected empty challenge");
        };
        assert!(c.is_empty());

        let Step::Credentials(creds) =
            mechanism.step(Some(b"\0dib\0hunter2".to_vec()))
        else {
            panic!("expected credentials");
        };
        assert_eq!("dib", creds.login);
        assert_eq!("hunter2", creds.password);

        // Matching authzid is tolerated
        assert!(matches!(
            Plain.step(Some(b"dib\0dib\0hunter2".to_vec())),
            Step::Credentials(..)
        ));
        // Mismatched authzid is a failure, not a syntax error
        assert!(matches!(
            Plain.step(Some(b"zim\0dib\0hunter2".to_vec())),
            Step::Denied
        ));
        // Too few and too many fields are syntax errors
        assert!(matches!(
            Plain.step(Some(b"dib\0hunter2".to_vec())),
            Step::Malformed
        ));
        assert!(matches!(
            Plain.step(Some(b"a\0b\0c\0d".to_vec())),
            Step::Malformed
        ));
    }

    #[test]
    fn login_mechanism() {
        let mut mechanism = Login { username: None };
        let Step::Challenge(c) = mechanism.step(None) else {
            panic!("expected challenge");
        };
        assert_eq!(b"User Name".to_vec(), c);

        let Step::Challenge(c) = mechanism.step(Some(b"dib".to_vec())) else {
            panic!("expected challenge");
        };
        assert_eq!(b"Password".to_vec(), c);

        let Step::Credentials(creds) =
            mechanism.step(Some(b"hunter2".to_vec()))
        else {
            panic!("expected credentials");
        };
        assert_eq!("dib", creds.login);
        assert_eq!("hunter2", creds.password);
    }

    #[test]
    fn login_mechanism_with_initial_username() {
        let mut mechanism = Login { username: None };
        let Step::Challenge(c) = mechanism.step(Some(b"dib".to_vec())) else {
            panic!("expected challenge");
        };
        assert_eq!(b"Password".to_vec(), c);

        assert!(matches!(
            mechanism.step(Some(b"hunter2".to_vec())),
            Step::Credentials(..)
        ));
    }

    #[test]
    fn mechanism_selection() {
        struct NullHandler;
        impl Handler for NullHandler {}

        struct XOauthHandler;
        impl Handler for XOauthHandler {
            fn auth_mechanisms(&self) -> Vec<String> {
                vec!["XOAUTH2".to_owned(), "plain".to_owned()]
            }
        }

        let config = ServerConfig::default();
        assert_eq!(
            vec!["LOGIN".to_owned(), "PLAIN".to_owned()],
            selectable_mechanisms(&config, &NullHandler)
        );
        assert_eq!(
            vec![
                "LOGIN".to_owned(),
                "PLAIN".to_owned(),
                "XOAUTH2".to_owned()
            ],
            selectable_mechanisms(&config, &XOauthHandler)
        );

        let config = ServerConfig {
            auth_exclude_mechanism: vec!["login".to_owned()],
            ..ServerConfig::default()
        };
        assert_eq!(
            vec!["PLAIN".to_owned()],
            selectable_mechanisms(&config, &NullHandler)
        );
    }
}
