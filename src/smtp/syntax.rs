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

//! The command grammar.
//!
//! Recognition is deliberately shallow: a command line is split into a verb
//! and its raw argument text, and the per-command argument grammars (angle
//! addresses, ESMTP parameters, AUTH arguments) are exposed as separate
//! functions that the dispatcher applies once it has decided the command is
//! legal in the current state. This keeps "unknown command", "bad sequence"
//! and "bad argument" replies cleanly separated.

use lazy_static::lazy_static;
use regex::Regex;

/// A recognized command line, with raw argument text.
///
/// The argument text has the verb and the separating space removed and
/// surrounding whitespace trimmed, but is otherwise untouched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// HELO, EHLO or LHLO. The first element is the verb as typed
    /// (uppercased), the second the origin host (first argument token).
    Helo(String, String),
    Mail(String),
    Rcpt(String),
    Data(String),
    Rset(String),
    Noop(String),
    Quit(String),
    Vrfy(String),
    Expn(String),
    Help(String),
    StartTls(String),
    Auth(String),
    /// Anything else; carries the uppercased verb for the error reply.
    Unknown(String),
    /// An empty command line.
    Empty,
}

pub fn parse_command_line(line: &str) -> Command {
    if line.is_empty() {
        return Command::Empty;
    }

    let (verb, arg) = match line.find(' ') {
        Some(ix) => (&line[..ix], line[ix + 1..].trim()),
        None => (line, ""),
    };
    let verb = verb.to_ascii_uppercase();
    let arg = arg.to_owned();

    match verb.as_str() {
        "HELO" | "EHLO" | "LHLO" => {
            let origin = arg
                .split_ascii_whitespace()
                .next()
                .unwrap_or("")
                .to_owned();
            Command::Helo(verb, origin)
        },
        "MAIL" => Command::Mail(arg),
        "RCPT" => Command::Rcpt(arg),
        "DATA" => Command::Data(arg),
        "RSET" => Command::Rset(arg),
        "NOOP" => Command::Noop(arg),
        "QUIT" => Command::Quit(arg),
        "VRFY" => Command::Vrfy(arg),
        "EXPN" => Command::Expn(arg),
        "HELP" => Command::Help(arg),
        "STARTTLS" => Command::StartTls(arg),
        "AUTH" => Command::Auth(arg),
        _ => Command::Unknown(verb),
    }
}

/// A parsed MAIL FROM / RCPT TO argument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressArg {
    /// The (possibly empty, for the null reverse-path) address.
    pub address: String,
    /// Raw parameter tokens following the address, uppercased.
    pub params: Vec<String>,
}

lazy_static! {
    static ref RX_MAIL_FROM: Regex = Regex::new(
        r"^(?i)FROM:\s*(?:<([^<>\s]*)>|([^<>\s:][^<>\s]*))(?:\s+(.+))?$"
    )
    .unwrap();
    static ref RX_RCPT_TO: Regex = Regex::new(
        r"^(?i)TO:\s*(?:<(?:@[^:<>]+:)?([^<>\s]+)>|([^<>\s:][^<>\s]*))(?:\s+(.+))?$"
    )
    .unwrap();
    static ref RX_AUTH_ARG: Regex =
        Regex::new(r"^([A-Za-z0-9][A-Za-z0-9_-]*)(?:\s+(\S+))?$").unwrap();
    static ref RX_VRFY_ARG: Regex =
        Regex::new(r"^(?:<([^<>\s]+)>|([^<>\s]+))$").unwrap();
}

/// Parses the argument of `MAIL`, i.e. `FROM:<address> [params...]`.
///
/// `None` means the argument does not match the grammar at all and the
/// command should be answered with a syntax error. The empty address
/// (`FROM:<>`, the null reverse-path) is legal.
pub fn parse_mail_arg(arg: &str) -> Option<AddressArg> {
    let cap = RX_MAIL_FROM.captures(arg)?;
    Some(AddressArg {
        address: cap
            .get(1)
            .or_else(|| cap.get(2))
            .map(|m| m.as_str())
            .unwrap_or("")
            .to_owned(),
        params: split_params(cap.get(3).map(|m| m.as_str()).unwrap_or("")),
    })
}

/// Parses the argument of `RCPT`, i.e. `TO:<address> [params...]`.
///
/// A source route (`<@relay:user@host>`) is accepted and stripped. The empty
/// forward-path is not legal.
pub fn parse_rcpt_arg(arg: &str) -> Option<AddressArg> {
    let cap = RX_RCPT_TO.captures(arg)?;
    Some(AddressArg {
        address: cap
            .get(1)
            .or_else(|| cap.get(2))
            .map(|m| m.as_str())?
            .to_owned(),
        params: split_params(cap.get(3).map(|m| m.as_str()).unwrap_or("")),
    })
}

fn split_params(params: &str) -> Vec<String> {
    params
        .split_ascii_whitespace()
        .map(|p| p.to_ascii_uppercase())
        .collect()
}

/// One ESMTP parameter, `KEYWORD` or `KEYWORD=VALUE`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EsmtpParam {
    pub keyword: String,
    pub value: Option<String>,
}

/// Validates raw parameter tokens against the RFC 1869 syntax.
///
/// Returns `None` if any token is syntactically invalid (non-alphanumeric
/// keyword, or `KEYWORD=` with an empty value); deciding whether a
/// *well-formed* parameter is supported is left to the caller.
pub fn parse_esmtp_params(params: &[String]) -> Option<Vec<EsmtpParam>> {
    let mut result = Vec::with_capacity(params.len());
    for param in params {
        let (keyword, value) = match param.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (param.as_str(), None),
        };

        if keyword.is_empty()
            || !keyword.chars().all(|c| c.is_ascii_alphanumeric())
            || value.is_some_and(str::is_empty)
        {
            return None;
        }

        result.push(EsmtpParam {
            keyword: keyword.to_owned(),
            value: value.map(str::to_owned),
        });
    }

    Some(result)
}

/// Parses the argument of `AUTH`: a mechanism name and an optional initial
/// response.
pub fn parse_auth_arg(arg: &str) -> Option<(String, Option<String>)> {
    let cap = RX_AUTH_ARG.captures(arg)?;
    Some((
        cap.get(1).unwrap().as_str().to_ascii_uppercase(),
        cap.get(2).map(|m| m.as_str().to_owned()),
    ))
}

/// Extracts the address from a VRFY argument, with or without angle
/// brackets.
pub fn parse_vrfy_arg(arg: &str) -> Option<String> {
    let cap = RX_VRFY_ARG.captures(arg)?;
    cap.get(1)
        .or_else(|| cap.get(2))
        .map(|m| m.as_str().to_owned())
}

#[cfg(test)]
mod test {
    use super::*;

    fn mail(address: &str, params: &[&str]) -> Option<AddressArg> {
        Some(AddressArg {
            address: address.to_owned(),
            params: params.iter().map(|s| (*s).to_owned()).collect(),
        })
    }

    #[test]
    fn command_recognition() {
        assert_eq!(
            Command::Helo("EHLO".to_owned(), "foo.example.com".to_owned()),
            parse_command_line("EHLO foo.example.com")
        );
        assert_eq!(
            Command::Helo("lhlo".to_ascii_uppercase(), "foo".to_owned()),
            parse_command_line("lhlo foo some client implementation")
        );
        assert_eq!(
            Command::Helo("HELO".to_owned(), String::new()),
            parse_command_line("HELO")
        );

        assert_eq!(
            Command::Mail("FROM:<a@b>".to_owned()),
            parse_command_line("MAIL FROM:<a@b>")
        );
        assert_eq!(
            Command::Rcpt("TO:<a@b>".to_owned()),
            parse_command_line("rcpt TO:<a@b>")
        );
        assert_eq!(
            Command::Data(String::new()),
            parse_command_line("DATA")
        );
        assert_eq!(
            Command::Unknown("DATABASE".to_owned()),
            parse_command_line("DATABASE")
        );
        assert_eq!(
            Command::Unknown("KILL".to_owned()),
            parse_command_line("kill -9 1")
        );
        assert_eq!(Command::Empty, parse_command_line(""));
        assert_eq!(
            Command::Auth("PLAIN dGVzdA==".to_owned()),
            parse_command_line("AUTH PLAIN dGVzdA==")
        );
        assert_eq!(
            Command::StartTls(String::new()),
            parse_command_line("STARTTLS")
        );
        assert_eq!(
            Command::StartTls("1.3".to_owned()),
            parse_command_line("STARTTLS 1.3")
        );
    }

    #[test]
    fn mail_arg_parsing() {
        assert_eq!(mail("foo@bar.com", &[]), parse_mail_arg("FROM:<foo@bar.com>"));
        assert_eq!(mail("", &[]), parse_mail_arg("from:<>"));
        assert_eq!(
            mail("foo@bar.com", &[]),
            parse_mail_arg("FROM: <foo@bar.com>")
        );
        assert_eq!(mail("foo@bar.com", &[]), parse_mail_arg("FROM:foo@bar.com"));
        assert_eq!(
            mail("foo@bar.com", &["SIZE=42", "BODY=8BITMIME"]),
            parse_mail_arg("FROM:<foo@bar.com> size=42 body=8bitmime")
        );
        assert_eq!(
            mail("foo@bar.com", &["SMTPUTF8"]),
            parse_mail_arg("FROM:<foo@bar.com> SMTPUTF8")
        );
        assert_eq!(None, parse_mail_arg("foo@bar.com"));
        assert_eq!(None, parse_mail_arg("FROM:<a b>"));
        assert_eq!(None, parse_mail_arg(""));
    }

    #[test]
    fn rcpt_arg_parsing() {
        assert_eq!(
            mail("userc@d.bar.org", &[]),
            parse_rcpt_arg("TO:<userc@d.bar.org>")
        );
        assert_eq!(
            mail("userc@d.bar.org", &[]),
            parse_rcpt_arg("to:<@hosta.int,@jkl.org:userc@d.bar.org>")
        );
        assert_eq!(
            mail("userc@d.bar.org", &["FOO=BAR"]),
            parse_rcpt_arg("TO:<userc@d.bar.org> FOO=BAR")
        );
        // The empty forward-path is not a thing.
        assert_eq!(None, parse_rcpt_arg("TO:<>"));
        assert_eq!(None, parse_rcpt_arg("FROM:<a@b>"));
    }

    #[test]
    fn esmtp_param_syntax() {
        let toks = |v: &[&str]| -> Vec<String> {
            v.iter().map(|s| (*s).to_owned()).collect()
        };

        assert_eq!(
            Some(vec![
                EsmtpParam {
                    keyword: "SIZE".to_owned(),
                    value: Some("42".to_owned()),
                },
                EsmtpParam { keyword: "SMTPUTF8".to_owned(), value: None },
            ]),
            parse_esmtp_params(&toks(&["SIZE=42", "SMTPUTF8"]))
        );
        assert_eq!(None, parse_esmtp_params(&toks(&["SIZE="])));
        assert_eq!(None, parse_esmtp_params(&toks(&["SI ZE=1"])));
        assert_eq!(None, parse_esmtp_params(&toks(&["=42"])));
        assert_eq!(None, parse_esmtp_params(&toks(&["B/ODY=7BIT"])));
        assert_eq!(Some(vec![]), parse_esmtp_params(&[]));
    }

    #[test]
    fn auth_arg_parsing() {
        assert_eq!(
            Some(("PLAIN".to_owned(), None)),
            parse_auth_arg("plain")
        );
        assert_eq!(
            Some(("PLAIN".to_owned(), Some("AGZvbwBiYXI=".to_owned()))),
            parse_auth_arg("PLAIN AGZvbwBiYXI=")
        );
        assert_eq!(
            Some(("SCRAM-SHA-256".to_owned(), None)),
            parse_auth_arg("SCRAM-SHA-256")
        );
        assert_eq!(None, parse_auth_arg(""));
        assert_eq!(None, parse_auth_arg("PLAIN foo bar"));
    }

    #[test]
    fn vrfy_arg_parsing() {
        assert_eq!(
            Some("foo@bar.com".to_owned()),
            parse_vrfy_arg("<foo@bar.com>")
        );
        assert_eq!(Some("Smith".to_owned()), parse_vrfy_arg("Smith"));
        assert_eq!(None, parse_vrfy_arg("a b"));
        assert_eq!(None, parse_vrfy_arg(""));
    }
}
