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

use std::sync::Arc;

use super::integration_test_common::*;
use crate::smtp::handler::{Handler, HookResult, Reply, ServerContext};
use crate::smtp::session::{Envelope, Session};
use crate::support::config::ServerConfig;

fn lmtp_config() -> ServerConfig {
    ServerConfig {
        hostname: "localhost".to_owned(),
        lmtp: true,
        ..ServerConfig::default()
    }
}

struct SinkHandler;
impl Handler for SinkHandler {}

/// Delivers per-recipient: the first recipient succeeds, every further one
/// is deferred.
struct PerRecipientHandler;
impl Handler for PerRecipientHandler {
    async fn handle_data(
        &self,
        _cx: &ServerContext,
        _session: &mut Session,
        envelope: &mut Envelope,
    ) -> HookResult {
        let statuses = envelope
            .rcpt_tos
            .iter()
            .enumerate()
            .map(|(ix, rcpt)| {
                if 0 == ix {
                    format!("250 2.1.5 <{}> OK", rcpt)
                } else {
                    format!("450 4.3.0 <{}> try later", rcpt)
                }
            })
            .collect();
        Ok(Reply::Lines(statuses))
    }
}

/// Always returns one status too few.
struct ForgetfulHandler;
impl Handler for ForgetfulHandler {
    async fn handle_data(
        &self,
        _cx: &ServerContext,
        _session: &mut Session,
        envelope: &mut Envelope,
    ) -> HookResult {
        let statuses = envelope
            .rcpt_tos
            .iter()
            .skip(1)
            .map(|_| "250 OK".to_owned())
            .collect();
        Ok(Reply::Lines(statuses))
    }
}

#[test]
fn lhlo_replaces_the_smtp_greetings() {
    let mut cxn =
        connect(Arc::new(lmtp_config()), Arc::new(SinkHandler), "lmtp_lhlo");
    cxn.read_responses();

    cxn.simple_command("HELO foo", "500 Error: command \"HELO\" not recognized");
    cxn.simple_command("EHLO foo", "500 Error: command \"EHLO\" not recognized");

    cxn.write_line("LHLO foo\r\n");
    let responses = cxn.read_responses();
    assert_eq!("250-localhost\r\n", responses[0]);
    assert!(responses.contains(&"250-8BITMIME\r\n".to_owned()));
    assert!(responses.contains(&"250-STARTTLS\r\n".to_owned()));
    assert!(responses.last().unwrap().starts_with("250 "));
}

#[test]
fn per_recipient_data_statuses() {
    let mut cxn = connect(
        Arc::new(lmtp_config()),
        Arc::new(PerRecipientHandler),
        "lmtp_per_recipient",
    );
    cxn.skip_pleasantries("LHLO foo");

    cxn.simple_command("MAIL FROM:<a@x>", "250 OK");
    cxn.simple_command("RCPT TO:<r1@y>", "250 OK");
    cxn.simple_command("RCPT TO:<r2@y>", "250 OK");
    cxn.simple_command("DATA", "354 ");
    cxn.write_line("Body\r\n.\r\n");

    let responses = cxn.read_n_lines(2);
    assert_eq!("250 2.1.5 <r1@y> OK\r\n", responses[0]);
    assert_eq!("450 4.3.0 <r2@y> try later\r\n", responses[1]);

    // The next transaction starts clean.
    cxn.simple_command("MAIL FROM:<a@x>", "250 OK");
}

#[test]
fn single_status_applies_to_all_recipients() {
    let mut cxn = connect(
        Arc::new(lmtp_config()),
        Arc::new(SinkHandler),
        "lmtp_single_status",
    );
    cxn.skip_pleasantries("LHLO foo");

    cxn.simple_command("MAIL FROM:<a@x>", "250 OK");
    cxn.simple_command("RCPT TO:<r1@y>", "250 OK");
    cxn.simple_command("RCPT TO:<r2@y>", "250 OK");
    cxn.simple_command("RCPT TO:<r3@y>", "250 OK");
    cxn.simple_command("DATA", "354 ");
    cxn.write_line("Body\r\n.\r\n");

    let responses = cxn.read_n_lines(3);
    for response in responses {
        assert_eq!("250 OK\r\n", response);
    }
}

#[test]
fn missing_statuses_are_made_explicit() {
    let mut cxn = connect(
        Arc::new(lmtp_config()),
        Arc::new(ForgetfulHandler),
        "lmtp_missing_status",
    );
    cxn.skip_pleasantries("LHLO foo");

    cxn.simple_command("MAIL FROM:<a@x>", "250 OK");
    cxn.simple_command("RCPT TO:<r1@y>", "250 OK");
    cxn.simple_command("RCPT TO:<r2@y>", "250 OK");
    cxn.simple_command("DATA", "354 ");
    cxn.write_line("Body\r\n.\r\n");

    let responses = cxn.read_n_lines(2);
    assert_eq!("250 OK\r\n", responses[0]);
    assert_eq!("500 Internal: missing LMTP response\r\n", responses[1]);
}

#[test]
fn lmtp_sequencing_matches_smtp() {
    let mut cxn = connect(
        Arc::new(lmtp_config()),
        Arc::new(SinkHandler),
        "lmtp_sequencing",
    );
    cxn.read_responses();

    cxn.simple_command("MAIL FROM:<a@x>", "503 Error: send HELO first");
    cxn.write_line("LHLO foo\r\n");
    assert!(cxn.read_responses().last().unwrap().starts_with("250 "));
    cxn.simple_command("DATA", "503 Error: need RCPT command");
    cxn.simple_command("QUIT", "221 Bye");
}
