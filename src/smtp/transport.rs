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

//! Line-oriented reading on top of the connection stream.
//!
//! Two modes exist. Command mode reads one CRLF-terminated line under a
//! length cap, draining and flagging over-long lines so the session can
//! survive them. Data mode consumes a message body up to the lone-dot
//! terminator, reversing dot-stuffing and normalizing line endings, while
//! never buffering more than the configured message size.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::support::error::Error;

/// Cap on one line of an AUTH exchange, per RFC 4954.
pub const AUTH_LINE_LIMIT: usize = 12288;

/// The outcome of reading one command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LineRead {
    Line {
        /// The line with its ending removed.
        text: String,
        /// Whether the ending was a proper CRLF rather than a bare LF.
        crlf: bool,
    },
    /// The logical line exceeded the cap. The whole line has been consumed.
    TooLong,
    /// The line contained NUL or was not valid UTF-8.
    Malformed,
}

/// Reads one line of up to `limit` octets (including the line ending).
///
/// EOF before any line ending is an error; a connection must end after a
/// complete line.
pub async fn read_line<R: AsyncBufRead + Unpin>(
    io: &mut R,
    limit: usize,
) -> Result<LineRead, Error> {
    let mut buffer = Vec::new();
    (&mut *io)
        .take(limit as u64)
        .read_until(b'\n', &mut buffer)
        .await?;

    if buffer.is_empty() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "EOF reached at start of line",
        )));
    }

    if !buffer.ends_with(b"\n") {
        if buffer.len() >= limit {
            // Skip the rest of the oversized logical line.
            while !buffer.is_empty() && !buffer.ends_with(b"\n") {
                buffer.clear();
                (&mut *io)
                    .take(limit as u64)
                    .read_until(b'\n', &mut buffer)
                    .await?;
            }

            return Ok(LineRead::TooLong);
        } else {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF reached within line",
            )));
        }
    }

    let crlf = buffer.ends_with(b"\r\n");
    let line = &buffer[..buffer.len() - if crlf { 2 } else { 1 }];

    if line.contains(&0) {
        return Ok(LineRead::Malformed);
    }

    match std::str::from_utf8(line) {
        Ok(text) => Ok(LineRead::Line { text: text.to_owned(), crlf }),
        Err(_) => Ok(LineRead::Malformed),
    }
}

/// A collected message body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataBody {
    /// The body, dot-unstuffed, with line endings normalized to CRLF.
    /// Truncated if `oversized`.
    pub content: Vec<u8>,
    /// Whether the client sent more than the configured limit. The
    /// terminator has still been consumed, so the protocol stays in sync.
    pub oversized: bool,
}

/// Accumulates body bytes but stops storing past the limit so an abusive
/// client cannot make us buffer an arbitrary amount.
struct CappedSink {
    buf: Vec<u8>,
    limit: u64,
    written: u64,
}

impl CappedSink {
    fn new(limit: u64) -> Self {
        Self { buf: Vec::new(), limit, written: 0 }
    }

    fn push(&mut self, data: &[u8]) {
        self.written += data.len() as u64;
        if 0 == self.limit || self.written <= self.limit {
            self.buf.extend_from_slice(data);
        }
    }

    /// Push `data`, possibly converting a bare-LF ending to CRLF.
    ///
    /// `data` must be a partial line or one full line including its ending.
    /// `has_trailing_cr` is whether the previous push ended with a bare CR.
    fn push_converted(
        &mut self,
        data: &[u8],
        has_trailing_cr: bool,
        unix_lines: bool,
    ) {
        if unix_lines
            && data.ends_with(b"\n")
            && !data.ends_with(b"\r\n")
            && (!has_trailing_cr || b"\n" != data)
        {
            self.push(&data[..data.len() - 1]);
            self.push(b"\r\n");
        } else {
            // No conversion, no line ending, or it already ends with a DOS
            // line ending.
            self.push(data);
        }
    }

    fn oversized(&self) -> bool {
        0 != self.limit && self.written > self.limit
    }
}

/// Reads a message body from `io`, up to and including the line containing
/// only `.`.
///
/// Dot-stuffing is reversed. UNIX line endings are converted to DOS
/// newlines if `unix_lines` is true; `unix_lines` is forced to true if an
/// LF is encountered before any CR unless `detect_line_endings` is false.
///
/// As long as `unix_lines` stays false, strict DOS newlines are required in
/// exchange for preserving arbitrary binary content exactly.
pub async fn read_data_body<R: AsyncBufRead + Unpin>(
    io: &mut R,
    size_limit: u64,
    mut unix_lines: bool,
    mut detect_line_endings: bool,
) -> Result<DataBody, Error> {
    // Consume io until a line which is just ".\r\n" is encountered. If a
    // line which is not ".\r\n" is found which begins with '.', the first
    // '.' on the line is removed. The "\r\n" before ".\r\n" is part of the
    // content.
    //
    // To be binary-safe, CRLFs are handled strictly, and not just any LF is
    // a line ending. E.g., the sequence "\n.\n" may occur by itself in the
    // input and should be part of the message.

    let mut sink = CappedSink::new(size_limit);
    // Whether the next read is reading from the start of a line; i.e., true
    // at the beginning of text and after each CRLF.
    let mut start_of_line = true;
    // Whether the last read ended with CR. This means that if the next read
    // is just \n, we still treat it as a line ending.
    let mut has_trailing_cr = false;

    loop {
        let mut buffer = io.fill_buf().await?;

        if buffer.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF encountered in DATA payload",
            )));
        }

        if let Some(eol) = memchr::memchr(b'\n', buffer) {
            buffer = &buffer[..=eol];

            if detect_line_endings {
                // This is our first line-ending. If it's not a DOS newline,
                // perform conversion for the rest of the message.
                if !buffer.ends_with(b"\r\n") && !has_trailing_cr {
                    unix_lines = true;
                }

                detect_line_endings = false;
            }
        }

        let buffer_len = buffer.len();

        if start_of_line {
            // ".\n" at the start of a line is illegal when `!unix_lines`,
            // so assume it's supposed to be the end of the text. In the
            // case of `unix_lines`, it *is* the normal end of text.
            if b".\r\n" == buffer || b".\n" == buffer {
                io.consume(buffer_len);
                break;
            }

            if b".\r" == buffer {
                // Maybe end of content, if we can get a \n next.
                io.consume(buffer_len);

                let mut extra = [0u8; 1];
                io.read_exact(&mut extra).await?;
                if b'\n' == extra[0] {
                    break;
                }

                // Nope, keep going. The isolated . at the start of the line
                // is illegal, so whether or not we include it is moot.
                sink.push(b"\r");
                sink.push(&extra);
                has_trailing_cr = b'\r' == extra[0];
                start_of_line = false;
                continue;
            }

            if b"." == buffer {
                // Could be end of content or a stuffed dot.
                io.consume(buffer_len);

                let mut extra = [0u8; 2];
                io.read_exact(&mut extra[..1]).await?;

                if b'\n' == extra[0] {
                    // ".\n" is illegal with !unix_lines, but is the end of
                    // content with unix_lines, so this is the end of
                    // content.
                    break;
                }

                io.read_exact(&mut extra[1..]).await?;

                if b"\r\n" == &extra {
                    break;
                }

                // Nope, keep going. The isolated '.' at the start of the
                // line either is part of dot-stuffing (if extra[0] is '.')
                // or illegal, so just drop it.
                //
                // extra[0] is known not to be '\n', so the only possible
                // line ending is at the end of `extra`.
                sink.push_converted(
                    &extra,
                    // There was a '.' since the last has_trailing_cr push
                    false,
                    unix_lines,
                );
                has_trailing_cr = extra.ends_with(b"\r");
                start_of_line = unix_lines && extra.ends_with(b"\n");
                continue;
            }
        }

        // Else, everything inside buffer is content, except possibly a
        // leading '.'.
        let line_contents = if b'.' == buffer[0] && start_of_line {
            &buffer[1..]
        } else {
            buffer
        };
        sink.push_converted(line_contents, has_trailing_cr, unix_lines);

        start_of_line = buffer.ends_with(b"\r\n")
            || (b"\n" == buffer && has_trailing_cr)
            || (unix_lines && buffer.ends_with(b"\n"));
        has_trailing_cr = buffer.ends_with(b"\r");
        io.consume(buffer_len);
    }

    Ok(DataBody {
        oversized: sink.oversized(),
        content: sink.buf,
    })
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn read_data_body_sync(
        stuffed: &[u8],
        buffer_size: usize,
        unix_lines: bool,
        detect_line_endings: bool,
    ) -> DataBody {
        let mut reader =
            tokio::io::BufReader::with_capacity(buffer_size, stuffed);
        futures::executor::block_on(read_data_body(
            &mut reader,
            0,
            unix_lines,
            detect_line_endings,
        ))
        .unwrap()
    }

    fn read_line_sync(input: &[u8], limit: usize) -> Result<LineRead, Error> {
        let mut reader = input;
        futures::executor::block_on(read_line(&mut reader, limit))
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 4096,
            ..ProptestConfig::default()
        })]

        #[test]
        fn binary_dot_stuffing_decodes_properly(
            content in "[x.\r\n]{0,100}\r\n",
            buffer_size in 1usize..=32,
        ) {
            let mut stuffed = content.replace("\r\n.", "\r\n..");
            if stuffed.starts_with(".") {
                stuffed = format!(".{}", stuffed);
            }
            stuffed.push_str(".\r\n");

            let body = read_data_body_sync(
                stuffed.as_bytes(),
                buffer_size,
                // For this test, never do line ending conversion.
                false,
                false,
            );

            assert!(!body.oversized);
            assert_eq!(
                content,
                std::str::from_utf8(&body.content).unwrap()
            );
        }

        #[test]
        fn text_dot_stuffing_decodes_properly(
            content in "[x.\r\n]{0,100}\r\n",
            buffer_size in 1usize..=32,
        ) {
            let mut stuffed = content.replace("\n.", "\n..");
            if stuffed.starts_with(".") {
                stuffed = format!(".{}", stuffed);
            }
            stuffed.push_str(".\n");

            let body = read_data_body_sync(
                stuffed.as_bytes(),
                buffer_size,
                // For this test, always do line ending conversion.
                true,
                false,
            );

            let converted_content =
                content.replace("\r\n", "\n").replace("\n", "\r\n");
            assert_eq!(
                converted_content,
                std::str::from_utf8(&body.content).unwrap(),
            );
        }
    }

    #[test]
    fn data_line_ending_detection() {
        assert_eq!(
            b"foo\r\nbar\n.\r\n".to_vec(),
            read_data_body_sync(b"foo\r\nbar\n.\r\n.\r\n", 64, false, true)
                .content,
        );
        assert_eq!(
            b"foo\r\nbar\r\nbaz\r\n".to_vec(),
            read_data_body_sync(b"foo\nbar\r\nbaz\n.\n", 64, false, true)
                .content,
        );
    }

    #[test]
    fn data_size_limit_consumes_to_terminator() {
        let mut input = Vec::new();
        for _ in 0..8 {
            input.extend_from_slice(b"xxxxxxxx\r\n");
        }
        input.extend_from_slice(b".\r\nMAIL FROM:<next@command>\r\n");

        let mut reader = tokio::io::BufReader::with_capacity(16, &input[..]);
        let body = futures::executor::block_on(read_data_body(
            &mut reader,
            30,
            false,
            true,
        ))
        .unwrap();
        assert!(body.oversized);
        assert!(body.content.len() <= 30);

        // The terminator was consumed; the next command is intact.
        let mut rest = Vec::new();
        futures::executor::block_on(tokio::io::AsyncReadExt::read_to_end(
            &mut reader,
            &mut rest,
        ))
        .unwrap();
        assert_eq!(b"MAIL FROM:<next@command>\r\n".to_vec(), rest);
    }

    #[test]
    fn data_eof_is_an_error() {
        let mut reader = tokio::io::BufReader::new(&b"no terminator\r\n"[..]);
        assert!(futures::executor::block_on(read_data_body(
            &mut reader,
            0,
            false,
            true
        ))
        .is_err());
    }

    #[test]
    fn command_line_reading() {
        assert_eq!(
            LineRead::Line { text: "NOOP".to_owned(), crlf: true },
            read_line_sync(b"NOOP\r\nQUIT\r\n", 64).unwrap()
        );
        assert_eq!(
            LineRead::Line { text: "NOOP".to_owned(), crlf: false },
            read_line_sync(b"NOOP\n", 64).unwrap()
        );
        assert_eq!(
            LineRead::Malformed,
            read_line_sync(b"NO\0OP\r\n", 64).unwrap()
        );
        assert_eq!(
            LineRead::Malformed,
            read_line_sync(b"NO\xC3\x28OP\r\n", 64).unwrap()
        );
        assert!(read_line_sync(b"", 64).is_err());
        assert!(read_line_sync(b"NOOP", 64).is_err());
    }

    #[test]
    fn over_long_line_is_fully_drained() {
        let mut input = vec![b'x'; 200];
        input.extend_from_slice(b"\r\nQUIT\r\n");

        let mut reader = tokio::io::BufReader::new(&input[..]);
        assert_eq!(
            LineRead::TooLong,
            futures::executor::block_on(read_line(&mut reader, 64)).unwrap()
        );
        assert_eq!(
            LineRead::Line { text: "QUIT".to_owned(), crlf: true },
            futures::executor::block_on(read_line(&mut reader, 64)).unwrap()
        );
    }
}
