// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Framing for the daemon's stream socket: each payload is config-tree
//! text followed by the four-byte terminator `\n##\n`.

use std::io;
use std::io::{ErrorKind, Read, Write};

pub const TERMINATOR: &[u8] = b"\n##\n";

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(TERMINATOR.len()).position(|w| w == TERMINATOR)
}

/// Reads framed messages off a stream, one message per call. Bytes
/// that arrive after a terminator are retained for the next call, so
/// a peer that batches several frames into one write loses nothing.
pub struct MessageReader<R> {
    inner: R,
    carry: Vec<u8>,
}

impl<R: Read> MessageReader<R> {
    pub fn new(inner: R) -> MessageReader<R> {
        MessageReader {
            inner,
            carry: Vec::new(),
        }
    }

    /// The wrapped stream, for writing replies back.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Read one framed message, blocking until its terminator
    /// arrives. The returned bytes exclude the terminator.
    /// End-of-stream before a terminator is a protocol error and
    /// surfaces as `ConnectionReset`, matching a peer that went away
    /// mid-message.
    pub fn read_message(&mut self) -> io::Result<Vec<u8>> {
        let mut chunk = [0u8; 1024];

        loop {
            if let Some(pos) = find_terminator(&self.carry) {
                let mut msg: Vec<u8> = self.carry.drain(..pos + TERMINATOR.len()).collect();
                msg.truncate(pos);
                return Ok(msg);
            }

            match self.inner.read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        ErrorKind::ConnectionReset,
                        "EOF mid-message",
                    ));
                }
                Ok(n) => self.carry.extend(&chunk[..n]),
                Err(ref e)
                    if e.kind() == ErrorKind::Interrupted
                        || e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
    }
}

fn write_retrying<W: Write>(stream: &mut W, buf: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        match stream.write(&buf[written..]) {
            Ok(n) => written += n,
            Err(ref e)
                if e.kind() == ErrorKind::Interrupted || e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Write one message followed by the terminator. Short writes and
/// EINTR/EAGAIN are retried in place.
pub fn write_message<W: Write>(stream: &mut W, buf: &[u8]) -> io::Result<()> {
    write_retrying(stream, buf)?;
    write_retrying(stream, TERMINATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Hands out at most `step` bytes per read, so terminators can be
    /// split across reads.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(self.data.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn roundtrip() {
        let mut buf = Vec::new();
        write_message(&mut buf, b"request = \"hello\"").unwrap();
        assert!(buf.ends_with(TERMINATOR));

        let mut reader = MessageReader::new(Cursor::new(buf));
        assert_eq!(reader.read_message().unwrap(), b"request = \"hello\"");
    }

    #[test]
    fn two_messages_back_to_back() {
        let mut buf = Vec::new();
        write_message(&mut buf, b"a = 1").unwrap();
        write_message(&mut buf, b"b = 2").unwrap();

        // both frames arrive in a single read; each call still
        // returns exactly one message
        let mut reader = MessageReader::new(Cursor::new(buf));
        assert_eq!(reader.read_message().unwrap(), b"a = 1");
        assert_eq!(reader.read_message().unwrap(), b"b = 2");
    }

    #[test]
    fn terminator_split_across_reads() {
        let mut data = Vec::new();
        write_message(&mut data, b"a = 1").unwrap();
        write_message(&mut data, b"b = 2").unwrap();

        let mut reader = MessageReader::new(Trickle {
            data,
            pos: 0,
            step: 3,
        });
        assert_eq!(reader.read_message().unwrap(), b"a = 1");
        assert_eq!(reader.read_message().unwrap(), b"b = 2");
    }

    #[test]
    fn premature_eof_is_an_error() {
        let mut reader = MessageReader::new(Cursor::new(b"request = \"hello\"\n#".to_vec()));
        let err = reader.read_message().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionReset);
    }

    #[test]
    fn empty_message() {
        let mut buf = Vec::new();
        write_message(&mut buf, b"").unwrap();
        let mut reader = MessageReader::new(Cursor::new(buf));
        assert_eq!(reader.read_message().unwrap(), b"");
    }
}
