// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Framed, enciphered byte stream built on top of a handshaked session
//! (§4.4 "Read path"/"Write path").

use crate::error::{Result, SessionError};
use homeostas_digest::Cipher;
use std::io::{Read, Write};

/// Default delimiter used by `read_until`/`write_delimited` (§4.4: "reading
/// up to a delimiter sequence (default NUL)").
pub const DEFAULT_DELIMITER: u8 = 0;

/// Internal buffer size, "on the order of the MSS" (§4.4).
const BUFFER_SIZE: usize = 1220;

/// A bidirectional stream layered over any `Read + Write` transport, with
/// independent encrypt/decrypt cipher states (§9 "Session/cipher coupling":
/// "a layered pair: a framed byte transport that owns two cipher states").
pub struct FramedStream<T: Read + Write> {
    inner: T,
    encryptor: Cipher,
    decryptor: Cipher,
    read_buf: Vec<u8>,
    read_pos: usize,
}

impl<T: Read + Write> FramedStream<T> {
    pub fn new(inner: T, encryptor: Cipher, decryptor: Cipher) -> Self {
        FramedStream {
            inner,
            encryptor,
            decryptor,
            read_buf: Vec::new(),
            read_pos: 0,
        }
    }

    /// Read bytes up to (and excluding) the first `delimiter`, consuming it
    /// from the stream. Fills the internal read buffer from the transport
    /// in `BUFFER_SIZE` chunks, decrypting in place on arrival.
    pub fn read_until(&mut self, delimiter: u8) -> Result<Vec<u8>> {
        loop {
            if let Some(rel) = self.read_buf[self.read_pos..].iter().position(|&b| b == delimiter)
            {
                let end = self.read_pos + rel;
                let out = self.read_buf[self.read_pos..end].to_vec();
                self.read_pos = end + 1;
                return Ok(out);
            }
            self.fill_more()?;
        }
    }

    fn fill_more(&mut self) -> Result<()> {
        if self.read_pos > 0 {
            self.read_buf.drain(0..self.read_pos);
            self.read_pos = 0;
        }
        let mut chunk = vec![0u8; BUFFER_SIZE];
        let n = self.inner.read(&mut chunk)?;
        if n == 0 {
            return Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed the stream",
            )));
        }
        chunk.truncate(n);
        self.decryptor.apply(&mut chunk);
        self.read_buf.extend_from_slice(&chunk);
        Ok(())
    }

    pub fn read_exact_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        while self.read_buf.len() - self.read_pos < len {
            self.fill_more()?;
        }
        let out = self.read_buf[self.read_pos..self.read_pos + len].to_vec();
        self.read_pos += len;
        Ok(out)
    }

    /// Encrypt and write `data`, followed by `delimiter` (§4.4: "writing a
    /// delimiter after each string").
    pub fn write_delimited(&mut self, data: &[u8], delimiter: u8) -> Result<()> {
        let mut buf = data.to_vec();
        buf.push(delimiter);
        self.encryptor.apply(&mut buf);
        self.inner.write_all(&buf)?;
        Ok(())
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let mut buf = data.to_vec();
        self.encryptor.apply(&mut buf);
        self.inner.write_all(&buf)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// A `Read + Write` fake that lets writes be replayed back through
    /// reads, so a `FramedStream` can talk to itself in tests.
    struct LoopbackTransport {
        outbound: Vec<u8>,
        inbound: Cursor<Vec<u8>>,
    }

    impl LoopbackTransport {
        fn new(preloaded: Vec<u8>) -> Self {
            LoopbackTransport {
                outbound: Vec::new(),
                inbound: Cursor::new(preloaded),
            }
        }
    }

    impl Read for LoopbackTransport {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.inbound.read(buf)
        }
    }

    impl Write for LoopbackTransport {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.outbound.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_then_read_back_through_none_cipher() {
        let transport = LoopbackTransport::new(Vec::new());
        let mut stream = FramedStream::new(transport, Cipher::None, Cipher::None);
        stream.write_delimited(b"hello", DEFAULT_DELIMITER).unwrap();

        let written = stream.into_inner().outbound;
        let mut reader_side = FramedStream::new(LoopbackTransport::new(written), Cipher::None, Cipher::None);
        let got = reader_side.read_until(DEFAULT_DELIMITER).unwrap();
        assert_eq!(got, b"hello");
    }

    #[test]
    fn read_exact_bytes_spans_multiple_fills() {
        let payload = vec![0x42u8; BUFFER_SIZE * 2 + 7];
        let transport = LoopbackTransport::new(payload.clone());
        let mut stream = FramedStream::new(transport, Cipher::None, Cipher::None);
        let got = stream.read_exact_bytes(payload.len()).unwrap();
        assert_eq!(got, payload);
    }
}
