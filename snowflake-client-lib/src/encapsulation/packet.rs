//! Packet-oriented endpoint over a reliable byte stream.
//!
//! Wraps a bidirectional stream in the framing codec so that a caller can
//! exchange discrete datagrams with it. The two address values are opaque
//! to this module; they only surface in `recv_from`/`local_addr` so the
//! endpoint can slot in where a UDP-like socket is expected.

use std::io::{self, BufWriter, Read, Write};
use std::time::Duration;

use super::{read_data, write_data, FrameError};

pub struct PacketConn<S: Read + Write, A: Clone> {
    stream: BufWriter<S>,
    local: A,
    remote: A,
}

impl<S: Read + Write, A: Clone> PacketConn<S, A> {
    pub fn new(stream: S, local: A, remote: A) -> Self {
        Self { stream: BufWriter::new(stream), local, remote }
    }

    /// Reads the next datagram into `p`. A datagram longer than `p` is
    /// silently truncated at the buffer boundary; the stream stays aligned
    /// on the next frame.
    pub fn recv_from(&mut self, p: &mut [u8]) -> Result<(usize, A), FrameError> {
        match read_data(self.stream.get_mut(), p) {
            Ok(n) => Ok((n, self.remote.clone())),
            Err(FrameError::ShortBuffer { .. }) => Ok((p.len(), self.remote.clone())),
            Err(e) => Err(e),
        }
    }

    /// Writes `p` as one data frame. The destination address is fixed at
    /// construction, so `_addr` is ignored. The frame is flushed so prefix
    /// and body leave in a single write to the underlying stream.
    pub fn send_to(&mut self, p: &[u8], _addr: &A) -> Result<usize, FrameError> {
        write_data(&mut self.stream, p)?;
        self.stream.flush()?;
        Ok(p.len())
    }

    pub fn local_addr(&self) -> &A {
        &self.local
    }

    pub fn set_read_timeout(&mut self, _d: Option<Duration>) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    pub fn set_write_timeout(&mut self, _d: Option<Duration>) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    pub fn into_inner(self) -> io::Result<S> {
        self.stream.into_inner().map_err(|e| e.into_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encapsulation::write_padding;
    use std::io::Cursor;

    #[test]
    fn datagram_roundtrip() {
        let mut conn = PacketConn::new(Cursor::new(Vec::new()), "local", "remote");
        conn.send_to(b"first", &"remote").expect("send");
        conn.send_to(b"", &"remote").expect("send empty");
        conn.send_to(b"second", &"remote").expect("send");

        let mut cursor = conn.into_inner().expect("inner");
        cursor.set_position(0);
        let mut conn = PacketConn::new(cursor, "local", "remote");

        let mut buf = [0u8; 32];
        let (n, addr) = conn.recv_from(&mut buf).expect("recv");
        assert_eq!((&buf[..n], addr), (&b"first"[..], "remote"));
        let (n, _) = conn.recv_from(&mut buf).expect("recv");
        assert_eq!(n, 0);
        let (n, _) = conn.recv_from(&mut buf).expect("recv");
        assert_eq!(&buf[..n], b"second");
        assert!(matches!(conn.recv_from(&mut buf), Err(FrameError::Eof)));
    }

    #[test]
    fn oversize_datagram_truncates() {
        let mut conn = PacketConn::new(Cursor::new(Vec::new()), (), ());
        conn.send_to(b"a long datagram", &()).expect("send");
        conn.send_to(b"tail", &()).expect("send");

        let mut cursor = conn.into_inner().expect("inner");
        cursor.set_position(0);
        let mut conn = PacketConn::new(cursor, (), ());

        let mut buf = [0u8; 6];
        let (n, _) = conn.recv_from(&mut buf).expect("recv");
        assert_eq!(&buf[..n], b"a long");
        let (n, _) = conn.recv_from(&mut buf).expect("recv");
        assert_eq!(&buf[..n], b"tail");
    }

    #[test]
    fn padding_is_invisible() {
        let mut cursor = Cursor::new(Vec::new());
        write_padding(&mut cursor, 100).expect("pad");
        let mut conn = PacketConn::new(cursor, (), ());
        conn.send_to(b"data", &()).expect("send");

        let mut cursor = conn.into_inner().expect("inner");
        cursor.set_position(0);
        let mut conn = PacketConn::new(cursor, (), ());
        let mut buf = [0u8; 8];
        let (n, _) = conn.recv_from(&mut buf).expect("recv");
        assert_eq!(&buf[..n], b"data");
    }

    #[test]
    fn deadlines_unsupported() {
        let mut conn = PacketConn::new(Cursor::new(Vec::new()), (), ());
        let err = conn.set_read_timeout(None).expect_err("unsupported");
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
