//! Stream-socket plumbing shared by the TTY and the plugin bridge.
//!
//! Both devices speak over a unix-domain or TCP stream that is either
//! connected to or listened on at configuration time; listening blocks
//! until the peer arrives, so the guest never sees a half-connected
//! device.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};

/// A connected byte stream over either socket family.
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    /// Open a unix-domain stream. Listening replaces a stale socket file
    /// and accepts exactly one client.
    pub fn open_unix(label: &str, path: &str, listen: bool) -> io::Result<Stream> {
        if listen {
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path)?;
            println!("Waiting for {label} connection at Unix Domain Socket '{path}'.");
            let (stream, _) = listener.accept()?;
            println!("{label} connection established");
            Ok(Stream::Unix(stream))
        } else {
            println!("Connecting to {label} at Unix Domain Socket '{path}'");
            let stream = UnixStream::connect(path)?;
            println!("{label} connection established");
            Ok(Stream::Unix(stream))
        }
    }

    /// Open a TCP stream. An empty host listens on all local addresses.
    pub fn open_tcp(label: &str, host: &str, port: u16, listen: bool) -> io::Result<Stream> {
        if listen {
            let bind_host = if host.is_empty() { "0.0.0.0" } else { host };
            let listener = TcpListener::bind((bind_host, port))?;
            println!("Waiting for {label} connection at TCP-port {port}.");
            let (stream, peer) = listener.accept()?;
            println!("{label} connection from {peer}");
            Ok(Stream::Tcp(stream))
        } else {
            println!("Connecting to {label} at {host}:{port}");
            let stream = TcpStream::connect((host, port))?;
            println!("{label} connection established");
            Ok(Stream::Tcp(stream))
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Stream::Tcp(s) => s.as_raw_fd(),
            Stream::Unix(s) => s.as_raw_fd(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_pair_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.sock");
        let path_str = path.to_str().unwrap().to_string();

        let listener = UnixListener::bind(&path).unwrap();
        let client = std::thread::spawn(move || {
            let mut s = Stream::open_unix("TEST", &path_str, false).unwrap();
            s.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).unwrap();
            buf
        });

        let (mut server, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        server.write_all(b"pong").unwrap();

        assert_eq!(&client.join().unwrap(), b"pong");
    }
}
