//! Raw byte-stream abstraction underneath a transport module.
//!
//! A `RawConn` is the connection the guest reads and writes through the
//! capability shim. The sandbox never sees sockets directly; it only needs
//! blocking I/O, per-direction timeouts, a shutdown that unblocks pending
//! I/O from another thread, and a second handle to perform that shutdown.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

/// A blocking, bidirectional byte stream the host hands to a guest.
pub trait RawConn: Read + Write + Send + 'static {
    /// Bound how long a blocked read may wait. `None` blocks forever.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Bound how long a blocked write may wait. `None` blocks forever.
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Shut down both directions. Pending reads on any handle to the same
    /// stream return promptly.
    fn shutdown(&self) -> io::Result<()>;

    /// A second handle to the same underlying stream.
    fn try_clone_conn(&self) -> io::Result<Box<dyn RawConn>>;
}

impl RawConn for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn try_clone_conn(&self) -> io::Result<Box<dyn RawConn>> {
        Ok(Box::new(self.try_clone()?))
    }
}

#[cfg(unix)]
impl RawConn for std::os::unix::net::UnixStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_write_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        std::os::unix::net::UnixStream::shutdown(self, Shutdown::Both)
    }

    fn try_clone_conn(&self) -> io::Result<Box<dyn RawConn>> {
        Ok(Box::new(self.try_clone()?))
    }
}

/// Default underlying dial function: `tcp`, `tcp4`, `tcp6`, and `unix`.
pub fn dial_stream(network: &str, address: &str) -> io::Result<Box<dyn RawConn>> {
    match network {
        "tcp" | "tcp4" | "tcp6" => {
            let stream = TcpStream::connect(address)?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        "unix" => Ok(Box::new(std::os::unix::net::UnixStream::connect(address)?)),
        other => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unsupported network: {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_dial_stream_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let mut conn = dial_stream("tcp", &addr).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        conn.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_dial_stream_rejects_unknown_network() {
        let err = dial_stream("udp", "127.0.0.1:53").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn test_dial_stream_rejects_invalid_address() {
        assert!(dial_stream("tcp", "256.267.278.289:2023").is_err());
    }

    #[test]
    fn test_shutdown_through_clone_unblocks_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut conn = dial_stream("tcp", &addr).unwrap();
        let (_peer, _) = listener.accept().unwrap();

        let handle = conn.try_clone_conn().unwrap();
        let reader = std::thread::spawn(move || {
            let mut buf = [0u8; 8];
            conn.read(&mut buf)
        });
        std::thread::sleep(Duration::from_millis(50));
        handle.shutdown().unwrap();

        // EOF or an error, but never a hang.
        match reader.join().unwrap() {
            Ok(n) => assert_eq!(n, 0),
            Err(_) => {}
        }
    }
}
