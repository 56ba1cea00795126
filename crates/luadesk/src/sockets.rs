//! Per-session registry of guest TCP sockets.
//!
//! Guest code refers to sockets by small integer ids handed out by
//! `socket.new`. Ids start at 1 and are never reused within a session. The
//! registry owns every stream, so closing the session releases them all.

use std::{
    collections::BTreeMap,
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

/// Largest single receive a guest may request.
pub const MAX_RECEIVE_BYTES: usize = 1024 * 1024;

/// One guest socket.
#[derive(Debug, Default)]
pub struct SocketEntry {
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    buffer: Vec<u8>,
    last_error: Option<String>,
}

impl SocketEntry {
    /// Connects to `host:port`, trying each resolved address in turn.
    ///
    /// Returns `false` and records the error on failure.
    pub fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> bool {
        self.stream = None;
        self.peer = None;
        self.buffer.clear();

        let addrs = match (host, port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(err) => return self.fail(format!("cannot resolve {host}:{port}: {err}")),
        };

        let mut last = format!("no address found for {host}:{port}");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    if let Err(err) = configure(&stream, timeout) {
                        last = err.to_string();
                        continue;
                    }
                    tracing::debug!(%addr, "guest socket connected");
                    self.stream = Some(stream);
                    self.peer = Some(addr);
                    self.last_error = None;
                    return true;
                }
                Err(err) => last = format!("cannot connect to {addr}: {err}"),
            }
        }
        self.fail(last)
    }

    /// Sends all of `data`; returns the byte count or `None` on failure.
    pub fn send(&mut self, data: &[u8]) -> Option<usize> {
        let Some(stream) = self.stream.as_mut() else {
            self.fail("socket is not connected".to_owned());
            return None;
        };
        match stream.write_all(data).and_then(|()| stream.flush()) {
            Ok(()) => {
                self.last_error = None;
                Some(data.len())
            }
            Err(err) => {
                self.fail(format!("send failed: {err}"));
                None
            }
        }
    }

    /// Receives up to `max` bytes; returns `None` on failure or when the peer closed.
    ///
    /// Buffered bytes are returned first; the stream is read only when the
    /// buffer is empty.
    pub fn receive(&mut self, max: usize) -> Option<Vec<u8>> {
        let max = max.clamp(1, MAX_RECEIVE_BYTES);
        if self.buffer.is_empty() {
            let Some(stream) = self.stream.as_mut() else {
                self.fail("socket is not connected".to_owned());
                return None;
            };
            let start = self.buffer.len();
            self.buffer.resize(start + max, 0);
            match stream.read(&mut self.buffer[start..]) {
                Ok(0) => {
                    self.buffer.truncate(start);
                    self.fail("connection closed by peer".to_owned());
                    return None;
                }
                Ok(read) => self.buffer.truncate(start + read),
                Err(err) => {
                    self.buffer.truncate(start);
                    let message = match err.kind() {
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => "receive timed out".to_owned(),
                        _ => format!("receive failed: {err}"),
                    };
                    self.fail(message);
                    return None;
                }
            }
        }
        let take = max.min(self.buffer.len());
        self.last_error = None;
        Some(self.buffer.drain(..take).collect())
    }

    /// Last recorded error, if the most recent operation failed.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Address of the connected peer.
    #[must_use]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn fail(&mut self, message: String) -> bool {
        tracing::debug!(error = %message, "guest socket operation failed");
        self.last_error = Some(message);
        false
    }
}

fn configure(stream: &TcpStream, timeout: Duration) -> io::Result<()> {
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.set_nodelay(true)
}

/// Socket table of one session.
#[derive(Debug)]
pub struct SocketRegistry {
    next_id: u32,
    entries: BTreeMap<u32, SocketEntry>,
}

impl Default for SocketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketRegistry {
    /// Creates an empty registry; the first id handed out is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: BTreeMap::new(),
        }
    }

    /// Creates an unconnected socket and returns its id.
    pub fn create(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, SocketEntry::default());
        id
    }

    /// Looks up a socket by id.
    pub fn get_mut(&mut self, id: u32) -> Option<&mut SocketEntry> {
        self.entries.get_mut(&id)
    }

    /// Closes and forgets a socket; returns `false` for unknown ids.
    pub fn delete(&mut self, id: u32) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Closes every socket and returns how many were released.
    pub fn clear(&mut self) -> usize {
        let released = self.entries.len();
        self.entries.clear();
        released
    }

    /// Number of live sockets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no socket is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, thread};

    use super::*;

    #[test]
    fn ids_start_at_one_and_are_not_reused() {
        let mut registry = SocketRegistry::new();
        assert_eq!(registry.create(), 1);
        assert_eq!(registry.create(), 2);
        assert!(registry.delete(1));
        assert!(!registry.delete(1));
        assert_eq!(registry.create(), 3);
        assert_eq!(registry.clear(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn echo_round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&buf).unwrap();
        });

        let mut entry = SocketEntry::default();
        assert!(entry.connect("127.0.0.1", port, Duration::from_secs(2)));
        assert_eq!(entry.send(b"hello"), Some(5));
        let mut received = Vec::new();
        while received.len() < 5 {
            received.extend(entry.receive(3).unwrap());
        }
        assert_eq!(received, b"hello");
        server.join().unwrap();

        assert_eq!(entry.receive(8), None);
        assert_eq!(entry.last_error(), Some("connection closed by peer"));
    }

    #[test]
    fn send_without_connect_records_error() {
        let mut entry = SocketEntry::default();
        assert_eq!(entry.send(b"x"), None);
        assert_eq!(entry.last_error(), Some("socket is not connected"));
    }
}
