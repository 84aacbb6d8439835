//! Polling client for the query counter server.
//!
//! Sends `GET` to the server on a fixed interval and logs the returned
//! count. Failures of a single poll are logged and never stop the loop.

use crate::protocol::{Reply, ReplyError, BUFFER_SIZE, GET_COMMAND};
#[cfg(unix)]
use std::ffi::CString;
#[cfg(unix)]
use std::sync::Mutex;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info};

/// Errors of a single client exchange
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Could not resolve the server endpoint: {0}")]
    Resolve(String),

    #[error("No reply from the server within {0:?}")]
    Timeout(Duration),

    #[error("The server responded with an error message: {0}")]
    Server(String),

    #[error(transparent)]
    Malformed(#[from] ReplyError),
}

/// UDP client bound to one server endpoint
pub struct CountersClient {
    socket: UdpSocket,
    target: SocketAddr,
    reply_timeout: Duration,
}

impl CountersClient {
    /// Resolve the target and open a local socket of the matching family.
    ///
    /// `service` is a numeric port or a name from the system services
    /// database (e.g. `domain`).
    pub async fn connect(
        host: &str,
        service: &str,
        reply_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let port = service_port(service)
            .ok_or_else(|| ClientError::Resolve(format!("unknown service '{service}'")))?;

        let target = lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| ClientError::Resolve(format!("no address found for '{host}'")))?;

        let local: SocketAddr = if target.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        debug!(server = %target, "Endpoint resolved");

        Ok(Self {
            socket,
            target,
            reply_timeout,
        })
    }

    /// Server endpoint this client talks to
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Send one `GET` and decode the reply into the new count
    pub async fn get_count(&self) -> Result<u64, ClientError> {
        self.discard_stale_replies()?;

        debug!("Sending a GET command to the server");
        self.socket
            .send_to(GET_COMMAND.as_bytes(), self.target)
            .await?;

        let mut buf = [0u8; BUFFER_SIZE];
        let len = timeout(self.reply_timeout, self.receive_reply(&mut buf))
            .await
            .map_err(|_| ClientError::Timeout(self.reply_timeout))??;

        match Reply::parse(&buf[..len])? {
            Reply::Count(count) => Ok(count),
            Reply::Error(msg) => Err(ClientError::Server(msg)),
        }
    }

    /// Poll once and log the outcome
    pub async fn poll_once(&self) -> Option<u64> {
        match self.get_count().await {
            Ok(count) => {
                info!(count, "Counter was successfully received");
                Some(count)
            }
            Err(e) => {
                error!(error = %e, "Poll failed");
                None
            }
        }
    }

    /// Poll every `period` until `shutdown` completes
    pub async fn run_until<F: Future>(&self, period: Duration, shutdown: F) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, polling stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }
    }

    /// Drop datagrams already queued on the socket, such as a reply that
    /// arrived after its exchange timed out.
    fn discard_stale_replies(&self) -> io::Result<()> {
        let mut buf = [0u8; BUFFER_SIZE];
        loop {
            match self.socket.try_recv_from(&mut buf) {
                Ok((len, from)) => {
                    debug!(peer = %from, len, "Discarding stale datagram");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait for a datagram from the target, ignoring other senders
    async fn receive_reply(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let (len, from) = self.socket.recv_from(buf).await?;
            if from == self.target {
                return Ok(len);
            }
            debug!(peer = %from, "Ignoring datagram from unexpected peer");
        }
    }
}

/// Map a service to a UDP port, numeric ports first
fn service_port(service: &str) -> Option<u16> {
    match service.parse() {
        Ok(port) => Some(port),
        Err(_) => lookup_service(service),
    }
}

#[cfg(unix)]
fn lookup_service(service: &str) -> Option<u16> {
    // getservbyname returns a pointer into shared static storage
    static LOOKUP: Mutex<()> = Mutex::new(());

    let name = CString::new(service).ok()?;
    let proto = b"udp\0";
    let _guard = LOOKUP.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    // SAFETY: both arguments are NUL-terminated. The entry is copied out
    // while the lock is held.
    unsafe {
        let entry = libc::getservbyname(name.as_ptr(), proto.as_ptr() as *const libc::c_char);
        if entry.is_null() {
            return None;
        }
        // s_port holds the port in network byte order
        Some(u16::from_be((*entry).s_port as u16))
    }
}

#[cfg(not(unix))]
fn lookup_service(_service: &str) -> Option<u16> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::RequestDispatcher;
    use crate::runtime::DatagramServer;
    use crate::storage::CounterStore;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    /// Answer every datagram with a fixed reply
    async fn canned_server(reply: &'static [u8]) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; BUFFER_SIZE];
            while let Ok((_, peer)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(reply, peer).await;
            }
        });
        addr
    }

    async fn client_for(addr: SocketAddr) -> CountersClient {
        CountersClient::connect("127.0.0.1", &addr.port().to_string(), Duration::from_secs(5))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_poll_real_server() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CounterStore::open(dir.path(), false).unwrap());
        let dispatcher = Arc::new(RequestDispatcher::new(store));
        let server = DatagramServer::bind("127.0.0.1:0".parse().unwrap(), dispatcher)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move { server.run_until(rx).await });

        let client = client_for(addr).await;
        assert_eq!(client.target(), addr);
        assert_eq!(client.get_count().await.unwrap(), 1);
        assert_eq!(client.poll_once().await, Some(2));

        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_reply() {
        let addr = canned_server(b"ERROR: Unrecognized command: 'GET'\n").await;
        let client = client_for(addr).await;

        match client.get_count().await {
            Err(ClientError::Server(msg)) => assert_eq!(msg, "Unrecognized command: 'GET'"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_reply() {
        let addr = canned_server(b"PONG\n").await;
        let client = client_for(addr).await;

        assert!(matches!(
            client.get_count().await,
            Err(ClientError::Malformed(_))
        ));
        assert_eq!(client.poll_once().await, None);
    }

    #[tokio::test]
    async fn test_timeout_without_server() {
        // Bound but never answering
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let client = CountersClient::connect("127.0.0.1", &port.to_string(), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(matches!(
            client.get_count().await,
            Err(ClientError::Timeout(_))
        ));
    }

    /// Answer with an increasing count, holding the first reply back
    async fn delayed_counting_server(first_delay: Duration) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; BUFFER_SIZE];
            let mut count = 0u64;
            while let Ok((_, peer)) = socket.recv_from(&mut buf).await {
                count += 1;
                if count == 1 {
                    tokio::time::sleep(first_delay).await;
                }
                let reply = format!("OK: {count}\n");
                let _ = socket.send_to(reply.as_bytes(), peer).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_late_reply_is_not_taken_for_the_next_one() {
        let addr = delayed_counting_server(Duration::from_millis(200)).await;
        let client = CountersClient::connect(
            "127.0.0.1",
            &addr.port().to_string(),
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        assert!(matches!(
            client.get_count().await,
            Err(ClientError::Timeout(_))
        ));

        // Let the late "OK: 1" land in the socket queue
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(client.get_count().await.unwrap(), 2);
        assert_eq!(client.get_count().await.unwrap(), 3);
    }

    #[test]
    fn test_service_port() {
        assert_eq!(service_port("12345"), Some(12345));
        assert_eq!(service_port("no-such-service-xyz"), None);
        assert_eq!(service_port("99999"), None);

        // Named lookups go through the system services database
        let services = std::fs::read_to_string("/etc/services").unwrap_or_default();
        let has_domain = services
            .lines()
            .any(|line| line.split_whitespace().take(2).eq(["domain", "53/udp"]));
        if has_domain {
            assert_eq!(service_port("domain"), Some(53));
        }
    }

    #[test]
    fn test_unknown_service_rejected() {
        let result = tokio_test::block_on(CountersClient::connect(
            "127.0.0.1",
            "no-such-service-xyz",
            Duration::from_secs(1),
        ));
        assert!(matches!(result, Err(ClientError::Resolve(_))));
    }

    #[tokio::test]
    async fn test_run_until_stops() {
        let addr = canned_server(b"OK: 7\n").await;
        let client = client_for(addr).await;

        let shutdown = tokio::time::sleep(Duration::from_millis(50));
        timeout(Duration::from_secs(5), client.run_until(Duration::from_secs(1), shutdown))
            .await
            .unwrap();
    }
}
