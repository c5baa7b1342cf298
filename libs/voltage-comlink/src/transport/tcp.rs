//! TCP client and listener transports

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::{Transport, TransportError, TransportKind, TransportResult};

async fn read_stream(
    stream: &mut TcpStream,
    buf: &mut [u8],
    deadline: Duration,
) -> TransportResult<()> {
    match timeout(deadline, stream.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(TransportError::from(e)),
        Err(_) => Err(TransportError::Timeout(deadline)),
    }
}

async fn write_stream(stream: &mut TcpStream, data: &[u8]) -> TransportResult<()> {
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

/// Outbound TCP connection (Modbus TCP master)
pub struct TcpClientTransport {
    host: String,
    port: u16,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpClientTransport {
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout,
            stream: None,
        }
    }
}

#[async_trait]
impl Transport for TcpClientTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::TcpClient
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn open(&mut self) -> TransportResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let target = self.describe();
        debug!("TCP: connecting {}", target);
        let stream = match timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::ConnectionFailed(format!("{target}: {e}")));
            },
            Err(_) => {
                return Err(TransportError::ConnectionFailed(format!(
                    "{target}: connect timeout after {:?}",
                    self.connect_timeout
                )));
            },
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("TCP: set_nodelay failed for {}: {}", target, e);
        }
        info!("TCP: connected {}", target);
        self.stream = Some(stream);
        Ok(())
    }

    async fn read_exact(&mut self, buf: &mut [u8], deadline: Duration) -> TransportResult<()> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        let result = read_stream(stream, buf, deadline).await;
        if matches!(&result, Err(e) if e.is_fatal()) {
            self.stream = None;
        }
        result
    }

    async fn write(&mut self, data: &[u8]) -> TransportResult<()> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        let result = write_stream(stream, data).await;
        if result.is_err() {
            self.stream = None;
        }
        result
    }

    async fn close(&mut self) -> TransportResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("TCP: closed {}", self.describe());
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

/// Listening TCP transport serving one peer at a time (Modbus TCP slave)
///
/// `open` binds the listener. The first read after a peer disconnects waits
/// for the next peer within the read deadline.
pub struct TcpServerTransport {
    bind_addr: String,
    listener: Option<TcpListener>,
    stream: Option<(TcpStream, SocketAddr)>,
}

impl TcpServerTransport {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            listener: None,
            stream: None,
        }
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.stream.as_ref().map(|(_, peer)| *peer)
    }
}

#[async_trait]
impl Transport for TcpServerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::TcpServer
    }

    fn describe(&self) -> String {
        match self.local_addr() {
            Some(addr) => format!("listen {}", addr),
            None => format!("listen {}", self.bind_addr),
        }
    }

    async fn open(&mut self) -> TransportResult<()> {
        if self.listener.is_some() {
            return Ok(());
        }
        let listener = TcpListener::bind(self.bind_addr.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", self.bind_addr, e)))?;
        info!("TCP: listening on {}", self.bind_addr);
        self.listener = Some(listener);
        Ok(())
    }

    async fn read_exact(&mut self, buf: &mut [u8], deadline: Duration) -> TransportResult<()> {
        let started = Instant::now();

        if self.stream.is_none() {
            let listener = self.listener.as_ref().ok_or(TransportError::NotOpen)?;
            match timeout(deadline, listener.accept()).await {
                Ok(Ok((stream, peer))) => {
                    let _ = stream.set_nodelay(true);
                    info!("TCP: accepted {}", peer);
                    self.stream = Some((stream, peer));
                },
                Ok(Err(e)) => return Err(TransportError::Io(e.to_string())),
                Err(_) => return Err(TransportError::Timeout(deadline)),
            }
        }

        let remaining = deadline.saturating_sub(started.elapsed());
        let Some((stream, peer)) = self.stream.as_mut() else {
            return Err(TransportError::NotOpen);
        };
        let result = read_stream(stream, buf, remaining).await;
        if matches!(&result, Err(e) if e.is_fatal()) {
            debug!("TCP: peer {} went away", peer);
            self.stream = None;
        }
        result
    }

    async fn write(&mut self, data: &[u8]) -> TransportResult<()> {
        let Some((stream, _)) = self.stream.as_mut() else {
            return Err(TransportError::ConnectionLost("no peer connected".into()));
        };
        let result = write_stream(stream, data).await;
        if result.is_err() {
            self.stream = None;
        }
        result
    }

    async fn close(&mut self) -> TransportResult<()> {
        if let Some((mut stream, _)) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.listener = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.listener.is_some()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_server_exchange() {
        let mut server = TcpServerTransport::new("127.0.0.1:0");
        server.open().await.unwrap();
        let addr = server.local_addr().unwrap();

        let client_task = tokio::spawn(async move {
            let mut client =
                TcpClientTransport::new("127.0.0.1", addr.port(), Duration::from_secs(1));
            client.open().await.unwrap();
            client.write(&[1, 2, 3]).await.unwrap();
            let mut reply = [0u8; 2];
            client
                .read_exact(&mut reply, Duration::from_secs(1))
                .await
                .unwrap();
            reply
        });

        let mut buf = [0u8; 3];
        server
            .read_exact(&mut buf, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(buf, [1, 2, 3]);
        server.write(&[9, 8]).await.unwrap();

        assert_eq!(client_task.await.unwrap(), [9, 8]);
    }

    #[tokio::test]
    async fn test_server_read_times_out_without_peer() {
        let mut server = TcpServerTransport::new("127.0.0.1:0");
        server.open().await.unwrap();
        let mut buf = [0u8; 1];
        let err = server
            .read_exact(&mut buf, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_client_connect_refused() {
        // Bind then drop to get a port with no listener
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let mut client = TcpClientTransport::new("127.0.0.1", port, Duration::from_millis(500));
        let err = client.open().await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
        assert!(!client.is_open());
    }

    #[tokio::test]
    async fn test_read_before_open() {
        let mut client = TcpClientTransport::new("127.0.0.1", 1, Duration::from_millis(10));
        let mut buf = [0u8; 1];
        assert_eq!(
            client
                .read_exact(&mut buf, Duration::from_millis(10))
                .await
                .unwrap_err(),
            TransportError::NotOpen
        );
    }
}
