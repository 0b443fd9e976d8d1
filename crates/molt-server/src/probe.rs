//! Liveness probe client.
//!
//! Connects once, then sends `ping` every interval and expects `pong`.
//! Any error ends the run; there is no reconnect, so a probe that survives a
//! restart proves its connection was handed over.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::info;

use crate::handler::{FRAME_LEN, PING, PONG};

/// Deadline for each connect, write and read.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("unexpected reply {0:?}")]
    UnexpectedReply([u8; FRAME_LEN]),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One probe connection.
#[derive(Debug)]
pub struct Prober {
    stream: TcpStream,
    timeout: Duration,
}

impl Prober {
    pub async fn connect(addr: SocketAddr, deadline: Duration) -> Result<Self, ProbeError> {
        let stream = timeout(deadline, TcpStream::connect(addr))
            .await
            .map_err(|_| ProbeError::Timeout("connect"))?
            .map_err(|source| ProbeError::Connect { addr, source })?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            timeout: deadline,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    /// One exchange; returns the round-trip time.
    pub async fn ping(&mut self) -> Result<Duration, ProbeError> {
        let started = Instant::now();
        timeout(self.timeout, self.stream.write_all(PING))
            .await
            .map_err(|_| ProbeError::Timeout("write"))??;

        let mut reply = [0u8; FRAME_LEN];
        timeout(self.timeout, self.stream.read_exact(&mut reply))
            .await
            .map_err(|_| ProbeError::Timeout("read"))??;
        if &reply != PONG {
            return Err(ProbeError::UnexpectedReply(reply));
        }
        Ok(started.elapsed())
    }
}

/// Probe `addr` every `interval`, `count` times or until an error.
///
/// Returns the number of successful exchanges.
pub async fn run(
    addr: SocketAddr,
    interval: Duration,
    count: Option<u64>,
    deadline: Duration,
) -> Result<u64, ProbeError> {
    let mut prober = Prober::connect(addr, deadline).await?;
    info!(server = %addr, local = ?prober.local_addr().ok(), "Connected");

    let mut ticker = tokio::time::interval(interval);
    let mut exchanges = 0;
    while count.map_or(true, |count| exchanges < count) {
        ticker.tick().await;
        let rtt = prober.ping().await?;
        exchanges += 1;
        info!(seq = exchanges, rtt_us = rtt.as_micros() as u64, "ping -> pong");
    }
    Ok(exchanges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_unexpected_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(b"nope").await.unwrap();
        });

        let mut prober = Prober::connect(addr, Duration::from_secs(1)).await.unwrap();
        let err = prober.ping().await.unwrap_err();
        assert!(matches!(err, ProbeError::UnexpectedReply(reply) if &reply == b"nope"));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(stream);
        });

        let mut prober = Prober::connect(addr, Duration::from_millis(100)).await.unwrap();
        assert!(matches!(
            prober.ping().await.unwrap_err(),
            ProbeError::Timeout("read")
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(matches!(
            Prober::connect(addr, Duration::from_secs(1)).await.unwrap_err(),
            ProbeError::Connect { .. }
        ));
    }
}
