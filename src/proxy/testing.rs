//! Test doubles shared by the proxy tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::error::DialError;
use crate::proxy::dialer::{Dialer, TcpDialer, Upstream, UpstreamTarget};
use crate::proxy::policy::AllowAll;

enum Mode {
    /// In-memory upstream that echoes everything back
    Echo,
    Fail(DialError),
    /// Real TCP connect to the target
    Direct,
}

/// Dialer that counts calls
pub(crate) struct MockDialer {
    calls: AtomicUsize,
    mode: Mode,
}

impl MockDialer {
    pub(crate) fn echo() -> Self {
        Self::with_mode(Mode::Echo)
    }

    pub(crate) fn failing(err: DialError) -> Self {
        Self::with_mode(Mode::Fail(err))
    }

    pub(crate) fn direct() -> Self {
        Self::with_mode(Mode::Direct)
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            mode,
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(
        &self,
        target: &UpstreamTarget,
        timeout: Duration,
    ) -> std::result::Result<Upstream, DialError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            Mode::Echo => {
                let (near, far) = duplex(16 * 1024);
                tokio::spawn(async move {
                    let (mut rd, mut wr) = tokio::io::split(far);
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                    let _ = wr.shutdown().await;
                });
                Ok(Upstream::new(near, "10.0.0.2:5555".parse().ok()))
            }
            Mode::Fail(err) => Err(*err),
            Mode::Direct => {
                TcpDialer::new(Arc::new(AllowAll))
                    .dial(target, timeout)
                    .await
            }
        }
    }
}

/// Client request asking to switch to the `echo` protocol
pub(crate) const UPGRADE_REQUEST: &[u8] =
    b"GET /ws HTTP/1.1\r\nhost: proxy.local\r\nconnection: upgrade\r\nupgrade: echo\r\n\r\n";

/// Origin that answers every request with `101` and then echoes raw bytes
pub(crate) async fn spawn_upgrade_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                if read_head(&mut socket).await.is_empty() {
                    return;
                }
                let switched = b"HTTP/1.1 101 Switching Protocols\r\nconnection: upgrade\r\nupgrade: echo\r\n\r\n";
                if socket.write_all(switched).await.is_err() {
                    return;
                }
                let (mut rd, mut wr) = socket.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

/// Read one HTTP head byte by byte, leaving anything after it unread
pub(crate) async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(1) => head.push(byte[0]),
            _ => break,
        }
    }
    head
}
