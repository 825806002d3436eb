//! Listener pool: plain HTTP and TLS sockets sharing one handler.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use super::handler::ProxyHandler;

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_HEADER_BYTES: usize = 1 << 20;

/// One bound socket, optionally terminating TLS.
pub struct Listener {
    local: SocketAddr,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
}

impl Listener {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            local: listener.local_addr()?,
            listener,
            tls: None,
        })
    }

    pub async fn bind_tls(addr: SocketAddr, config: Arc<ServerConfig>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            local: listener.local_addr()?,
            listener,
            tls: Some(TlsAcceptor::from(config)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    async fn run(self, handler: Arc<ProxyHandler>) -> anyhow::Result<()> {
        info!(addr = %self.local, tls = self.tls.is_some(), "listener started");
        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .with_context(|| format!("accept failed on {}", self.local))?;

            let handler = handler.clone();
            let tls = self.tls.clone();
            tokio::spawn(async move {
                if let Err(error) = serve_connection(stream, peer, tls, handler).await {
                    debug!(peer = %peer, error = %error, "connection closed with error");
                }
            });
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    handler: Arc<ProxyHandler>,
) -> anyhow::Result<()> {
    let service = service_fn(move |request| {
        let handler = handler.clone();
        async move { Ok::<_, Infallible>(handler.handle(request, peer).await) }
    });

    let mut builder = http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT)
        .max_buf_size(MAX_HEADER_BYTES);

    match tls {
        Some(acceptor) => {
            let stream = acceptor
                .accept(stream)
                .await
                .context("tls handshake failed")?;
            builder.serve_connection(TokioIo::new(stream), service).await?;
        }
        None => {
            builder.serve_connection(TokioIo::new(stream), service).await?;
        }
    }
    Ok(())
}

/// All listeners of one proxy process. The first listener to fail takes the
/// pool down; the caller is expected to exit.
pub struct ListenerPool {
    handler: Arc<ProxyHandler>,
    listeners: Vec<Listener>,
}

impl ListenerPool {
    pub fn new(handler: Arc<ProxyHandler>) -> Self {
        Self {
            handler,
            listeners: Vec::new(),
        }
    }

    pub fn add(&mut self, listener: Listener) {
        self.listeners.push(listener);
    }

    /// Run every listener and return the first error any of them reports.
    pub async fn listen_and_serve(self) -> anyhow::Result<()> {
        let (tx, mut rx) = mpsc::channel::<anyhow::Error>(self.listeners.len().max(1));

        for listener in self.listeners {
            let addr = listener.local_addr();
            let handler = self.handler.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let error = match listener.run(handler).await {
                    Ok(()) => anyhow::anyhow!("listener {addr} exited unexpectedly"),
                    Err(error) => error,
                };
                let _ = tx.send(error).await;
            });
        }
        drop(tx);

        match rx.recv().await {
            Some(error) => Err(error),
            None => Err(anyhow::anyhow!("listener pool is empty")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_assigns_an_ephemeral_port() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_ne!(listener.local_addr().port(), 0);
        assert!(listener.tls.is_none());
    }
}
