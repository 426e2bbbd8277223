pub mod command;
pub mod delivery;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

use crate::auth::Authenticator;
use crate::storage::Storage;

use session::{Session, SessionOutcome};

/// One SMTP listener. The same server runs on the MX port, the
/// submission port and the implicit-TLS port; only the TLS posture
/// differs.
pub struct Server {
    bind_addr: SocketAddr,
    implicit_tls: bool,
    storage: Arc<Storage>,
    auth: Authenticator,
    hostname: String,
    max_size: u64,
    tls: Option<TlsAcceptor>,
}

impl Server {
    pub fn new(
        bind_addr: SocketAddr,
        implicit_tls: bool,
        storage: Arc<Storage>,
        auth: Authenticator,
        hostname: String,
        max_size: u64,
        tls: Option<TlsAcceptor>,
    ) -> Arc<Self> {
        Arc::new(Server {
            bind_addr,
            implicit_tls,
            storage,
            auth,
            hostname,
            max_size,
            tls,
        })
    }

    pub async fn run(self: Arc<Self>, mut must_exit: watch::Receiver<bool>) -> Result<()> {
        let tcp = TcpListener::bind(self.bind_addr).await?;
        info!("SMTP server listening on {:#}", self.bind_addr);

        let mut connections = FuturesUnordered::new();

        while !*must_exit.borrow() {
            let wait_conn_finished = async {
                if connections.is_empty() {
                    futures::future::pending().await
                } else {
                    connections.next().await
                }
            };
            let (socket, remote_addr) = tokio::select! {
                a = tcp.accept() => a?,
                _ = wait_conn_finished => continue,
                _ = must_exit.changed() => continue,
            };
            info!("SMTP: accepted connection from {}", remote_addr);

            let server = self.clone();
            let conn = tokio::spawn(async move {
                if let Err(e) = server.handle(socket).await {
                    error!(addr = %remote_addr, err = ?e, "smtp connection error");
                }
            });
            connections.push(conn);
        }
        drop(tcp);

        info!("SMTP server shutting down, draining remaining connections...");
        while connections.next().await.is_some() {}

        Ok(())
    }

    async fn handle(&self, socket: TcpStream) -> Result<()> {
        if self.implicit_tls {
            let acceptor = self
                .tls
                .clone()
                .ok_or_else(|| anyhow::anyhow!("implicit-TLS listener without TLS config"))?;
            let stream = acceptor.accept(socket).await?;
            let session = self.session(stream, true);
            session.run().await?;
            return Ok(());
        }

        let session = self.session(socket, false);
        match session.run().await? {
            SessionOutcome::Closed => Ok(()),
            SessionOutcome::StartTls(socket) => {
                let acceptor = self
                    .tls
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("STARTTLS accepted without TLS config"))?;
                let stream = acceptor.accept(socket).await?;
                // RFC 3207: the session restarts from scratch on the
                // freshly negotiated stream.
                self.session(stream, true).run().await?;
                Ok(())
            }
        }
    }

    fn session<S>(&self, stream: S, secure: bool) -> Session<S>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        Session::new(
            stream,
            self.storage.clone(),
            self.auth.clone(),
            self.hostname.clone(),
            self.max_size,
            self.tls.is_some(),
            secure,
        )
    }
}
