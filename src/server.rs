use std::sync::Arc;

use anyhow::{Context, Result};
use rustls_pemfile::{certs, private_key};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::auth::Authenticator;
use crate::config::Config;
use crate::storage::Storage;
use crate::{imap, smtp};

pub struct Server {
    config: Config,
    storage: Arc<Storage>,
    auth: Authenticator,
    tls: Option<TlsAcceptor>,
}

impl Server {
    pub fn from_config(config: Config) -> Result<Self> {
        let storage = Storage::open(&config.storage, &config.hostname)?;
        let auth = Authenticator::new(storage.index.clone());
        let tls = match &config.tls {
            Some(tls_config) => {
                let loaded_certs = certs(&mut std::io::BufReader::new(
                    std::fs::File::open(&tls_config.certs).context("open certificate file")?,
                ))
                .collect::<Result<Vec<_>, _>>()?;
                let loaded_key = private_key(&mut std::io::BufReader::new(
                    std::fs::File::open(&tls_config.key).context("open key file")?,
                ))?
                .context("no private key found")?;
                let tls_config = rustls::ServerConfig::builder()
                    .with_no_client_auth()
                    .with_single_cert(loaded_certs, loaded_key)?;
                Some(TlsAcceptor::from(Arc::new(tls_config)))
            }
            None => None,
        };
        Ok(Server {
            config,
            storage,
            auth,
            tls,
        })
    }

    pub async fn run(self) -> Result<()> {
        let (exit_tx, exit_rx) = watch::channel(false);

        tokio::spawn(async move {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(err = ?e, "unable to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
                _ = sigterm.recv() => info!("SIGTERM received"),
            }
            let _ = exit_tx.send(true);
        });

        let mut listeners = Vec::new();

        if let Some(smtp_config) = &self.config.smtp {
            for (addr, implicit) in [
                (smtp_config.bind_addr, false),
                (smtp_config.submission_addr, false),
                (smtp_config.tls_addr, true),
            ] {
                if let Some(addr) = addr {
                    let server = smtp::Server::new(
                        addr,
                        implicit,
                        self.storage.clone(),
                        self.auth.clone(),
                        self.config.hostname.clone(),
                        self.config.max_message_size,
                        self.tls.clone(),
                    );
                    listeners.push(tokio::spawn(server.run(exit_rx.clone())));
                }
            }
        }

        if let Some(imap_config) = &self.config.imap {
            for (addr, implicit) in [
                (imap_config.bind_addr, false),
                (imap_config.tls_addr, true),
            ] {
                if let Some(addr) = addr {
                    let server = imap::Server::new(
                        addr,
                        implicit,
                        self.storage.clone(),
                        self.auth.clone(),
                        self.config.hostname.clone(),
                        self.config.max_message_size,
                        self.config.auto_seen_on_open,
                        self.tls.clone(),
                    );
                    listeners.push(tokio::spawn(server.run(exit_rx.clone())));
                }
            }
        }

        anyhow::ensure!(!listeners.is_empty(), "no listener configured");
        info!(hostname = %self.config.hostname, "server started");

        let results = futures::future::join_all(listeners).await;
        for result in results {
            result.context("listener task panicked")??;
        }
        Ok(())
    }
}
