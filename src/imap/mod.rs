pub mod attributes;
pub mod capability;
pub mod command;
pub mod flow;
pub mod grammar;
pub mod mailbox_view;
pub mod response;
pub mod search;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use crate::auth::Authenticator;
use crate::imap::capability::ServerCapability;
use crate::imap::command::ServerContext;
use crate::imap::grammar::{parse_command, peek_tag, trailing_literal, Command, CommandBody};
use crate::imap::response::{encode_body, encode_response, encode_status, Code, Status};
use crate::imap::session::{Action, Instance};
use crate::netio::{read_line, read_line_timeout, read_exact, trim_crlf, write_all_flush};
use crate::storage::Storage;

const MAX_LINE: usize = 16 * 1024;
const COMMAND_DEADLINE: Duration = Duration::from_secs(30 * 60);
const IDLE_KEEPALIVE: Duration = Duration::from_secs(29 * 60);

pub struct Server {
    bind_addr: SocketAddr,
    implicit_tls: bool,
    storage: Arc<Storage>,
    auth: Authenticator,
    hostname: String,
    max_size: u64,
    auto_seen: bool,
    tls: Option<TlsAcceptor>,
}

impl Server {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bind_addr: SocketAddr,
        implicit_tls: bool,
        storage: Arc<Storage>,
        auth: Authenticator,
        hostname: String,
        max_size: u64,
        auto_seen: bool,
        tls: Option<TlsAcceptor>,
    ) -> Arc<Self> {
        Arc::new(Server {
            bind_addr,
            implicit_tls,
            storage,
            auth,
            hostname,
            max_size,
            auto_seen,
            tls,
        })
    }

    pub async fn run(self: Arc<Self>, mut must_exit: watch::Receiver<bool>) -> Result<()> {
        let tcp = TcpListener::bind(self.bind_addr).await?;
        info!("IMAP server listening on {:#}", self.bind_addr);

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
            info!("IMAP: accepted connection from {}", remote_addr);

            let server = self.clone();
            let conn = tokio::spawn(async move {
                if let Err(e) = server.handle(socket).await {
                    error!(addr = %remote_addr, err = ?e, "imap connection error");
                }
            });
            connections.push(conn);
        }
        drop(tcp);

        info!("IMAP server shutting down, draining remaining connections...");
        while connections.next().await.is_some() {}

        Ok(())
    }

    fn context(&self, secure: bool) -> ServerContext {
        ServerContext {
            storage: self.storage.clone(),
            auth: self.auth.clone(),
            caps: ServerCapability::new(self.tls.is_some(), secure),
            hostname: self.hostname.clone(),
            max_size: self.max_size,
            auto_seen: self.auto_seen,
        }
    }

    async fn handle(&self, socket: TcpStream) -> Result<()> {
        if self.implicit_tls {
            let acceptor = self
                .tls
                .clone()
                .ok_or_else(|| anyhow::anyhow!("implicit-TLS listener without TLS config"))?;
            let stream = acceptor.accept(socket).await?;
            let conn = Connection::new(stream, self.context(true), self.storage.clone());
            conn.run().await?;
            return Ok(());
        }

        let conn = Connection::new(socket, self.context(false), self.storage.clone());
        match conn.run().await? {
            Outcome::Closed => Ok(()),
            Outcome::StartTls(socket) => {
                let acceptor = self
                    .tls
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("STARTTLS accepted without TLS config"))?;
                let stream = acceptor.accept(socket).await?;
                let conn = Connection::new(stream, self.context(true), self.storage.clone());
                conn.run().await?;
                Ok(())
            }
        }
    }
}

/// Drive one already-accepted stream through a full session, without
/// a listener. STARTTLS is never offered on such sessions; embedders
/// that want it go through `Server`.
pub async fn serve_plain<S>(stream: S, ctx: ServerContext, storage: Arc<Storage>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let conn = Connection::new(stream, ctx, storage);
    conn.run().await.map(|_| ())
}

enum Outcome<S> {
    Closed,
    StartTls(S),
}

struct Connection<S> {
    io: BufStream<S>,
    instance: Instance,
    storage: Arc<Storage>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    fn new(stream: S, ctx: ServerContext, storage: Arc<Storage>) -> Self {
        Connection {
            io: BufStream::new(stream),
            instance: Instance::new(ctx),
            storage,
        }
    }

    async fn run(mut self) -> Result<Outcome<S>> {
        let caps = self.instance.ctx.caps.to_vec().join(" ");
        write_all_flush(
            &mut self.io,
            format!(
                "* OK [CAPABILITY {}] {} malleposte ready\r\n",
                caps, self.instance.ctx.hostname
            )
            .as_bytes(),
        )
        .await?;

        loop {
            let buffer = match self.read_command().await? {
                None => return Ok(Outcome::Closed),
                Some(b) => b,
            };

            let cmd = match parse_command(trim_crlf(&buffer)) {
                Ok(cmd) => cmd,
                Err(e) => {
                    debug!(error = %e, "unparseable command");
                    let tag = peek_tag(&buffer).unwrap_or_else(|| "*".to_string());
                    let mut out = Vec::new();
                    encode_status(
                        &Status::bad(Some(tag), None, "Command not understood"),
                        &mut out,
                    );
                    write_all_flush(&mut self.io, &out).await?;
                    continue;
                }
            };

            // AUTHENTICATE without SASL-IR needs one continuation
            // round before dispatch sees the payload.
            let cmd = match cmd {
                Command {
                    tag,
                    body:
                        CommandBody::Authenticate {
                            mechanism,
                            initial: None,
                        },
                } => {
                    write_all_flush(&mut self.io, b"+ \r\n").await?;
                    let line =
                        match read_line_timeout(&mut self.io, MAX_LINE, COMMAND_DEADLINE).await? {
                            None => return Ok(Outcome::Closed),
                            Some(line) => String::from_utf8_lossy(trim_crlf(&line)).into_owned(),
                        };
                    if line == "*" {
                        let mut out = Vec::new();
                        encode_status(
                            &Status::bad(Some(tag), None, "Authentication cancelled"),
                            &mut out,
                        );
                        write_all_flush(&mut self.io, &out).await?;
                        continue;
                    }
                    Command {
                        tag,
                        body: CommandBody::Authenticate {
                            mechanism,
                            initial: Some(line),
                        },
                    }
                }
                other => other,
            };

            match self.instance.execute(cmd).await {
                Action::Respond(resp) => {
                    let mut out = Vec::new();
                    encode_response(&resp, &mut out);
                    write_all_flush(&mut self.io, &out).await?;
                }
                Action::StartTls(resp) => {
                    let mut out = Vec::new();
                    encode_response(&resp, &mut out);
                    write_all_flush(&mut self.io, &out).await?;
                    return Ok(Outcome::StartTls(self.io.into_inner()));
                }
                Action::Idle { tag } => self.idle(&tag).await?,
                Action::Logout(resp) => {
                    let mut out = Vec::new();
                    encode_response(&resp, &mut out);
                    write_all_flush(&mut self.io, &out).await?;
                    return Ok(Outcome::Closed);
                }
            }
        }
    }

    /// Assemble one command: the tagged line plus any literal
    /// continuations, spliced into a single buffer for the grammar.
    async fn read_command(&mut self) -> Result<Option<Vec<u8>>> {
        'command: loop {
            let mut buffer =
                match read_line_timeout(&mut self.io, MAX_LINE, COMMAND_DEADLINE).await? {
                    None => return Ok(None),
                    Some(line) => line,
                };

            while let Some((n, nonsync)) = trailing_literal(&buffer) {
                if n as u64 > self.instance.ctx.max_size {
                    let tag = peek_tag(&buffer).unwrap_or_else(|| "*".to_string());
                    if nonsync {
                        // LITERAL+ data is already on the wire; drain it.
                        read_exact(&mut self.io, n as usize).await?;
                        read_line_timeout(&mut self.io, MAX_LINE, COMMAND_DEADLINE).await?;
                    }
                    let mut out = Vec::new();
                    encode_status(
                        &Status::no(
                            Some(tag),
                            Some(Code::TooBig),
                            "Literal exceeds the size limit",
                        ),
                        &mut out,
                    );
                    write_all_flush(&mut self.io, &out).await?;
                    continue 'command;
                }
                if !nonsync {
                    write_all_flush(&mut self.io, b"+ Ready for literal data\r\n").await?;
                }
                let bytes = read_exact(&mut self.io, n as usize).await?;
                buffer.extend_from_slice(&bytes);
                match read_line_timeout(&mut self.io, MAX_LINE, COMMAND_DEADLINE).await? {
                    None => return Ok(None),
                    Some(line) => buffer.extend_from_slice(&line),
                }
            }
            return Ok(Some(buffer));
        }
    }

    async fn idle(&mut self, tag: &str) -> Result<()> {
        let (user, folder) = match self.instance.selected_mailbox() {
            Some(pair) => pair,
            None => {
                let mut out = Vec::new();
                encode_status(
                    &Status::no(Some(tag.to_string()), None, "Nothing selected"),
                    &mut out,
                );
                return write_all_flush(&mut self.io, &out).await;
            }
        };
        let mut updates_rx = self.storage.watcher.subscribe(&user, &folder);
        write_all_flush(&mut self.io, b"+ idling\r\n").await?;
        debug!(user = %user, folder = %folder, "idle started");

        loop {
            tokio::select! {
                line = read_line(&mut self.io, MAX_LINE) => {
                    match line? {
                        None => anyhow::bail!("connection closed while idling"),
                        Some(line) => {
                            if trim_crlf(&line).eq_ignore_ascii_case(b"DONE") {
                                let mut out = Vec::new();
                                encode_status(
                                    &Status::ok(Some(tag.to_string()), None, "IDLE terminated"),
                                    &mut out,
                                );
                                return write_all_flush(&mut self.io, &out).await;
                            }
                            // Anything but DONE is a protocol error.
                            anyhow::bail!("unexpected data during IDLE");
                        }
                    }
                }
                recv = updates_rx.recv() => {
                    // A lagged receiver still wants a poll.
                    let _ = recv;
                    let updates = self.instance.poll_idle().await?;
                    if !updates.is_empty() {
                        let mut out = Vec::new();
                        for body in &updates {
                            encode_body(body, &mut out);
                        }
                        write_all_flush(&mut self.io, &out).await?;
                    }
                }
                _ = tokio::time::sleep(IDLE_KEEPALIVE) => {
                    write_all_flush(&mut self.io, b"* OK Still here\r\n").await?;
                }
            }
        }
    }
}
