use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncWrite, BufStream};
use tracing::{debug, info, warn};

use crate::auth::{AuthError, Authenticator, Principal};
use crate::netio::{read_line_timeout, trim_crlf, write_all_flush};
use crate::smtp::command::{address_domain, parse, Command, ParseError};
use crate::smtp::delivery;
use crate::storage::Storage;

const MAX_LINE: usize = 8192;
/// DATA lines are far laxer than command lines; some senders emit
/// unwrapped HTML bodies.
const MAX_DATA_LINE: usize = 1024 * 1024;
const MAX_RECIPIENTS: usize = 100;
const COMMAND_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// What the connection handler should do once `run` returns.
pub enum SessionOutcome<S> {
    Closed,
    /// Client asked for STARTTLS; the caller upgrades the stream and
    /// starts a fresh session on it.
    StartTls(S),
}

pub struct Session<S> {
    io: BufStream<S>,
    storage: Arc<Storage>,
    auth: Authenticator,
    hostname: String,
    max_size: u64,
    tls_configured: bool,
    secure: bool,
    principal: Option<Principal>,
    from: Option<String>,
    rcpt: Vec<String>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    pub fn new(
        stream: S,
        storage: Arc<Storage>,
        auth: Authenticator,
        hostname: String,
        max_size: u64,
        tls_configured: bool,
        secure: bool,
    ) -> Self {
        Session {
            io: BufStream::new(stream),
            storage,
            auth,
            hostname,
            max_size,
            tls_configured,
            secure,
            principal: None,
            from: None,
            rcpt: Vec::new(),
        }
    }

    /// Whether AUTH may proceed on this stream. Plaintext credentials
    /// are refused as soon as a TLS upgrade is available.
    fn auth_allowed(&self) -> bool {
        self.secure || !self.tls_configured
    }

    fn starttls_available(&self) -> bool {
        self.tls_configured && !self.secure
    }

    async fn reply(&mut self, line: &str) -> Result<()> {
        write_all_flush(&mut self.io, format!("{}\r\n", line).as_bytes()).await
    }

    async fn read_command(&mut self) -> Result<Option<String>> {
        match read_line_timeout(&mut self.io, MAX_LINE, COMMAND_DEADLINE).await? {
            None => Ok(None),
            Some(line) => Ok(Some(
                String::from_utf8_lossy(trim_crlf(&line)).into_owned(),
            )),
        }
    }

    pub async fn run(mut self) -> Result<SessionOutcome<S>> {
        self.reply(&format!("220 {} ESMTP malleposte", self.hostname))
            .await?;

        loop {
            let line = match self.read_command().await? {
                None => return Ok(SessionOutcome::Closed),
                Some(l) => l,
            };
            // AUTH lines carry credentials, so only the verb is logged.
            debug!(command = %line.split_whitespace().next().unwrap_or(""), "smtp command");

            let cmd = match parse(&line) {
                Ok(cmd) => cmd,
                Err(ParseError::BadAddress) => {
                    self.reply("501 5.1.3 Bad address syntax").await?;
                    continue;
                }
                Err(ParseError::Unknown) => {
                    self.reply("500 5.5.2 Command unrecognized").await?;
                    continue;
                }
            };

            match cmd {
                Command::Helo(domain) => {
                    debug!(client = %domain, "helo");
                    self.reply(&format!("250 {}", self.hostname)).await?;
                }
                Command::Ehlo(domain) => {
                    debug!(client = %domain, "ehlo");
                    self.ehlo().await?;
                }
                Command::StartTls => {
                    if !self.starttls_available() {
                        self.reply("454 4.7.0 TLS not available").await?;
                        continue;
                    }
                    self.reply("220 2.0.0 Ready to start TLS").await?;
                    return Ok(SessionOutcome::StartTls(self.io.into_inner()));
                }
                Command::AuthPlain(initial) => self.auth_plain(initial).await?,
                Command::AuthLogin(initial) => self.auth_login(initial).await?,
                Command::MailFrom { path, params } => self.mail_from(path, params).await?,
                Command::RcptTo { path } => self.rcpt_to(path).await?,
                Command::Data => self.data().await?,
                Command::Rset => {
                    self.reset();
                    self.reply("250 2.0.0 Ok").await?;
                }
                Command::Noop => self.reply("250 2.0.0 Ok").await?,
                Command::Vrfy(_) => {
                    self.reply("252 2.1.5 Cannot VRFY user, try RCPT").await?
                }
                Command::Help => self.reply("214 2.0.0 See RFC 5321").await?,
                Command::Quit => {
                    self.reply(&format!("221 2.0.0 {} closing connection", self.hostname))
                        .await?;
                    return Ok(SessionOutcome::Closed);
                }
            }
        }
    }

    fn reset(&mut self) {
        self.from = None;
        self.rcpt.clear();
    }

    async fn ehlo(&mut self) -> Result<()> {
        let mut lines = vec![
            self.hostname.clone(),
            "PIPELINING".to_string(),
            format!("SIZE {}", self.max_size),
            "8BITMIME".to_string(),
        ];
        if self.starttls_available() {
            lines.push("STARTTLS".to_string());
        }
        if self.auth_allowed() {
            lines.push("AUTH PLAIN LOGIN".to_string());
        }
        let last = lines.len() - 1;
        for (i, line) in lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            write_all_flush(&mut self.io, format!("250{}{}\r\n", sep, line).as_bytes()).await?;
        }
        Ok(())
    }

    // ---- AUTH ----

    async fn auth_challenge(&mut self, prompt: &str) -> Result<Option<String>> {
        self.reply(&format!("334 {}", prompt)).await?;
        match self.read_command().await? {
            None => Ok(None),
            // "*" cancels the exchange.
            Some(l) if l.trim() == "*" => Ok(None),
            Some(l) => Ok(Some(l.trim().to_string())),
        }
    }

    async fn auth_plain(&mut self, initial: Option<String>) -> Result<()> {
        if !self.auth_allowed() {
            return self.reply("530 5.7.0 Must issue a STARTTLS command first").await;
        }
        let payload = match initial {
            Some(p) => p,
            None => match self.auth_challenge("").await? {
                Some(p) => p,
                None => return self.reply("501 5.7.0 Authentication cancelled").await,
            },
        };
        let decoded = match base64::engine::general_purpose::STANDARD.decode(payload.as_bytes()) {
            Ok(d) => d,
            Err(_) => return self.reply("501 5.5.2 Invalid base64").await,
        };
        // authzid NUL authcid NUL password
        let mut parts = decoded.splitn(3, |&b| b == 0);
        let (_authz, user, pass) = match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(u), Some(p)) => (a, u, p),
            _ => return self.reply("501 5.5.2 Malformed AUTH PLAIN payload").await,
        };
        let user = String::from_utf8_lossy(user).into_owned();
        let pass = String::from_utf8_lossy(pass).into_owned();
        self.finish_auth(&user, &pass).await
    }

    async fn auth_login(&mut self, initial: Option<String>) -> Result<()> {
        if !self.auth_allowed() {
            return self.reply("530 5.7.0 Must issue a STARTTLS command first").await;
        }
        let b64 = base64::engine::general_purpose::STANDARD;
        let user = match initial {
            Some(u) => u,
            None => match self.auth_challenge("VXNlcm5hbWU6").await? {
                Some(u) => u,
                None => return self.reply("501 5.7.0 Authentication cancelled").await,
            },
        };
        let pass = match self.auth_challenge("UGFzc3dvcmQ6").await? {
            Some(p) => p,
            None => return self.reply("501 5.7.0 Authentication cancelled").await,
        };
        let (user, pass) = match (b64.decode(user.as_bytes()), b64.decode(pass.as_bytes())) {
            (Ok(u), Ok(p)) => (
                String::from_utf8_lossy(&u).into_owned(),
                String::from_utf8_lossy(&p).into_owned(),
            ),
            _ => return self.reply("501 5.5.2 Invalid base64").await,
        };
        self.finish_auth(&user, &pass).await
    }

    async fn finish_auth(&mut self, user: &str, secret: &str) -> Result<()> {
        match self.auth.authenticate(user, secret) {
            Ok(principal) => {
                info!(user = %principal.email, "smtp authenticated");
                self.principal = Some(principal);
                self.reply("235 2.7.0 Authentication successful").await
            }
            Err(AuthError::TotpRequired) => {
                self.reply("535 5.7.8 TOTP code required").await
            }
            Err(AuthError::Transient) => self.reply("451 4.3.0 Temporary failure").await,
            Err(_) => {
                self.reply("535 5.7.8 Authentication credentials invalid")
                    .await
            }
        }
    }

    // ---- envelope ----

    async fn mail_from(
        &mut self,
        path: String,
        params: Vec<(String, Option<String>)>,
    ) -> Result<()> {
        if self.from.is_some() {
            return self.reply("503 5.5.1 Nested MAIL command").await;
        }
        for (key, value) in &params {
            if key == "SIZE" {
                if let Some(size) = value.as_deref().and_then(|v| v.parse::<u64>().ok()) {
                    if size > self.max_size {
                        return self
                            .reply("552 Message size exceeds fixed maximum message size")
                            .await;
                    }
                }
            }
        }
        if !path.is_empty() && address_domain(&path).is_none() {
            return self.reply("501 5.1.7 Bad sender address syntax").await;
        }
        self.from = Some(path);
        self.reply("250 2.1.0 Ok").await
    }

    async fn rcpt_to(&mut self, path: String) -> Result<()> {
        if self.from.is_none() {
            return self.reply("503 5.5.1 Need MAIL command first").await;
        }
        if self.rcpt.len() >= MAX_RECIPIENTS {
            return self.reply("452 4.5.3 Too many recipients").await;
        }
        let domain = match address_domain(&path) {
            Some(d) => d,
            None => return self.reply("501 5.1.3 Bad recipient address syntax").await,
        };

        // Relay admission: the domain must be local and active, and
        // the full address must resolve to a user or an alias.
        let admitted = match self.storage.index.get_domain(&domain) {
            Ok(d) if d.active => delivery::resolve_local(&self.storage.index, &path).is_some(),
            Ok(_) => false,
            Err(crate::storage::StorageError::NotFound) => false,
            Err(e) => {
                warn!(error = %e, "relay admission lookup failed");
                return self.reply("451 4.3.0 Temporary failure").await;
            }
        };
        if !admitted {
            debug!(rcpt = %path, "relay denied");
            return self.reply("550 5.7.1 Relay denied").await;
        }
        self.rcpt.push(path);
        self.reply("250 2.1.5 Ok").await
    }

    async fn data(&mut self) -> Result<()> {
        if self.from.is_none() {
            return self.reply("503 5.5.1 Need MAIL command first").await;
        }
        if self.rcpt.is_empty() {
            return self.reply("554 5.5.1 No valid recipients").await;
        }
        self.reply("354 End data with <CR><LF>.<CR><LF>").await?;

        // One byte past the cap is enough to know we are over it.
        let cap = self.max_size as usize;
        let mut data: Vec<u8> = Vec::new();
        let mut overflow = false;
        loop {
            let line =
                match read_line_timeout(&mut self.io, MAX_DATA_LINE, COMMAND_DEADLINE).await? {
                    None => anyhow::bail!("connection closed during DATA"),
                    Some(l) => l,
                };
            if trim_crlf(&line) == b"." {
                break;
            }
            // Dot-stuffing: a leading dot doubled by the client.
            let payload: &[u8] = if line.starts_with(b".") { &line[1..] } else { &line };
            if !overflow {
                if data.len() + payload.len() > cap {
                    overflow = true;
                    data.clear();
                } else {
                    data.extend_from_slice(payload);
                }
            }
        }

        if overflow {
            self.reset();
            return self
                .reply("552 Message size exceeds fixed maximum message size")
                .await;
        }

        let from = self.from.clone().unwrap_or_default();
        let rcpt = std::mem::take(&mut self.rcpt);
        self.from = None;

        match delivery::deliver(&self.storage, &self.hostname, &from, &rcpt, &data).await {
            Ok(report) => {
                info!(
                    from = %from,
                    authenticated = self.principal.as_ref().map(|p| p.email.as_str()).unwrap_or("-"),
                    delivered = report.delivered,
                    skipped = report.skipped,
                    bytes = data.len(),
                    "message accepted"
                );
                self.reply("250 2.0.0 Ok: queued").await
            }
            Err(e) => {
                warn!(error = %e, "delivery failed");
                self.reply("451 4.3.0 Temporary failure, try again later").await
            }
        }
    }
}
