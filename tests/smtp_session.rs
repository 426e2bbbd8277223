//! SMTP session driven over an in-process pipe, covering the envelope
//! state machine, relay admission, the size cap and AUTH.

use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

use malleposte::auth::{hash_password, Authenticator};
use malleposte::config::StorageConfig;
use malleposte::smtp::session::Session;
use malleposte::storage::{Alias, Domain, Storage, User, INBOX};

struct Client {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl Client {
    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        line
    }

    /// Read one reply, following multi-line `250-` continuations.
    async fn reply(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.recv().await;
            let done = line.len() < 4 || line.as_bytes()[3] != b'-';
            lines.push(line);
            if done {
                return lines;
            }
        }
    }

    async fn expect(&mut self, code: &str) -> String {
        let lines = self.reply().await;
        let last = lines.last().cloned().unwrap_or_default();
        assert!(
            last.starts_with(code),
            "expected {} got {:?}",
            code,
            lines
        );
        last
    }
}

async fn fixture(max_size: u64) -> (tempfile::TempDir, Arc<Storage>, Client) {
    let tmp = tempfile::tempdir().unwrap();
    let storage = Storage::open(
        &StorageConfig {
            db_path: tmp.path().join("index.db"),
            maildir_root: tmp.path().join("maildir"),
        },
        "mx.example.com",
    )
    .unwrap();
    storage
        .index
        .create_domain(&Domain {
            name: "example.com".into(),
            active: true,
        })
        .unwrap();
    storage
        .index
        .create_user(&User {
            id: 0,
            email: "alice@example.com".into(),
            password_hash: hash_password("hunter2").unwrap(),
            totp_secret: None,
            quota_bytes: 0,
            active: true,
            admin: false,
            created_at: Utc::now(),
        })
        .unwrap();

    let (client_end, server_end) = tokio::io::duplex(256 * 1024);
    let session = Session::new(
        server_end,
        storage.clone(),
        Authenticator::new(storage.index.clone()),
        "mx.example.com".to_string(),
        max_size,
        false,
        false,
    );
    tokio::spawn(session.run());

    let (read_half, write_half) = tokio::io::split(client_end);
    let mut client = Client {
        reader: BufReader::new(read_half),
        writer: write_half,
    };
    client.expect("220").await;
    (tmp, storage, client)
}

#[tokio::test]
async fn delivery_round_trip() {
    let (_tmp, storage, mut client) = fixture(50 * 1024 * 1024).await;

    client.send("EHLO client.example.org").await;
    let ehlo = client.reply().await.join("");
    assert!(ehlo.contains("PIPELINING"));
    assert!(ehlo.contains("SIZE 52428800"));
    assert!(ehlo.contains("AUTH PLAIN LOGIN"));
    assert!(!ehlo.contains("STARTTLS"), "no TLS configured");

    client.send("MAIL FROM:<bob@other.tld>").await;
    client.expect("250").await;
    client.send("RCPT TO:<alice@example.com>").await;
    client.expect("250").await;
    client.send("DATA").await;
    client.expect("354").await;
    client
        .send("From: bob@other.tld\r\nTo: alice@example.com\r\nSubject: Hi\r\n\r\nbody\r\n.")
        .await;
    client.expect("250").await;
    client.send("QUIT").await;
    client.expect("221").await;

    let rows = storage
        .index
        .list_mails("alice@example.com", INBOX, 10, 0)
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].subject, "Hi");
    let raw = storage
        .maildir
        .read("alice@example.com", INBOX, &rows[0].id)
        .await
        .unwrap();
    assert_eq!(
        raw,
        b"From: bob@other.tld\r\nTo: alice@example.com\r\nSubject: Hi\r\n\r\nbody\r\n"
    );
}

#[tokio::test]
async fn relay_denied_for_unknown_domain_and_user() {
    let (_tmp, storage, mut client) = fixture(1024 * 1024).await;

    client.send("MAIL FROM:<bob@other.tld>").await;
    client.expect("250").await;
    client.send("RCPT TO:<carol@nope.tld>").await;
    let line = client.expect("550").await;
    assert!(line.contains("Relay denied"));
    client.send("RCPT TO:<ghost@example.com>").await;
    client.expect("550").await;

    // No recipients accepted: DATA refused, nothing stored.
    client.send("DATA").await;
    client.expect("554").await;
    assert!(storage
        .index
        .list_mails("alice@example.com", INBOX, 10, 0)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn oversized_data_is_rejected() {
    let (_tmp, storage, mut client) = fixture(1024).await;

    client.send("MAIL FROM:<bob@other.tld>").await;
    client.expect("250").await;
    client.send("RCPT TO:<alice@example.com>").await;
    client.expect("250").await;
    client.send("DATA").await;
    client.expect("354").await;

    let chunk = "x".repeat(64);
    for _ in 0..32 {
        client.send(&chunk).await;
    }
    client.send(".").await;
    client.expect("552").await;

    assert!(storage
        .index
        .list_mails("alice@example.com", INBOX, 10, 0)
        .unwrap()
        .is_empty());
    assert!(storage
        .maildir
        .list("alice@example.com", INBOX)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn null_return_path_and_rset() {
    let (_tmp, _storage, mut client) = fixture(1024).await;

    client.send("MAIL FROM:<>").await;
    client.expect("250").await;
    client.send("MAIL FROM:<again@other.tld>").await;
    client.expect("503").await;
    client.send("RSET").await;
    client.expect("250").await;
    client.send("MAIL FROM:<again@other.tld>").await;
    client.expect("250").await;
}

#[tokio::test]
async fn alias_recipient_is_admitted() {
    let (_tmp, storage, mut client) = fixture(1024 * 1024).await;
    storage
        .index
        .create_alias(&Alias {
            source: "team@example.com".into(),
            target: "alice@example.com".into(),
            domain: "example.com".into(),
        })
        .unwrap();

    client.send("MAIL FROM:<bob@other.tld>").await;
    client.expect("250").await;
    client.send("RCPT TO:<team@example.com>").await;
    client.expect("250").await;
    client.send("DATA").await;
    client.expect("354").await;
    client.send("Subject: via alias\r\n\r\nhello\r\n.").await;
    client.expect("250").await;

    let rows = storage
        .index
        .list_mails("alice@example.com", INBOX, 10, 0)
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].subject, "via alias");
}

#[tokio::test]
async fn auth_plain_accepts_and_rejects() {
    let (_tmp, _storage, mut client) = fixture(1024).await;

    // \0alice@example.com\0hunter2
    client
        .send("AUTH PLAIN AGFsaWNlQGV4YW1wbGUuY29tAGh1bnRlcjI=")
        .await;
    client.expect("235").await;

    // \0alice@example.com\0wrong
    client
        .send("AUTH PLAIN AGFsaWNlQGV4YW1wbGUuY29tAHdyb25n")
        .await;
    client.expect("535").await;
}

#[tokio::test]
async fn unknown_command_is_500() {
    let (_tmp, _storage, mut client) = fixture(1024).await;
    client.send("BOGUS").await;
    client.expect("500").await;
    client.send("NOOP").await;
    client.expect("250").await;
}
