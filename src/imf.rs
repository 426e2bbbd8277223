//! Minimal Internet Message Format views shared by delivery and the
//! store reconciler: header snapshots for the index, bare-address
//! extraction, and synthesis of a header block for headerless bodies.

use chrono::{DateTime, TimeZone, Utc};
use mailparse::MailHeaderMap;

/// Bodies produced by some legacy senders start with this marker and no
/// header block at all.
pub const MULTIPART_MARKER: &[u8] = b"This is a multi-part message in MIME format.";

/// Parsed header digest stored in the index next to each message.
#[derive(Clone, Debug, Default)]
pub struct HeaderSnapshot {
    pub from: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub message_id: Option<String>,
}

impl HeaderSnapshot {
    pub fn is_empty(&self) -> bool {
        self.from.is_none()
            && self.to.is_empty()
            && self.subject.is_none()
            && self.date.is_none()
            && self.message_id.is_none()
    }
}

/// Extract the header snapshot from raw bytes. Returns a default
/// (empty) snapshot when nothing parseable is found.
pub fn snapshot(raw: &[u8]) -> HeaderSnapshot {
    let parsed = match mailparse::parse_mail(raw) {
        Ok(p) => p,
        Err(_) => return HeaderSnapshot::default(),
    };
    let headers = &parsed.headers;
    HeaderSnapshot {
        from: headers
            .get_first_value("From")
            .map(|v| bare_address(&v))
            .filter(|v| !v.is_empty()),
        to: address_list(headers.get_all_values("To")),
        cc: address_list(headers.get_all_values("Cc")),
        bcc: address_list(headers.get_all_values("Bcc")),
        subject: headers.get_first_value("Subject").filter(|s| !s.is_empty()),
        date: headers
            .get_first_value("Date")
            .and_then(|d| mailparse::dateparse(&d).ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        message_id: headers.get_first_value("Message-ID"),
    }
}

fn address_list(values: Vec<String>) -> Vec<String> {
    let mut out = Vec::new();
    for value in values {
        match mailparse::addrparse(&value) {
            Ok(list) => {
                for addr in list.iter() {
                    match addr {
                        mailparse::MailAddr::Single(s) => out.push(s.addr.clone()),
                        mailparse::MailAddr::Group(g) => {
                            out.extend(g.addrs.iter().map(|s| s.addr.clone()))
                        }
                    }
                }
            }
            Err(_) => {
                let bare = bare_address(&value);
                if !bare.is_empty() {
                    out.push(bare);
                }
            }
        }
    }
    out
}

/// Reduce any `"Name" <addr@host>` form to the bare address, stripping
/// quoting and whitespace.
pub fn bare_address(s: &str) -> String {
    let s = s.trim();
    if let (Some(start), Some(end)) = (s.find('<'), s.rfind('>')) {
        if start < end {
            return s[start + 1..end].trim().to_string();
        }
    }
    s.trim_matches('"').trim().to_string()
}

/// True when the first headers-or-blank-line region carries at least
/// one of From/To/Subject/Date/Message-ID.
pub fn has_header_block(raw: &[u8]) -> bool {
    for line in raw.split(|&b| b == b'\n').take(200) {
        let line = match line.strip_suffix(b"\r") {
            Some(l) => l,
            None => line,
        };
        if line.is_empty() {
            return false;
        }
        let lower: Vec<u8> = line
            .iter()
            .take(12)
            .map(|b| b.to_ascii_lowercase())
            .collect();
        for known in [
            &b"from:"[..],
            &b"to:"[..],
            &b"subject:"[..],
            &b"date:"[..],
            &b"message-id:"[..],
        ] {
            if lower.starts_with(known) {
                return true;
            }
        }
    }
    false
}

/// Build the header block prepended to a headerless body at delivery.
/// The caller appends a CRLF separator and the original bytes.
pub fn synthesize_header_block(
    body: &[u8],
    from: &str,
    first_rcpt: &str,
    hostname: &str,
    now: DateTime<Utc>,
    nanos: u128,
) -> Vec<u8> {
    let from = if from.is_empty() {
        "unknown@unknown"
    } else {
        from
    };
    let content_type = if body.starts_with(MULTIPART_MARKER) {
        let boundary = detect_boundary(body)
            .unwrap_or_else(|| format!("----=_{:x}.{}", nanos, hostname));
        format!("multipart/alternative; boundary=\"{}\"", boundary)
    } else {
        "text/plain; charset=UTF-8".to_string()
    };
    let mut block = Vec::new();
    block.extend_from_slice(format!("Date: {}\r\n", now.to_rfc2822()).as_bytes());
    block.extend_from_slice(format!("Message-ID: <{:x}@{}>\r\n", nanos, hostname).as_bytes());
    block.extend_from_slice(format!("From: {}\r\n", from).as_bytes());
    block.extend_from_slice(format!("To: {}\r\n", first_rcpt).as_bytes());
    block.extend_from_slice(b"Subject: (no subject)\r\n");
    block.extend_from_slice(b"MIME-Version: 1.0\r\n");
    block.extend_from_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
    block
}

/// MIME separator lines in such bodies look like `------=<value>----`;
/// the boundary is the line without its two leading separator dashes.
fn detect_boundary(body: &[u8]) -> Option<String> {
    for line in body.split(|&b| b == b'\n').take(50) {
        let line = match line.strip_suffix(b"\r") {
            Some(l) => l,
            None => line,
        };
        if line.starts_with(b"------=") {
            return std::str::from_utf8(&line[2..]).ok().map(|s| s.to_string());
        }
    }
    None
}
