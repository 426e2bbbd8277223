//! Typed IMAP responses and their wire encoding. Everything the server
//! sends goes through `encode_data` / `encode_status` so quoting and
//! literal rules live in one place.

use chrono::{DateTime, Utc};

use crate::imap::grammar::StatusItem;
use crate::storage::{Flag, FlagSet};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StatusKind {
    Ok,
    No,
    Bad,
    Bye,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Code {
    Capability(Vec<String>),
    UidValidity(u32),
    UidNext(u32),
    Unseen(u32),
    PermanentFlags(Vec<String>),
    ReadOnly,
    ReadWrite,
    TryCreate,
    TooBig,
    AuthenticationFailed,
}

/// A tagged completion or an untagged `*` status line.
#[derive(Clone, Debug, PartialEq)]
pub struct Status {
    pub tag: Option<String>,
    pub kind: StatusKind,
    pub code: Option<Code>,
    pub text: String,
}

impl Status {
    pub fn ok(tag: Option<String>, code: Option<Code>, text: &str) -> Self {
        Status {
            tag,
            kind: StatusKind::Ok,
            code,
            text: text.to_string(),
        }
    }

    pub fn no(tag: Option<String>, code: Option<Code>, text: &str) -> Self {
        Status {
            tag,
            kind: StatusKind::No,
            code,
            text: text.to_string(),
        }
    }

    pub fn bad(tag: Option<String>, code: Option<Code>, text: &str) -> Self {
        Status {
            tag,
            kind: StatusKind::Bad,
            code,
            text: text.to_string(),
        }
    }

    pub fn bye(text: &str) -> Self {
        Status {
            tag: None,
            kind: StatusKind::Bye,
            code: None,
            text: text.to_string(),
        }
    }
}

// ---- envelope & body structure ----

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Address {
    pub name: Option<String>,
    pub mailbox: Option<String>,
    pub host: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Envelope {
    pub date: Option<String>,
    pub subject: Option<String>,
    pub from: Vec<Address>,
    pub sender: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub in_reply_to: Option<String>,
    pub message_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum BodyStructure {
    Single {
        media_type: String,
        media_subtype: String,
        params: Vec<(String, String)>,
        id: Option<String>,
        description: Option<String>,
        encoding: String,
        size: u32,
        /// Line count, only for text parts.
        lines: Option<u32>,
    },
    Multi {
        parts: Vec<BodyStructure>,
        media_subtype: String,
        params: Vec<(String, String)>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum FetchAttr {
    Uid(u32),
    Flags(FlagSet),
    InternalDate(DateTime<Utc>),
    Rfc822Size(u64),
    Envelope(Envelope),
    /// `BODY` (the non-extensible structure).
    Body(BodyStructure),
    BodyStructure(BodyStructure),
    Rfc822(Vec<u8>),
    Rfc822Header(Vec<u8>),
    Rfc822Text(Vec<u8>),
    BodySection {
        /// The rendered section specifier, e.g. `""`, `"HEADER"`,
        /// `"1.2.TEXT"`.
        spec: String,
        origin: Option<u32>,
        data: Option<Vec<u8>>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Data {
    Capability(Vec<String>),
    Exists(u32),
    Recent(u32),
    Expunge(u32),
    Flags(Vec<Flag>),
    List {
        lsub: bool,
        attrs: Vec<String>,
        delimiter: char,
        name: String,
    },
    Status {
        mailbox: String,
        items: Vec<(StatusItem, u32)>,
    },
    Search(Vec<u32>),
    Fetch {
        seq: u32,
        attrs: Vec<FetchAttr>,
    },
}

/// One untagged response line.
#[derive(Clone, Debug)]
pub enum Body {
    Data(Data),
    Status(Status),
}

impl From<Data> for Body {
    fn from(data: Data) -> Body {
        Body::Data(data)
    }
}

impl From<Status> for Body {
    fn from(status: Status) -> Body {
        Body::Status(status)
    }
}

/// Untagged lines followed by the tagged completion, the unit a
/// command handler returns.
#[derive(Clone, Debug)]
pub struct Response {
    pub body: Vec<Body>,
    pub completion: Status,
}

impl Response {
    pub fn new(body: Vec<Body>, completion: Status) -> Self {
        Response { body, completion }
    }

    pub fn status(completion: Status) -> Self {
        Response {
            body: Vec::new(),
            completion,
        }
    }
}

// ---- encoding ----

pub fn encode_body(body: &Body, out: &mut Vec<u8>) {
    match body {
        Body::Data(data) => encode_data(data, out),
        Body::Status(status) => encode_status(status, out),
    }
}

pub fn encode_response(resp: &Response, out: &mut Vec<u8>) {
    for body in &resp.body {
        encode_body(body, out);
    }
    encode_status(&resp.completion, out);
}

pub fn encode_status(status: &Status, out: &mut Vec<u8>) {
    match &status.tag {
        Some(tag) => out.extend_from_slice(tag.as_bytes()),
        None => out.push(b'*'),
    }
    let kind = match status.kind {
        StatusKind::Ok => " OK",
        StatusKind::No => " NO",
        StatusKind::Bad => " BAD",
        StatusKind::Bye => " BYE",
    };
    out.extend_from_slice(kind.as_bytes());
    if let Some(code) = &status.code {
        out.push(b' ');
        encode_code(code, out);
    }
    out.push(b' ');
    out.extend_from_slice(status.text.as_bytes());
    out.extend_from_slice(b"\r\n");
}

fn encode_code(code: &Code, out: &mut Vec<u8>) {
    match code {
        Code::Capability(caps) => {
            out.extend_from_slice(b"[CAPABILITY ");
            out.extend_from_slice(caps.join(" ").as_bytes());
            out.push(b']');
        }
        Code::UidValidity(v) => out.extend_from_slice(format!("[UIDVALIDITY {}]", v).as_bytes()),
        Code::UidNext(v) => out.extend_from_slice(format!("[UIDNEXT {}]", v).as_bytes()),
        Code::Unseen(v) => out.extend_from_slice(format!("[UNSEEN {}]", v).as_bytes()),
        Code::PermanentFlags(flags) => {
            out.extend_from_slice(format!("[PERMANENTFLAGS ({})]", flags.join(" ")).as_bytes())
        }
        Code::ReadOnly => out.extend_from_slice(b"[READ-ONLY]"),
        Code::ReadWrite => out.extend_from_slice(b"[READ-WRITE]"),
        Code::TryCreate => out.extend_from_slice(b"[TRYCREATE]"),
        Code::TooBig => out.extend_from_slice(b"[TOOBIG]"),
        Code::AuthenticationFailed => out.extend_from_slice(b"[AUTHENTICATIONFAILED]"),
    }
}

pub fn encode_data(data: &Data, out: &mut Vec<u8>) {
    match data {
        Data::Capability(caps) => {
            out.extend_from_slice(b"* CAPABILITY ");
            out.extend_from_slice(caps.join(" ").as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Data::Exists(n) => out.extend_from_slice(format!("* {} EXISTS\r\n", n).as_bytes()),
        Data::Recent(n) => out.extend_from_slice(format!("* {} RECENT\r\n", n).as_bytes()),
        Data::Expunge(n) => out.extend_from_slice(format!("* {} EXPUNGE\r\n", n).as_bytes()),
        Data::Flags(flags) => {
            let rendered: Vec<String> = flags.iter().map(|f| f.to_string()).collect();
            out.extend_from_slice(format!("* FLAGS ({})\r\n", rendered.join(" ")).as_bytes());
        }
        Data::List {
            lsub,
            attrs,
            delimiter,
            name,
        } => {
            let verb = if *lsub { "LSUB" } else { "LIST" };
            out.extend_from_slice(format!("* {} ({}) \"{}\" ", verb, attrs.join(" "), delimiter).as_bytes());
            encode_string(name.as_bytes(), out);
            out.extend_from_slice(b"\r\n");
        }
        Data::Status { mailbox, items } => {
            out.extend_from_slice(b"* STATUS ");
            encode_string(mailbox.as_bytes(), out);
            let rendered: Vec<String> = items
                .iter()
                .map(|(item, value)| format!("{} {}", status_item_name(*item), value))
                .collect();
            out.extend_from_slice(format!(" ({})\r\n", rendered.join(" ")).as_bytes());
        }
        Data::Search(hits) => {
            out.extend_from_slice(b"* SEARCH");
            for hit in hits {
                out.extend_from_slice(format!(" {}", hit).as_bytes());
            }
            out.extend_from_slice(b"\r\n");
        }
        Data::Fetch { seq, attrs } => {
            out.extend_from_slice(format!("* {} FETCH (", seq).as_bytes());
            for (i, attr) in attrs.iter().enumerate() {
                if i > 0 {
                    out.push(b' ');
                }
                encode_fetch_attr(attr, out);
            }
            out.extend_from_slice(b")\r\n");
        }
    }
}

fn status_item_name(item: StatusItem) -> &'static str {
    match item {
        StatusItem::Messages => "MESSAGES",
        StatusItem::Recent => "RECENT",
        StatusItem::Unseen => "UNSEEN",
        StatusItem::UidNext => "UIDNEXT",
        StatusItem::UidValidity => "UIDVALIDITY",
    }
}

fn encode_fetch_attr(attr: &FetchAttr, out: &mut Vec<u8>) {
    match attr {
        FetchAttr::Uid(uid) => out.extend_from_slice(format!("UID {}", uid).as_bytes()),
        FetchAttr::Flags(flags) => {
            let rendered: Vec<String> = flags.iter().map(|f| f.to_string()).collect();
            out.extend_from_slice(format!("FLAGS ({})", rendered.join(" ")).as_bytes());
        }
        FetchAttr::InternalDate(at) => out.extend_from_slice(
            format!("INTERNALDATE \"{}\"", at.format("%d-%b-%Y %H:%M:%S +0000")).as_bytes(),
        ),
        FetchAttr::Rfc822Size(size) => {
            out.extend_from_slice(format!("RFC822.SIZE {}", size).as_bytes())
        }
        FetchAttr::Envelope(env) => {
            out.extend_from_slice(b"ENVELOPE ");
            encode_envelope(env, out);
        }
        FetchAttr::Body(bs) => {
            out.extend_from_slice(b"BODY ");
            encode_body_structure(bs, false, out);
        }
        FetchAttr::BodyStructure(bs) => {
            out.extend_from_slice(b"BODYSTRUCTURE ");
            encode_body_structure(bs, true, out);
        }
        FetchAttr::Rfc822(bytes) => {
            out.extend_from_slice(b"RFC822 ");
            encode_literal(bytes, out);
        }
        FetchAttr::Rfc822Header(bytes) => {
            out.extend_from_slice(b"RFC822.HEADER ");
            encode_literal(bytes, out);
        }
        FetchAttr::Rfc822Text(bytes) => {
            out.extend_from_slice(b"RFC822.TEXT ");
            encode_literal(bytes, out);
        }
        FetchAttr::BodySection { spec, origin, data } => {
            out.extend_from_slice(format!("BODY[{}]", spec).as_bytes());
            if let Some(origin) = origin {
                out.extend_from_slice(format!("<{}>", origin).as_bytes());
            }
            out.push(b' ');
            match data {
                Some(bytes) => encode_literal(bytes, out),
                None => out.extend_from_slice(b"NIL"),
            }
        }
    }
}

fn encode_envelope(env: &Envelope, out: &mut Vec<u8>) {
    out.push(b'(');
    encode_nstring(env.date.as_deref(), out);
    out.push(b' ');
    encode_nstring(env.subject.as_deref(), out);
    for list in [
        &env.from,
        &env.sender,
        &env.reply_to,
        &env.to,
        &env.cc,
        &env.bcc,
    ] {
        out.push(b' ');
        encode_address_list(list, out);
    }
    out.push(b' ');
    encode_nstring(env.in_reply_to.as_deref(), out);
    out.push(b' ');
    encode_nstring(env.message_id.as_deref(), out);
    out.push(b')');
}

fn encode_address_list(addrs: &[Address], out: &mut Vec<u8>) {
    if addrs.is_empty() {
        out.extend_from_slice(b"NIL");
        return;
    }
    out.push(b'(');
    for addr in addrs {
        out.push(b'(');
        encode_nstring(addr.name.as_deref(), out);
        out.extend_from_slice(b" NIL ");
        encode_nstring(addr.mailbox.as_deref(), out);
        out.push(b' ');
        encode_nstring(addr.host.as_deref(), out);
        out.push(b')');
    }
    out.push(b')');
}

fn encode_body_structure(bs: &BodyStructure, extended: bool, out: &mut Vec<u8>) {
    match bs {
        BodyStructure::Single {
            media_type,
            media_subtype,
            params,
            id,
            description,
            encoding,
            size,
            lines,
        } => {
            out.push(b'(');
            encode_string(media_type.to_ascii_uppercase().as_bytes(), out);
            out.push(b' ');
            encode_string(media_subtype.to_ascii_uppercase().as_bytes(), out);
            out.push(b' ');
            encode_params(params, out);
            out.push(b' ');
            encode_nstring(id.as_deref(), out);
            out.push(b' ');
            encode_nstring(description.as_deref(), out);
            out.push(b' ');
            encode_string(encoding.to_ascii_uppercase().as_bytes(), out);
            out.extend_from_slice(format!(" {}", size).as_bytes());
            if let Some(lines) = lines {
                out.extend_from_slice(format!(" {}", lines).as_bytes());
            }
            out.push(b')');
        }
        BodyStructure::Multi {
            parts,
            media_subtype,
            params,
        } => {
            out.push(b'(');
            for part in parts {
                encode_body_structure(part, extended, out);
            }
            out.push(b' ');
            encode_string(media_subtype.to_ascii_uppercase().as_bytes(), out);
            if extended {
                out.push(b' ');
                encode_params(params, out);
            }
            out.push(b')');
        }
    }
}

fn encode_params(params: &[(String, String)], out: &mut Vec<u8>) {
    if params.is_empty() {
        out.extend_from_slice(b"NIL");
        return;
    }
    out.push(b'(');
    for (i, (key, value)) in params.iter().enumerate() {
        if i > 0 {
            out.push(b' ');
        }
        encode_string(key.to_ascii_uppercase().as_bytes(), out);
        out.push(b' ');
        encode_string(value.as_bytes(), out);
    }
    out.push(b')');
}

fn encode_nstring(s: Option<&str>, out: &mut Vec<u8>) {
    match s {
        Some(s) => encode_string(s.as_bytes(), out),
        None => out.extend_from_slice(b"NIL"),
    }
}

/// Quoted when the bytes allow it, a literal otherwise.
pub fn encode_string(bytes: &[u8], out: &mut Vec<u8>) {
    let quotable = bytes.len() < 512
        && bytes
            .iter()
            .all(|&b| b.is_ascii() && b != b'\r' && b != b'\n' && b != b'"' && b != b'\\');
    if quotable {
        out.push(b'"');
        out.extend_from_slice(bytes);
        out.push(b'"');
    } else {
        encode_literal(bytes, out);
    }
}

fn encode_literal(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(format!("{{{}}}\r\n", bytes.len()).as_bytes());
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render_data(data: &Data) -> String {
        let mut out = Vec::new();
        encode_data(data, &mut out);
        String::from_utf8_lossy(&out).into_owned()
    }

    fn render_status(status: &Status) -> String {
        let mut out = Vec::new();
        encode_status(status, &mut out);
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn tagged_statuses() {
        assert_eq!(
            render_status(&Status::ok(Some("a1".into()), None, "LOGIN completed")),
            "a1 OK LOGIN completed\r\n"
        );
        assert_eq!(
            render_status(&Status::no(
                Some("a2".into()),
                Some(Code::AuthenticationFailed),
                "Authentication failed"
            )),
            "a2 NO [AUTHENTICATIONFAILED] Authentication failed\r\n"
        );
        assert_eq!(
            render_status(&Status::ok(None, Some(Code::UidNext(4)), "Predicted next UID")),
            "* OK [UIDNEXT 4] Predicted next UID\r\n"
        );
    }

    #[test]
    fn untagged_counts() {
        assert_eq!(render_data(&Data::Exists(3)), "* 3 EXISTS\r\n");
        assert_eq!(render_data(&Data::Recent(1)), "* 1 RECENT\r\n");
        assert_eq!(render_data(&Data::Expunge(2)), "* 2 EXPUNGE\r\n");
    }

    #[test]
    fn list_line() {
        let line = render_data(&Data::List {
            lsub: false,
            attrs: vec!["\\Noinferiors".into()],
            delimiter: '/',
            name: "INBOX".into(),
        });
        assert_eq!(line, "* LIST (\\Noinferiors) \"/\" \"INBOX\"\r\n");
    }

    #[test]
    fn fetch_flags_and_literal() {
        let line = render_data(&Data::Fetch {
            seq: 1,
            attrs: vec![
                FetchAttr::Uid(7),
                FetchAttr::Rfc822(b"From: x\r\n\r\nbody".to_vec()),
            ],
        });
        assert_eq!(line, "* 1 FETCH (UID 7 RFC822 {15}\r\nFrom: x\r\n\r\nbody)\r\n");
    }

    #[test]
    fn envelope_rendering() {
        let env = Envelope {
            date: Some("Mon, 2 Jan 2006 15:04:05 -0700".into()),
            subject: Some("Hi".into()),
            from: vec![Address {
                name: Some("Bob".into()),
                mailbox: Some("bob".into()),
                host: Some("other.tld".into()),
            }],
            ..Default::default()
        };
        let mut out = Vec::new();
        encode_envelope(&env, &mut out);
        assert_eq!(
            String::from_utf8_lossy(&out),
            "(\"Mon, 2 Jan 2006 15:04:05 -0700\" \"Hi\" ((\"Bob\" NIL \"bob\" \"other.tld\")) NIL NIL NIL NIL NIL NIL NIL)"
        );
    }

    #[test]
    fn body_structure_rendering() {
        let bs = BodyStructure::Multi {
            parts: vec![
                BodyStructure::Single {
                    media_type: "text".into(),
                    media_subtype: "plain".into(),
                    params: vec![("charset".into(), "utf-8".into())],
                    id: None,
                    description: None,
                    encoding: "7bit".into(),
                    size: 5,
                    lines: Some(1),
                },
                BodyStructure::Single {
                    media_type: "application".into(),
                    media_subtype: "pdf".into(),
                    params: vec![],
                    id: None,
                    description: None,
                    encoding: "base64".into(),
                    size: 100,
                    lines: None,
                },
            ],
            media_subtype: "mixed".into(),
            params: vec![("boundary".into(), "b1".into())],
        };
        let mut out = Vec::new();
        encode_body_structure(&bs, false, &mut out);
        assert_eq!(
            String::from_utf8_lossy(&out),
            "((\"TEXT\" \"PLAIN\" (\"CHARSET\" \"utf-8\") NIL NIL \"7BIT\" 5 1)(\"APPLICATION\" \"PDF\" NIL NIL NIL \"BASE64\" 100) \"MIXED\")"
        );
    }

    #[test]
    fn non_ascii_strings_become_literals() {
        let mut out = Vec::new();
        encode_string("héllo".as_bytes(), &mut out);
        assert_eq!(out, "{6}\r\nhéllo".as_bytes());
    }
}
