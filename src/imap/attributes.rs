//! FETCH attribute production: envelope digests, MIME trees and body
//! section slicing, all computed from the raw stored bytes.

use mailparse::{MailHeaderMap, ParsedMail};

use crate::imap::grammar::Section;
use crate::imap::response::{Address, BodyStructure, Envelope};

/// Offset of the first body byte; the header region includes the blank
/// separator line.
pub fn body_offset(raw: &[u8]) -> usize {
    if let Some(pos) = find(raw, b"\r\n\r\n") {
        return pos + 4;
    }
    if let Some(pos) = find(raw, b"\n\n") {
        return pos + 2;
    }
    raw.len()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

pub fn header_slice(raw: &[u8]) -> &[u8] {
    &raw[..body_offset(raw)]
}

pub fn text_slice(raw: &[u8]) -> &[u8] {
    &raw[body_offset(raw).min(raw.len())..]
}

// ---- envelope ----

pub fn envelope(parsed: &ParsedMail<'_>) -> Envelope {
    let headers = &parsed.headers;
    let from = addresses(parsed, "From");
    let sender = non_empty_or(addresses(parsed, "Sender"), &from);
    let reply_to = non_empty_or(addresses(parsed, "Reply-To"), &from);
    Envelope {
        date: headers.get_first_value("Date"),
        subject: headers.get_first_value("Subject"),
        to: addresses(parsed, "To"),
        cc: addresses(parsed, "Cc"),
        bcc: addresses(parsed, "Bcc"),
        in_reply_to: headers.get_first_value("In-Reply-To"),
        message_id: headers.get_first_value("Message-ID"),
        from,
        sender,
        reply_to,
    }
}

fn non_empty_or(list: Vec<Address>, fallback: &[Address]) -> Vec<Address> {
    if list.is_empty() {
        fallback.to_vec()
    } else {
        list
    }
}

fn addresses(parsed: &ParsedMail<'_>, header: &str) -> Vec<Address> {
    let mut out = Vec::new();
    for value in parsed.headers.get_all_values(header) {
        let list = match mailparse::addrparse(&value) {
            Ok(list) => list,
            Err(_) => continue,
        };
        for addr in list.iter() {
            match addr {
                mailparse::MailAddr::Single(single) => out.push(convert_single(single)),
                mailparse::MailAddr::Group(group) => {
                    out.extend(group.addrs.iter().map(convert_single))
                }
            }
        }
    }
    out
}

fn convert_single(single: &mailparse::SingleInfo) -> Address {
    let (mailbox, host) = match single.addr.split_once('@') {
        Some((local, domain)) => (Some(local.to_string()), Some(domain.to_string())),
        None => (Some(single.addr.clone()), None),
    };
    Address {
        name: single.display_name.clone(),
        mailbox,
        host,
    }
}

// ---- body structure ----

pub fn body_structure(part: &ParsedMail<'_>) -> BodyStructure {
    let mimetype = part.ctype.mimetype.to_ascii_lowercase();
    if mimetype.starts_with("multipart/") {
        let subtype = mimetype
            .split_once('/')
            .map(|(_, s)| s.to_string())
            .unwrap_or_else(|| "mixed".to_string());
        let mut params = Vec::new();
        if let Some(boundary) = part.ctype.params.get("boundary") {
            params.push(("boundary".to_string(), boundary.clone()));
        }
        return BodyStructure::Multi {
            parts: part.subparts.iter().map(body_structure).collect(),
            media_subtype: subtype,
            params,
        };
    }

    let (media_type, media_subtype) = match mimetype.split_once('/') {
        Some((t, s)) => (t.to_string(), s.to_string()),
        None => ("text".to_string(), "plain".to_string()),
    };
    let is_text = media_type == "text";

    let mut params = Vec::new();
    if is_text {
        params.push(("charset".to_string(), part.ctype.charset.clone()));
    }
    for (key, value) in part.ctype.params.iter() {
        let key = key.to_ascii_lowercase();
        if key != "charset" && key != "boundary" {
            params.push((key, value.clone()));
        }
    }

    let body = text_slice(part.raw_bytes);
    BodyStructure::Single {
        media_type,
        media_subtype,
        params,
        id: part.headers.get_first_value("Content-ID"),
        description: part.headers.get_first_value("Content-Description"),
        encoding: part
            .headers
            .get_first_value("Content-Transfer-Encoding")
            .unwrap_or_else(|| "7bit".to_string()),
        size: body.len() as u32,
        lines: is_text.then(|| body.iter().filter(|&&b| b == b'\n').count() as u32),
    }
}

// ---- body sections ----

/// Resolve a `BODY[...]` section against the raw message. `None` when
/// the addressed part does not exist.
pub fn section_bytes(raw: &[u8], parsed: &ParsedMail<'_>, section: &Section) -> Option<Vec<u8>> {
    match section {
        Section::Full => Some(raw.to_vec()),
        Section::Header => Some(header_slice(raw).to_vec()),
        Section::Text => Some(text_slice(raw).to_vec()),
        Section::HeaderFields(fields) => Some(filter_headers(header_slice(raw), fields, false)),
        Section::HeaderFieldsNot(fields) => Some(filter_headers(header_slice(raw), fields, true)),
        Section::Part(path, tail) => {
            let part = resolve_part(parsed, path)?;
            let body = text_slice(part.raw_bytes);
            match tail.as_deref() {
                None => Some(body.to_vec()),
                Some(Section::Header) => Some(header_slice(body).to_vec()),
                Some(Section::Text) => Some(text_slice(body).to_vec()),
                Some(Section::HeaderFields(fields)) => {
                    Some(filter_headers(header_slice(body), fields, false))
                }
                Some(Section::HeaderFieldsNot(fields)) => {
                    Some(filter_headers(header_slice(body), fields, true))
                }
                Some(_) => None,
            }
        }
    }
}

fn resolve_part<'a>(parsed: &'a ParsedMail<'a>, path: &[u32]) -> Option<&'a ParsedMail<'a>> {
    let mut current = parsed;
    for &index in path {
        if current.subparts.is_empty() {
            // `BODY[1]` of a non-multipart message is the message
            // itself.
            if index == 1 {
                continue;
            }
            return None;
        }
        current = current.subparts.get(index as usize - 1)?;
    }
    Some(current)
}

/// Keep (or drop, with `invert`) the named header fields, preserving
/// continuation lines, and terminate with an empty line as the wire
/// format requires.
fn filter_headers(header: &[u8], fields: &[String], invert: bool) -> Vec<u8> {
    let wanted: Vec<String> = fields.iter().map(|f| f.to_ascii_lowercase()).collect();
    let mut out = Vec::new();
    let mut keeping = false;
    for line in split_keep_ends(header) {
        let is_continuation = line.first().map_or(false, |&b| b == b' ' || b == b'\t');
        if is_continuation {
            if keeping {
                out.extend_from_slice(line);
            }
            continue;
        }
        let name = line
            .split(|&b| b == b':')
            .next()
            .map(|n| String::from_utf8_lossy(n).trim().to_ascii_lowercase());
        keeping = match name {
            Some(name) if !name.is_empty() && line.contains(&b':') => {
                wanted.contains(&name) != invert
            }
            _ => false,
        };
        if keeping {
            out.extend_from_slice(line);
        }
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn split_keep_ends(bytes: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = bytes;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let line = match rest.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let (line, tail) = rest.split_at(pos + 1);
                rest = tail;
                line
            }
            None => {
                let line = rest;
                rest = &[];
                line
            }
        };
        Some(line)
    })
}
