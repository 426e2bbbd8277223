//! SEARCH criteria evaluation against the mailbox snapshot. String
//! matches are case-insensitive substring tests, per RFC 3501.

use crate::imap::attributes;
use crate::imap::grammar::SearchKey;
use crate::storage::{Flag, MailRow};

pub struct MatchContext<'a> {
    pub row: &'a MailRow,
    pub seq: u32,
    pub max_seq: u32,
    pub max_uid: u32,
    /// Raw bytes, loaded only when the criteria need them.
    pub raw: Option<&'a [u8]>,
}

/// Whether evaluating `key` requires the raw message bytes.
pub fn needs_body(key: &SearchKey) -> bool {
    use SearchKey::*;
    match key {
        Body(_) | Text(_) | Header(..) => true,
        Not(inner) => needs_body(inner),
        Or(a, b) => needs_body(a) || needs_body(b),
        And(keys) => keys.iter().any(needs_body),
        _ => false,
    }
}

pub fn matches(key: &SearchKey, ctx: &MatchContext<'_>) -> bool {
    use SearchKey::*;
    let flags = &ctx.row.flags;
    match key {
        All => true,
        Answered => flags.contains(&Flag::Answered),
        Unanswered => !flags.contains(&Flag::Answered),
        Deleted => flags.contains(&Flag::Deleted),
        Undeleted => !flags.contains(&Flag::Deleted),
        Draft => flags.contains(&Flag::Draft),
        Undraft => !flags.contains(&Flag::Draft),
        Flagged => flags.contains(&Flag::Flagged),
        Unflagged => !flags.contains(&Flag::Flagged),
        Seen => flags.contains(&Flag::Seen),
        Unseen => !flags.contains(&Flag::Seen),
        Recent => flags.contains(&Flag::Recent),
        Old => !flags.contains(&Flag::Recent),
        New => flags.contains(&Flag::Recent) && !flags.contains(&Flag::Seen),
        Keyword(k) => has_keyword(ctx.row, k),
        Unkeyword(k) => !has_keyword(ctx.row, k),
        From(s) => contains_ci(&ctx.row.from, s),
        To(s) => ctx.row.to.iter().any(|a| contains_ci(a, s)),
        Cc(s) => ctx.row.cc.iter().any(|a| contains_ci(a, s)),
        Bcc(s) => ctx.row.bcc.iter().any(|a| contains_ci(a, s)),
        Subject(s) => contains_ci(&ctx.row.subject, s),
        Body(s) => match ctx.raw {
            Some(raw) => bytes_contain_ci(attributes::text_slice(raw), s),
            None => false,
        },
        Text(s) => match ctx.raw {
            Some(raw) => bytes_contain_ci(raw, s),
            None => false,
        },
        Header(name, value) => match ctx.raw {
            Some(raw) => header_matches(raw, name, value),
            None => false,
        },
        Before(date) => ctx.row.received_at.date_naive() < *date,
        On(date) => ctx.row.received_at.date_naive() == *date,
        Since(date) => ctx.row.received_at.date_naive() >= *date,
        Larger(n) => ctx.row.size > *n as u64,
        Smaller(n) => ctx.row.size < *n as u64,
        SeqSet(set) => set.contains(ctx.seq, ctx.max_seq),
        Uid(set) => set.contains(ctx.row.uid, ctx.max_uid),
        Not(inner) => !matches(inner, ctx),
        Or(a, b) => matches(a, ctx) || matches(b, ctx),
        And(keys) => keys.iter().all(|k| matches(k, ctx)),
    }
}

fn has_keyword(row: &MailRow, keyword: &str) -> bool {
    row.flags.iter().any(
        |f| matches!(f, Flag::Keyword(k) if k.eq_ignore_ascii_case(keyword)),
    )
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack
        .to_ascii_lowercase()
        .contains(&needle.to_ascii_lowercase())
}

fn bytes_contain_ci(haystack: &[u8], needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    let haystack = haystack.to_ascii_lowercase();
    let needle = needle.as_bytes().to_ascii_lowercase();
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

/// `HEADER name value`: the named header exists and its value contains
/// the substring; an empty value matches mere presence.
fn header_matches(raw: &[u8], name: &str, value: &str) -> bool {
    let header = attributes::header_slice(raw);
    let prefix = format!("{}:", name.to_ascii_lowercase());
    for line in header.split(|&b| b == b'\n') {
        let lower = line.to_ascii_lowercase();
        if lower.starts_with(prefix.as_bytes()) {
            let rest = &line[prefix.len()..];
            if bytes_contain_ci(rest, value) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::grammar::{SeqNum, Sequence, SequenceSet};
    use chrono::{TimeZone, Utc};

    fn row() -> MailRow {
        MailRow {
            id: "m1".into(),
            user_email: "alice@example.com".into(),
            folder: "INBOX".into(),
            uid: 7,
            from: "Bob@Other.tld".into(),
            to: vec!["alice@example.com".into()],
            cc: vec![],
            bcc: vec![],
            subject: "Quarterly Report".into(),
            size: 2048,
            flags: [Flag::Recent, Flag::Keyword("Urgent".into())]
                .into_iter()
                .collect(),
            received_at: Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap(),
        }
    }

    fn ctx(row: &MailRow) -> MatchContext<'_> {
        MatchContext {
            row,
            seq: 1,
            max_seq: 3,
            max_uid: 9,
            raw: None,
        }
    }

    #[test]
    fn flag_criteria() {
        let row = row();
        let ctx = ctx(&row);
        assert!(matches(&SearchKey::All, &ctx));
        assert!(matches(&SearchKey::Unseen, &ctx));
        assert!(matches(&SearchKey::New, &ctx));
        assert!(!matches(&SearchKey::Seen, &ctx));
        assert!(matches(&SearchKey::Keyword("urgent".into()), &ctx));
        assert!(!matches(&SearchKey::Unkeyword("urgent".into()), &ctx));
    }

    #[test]
    fn string_criteria_are_case_insensitive() {
        let row = row();
        let ctx = ctx(&row);
        assert!(matches(&SearchKey::From("bob@other".into()), &ctx));
        assert!(matches(&SearchKey::Subject("quarterly".into()), &ctx));
        assert!(matches(&SearchKey::To("ALICE".into()), &ctx));
        assert!(!matches(&SearchKey::Subject("missing".into()), &ctx));
    }

    #[test]
    fn date_and_size_criteria() {
        let row = row();
        let ctx = ctx(&row);
        let date = |y, m, d| chrono::NaiveDate::from_ymd_opt(y, m, d).unwrap();
        assert!(matches(&SearchKey::On(date(2026, 3, 15)), &ctx));
        assert!(matches(&SearchKey::Since(date(2026, 3, 15)), &ctx));
        assert!(matches(&SearchKey::Before(date(2026, 4, 1)), &ctx));
        assert!(!matches(&SearchKey::Before(date(2026, 3, 15)), &ctx));
        assert!(matches(&SearchKey::Larger(1024), &ctx));
        assert!(!matches(&SearchKey::Smaller(1024), &ctx));
    }

    #[test]
    fn body_criteria_use_raw_bytes() {
        let row = row();
        let raw = b"Subject: Quarterly Report\r\nX-Origin: mars\r\n\r\nDeep Body Text\r\n";
        let ctx = MatchContext {
            raw: Some(raw),
            ..ctx(&row)
        };
        assert!(matches(&SearchKey::Body("deep body".into()), &ctx));
        assert!(!matches(&SearchKey::Body("x-origin".into()), &ctx));
        assert!(matches(&SearchKey::Text("x-origin".into()), &ctx));
        assert!(matches(
            &SearchKey::Header("X-Origin".into(), "mars".into()),
            &ctx
        ));
        assert!(matches(&SearchKey::Header("X-Origin".into(), "".into()), &ctx));
        assert!(!matches(
            &SearchKey::Header("X-Missing".into(), "".into()),
            &ctx
        ));
        assert!(needs_body(&SearchKey::Body("x".into())));
        assert!(!needs_body(&SearchKey::Subject("x".into())));
    }

    #[test]
    fn set_and_composite_criteria() {
        let row = row();
        let ctx = ctx(&row);
        let seqs = SequenceSet(vec![Sequence::Single(SeqNum::Value(1))]);
        let uids = SequenceSet(vec![Sequence::Range(
            SeqNum::Value(5),
            SeqNum::Star,
        )]);
        assert!(matches(&SearchKey::SeqSet(seqs), &ctx));
        assert!(matches(&SearchKey::Uid(uids), &ctx));
        assert!(matches(
            &SearchKey::And(vec![SearchKey::Unseen, SearchKey::Larger(1)]),
            &ctx
        ));
        assert!(matches(
            &SearchKey::Or(
                Box::new(SearchKey::Seen),
                Box::new(SearchKey::Subject("report".into()))
            ),
            &ctx
        ));
        assert!(!matches(&SearchKey::Not(Box::new(SearchKey::All)), &ctx));
    }
}
