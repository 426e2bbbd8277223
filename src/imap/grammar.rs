//! The IMAP tagged-command grammar. Literals have already been inlined
//! into the buffer by the session's continuation handling, so `{n}CRLF`
//! is always followed by its `n` bytes here.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone};
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take, take_while1},
    character::complete::{char, u32 as number},
    combinator::{map, opt, value},
    multi::{separated_list0, separated_list1},
    sequence::{delimited, preceded, separated_pair, tuple},
    IResult,
};

use crate::storage::Flag;

#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    pub tag: String,
    pub body: CommandBody,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CommandBody {
    Capability,
    Noop,
    Logout,
    StartTls,
    Check,
    Close,
    Unselect,
    Expunge,
    Idle,
    Login {
        user: String,
        password: String,
    },
    Authenticate {
        mechanism: String,
        initial: Option<String>,
    },
    Select {
        mailbox: String,
    },
    Examine {
        mailbox: String,
    },
    Create {
        mailbox: String,
    },
    Delete {
        mailbox: String,
    },
    Rename {
        from: String,
        to: String,
    },
    Subscribe {
        mailbox: String,
    },
    Unsubscribe {
        mailbox: String,
    },
    List {
        reference: String,
        pattern: String,
    },
    Lsub {
        reference: String,
        pattern: String,
    },
    Status {
        mailbox: String,
        items: Vec<StatusItem>,
    },
    Append {
        mailbox: String,
        flags: Vec<Flag>,
        date: Option<DateTime<FixedOffset>>,
        message: Vec<u8>,
    },
    Search {
        uid: bool,
        criteria: SearchKey,
    },
    Fetch {
        uid: bool,
        set: SequenceSet,
        items: Vec<FetchItem>,
    },
    Store {
        uid: bool,
        set: SequenceSet,
        op: StoreOp,
        silent: bool,
        flags: Vec<Flag>,
    },
    Copy {
        uid: bool,
        set: SequenceSet,
        mailbox: String,
    },
    Move {
        uid: bool,
        set: SequenceSet,
        mailbox: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StoreOp {
    Set,
    Add,
    Remove,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StatusItem {
    Messages,
    Recent,
    Unseen,
    UidNext,
    UidValidity,
}

// ---- sequence sets ----

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SeqNum {
    Value(u32),
    /// `*`, the largest number in use.
    Star,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Sequence {
    Single(SeqNum),
    Range(SeqNum, SeqNum),
}

#[derive(Clone, Debug, PartialEq)]
pub struct SequenceSet(pub Vec<Sequence>);

impl SeqNum {
    fn resolve(self, max: u32) -> u32 {
        match self {
            SeqNum::Value(v) => v,
            SeqNum::Star => max,
        }
    }
}

impl SequenceSet {
    /// Membership test against a concrete maximum (`*` resolves to
    /// `max`). Ranges are accepted in either order, per RFC 3501.
    pub fn contains(&self, n: u32, max: u32) -> bool {
        self.0.iter().any(|seq| match seq {
            // "*" in an empty mailbox matches nothing.
            Sequence::Single(SeqNum::Star) => max != 0 && n == max,
            Sequence::Single(SeqNum::Value(v)) => *v == n,
            Sequence::Range(a, b) => {
                let (a, b) = (a.resolve(max), b.resolve(max));
                let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                lo <= n && n <= hi
            }
        })
    }
}

// ---- fetch items ----

#[derive(Clone, Debug, PartialEq)]
pub enum Section {
    /// `BODY[]`
    Full,
    Header,
    HeaderFields(Vec<String>),
    HeaderFieldsNot(Vec<String>),
    Text,
    /// Dotted part path with an optional trailing specifier,
    /// e.g. `1.2.TEXT`.
    Part(Vec<u32>, Option<Box<Section>>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum FetchItem {
    Uid,
    Flags,
    InternalDate,
    Envelope,
    Rfc822,
    Rfc822Header,
    Rfc822Size,
    Rfc822Text,
    /// `BODY` without a section: non-extensible BODYSTRUCTURE.
    Body,
    BodyStructure,
    BodySection {
        section: Section,
        partial: Option<(u32, u32)>,
        peek: bool,
    },
}

// ---- search ----

#[derive(Clone, Debug, PartialEq)]
pub enum SearchKey {
    All,
    Answered,
    Unanswered,
    Deleted,
    Undeleted,
    Draft,
    Undraft,
    Flagged,
    Unflagged,
    Seen,
    Unseen,
    New,
    Old,
    Recent,
    Keyword(String),
    Unkeyword(String),
    From(String),
    To(String),
    Cc(String),
    Bcc(String),
    Subject(String),
    Body(String),
    Text(String),
    Header(String, String),
    Before(NaiveDate),
    On(NaiveDate),
    Since(NaiveDate),
    Larger(u32),
    Smaller(u32),
    SeqSet(SequenceSet),
    Uid(SequenceSet),
    Not(Box<SearchKey>),
    Or(Box<SearchKey>, Box<SearchKey>),
    And(Vec<SearchKey>),
}

#[derive(Debug, thiserror::Error)]
#[error("parse error: {0}")]
pub struct ParseError(pub String);

/// Parse one complete command (tag, name, arguments). The input must
/// contain the whole command with literals inlined, without the final
/// CRLF.
pub fn parse_command(input: &[u8]) -> Result<Command, ParseError> {
    let (input, tag) = command_tag(input).map_err(|_| ParseError("missing tag".into()))?;
    let (input, _) = sp(input).map_err(|_| ParseError("missing command".into()))?;
    match command_body(input) {
        Ok((rest, body)) if rest.is_empty() => Ok(Command { tag, body }),
        Ok((rest, _)) => Err(ParseError(format!(
            "trailing garbage: {:?}",
            String::from_utf8_lossy(&rest[..rest.len().min(32)])
        ))),
        Err(_) => Err(ParseError("unknown command or bad arguments".into())),
    }
}

/// Extract the tag alone, for error reports on unparseable lines.
pub fn peek_tag(input: &[u8]) -> Option<String> {
    command_tag(input).ok().map(|(_, tag)| tag)
}

fn command_tag(input: &[u8]) -> IResult<&[u8], String> {
    map(take_while1(is_tag_char), |t: &[u8]| lossy(t))(input)
}

fn is_tag_char(c: u8) -> bool {
    c.is_ascii_graphic() && !matches!(c, b'(' | b')' | b'{' | b'%' | b'*' | b'"' | b'\\' | b'+')
}

fn sp(input: &[u8]) -> IResult<&[u8], char> {
    char(' ')(input)
}

fn lossy(b: &[u8]) -> String {
    String::from_utf8_lossy(b).into_owned()
}

fn command_body(input: &[u8]) -> IResult<&[u8], CommandBody> {
    alt((
        alt((
            value(CommandBody::Capability, tag_no_case("CAPABILITY")),
            value(CommandBody::Noop, tag_no_case("NOOP")),
            value(CommandBody::Logout, tag_no_case("LOGOUT")),
            value(CommandBody::StartTls, tag_no_case("STARTTLS")),
            value(CommandBody::Check, tag_no_case("CHECK")),
            value(CommandBody::Close, tag_no_case("CLOSE")),
            value(CommandBody::Unselect, tag_no_case("UNSELECT")),
            value(CommandBody::Expunge, tag_no_case("EXPUNGE")),
            value(CommandBody::Idle, tag_no_case("IDLE")),
        )),
        login,
        authenticate,
        mailbox_arg_command,
        rename,
        list_like,
        status,
        append,
        preceded(tag_no_case("UID "), uid_command),
        search(false),
        fetch(false),
        store(false),
        copy_move(false),
    ))(input)
}

fn uid_command(input: &[u8]) -> IResult<&[u8], CommandBody> {
    alt((
        search(true),
        fetch(true),
        store(true),
        copy_move(true),
    ))(input)
}

fn login(input: &[u8]) -> IResult<&[u8], CommandBody> {
    let (input, _) = tag_no_case("LOGIN ")(input)?;
    let (input, (user, password)) = separated_pair(astring, sp, astring)(input)?;
    Ok((
        input,
        CommandBody::Login {
            user: lossy(&user),
            password: lossy(&password),
        },
    ))
}

fn authenticate(input: &[u8]) -> IResult<&[u8], CommandBody> {
    let (input, _) = tag_no_case("AUTHENTICATE ")(input)?;
    let (input, mech) = map(take_while1(is_atom_char), lossy)(input)?;
    let (input, initial) = opt(preceded(
        sp,
        map(take_while1(|c: u8| c.is_ascii_graphic()), lossy),
    ))(input)?;
    Ok((
        input,
        CommandBody::Authenticate {
            mechanism: mech.to_ascii_uppercase(),
            initial,
        },
    ))
}

fn mailbox_arg_command(input: &[u8]) -> IResult<&[u8], CommandBody> {
    let (input, name) = alt((
        tag_no_case("SELECT"),
        tag_no_case("EXAMINE"),
        tag_no_case("CREATE"),
        tag_no_case("DELETE"),
        tag_no_case("SUBSCRIBE"),
        tag_no_case("UNSUBSCRIBE"),
    ))(input)?;
    let (input, _) = sp(input)?;
    let (input, mailbox) = mailbox(input)?;
    let body = match name.to_ascii_uppercase().as_slice() {
        b"SELECT" => CommandBody::Select { mailbox },
        b"EXAMINE" => CommandBody::Examine { mailbox },
        b"CREATE" => CommandBody::Create { mailbox },
        b"DELETE" => CommandBody::Delete { mailbox },
        b"SUBSCRIBE" => CommandBody::Subscribe { mailbox },
        _ => CommandBody::Unsubscribe { mailbox },
    };
    Ok((input, body))
}

fn rename(input: &[u8]) -> IResult<&[u8], CommandBody> {
    let (input, _) = tag_no_case("RENAME ")(input)?;
    let (input, (from, to)) = separated_pair(mailbox, sp, mailbox)(input)?;
    Ok((input, CommandBody::Rename { from, to }))
}

fn list_like(input: &[u8]) -> IResult<&[u8], CommandBody> {
    let (input, name) = alt((tag_no_case("LIST"), tag_no_case("LSUB")))(input)?;
    let (input, _) = sp(input)?;
    let (input, (reference, pattern)) = separated_pair(mailbox, sp, list_pattern)(input)?;
    let body = if name.eq_ignore_ascii_case(b"LIST") {
        CommandBody::List { reference, pattern }
    } else {
        CommandBody::Lsub { reference, pattern }
    };
    Ok((input, body))
}

fn status(input: &[u8]) -> IResult<&[u8], CommandBody> {
    let (input, _) = tag_no_case("STATUS ")(input)?;
    let (input, mailbox) = mailbox(input)?;
    let (input, _) = sp(input)?;
    let (input, items) = delimited(
        char('('),
        separated_list1(sp, status_item),
        char(')'),
    )(input)?;
    Ok((input, CommandBody::Status { mailbox, items }))
}

fn status_item(input: &[u8]) -> IResult<&[u8], StatusItem> {
    alt((
        value(StatusItem::Messages, tag_no_case("MESSAGES")),
        value(StatusItem::Recent, tag_no_case("RECENT")),
        value(StatusItem::Unseen, tag_no_case("UNSEEN")),
        value(StatusItem::UidNext, tag_no_case("UIDNEXT")),
        value(StatusItem::UidValidity, tag_no_case("UIDVALIDITY")),
    ))(input)
}

fn append(input: &[u8]) -> IResult<&[u8], CommandBody> {
    let (input, _) = tag_no_case("APPEND ")(input)?;
    let (input, mailbox) = mailbox(input)?;
    let (input, flags) = opt(preceded(sp, flag_list))(input)?;
    let (input, date) = opt(preceded(sp, date_time))(input)?;
    let (input, _) = sp(input)?;
    let (input, message) = literal(input)?;
    Ok((
        input,
        CommandBody::Append {
            mailbox,
            flags: flags.unwrap_or_default(),
            date,
            message,
        },
    ))
}

fn search(uid: bool) -> impl FnMut(&[u8]) -> IResult<&[u8], CommandBody> {
    move |input| {
        let (input, _) = tag_no_case("SEARCH ")(input)?;
        // An optional CHARSET is accepted; strings are always treated
        // as UTF-8.
        let (input, _) = opt(tuple((tag_no_case("CHARSET "), astring, sp)))(input)?;
        let (input, keys) = separated_list1(sp, search_key)(input)?;
        let criteria = if keys.len() == 1 {
            keys.into_iter().next().unwrap_or(SearchKey::All)
        } else {
            SearchKey::And(keys)
        };
        Ok((input, CommandBody::Search { uid, criteria }))
    }
}

fn fetch(uid: bool) -> impl FnMut(&[u8]) -> IResult<&[u8], CommandBody> {
    move |input| {
        let (input, _) = tag_no_case("FETCH ")(input)?;
        let (input, set) = sequence_set(input)?;
        let (input, _) = sp(input)?;
        let (input, items) = fetch_items(input)?;
        Ok((input, CommandBody::Fetch { uid, set, items }))
    }
}

fn store(uid: bool) -> impl FnMut(&[u8]) -> IResult<&[u8], CommandBody> {
    move |input| {
        let (input, _) = tag_no_case("STORE ")(input)?;
        let (input, set) = sequence_set(input)?;
        let (input, _) = sp(input)?;
        let (input, op) = alt((
            value(StoreOp::Add, char('+')),
            value(StoreOp::Remove, char('-')),
            value(StoreOp::Set, nom::combinator::success(())),
        ))(input)?;
        let (input, _) = tag_no_case("FLAGS")(input)?;
        let (input, silent) = map(opt(tag_no_case(".SILENT")), |s| s.is_some())(input)?;
        let (input, _) = sp(input)?;
        let (input, flags) = alt((flag_list, separated_list1(sp, flag)))(input)?;
        Ok((
            input,
            CommandBody::Store {
                uid,
                set,
                op,
                silent,
                flags,
            },
        ))
    }
}

fn copy_move(uid: bool) -> impl FnMut(&[u8]) -> IResult<&[u8], CommandBody> {
    move |input| {
        let (input, name) = alt((tag_no_case("COPY"), tag_no_case("MOVE")))(input)?;
        let (input, _) = sp(input)?;
        let (input, set) = sequence_set(input)?;
        let (input, _) = sp(input)?;
        let (input, mailbox) = mailbox(input)?;
        let body = if name.eq_ignore_ascii_case(b"COPY") {
            CommandBody::Copy { uid, set, mailbox }
        } else {
            CommandBody::Move { uid, set, mailbox }
        };
        Ok((input, body))
    }
}

// ---- strings ----

fn is_atom_char(c: u8) -> bool {
    c.is_ascii_graphic()
        && !matches!(c, b'(' | b')' | b'{' | b'%' | b'*' | b'"' | b'\\')
}

fn is_list_char(c: u8) -> bool {
    c.is_ascii_graphic() && !matches!(c, b'(' | b')' | b'{' | b'"' | b'\\')
}

fn atom(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    map(take_while1(is_atom_char), |b: &[u8]| b.to_vec())(input)
}

fn quoted(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    let (mut input, _) = char('"')(input)?;
    let mut out = Vec::new();
    loop {
        match input.first() {
            Some(b'"') => return Ok((&input[1..], out)),
            Some(b'\\') if input.len() >= 2 => {
                out.push(input[1]);
                input = &input[2..];
            }
            Some(&c) if c != b'\r' && c != b'\n' => {
                out.push(c);
                input = &input[1..];
            }
            _ => {
                return Err(nom::Err::Error(nom::error::Error::new(
                    input,
                    nom::error::ErrorKind::Char,
                )))
            }
        }
    }
}

/// `{n}CRLF<bytes>` — the bytes were spliced in by the continuation
/// handling.
fn literal(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    let (input, n) = delimited(
        char('{'),
        nom::sequence::terminated(number, opt(char('+'))),
        char('}'),
    )(input)?;
    let (input, _) = tag("\r\n")(input)?;
    let (input, bytes) = take(n as usize)(input)?;
    Ok((input, bytes.to_vec()))
}

fn astring(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    alt((literal, quoted, atom))(input)
}

fn mailbox(input: &[u8]) -> IResult<&[u8], String> {
    map(astring, |b| lossy(&b))(input)
}

fn list_pattern(input: &[u8]) -> IResult<&[u8], String> {
    alt((
        map(literal, |b| lossy(&b)),
        map(quoted, |b| lossy(&b)),
        map(take_while1(is_list_char), lossy),
    ))(input)
}

// ---- flags ----

fn flag(input: &[u8]) -> IResult<&[u8], Flag> {
    let (input, backslash) = opt(char('\\'))(input)?;
    let (input, name) = map(take_while1(is_atom_char), lossy)(input)?;
    let text = match backslash {
        Some(_) => format!("\\{}", name),
        None => name,
    };
    match text.parse() {
        Ok(flag) => Ok((input, flag)),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Tag,
        ))),
    }
}

fn flag_list(input: &[u8]) -> IResult<&[u8], Vec<Flag>> {
    delimited(char('('), separated_list0(sp, flag), char(')'))(input)
}

// ---- sequence sets ----

fn seq_num(input: &[u8]) -> IResult<&[u8], SeqNum> {
    alt((
        value(SeqNum::Star, char('*')),
        map(number, SeqNum::Value),
    ))(input)
}

fn sequence(input: &[u8]) -> IResult<&[u8], Sequence> {
    let (input, first) = seq_num(input)?;
    let (input, second) = opt(preceded(char(':'), seq_num))(input)?;
    Ok((
        input,
        match second {
            Some(second) => Sequence::Range(first, second),
            None => Sequence::Single(first),
        },
    ))
}

pub fn sequence_set(input: &[u8]) -> IResult<&[u8], SequenceSet> {
    map(separated_list1(char(','), sequence), SequenceSet)(input)
}

// ---- dates ----

fn month(input: &[u8]) -> IResult<&[u8], u32> {
    let names = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    for (i, name) in names.iter().enumerate() {
        if let Ok((rest, _)) = tag_no_case::<_, _, nom::error::Error<&[u8]>>(*name)(input) {
            return Ok((rest, i as u32 + 1));
        }
    }
    Err(nom::Err::Error(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Tag,
    )))
}

fn naive_date(input: &[u8]) -> IResult<&[u8], NaiveDate> {
    let (input, (day, _, month, _, year)) =
        tuple((number, char('-'), month, char('-'), number))(input)?;
    match NaiveDate::from_ymd_opt(year as i32, month, day) {
        Some(d) => Ok((input, d)),
        None => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        ))),
    }
}

/// Search dates may be quoted.
fn search_date(input: &[u8]) -> IResult<&[u8], NaiveDate> {
    alt((delimited(char('"'), naive_date, char('"')), naive_date))(input)
}

/// `"dd-MMM-yyyy HH:MM:SS +ZZZZ"` with an optionally space-padded day.
fn date_time(input: &[u8]) -> IResult<&[u8], DateTime<FixedOffset>> {
    let (input, _) = char('"')(input)?;
    let (input, _) = opt(char(' '))(input)?;
    let (input, date) = naive_date(input)?;
    let (input, _) = sp(input)?;
    let (input, (h, _, m, _, s)) =
        tuple((number, char(':'), number, char(':'), number))(input)?;
    let (input, _) = sp(input)?;
    let (input, sign) = alt((value(1i32, char('+')), value(-1i32, char('-'))))(input)?;
    let (input, zone) = number(input)?;
    let (input, _) = char('"')(input)?;

    let time = NaiveTime::from_hms_opt(h, m, s);
    let offset_secs = sign * ((zone / 100) as i32 * 3600 + (zone % 100) as i32 * 60);
    let offset = FixedOffset::east_opt(offset_secs);
    match (time, offset) {
        (Some(time), Some(offset)) => {
            match offset.from_local_datetime(&date.and_time(time)).single() {
                Some(dt) => Ok((input, dt)),
                None => Err(nom::Err::Error(nom::error::Error::new(
                    input,
                    nom::error::ErrorKind::Verify,
                ))),
            }
        }
        _ => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        ))),
    }
}

// ---- fetch items ----

fn fetch_items(input: &[u8]) -> IResult<&[u8], Vec<FetchItem>> {
    alt((
        value(
            vec![FetchItem::Flags, FetchItem::InternalDate, FetchItem::Rfc822Size],
            tag_no_case("FAST"),
        ),
        value(
            vec![
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size,
                FetchItem::Envelope,
            ],
            tag_no_case("ALL"),
        ),
        value(
            vec![
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size,
                FetchItem::Envelope,
                FetchItem::Body,
            ],
            tag_no_case("FULL"),
        ),
        delimited(char('('), separated_list1(sp, fetch_item), char(')')),
        map(fetch_item, |i| vec![i]),
    ))(input)
}

fn fetch_item(input: &[u8]) -> IResult<&[u8], FetchItem> {
    alt((
        body_section,
        value(FetchItem::BodyStructure, tag_no_case("BODYSTRUCTURE")),
        value(FetchItem::Uid, tag_no_case("UID")),
        value(FetchItem::Flags, tag_no_case("FLAGS")),
        value(FetchItem::InternalDate, tag_no_case("INTERNALDATE")),
        value(FetchItem::Envelope, tag_no_case("ENVELOPE")),
        value(FetchItem::Rfc822Header, tag_no_case("RFC822.HEADER")),
        value(FetchItem::Rfc822Size, tag_no_case("RFC822.SIZE")),
        value(FetchItem::Rfc822Text, tag_no_case("RFC822.TEXT")),
        value(FetchItem::Rfc822, tag_no_case("RFC822")),
        value(FetchItem::Body, tag_no_case("BODY")),
    ))(input)
}

fn body_section(input: &[u8]) -> IResult<&[u8], FetchItem> {
    let (input, _) = tag_no_case("BODY")(input)?;
    let (input, peek) = map(opt(tag_no_case(".PEEK")), |p| p.is_some())(input)?;
    let (input, section) = delimited(char('['), opt(section), char(']'))(input)?;
    let (input, partial) = opt(delimited(
        char('<'),
        separated_pair(number, char('.'), number),
        char('>'),
    ))(input)?;
    Ok((
        input,
        FetchItem::BodySection {
            section: section.unwrap_or(Section::Full),
            partial,
            peek,
        },
    ))
}

fn section(input: &[u8]) -> IResult<&[u8], Section> {
    alt((part_section, section_text))(input)
}

fn section_text(input: &[u8]) -> IResult<&[u8], Section> {
    alt((
        map(
            preceded(tag_no_case("HEADER.FIELDS.NOT "), header_field_list),
            Section::HeaderFieldsNot,
        ),
        map(
            preceded(tag_no_case("HEADER.FIELDS "), header_field_list),
            Section::HeaderFields,
        ),
        value(Section::Header, tag_no_case("HEADER")),
        value(Section::Text, tag_no_case("TEXT")),
    ))(input)
}

fn part_section(input: &[u8]) -> IResult<&[u8], Section> {
    let (input, parts) = separated_list1(char('.'), number)(input)?;
    if parts.is_empty() || parts.contains(&0) {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        )));
    }
    let (input, tail) = opt(preceded(char('.'), section_text))(input)?;
    Ok((input, Section::Part(parts, tail.map(Box::new))))
}

fn header_field_list(input: &[u8]) -> IResult<&[u8], Vec<String>> {
    delimited(
        char('('),
        separated_list1(sp, map(astring, |b| lossy(&b))),
        char(')'),
    )(input)
}

// ---- search keys ----

fn search_key(input: &[u8]) -> IResult<&[u8], SearchKey> {
    alt((search_key_simple, search_key_arg, search_key_composite))(input)
}

fn search_key_simple(input: &[u8]) -> IResult<&[u8], SearchKey> {
    alt((
        value(SearchKey::All, tag_no_case("ALL")),
        value(SearchKey::Unanswered, tag_no_case("UNANSWERED")),
        value(SearchKey::Answered, tag_no_case("ANSWERED")),
        value(SearchKey::Undeleted, tag_no_case("UNDELETED")),
        value(SearchKey::Deleted, tag_no_case("DELETED")),
        value(SearchKey::Undraft, tag_no_case("UNDRAFT")),
        value(SearchKey::Draft, tag_no_case("DRAFT")),
        value(SearchKey::Unflagged, tag_no_case("UNFLAGGED")),
        value(SearchKey::Flagged, tag_no_case("FLAGGED")),
        value(SearchKey::Unseen, tag_no_case("UNSEEN")),
        value(SearchKey::Seen, tag_no_case("SEEN")),
        value(SearchKey::New, tag_no_case("NEW")),
        value(SearchKey::Old, tag_no_case("OLD")),
        value(SearchKey::Recent, tag_no_case("RECENT")),
    ))(input)
}

fn search_key_arg(input: &[u8]) -> IResult<&[u8], SearchKey> {
    alt((
        map(preceded(tag_no_case("KEYWORD "), atom), |k| {
            SearchKey::Keyword(lossy(&k))
        }),
        map(preceded(tag_no_case("UNKEYWORD "), atom), |k| {
            SearchKey::Unkeyword(lossy(&k))
        }),
        map(preceded(tag_no_case("FROM "), astring), |s| {
            SearchKey::From(lossy(&s))
        }),
        map(preceded(tag_no_case("TO "), astring), |s| {
            SearchKey::To(lossy(&s))
        }),
        map(preceded(tag_no_case("CC "), astring), |s| {
            SearchKey::Cc(lossy(&s))
        }),
        map(preceded(tag_no_case("BCC "), astring), |s| {
            SearchKey::Bcc(lossy(&s))
        }),
        map(preceded(tag_no_case("SUBJECT "), astring), |s| {
            SearchKey::Subject(lossy(&s))
        }),
        map(preceded(tag_no_case("BODY "), astring), |s| {
            SearchKey::Body(lossy(&s))
        }),
        map(preceded(tag_no_case("TEXT "), astring), |s| {
            SearchKey::Text(lossy(&s))
        }),
        map(
            preceded(
                tag_no_case("HEADER "),
                separated_pair(astring, sp, astring),
            ),
            |(name, value)| SearchKey::Header(lossy(&name), lossy(&value)),
        ),
        map(preceded(tag_no_case("SENTBEFORE "), search_date), SearchKey::Before),
        map(preceded(tag_no_case("SENTSINCE "), search_date), SearchKey::Since),
        map(preceded(tag_no_case("SENTON "), search_date), SearchKey::On),
        map(preceded(tag_no_case("BEFORE "), search_date), SearchKey::Before),
        map(preceded(tag_no_case("SINCE "), search_date), SearchKey::Since),
        map(preceded(tag_no_case("ON "), search_date), SearchKey::On),
        map(preceded(tag_no_case("LARGER "), number), SearchKey::Larger),
        map(preceded(tag_no_case("SMALLER "), number), SearchKey::Smaller),
        map(preceded(tag_no_case("UID "), sequence_set), SearchKey::Uid),
    ))(input)
}

fn search_key_composite(input: &[u8]) -> IResult<&[u8], SearchKey> {
    alt((
        map(preceded(tag_no_case("NOT "), search_key), |k| {
            SearchKey::Not(Box::new(k))
        }),
        map(
            preceded(
                tag_no_case("OR "),
                separated_pair(search_key, sp, search_key),
            ),
            |(a, b)| SearchKey::Or(Box::new(a), Box::new(b)),
        ),
        map(
            delimited(char('('), separated_list1(sp, search_key), char(')')),
            |keys| {
                if keys.len() == 1 {
                    keys.into_iter().next().unwrap_or(SearchKey::All)
                } else {
                    SearchKey::And(keys)
                }
            },
        ),
        map(sequence_set, SearchKey::SeqSet),
    ))(input)
}

/// Detect a trailing literal announcement on a raw command line,
/// returning (size, non-synchronizing). Drives the continuation logic
/// in the session read loop.
pub fn trailing_literal(line: &[u8]) -> Option<(u32, bool)> {
    let line = crate::netio::trim_crlf(line);
    if !line.ends_with(b"}") {
        return None;
    }
    let open = line.iter().rposition(|&b| b == b'{')?;
    let inner = &line[open + 1..line.len() - 1];
    let (digits, plus) = match inner.strip_suffix(b"+") {
        Some(d) => (d, true),
        None => (inner, false),
    };
    if digits.is_empty() || !digits.iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    std::str::from_utf8(digits)
        .ok()?
        .parse::<u32>()
        .ok()
        .map(|n| (n, plus))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(input: &str) -> CommandBody {
        parse_command(input.as_bytes()).unwrap().body
    }

    #[test]
    fn tagged_simple_commands() {
        let cmd = parse_command(b"a001 CAPABILITY").unwrap();
        assert_eq!(cmd.tag, "a001");
        assert_eq!(cmd.body, CommandBody::Capability);
        assert_eq!(body("x NOOP"), CommandBody::Noop);
        assert_eq!(body("x unselect"), CommandBody::Unselect);
    }

    #[test]
    fn login_forms() {
        assert_eq!(
            body("a LOGIN alice hunter2"),
            CommandBody::Login {
                user: "alice".into(),
                password: "hunter2".into()
            }
        );
        assert_eq!(
            body("a LOGIN \"alice@example.com\" \"hu nter\\\"2\""),
            CommandBody::Login {
                user: "alice@example.com".into(),
                password: "hu nter\"2".into()
            }
        );
        // Literal password, already inlined.
        assert_eq!(
            parse_command(b"a LOGIN alice {7}\r\nhunter2").unwrap().body,
            CommandBody::Login {
                user: "alice".into(),
                password: "hunter2".into()
            }
        );
    }

    #[test]
    fn select_and_list() {
        assert_eq!(
            body("a SELECT INBOX"),
            CommandBody::Select {
                mailbox: "INBOX".into()
            }
        );
        assert_eq!(
            body("a LIST \"\" *"),
            CommandBody::List {
                reference: "".into(),
                pattern: "*".into()
            }
        );
        assert_eq!(
            body("a LIST \"\" \"INBOX/%\""),
            CommandBody::List {
                reference: "".into(),
                pattern: "INBOX/%".into()
            }
        );
    }

    #[test]
    fn status_items() {
        assert_eq!(
            body("a STATUS Archive (MESSAGES UIDNEXT UIDVALIDITY)"),
            CommandBody::Status {
                mailbox: "Archive".into(),
                items: vec![
                    StatusItem::Messages,
                    StatusItem::UidNext,
                    StatusItem::UidValidity
                ],
            }
        );
    }

    #[test]
    fn fetch_variants() {
        assert_eq!(
            body("a FETCH 1:5 (FLAGS UID)"),
            CommandBody::Fetch {
                uid: false,
                set: SequenceSet(vec![Sequence::Range(
                    SeqNum::Value(1),
                    SeqNum::Value(5)
                )]),
                items: vec![FetchItem::Flags, FetchItem::Uid],
            }
        );
        assert_eq!(
            body("a UID FETCH 1,3:* RFC822"),
            CommandBody::Fetch {
                uid: true,
                set: SequenceSet(vec![
                    Sequence::Single(SeqNum::Value(1)),
                    Sequence::Range(SeqNum::Value(3), SeqNum::Star),
                ]),
                items: vec![FetchItem::Rfc822],
            }
        );
        match body("a FETCH 1 BODY.PEEK[HEADER.FIELDS (From Subject)]") {
            CommandBody::Fetch { items, .. } => assert_eq!(
                items,
                vec![FetchItem::BodySection {
                    section: Section::HeaderFields(vec!["From".into(), "Subject".into()]),
                    partial: None,
                    peek: true,
                }]
            ),
            other => panic!("unexpected {:?}", other),
        }
        match body("a FETCH 1 BODY[1.2.TEXT]<0.1024>") {
            CommandBody::Fetch { items, .. } => assert_eq!(
                items,
                vec![FetchItem::BodySection {
                    section: Section::Part(vec![1, 2], Some(Box::new(Section::Text))),
                    partial: Some((0, 1024)),
                    peek: false,
                }]
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn store_ops() {
        assert_eq!(
            body("a STORE 1 +FLAGS.SILENT (\\Deleted)"),
            CommandBody::Store {
                uid: false,
                set: SequenceSet(vec![Sequence::Single(SeqNum::Value(1))]),
                op: StoreOp::Add,
                silent: true,
                flags: vec![Flag::Deleted],
            }
        );
        assert_eq!(
            body("a UID STORE 4 FLAGS (\\Seen Custom)"),
            CommandBody::Store {
                uid: true,
                set: SequenceSet(vec![Sequence::Single(SeqNum::Value(4))]),
                op: StoreOp::Set,
                silent: false,
                flags: vec![Flag::Seen, Flag::Keyword("Custom".into())],
            }
        );
    }

    #[test]
    fn search_programs() {
        assert_eq!(
            body("a SEARCH UNSEEN FROM bob"),
            CommandBody::Search {
                uid: false,
                criteria: SearchKey::And(vec![
                    SearchKey::Unseen,
                    SearchKey::From("bob".into())
                ]),
            }
        );
        assert_eq!(
            body("a UID SEARCH OR SEEN LARGER 1024"),
            CommandBody::Search {
                uid: true,
                criteria: SearchKey::Or(
                    Box::new(SearchKey::Seen),
                    Box::new(SearchKey::Larger(1024))
                ),
            }
        );
        assert_eq!(
            body("a SEARCH CHARSET UTF-8 NOT DELETED"),
            CommandBody::Search {
                uid: false,
                criteria: SearchKey::Not(Box::new(SearchKey::Deleted)),
            }
        );
        assert_eq!(
            body("a SEARCH SINCE 1-Feb-2024"),
            CommandBody::Search {
                uid: false,
                criteria: SearchKey::Since(NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()),
            }
        );
        assert_eq!(
            body("a SEARCH HEADER X-Spam yes"),
            CommandBody::Search {
                uid: false,
                criteria: SearchKey::Header("X-Spam".into(), "yes".into()),
            }
        );
    }

    #[test]
    fn append_with_literal() {
        let input = b"a APPEND Sent (\\Seen) \"01-Jan-2026 10:00:00 +0000\" {12}\r\nhello world!";
        match parse_command(input).unwrap().body {
            CommandBody::Append {
                mailbox,
                flags,
                date,
                message,
            } => {
                assert_eq!(mailbox, "Sent");
                assert_eq!(flags, vec![Flag::Seen]);
                assert!(date.is_some());
                assert_eq!(message, b"hello world!");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn sequence_set_membership() {
        let (_, set) = sequence_set(b"1,3:5,9:*").unwrap();
        assert!(set.contains(1, 10));
        assert!(!set.contains(2, 10));
        assert!(set.contains(4, 10));
        assert!(set.contains(9, 10));
        assert!(set.contains(10, 10));
        assert!(!set.contains(11, 10));
        // Backwards range.
        let (_, set) = sequence_set(b"5:3").unwrap();
        assert!(set.contains(4, 10));
    }

    #[test]
    fn trailing_literal_detection() {
        assert_eq!(trailing_literal(b"a LOGIN alice {7}\r\n"), Some((7, false)));
        assert_eq!(trailing_literal(b"a APPEND x {1024+}\r\n"), Some((1024, true)));
        assert_eq!(trailing_literal(b"a NOOP\r\n"), None);
        assert_eq!(trailing_literal(b"a SEARCH SUBJECT {}\r\n"), None);
    }

    #[test]
    fn bad_commands_are_errors() {
        assert!(parse_command(b"").is_err());
        assert!(parse_command(b"a BOGUS").is_err());
        assert!(parse_command(b"a FETCH").is_err());
        assert!(parse_command(b"a STORE 1 FLAGS").is_err());
    }
}
