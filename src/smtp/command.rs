//! SMTP command line grammar.

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while, take_while1},
    character::complete::space1,
    combinator::{map, opt, rest, value},
    sequence::{delimited, preceded, tuple},
    IResult,
};

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    StartTls,
    /// `AUTH PLAIN [initial-response]`
    AuthPlain(Option<String>),
    /// `AUTH LOGIN [initial-response]`
    AuthLogin(Option<String>),
    MailFrom {
        /// Empty string is the null return-path `<>` used by bounces.
        path: String,
        params: Vec<(String, Option<String>)>,
    },
    RcptTo {
        path: String,
    },
    Data,
    Rset,
    Noop,
    Quit,
    Vrfy(String),
    Help,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unrecognized command")]
    Unknown,
    #[error("bad address syntax")]
    BadAddress,
}

pub fn parse(line: &str) -> Result<Command, ParseError> {
    let line = line.trim_end();
    match command(line) {
        Ok((rest, cmd)) if rest.trim().is_empty() => Ok(cmd),
        Ok(_) | Err(_) => {
            // MAIL/RCPT with a mangled path get the dedicated 501.
            let upper = line.to_ascii_uppercase();
            if upper.starts_with("MAIL") || upper.starts_with("RCPT") {
                Err(ParseError::BadAddress)
            } else {
                Err(ParseError::Unknown)
            }
        }
    }
}

fn command(input: &str) -> IResult<&str, Command> {
    alt((
        map(preceded(pair_sp(tag_no_case("EHLO")), rest), |d: &str| {
            Command::Ehlo(d.trim().to_string())
        }),
        map(preceded(pair_sp(tag_no_case("HELO")), rest), |d: &str| {
            Command::Helo(d.trim().to_string())
        }),
        mail_from,
        rcpt_to,
        auth,
        value(Command::StartTls, tag_no_case("STARTTLS")),
        value(Command::Data, tag_no_case("DATA")),
        value(Command::Rset, tag_no_case("RSET")),
        value(Command::Noop, tag_no_case("NOOP")),
        value(Command::Quit, tag_no_case("QUIT")),
        value(Command::Help, tag_no_case("HELP")),
        map(preceded(pair_sp(tag_no_case("VRFY")), rest), |a: &str| {
            Command::Vrfy(a.trim().to_string())
        }),
    ))(input)
}

fn pair_sp<'a, O>(
    parser: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    nom::sequence::terminated(parser, space1)
}

/// `<addr>` or a bare address token.
fn path(input: &str) -> IResult<&str, String> {
    alt((
        map(
            delimited(tag("<"), take_while(|c| c != '>'), tag(">")),
            |a: &str| a.trim().to_string(),
        ),
        map(take_while1(|c: char| !c.is_whitespace()), |a: &str| {
            a.to_string()
        }),
    ))(input)
}

fn esmtp_param(input: &str) -> IResult<&str, (String, Option<String>)> {
    let (input, key) = take_while1(|c: char| c.is_ascii_alphanumeric())(input)?;
    let (input, val) = opt(preceded(
        tag("="),
        take_while1(|c: char| !c.is_whitespace()),
    ))(input)?;
    Ok((input, (key.to_ascii_uppercase(), val.map(|v| v.to_string()))))
}

fn mail_from(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_no_case("MAIL")(input)?;
    let (input, _) = space1(input)?;
    let (input, _) = tag_no_case("FROM:")(input)?;
    let (input, _) = take_while(|c: char| c.is_whitespace())(input)?;
    let (input, path) = path(input)?;
    let (input, params) = nom::multi::many0(preceded(space1, esmtp_param))(input)?;
    Ok((input, Command::MailFrom { path, params }))
}

fn rcpt_to(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_no_case("RCPT")(input)?;
    let (input, _) = space1(input)?;
    let (input, _) = tag_no_case("TO:")(input)?;
    let (input, _) = take_while(|c: char| c.is_whitespace())(input)?;
    let (input, path) = path(input)?;
    Ok((input, Command::RcptTo { path }))
}

fn auth(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_no_case("AUTH")(input)?;
    let (input, _) = space1(input)?;
    alt((
        map(
            tuple((
                tag_no_case("PLAIN"),
                opt(preceded(space1, take_while1(|c: char| !c.is_whitespace()))),
            )),
            |(_, ir): (_, Option<&str>)| Command::AuthPlain(ir.map(|s| s.to_string())),
        ),
        map(
            tuple((
                tag_no_case("LOGIN"),
                opt(preceded(space1, take_while1(|c: char| !c.is_whitespace()))),
            )),
            |(_, ir): (_, Option<&str>)| Command::AuthLogin(ir.map(|s| s.to_string())),
        ),
    ))(input)
}

/// The domain of an address, lowercased; `None` when the address has
/// no `@domain` part.
pub fn address_domain(addr: &str) -> Option<String> {
    addr.rsplit_once('@')
        .map(|(_, d)| d.trim().to_ascii_lowercase())
        .filter(|d| !d.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_commands() {
        assert_eq!(
            parse("EHLO client.example.org").unwrap(),
            Command::Ehlo("client.example.org".into())
        );
        assert_eq!(parse("helo x").unwrap(), Command::Helo("x".into()));
    }

    #[test]
    fn mail_from_variants() {
        assert_eq!(
            parse("MAIL FROM:<bob@other.tld>").unwrap(),
            Command::MailFrom {
                path: "bob@other.tld".into(),
                params: vec![]
            }
        );
        // Null return-path for bounces.
        assert_eq!(
            parse("MAIL FROM:<>").unwrap(),
            Command::MailFrom {
                path: "".into(),
                params: vec![]
            }
        );
        assert_eq!(
            parse("mail from: <bob@other.tld> SIZE=1024 BODY=8BITMIME").unwrap(),
            Command::MailFrom {
                path: "bob@other.tld".into(),
                params: vec![
                    ("SIZE".into(), Some("1024".into())),
                    ("BODY".into(), Some("8BITMIME".into()))
                ]
            }
        );
    }

    #[test]
    fn rcpt_to() {
        assert_eq!(
            parse("RCPT TO:<alice@example.com>").unwrap(),
            Command::RcptTo {
                path: "alice@example.com".into()
            }
        );
        assert!(matches!(parse("RCPT TO:"), Err(ParseError::BadAddress)));
    }

    #[test]
    fn auth_commands() {
        assert_eq!(parse("AUTH PLAIN").unwrap(), Command::AuthPlain(None));
        assert_eq!(
            parse("AUTH PLAIN AGFsaWNlAGh1bnRlcjI=").unwrap(),
            Command::AuthPlain(Some("AGFsaWNlAGh1bnRlcjI=".into()))
        );
        assert_eq!(parse("auth login").unwrap(), Command::AuthLogin(None));
    }

    #[test]
    fn bare_words() {
        assert_eq!(parse("DATA").unwrap(), Command::Data);
        assert_eq!(parse("rset").unwrap(), Command::Rset);
        assert_eq!(parse("QUIT").unwrap(), Command::Quit);
        assert_eq!(parse("STARTTLS").unwrap(), Command::StartTls);
        assert!(matches!(parse("BOGUS"), Err(ParseError::Unknown)));
    }

    #[test]
    fn domain_extraction() {
        assert_eq!(
            address_domain("alice@Example.COM"),
            Some("example.com".into())
        );
        assert_eq!(address_domain("no-domain"), None);
        assert_eq!(address_domain("trailing@"), None);
    }
}
