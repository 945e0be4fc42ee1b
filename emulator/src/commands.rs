//! Operator console grammar.

use node_core::update::ImageKind;
use winnow::ascii::{dec_uint, space0, space1};
use winnow::combinator::{alt, eof, opt, preceded, terminated};
use winnow::prelude::*;
use winnow::token::take_while;

pub const HELP_TOPICS: &[(&str, &str)] = &[
    ("short", "short                          - short press on the power key"),
    ("long", "long                           - long press; the node shuts down"),
    ("link", "link down|up                   - take the access point away or back"),
    ("publish", "publish fail [n]               - fail the next n publishes (default 1)"),
    ("session", "session reject [n]             - refuse the next n broker handshakes"),
    ("battery", "battery <mV>                   - set the battery voltage"),
    ("update", "update app|fs <bytes> [password] - push a generated image"),
    ("status", "status                         - show the simulated world"),
    ("help", "help [topic]                   - show help for a command"),
    ("quit", "quit                           - stop the emulator"),
];

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    ShortPress,
    LongPress,
    Link { up: bool },
    FailPublishes(u32),
    RejectSessions(u32),
    Battery { millivolts: u32 },
    Update {
        kind: ImageKind,
        size: u32,
        password: Option<String>,
    },
    Status,
    Help(Option<String>),
    Quit,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParseError {
    pub input: String,
}

impl core::fmt::Display for ParseError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "unrecognised command `{}`; try `help`", self.input)
    }
}

/// Parses one console line.
///
/// # Errors
///
/// [`ParseError`] when the line matches no command.
pub fn parse(line: &str) -> Result<Command, ParseError> {
    let trimmed = line.trim();
    terminated(command, (space0, eof))
        .parse(trimmed)
        .map_err(|_| ParseError {
            input: trimmed.to_owned(),
        })
}

fn command(input: &mut &str) -> ModalResult<Command> {
    alt((
        "short".value(Command::ShortPress),
        "long".value(Command::LongPress),
        link,
        publish,
        session,
        battery,
        update,
        "status".value(Command::Status),
        help,
        alt(("quit", "exit")).value(Command::Quit),
    ))
    .parse_next(input)
}

fn count(input: &mut &str) -> ModalResult<u32> {
    opt(preceded(space1, dec_uint))
        .map(|n| n.unwrap_or(1))
        .parse_next(input)
}

fn link(input: &mut &str) -> ModalResult<Command> {
    preceded(
        ("link", space1),
        alt(("down".value(false), "up".value(true))),
    )
    .map(|up| Command::Link { up })
    .parse_next(input)
}

fn publish(input: &mut &str) -> ModalResult<Command> {
    preceded(("publish", space1, "fail"), count)
        .map(Command::FailPublishes)
        .parse_next(input)
}

fn session(input: &mut &str) -> ModalResult<Command> {
    preceded(("session", space1, "reject"), count)
        .map(Command::RejectSessions)
        .parse_next(input)
}

fn battery(input: &mut &str) -> ModalResult<Command> {
    preceded(("battery", space1), dec_uint)
        .map(|millivolts| Command::Battery { millivolts })
        .parse_next(input)
}

fn word(input: &mut &str) -> ModalResult<String> {
    take_while(1.., |c: char| !c.is_whitespace())
        .map(str::to_owned)
        .parse_next(input)
}

fn update(input: &mut &str) -> ModalResult<Command> {
    let kind = preceded(
        ("update", space1),
        alt((
            "app".value(ImageKind::Application),
            "fs".value(ImageKind::Filesystem),
        )),
    )
    .parse_next(input)?;
    let size = preceded(space1, dec_uint).parse_next(input)?;
    let password = opt(preceded(space1, word)).parse_next(input)?;
    Ok(Command::Update {
        kind,
        size,
        password,
    })
}

fn help(input: &mut &str) -> ModalResult<Command> {
    preceded("help", opt(preceded(space1, word)))
        .map(Command::Help)
        .parse_next(input)
}

pub fn help_text(topic: Option<&str>) -> Vec<String> {
    match topic {
        Some(topic) => HELP_TOPICS
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(topic))
            .map_or_else(
                || vec![format!("no help for `{topic}`")],
                |(_, text)| vec![(*text).to_owned()],
            ),
        None => HELP_TOPICS
            .iter()
            .map(|(_, text)| (*text).to_owned())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presses_and_status() {
        assert_eq!(parse("short"), Ok(Command::ShortPress));
        assert_eq!(parse("  long  "), Ok(Command::LongPress));
        assert_eq!(parse("status"), Ok(Command::Status));
        assert_eq!(parse("exit"), Ok(Command::Quit));
    }

    #[test]
    fn counts_default_to_one() {
        assert_eq!(parse("publish fail"), Ok(Command::FailPublishes(1)));
        assert_eq!(parse("publish fail 4"), Ok(Command::FailPublishes(4)));
        assert_eq!(parse("session reject 2"), Ok(Command::RejectSessions(2)));
    }

    #[test]
    fn link_and_battery() {
        assert_eq!(parse("link down"), Ok(Command::Link { up: false }));
        assert_eq!(parse("link up"), Ok(Command::Link { up: true }));
        assert_eq!(
            parse("battery 3700"),
            Ok(Command::Battery { millivolts: 3700 })
        );
        assert!(parse("link sideways").is_err());
        assert!(parse("battery").is_err());
    }

    #[test]
    fn update_takes_optional_password() {
        assert_eq!(
            parse("update app 4096"),
            Ok(Command::Update {
                kind: ImageKind::Application,
                size: 4096,
                password: None,
            })
        );
        assert_eq!(
            parse("update fs 512 wrong"),
            Ok(Command::Update {
                kind: ImageKind::Filesystem,
                size: 512,
                password: Some("wrong".to_owned()),
            })
        );
        assert!(parse("update firmware 10").is_err());
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let error = parse("short now").unwrap_err();
        assert_eq!(error.input, "short now");
        assert!(error.to_string().contains("help"));
    }

    #[test]
    fn help_lists_every_topic_or_one() {
        assert_eq!(help_text(None).len(), HELP_TOPICS.len());
        assert_eq!(parse("help link"), Ok(Command::Help(Some("link".to_owned()))));
        assert!(help_text(Some("link"))[0].starts_with("link down|up"));
        assert!(help_text(Some("nope"))[0].contains("no help"));
    }
}
