//! Raw line cleanup and SMTP command parsing.

/// Recognized SMTP verbs, plus `Unknown` for everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Helo,
    Ehlo,
    MailFrom,
    RcptTo,
    Data,
    Rset,
    Quit,
    Vrfy,
    Expn,
    Help,
    Noop,
    Unknown,
}

// Keyword table, matched in order against the upper-cased line.
const VERBS: &[(Command, &str)] = &[
    (Command::Helo, "HELO"),
    (Command::Ehlo, "EHLO"),
    (Command::MailFrom, "MAIL FROM:"),
    (Command::RcptTo, "RCPT TO:"),
    (Command::Data, "DATA"),
    (Command::Rset, "RSET"),
    (Command::Quit, "QUIT"),
    (Command::Vrfy, "VRFY"),
    (Command::Expn, "EXPN"),
    (Command::Help, "HELP"),
    (Command::Noop, "NOOP"),
];

impl Command {
    /// Matches a raw command line against the verb table. Matching is
    /// case-insensitive and prefix-based, so `MAIL FROM:<x>` resolves
    /// without a space after the colon.
    pub fn from_line(line: &str) -> Command {
        let upper = line.to_uppercase();
        for (cmd, verb) in VERBS {
            if upper.starts_with(verb) {
                return *cmd;
            }
        }
        Command::Unknown
    }

    /// True for the colon-form verbs (`MAIL FROM:`, `RCPT TO:`).
    fn uses_colon(&self) -> bool {
        matches!(self, Command::MailFrom | Command::RcptTo)
    }
}

/// Space-separated list of the supported verb keywords, for HELP.
pub fn help_verbs() -> String {
    VERBS
        .iter()
        .map(|(_, verb)| verb.split(' ').next().unwrap_or(verb))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A command line split into verb and optional argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    pub verb: String,
    pub arg: Option<String>,
}

/// Cleans a raw line: trims, turns control characters and non-space
/// whitespace into spaces, collapses runs of spaces, trims again.
pub fn clean_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_space = true;
    for ch in input.trim().chars() {
        let ch = if (ch.is_whitespace() || ch.is_control()) && ch != ' ' {
            ' '
        } else {
            ch
        };
        if ch == ' ' {
            if last_was_space {
                continue;
            }
            last_was_space = true;
        } else {
            last_was_space = false;
        }
        out.push(ch);
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Splits a command line into verb and argument. Colon-form commands are
/// split at the first `:`, everything else at the first space. A missing
/// or empty argument yields `None`.
pub fn parse_line(cmd: Command, raw: &str) -> ParsedLine {
    let split_at = if cmd.uses_colon() {
        raw.find(':')
    } else {
        raw.find(' ')
    };
    match split_at {
        Some(pos) => {
            let verb = clean_line(&raw[..pos]).to_uppercase();
            let arg = clean_line(&raw[pos + 1..]);
            ParsedLine {
                verb,
                arg: if arg.is_empty() { None } else { Some(arg) },
            }
        }
        None => ParsedLine {
            verb: clean_line(raw).to_uppercase(),
            arg: None,
        },
    }
}
