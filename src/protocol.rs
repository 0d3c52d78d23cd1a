//! Session command parser and response lines.
//!
//! Implements parsing for the line protocol commands:
//! - Information: help, status, list, who, uptime, about, ping
//! - Transfer: get <file>, or a bare file name
//! - Session: exit
//!
//! Verbs are case-insensitive. Anything that is not a known command is
//! returned as `Command::Other` so the session can try it as a file name.

/// Parsed session command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Status,
    List,
    /// Transfer a named file
    Get { name: String },
    Ping,
    Who,
    Uptime,
    About,
    Exit,
    /// Unrecognized input, kept verbatim
    Other(String),
}

impl Command {
    /// Parse one trimmed command line.
    pub fn parse(line: &str) -> Command {
        let line = line.trim();
        let lower = line.to_lowercase();

        match lower.as_str() {
            "help" => return Command::Help,
            "status" => return Command::Status,
            "list" => return Command::List,
            "ping" => return Command::Ping,
            "who" => return Command::Who,
            "uptime" => return Command::Uptime,
            "about" => return Command::About,
            "exit" => return Command::Exit,
            _ => {}
        }

        // `get` needs an argument; a bare `get` falls through as ordinary input.
        let mut parts = line.splitn(2, char::is_whitespace);
        if let (Some(verb), Some(rest)) = (parts.next(), parts.next()) {
            let name = rest.trim();
            if verb.eq_ignore_ascii_case("get") && !name.is_empty() {
                return Command::Get {
                    name: name.to_string(),
                };
            }
        }

        Command::Other(line.to_string())
    }
}

/// Response line builders
pub struct Response;

impl Response {
    pub const HELP: &'static str =
        "CMDS: help | status | list | get <file> | <filename> | ping | who | uptime | about | exit";
    pub const PONG: &'static str = "PONG";
    pub const BYE: &'static str = "BYE";
    pub const SERVER_FULL: &'static str = "SERVER FULL";
    pub const STATUS_BEGIN: &'static str = "STATUS BEGIN";
    pub const STATUS_END: &'static str = "STATUS END";
    pub const FILES_BEGIN: &'static str = "FILES BEGIN";
    pub const FILES_END: &'static str = "FILES END";

    pub fn greeting(name: &str) -> String {
        format!("NAME {}", name)
    }

    pub fn welcome(name: &str, version: &str) -> String {
        format!("WELCOME {} | SERVER v{}", name, version)
    }

    /// `WHO` line from sorted active names
    pub fn who<I, S>(names: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = names
            .into_iter()
            .map(|n| n.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        if joined.is_empty() {
            "WHO <none>".to_string()
        } else {
            format!("WHO {}", joined)
        }
    }

    pub fn uptime(seconds: u64) -> String {
        format!("UPTIME {}s", seconds)
    }

    pub fn about(team: &str, version: &str) -> String {
        format!("ABOUT Team: {} | Version: {}", team, version)
    }

    pub fn ack(input: &str) -> String {
        format!("{} ACK", input)
    }

    pub fn warn(msg: &str) -> String {
        format!("WARN {}", msg)
    }

    pub fn error(msg: &str) -> String {
        format!("ERR {}", msg)
    }
}

/// Extract the claimed name from a `NAME <claimed>` handshake line.
pub fn parse_handshake(line: &str) -> Option<&str> {
    let claimed = line.strip_prefix("NAME ")?.trim();
    if claimed.is_empty() {
        None
    } else {
        Some(claimed)
    }
}
