//! Slash-command and persona parsing for inbound text

use regex::Regex;
use std::sync::OnceLock;

/// Bot commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Status,
    New,
    List,
    /// Raw argument; `None` when missing
    Switch(Option<String>),
    /// Target path; `None` shows the current directory
    Cd(Option<String>),
    Reset,
    ResetChild,
}

/// What an inbound text message asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Command(Command),
    /// Free text for the agent, with an optional one-off persona
    Prompt {
        persona: Option<String>,
        text: String,
    },
    /// Nothing left to send after stripping the persona token
    Empty,
}

/// `/name[@bot] [rest]`
fn slash_token() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)^/([A-Za-z0-9_-]+)(?:@[A-Za-z0-9_]+)?(?:\s+(.*))?$")
            .expect("slash token pattern is valid")
    })
}

fn argument(rest: Option<&str>) -> Option<String> {
    rest.map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
}

/// Classify inbound text against the command set and persona names
///
/// Unknown slash words are not commands; they go to the agent verbatim.
pub fn parse(text: &str, personas: &[String]) -> Inbound {
    if let Some(caps) = slash_token().captures(text) {
        let name = caps.get(1).map_or("", |m| m.as_str());
        let rest = caps.get(2).map(|m| m.as_str());

        let command = match name {
            "start" => Some(Command::Start),
            "help" => Some(Command::Help),
            "status" => Some(Command::Status),
            "new" => Some(Command::New),
            "list" => Some(Command::List),
            "switch" => Some(Command::Switch(argument(rest))),
            "cd" => Some(Command::Cd(argument(rest))),
            "reset" => Some(Command::Reset),
            "reset_child" | "reset-child" => Some(Command::ResetChild),
            _ => None,
        };
        if let Some(command) = command {
            return Inbound::Command(command);
        }

        if personas.iter().any(|p| p == name) {
            return match argument(rest) {
                Some(text) => Inbound::Prompt {
                    persona: Some(name.to_string()),
                    text,
                },
                None => Inbound::Empty,
            };
        }
    }

    if text.trim().is_empty() {
        return Inbound::Empty;
    }
    Inbound::Prompt {
        persona: None,
        text: text.to_string(),
    }
}
