//! Interactive operator commands and the GUI `COMMAND` translation layer
//! share the same parsed command type, so a GUI-issued `{command,args}`
//! maps onto exactly the same dispatch as a typed CLI line.

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Status,
    Peers,
    Network,
    Discover,
    Start {
        topic: String,
        allowed_choices: Option<Vec<String>>,
        voting_time_seconds: Option<u64>,
    },
    Vote {
        choice: String,
    },
    Results,
    Verify,
    Debug,
    CheckDuplicates,
    Whoami,
    GuiInfo,
    Quit,
}

/// Parse one CLI line (`command args...`) or a GUI `COMMAND{command, args}`
/// frame's equivalent `(command, args)` pair.
pub fn parse(command: &str, args: &[String]) -> Result<Command> {
    match command.to_ascii_lowercase().as_str() {
        "help" => Ok(Command::Help),
        "status" => Ok(Command::Status),
        "peers" => Ok(Command::Peers),
        "network" | "topology" => Ok(Command::Network),
        "discover" | "find-peers" => Ok(Command::Discover),
        "start" => Ok(parse_start(args)),
        "vote" => {
            let choice = args
                .first()
                .ok_or_else(|| Error::Policy("vote requires a choice".into()))?;
            Ok(Command::Vote {
                choice: choice.clone(),
            })
        }
        "results" => Ok(Command::Results),
        "verify" => Ok(Command::Verify),
        "debug" => Ok(Command::Debug),
        "check-duplicates" | "validate" => Ok(Command::CheckDuplicates),
        "whoami" | "info" => Ok(Command::Whoami),
        "gui-info" => Ok(Command::GuiInfo),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(Error::Policy(format!("unknown command '{other}'"))),
    }
}

/// Split a raw CLI line into `(command, args)`.
pub fn split_line(line: &str) -> Option<(String, Vec<String>)> {
    let mut parts = line.split_whitespace();
    let command = parts.next()?.to_string();
    let args = parts.map(|s| s.to_string()).collect();
    Some((command, args))
}

/// `start` argument grammar: the final argument is `seconds` iff it parses
/// as a bare integer; then the next-last is `allowedChoices` iff it
/// contains a comma; everything else, joined by spaces, is the topic.
fn parse_start(args: &[String]) -> Command {
    let mut rest = args.to_vec();

    let voting_time_seconds = match rest.last().and_then(|s| s.parse::<u64>().ok()) {
        Some(seconds) => {
            rest.pop();
            Some(seconds)
        }
        None => None,
    };

    let allowed_choices = match rest.last() {
        Some(last) if last.contains(',') => {
            let choices = last
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect::<Vec<_>>();
            rest.pop();
            Some(choices)
        }
        _ => None,
    };

    Command::Start {
        topic: rest.join(" "),
        allowed_choices,
        voting_time_seconds,
    }
}

pub const HELP_TEXT: &str = "\
help                           show this message
status                         this node's round/mesh status
peers                          list known peers
network | topology             mesh connectivity summary
discover | find-peers          trigger a discovery beacon sweep
start <topic> [choices] [secs] start a voting round
vote <choice>                  cast a ballot in the active round
results                        show the current/last tally
verify                         self-verify the local ballot's inclusion
debug                          dump internal round/mesh state
check-duplicates | validate    re-run the startup duplicate probe
whoami | info                  this node's identity
gui-info                       observer connection info
quit | exit                    shut down this node";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_with_choices_and_seconds() {
        let args = vec!["x".to_string(), "yes,no".to_string(), "60".to_string()];
        match parse_start(&args) {
            Command::Start {
                topic,
                allowed_choices,
                voting_time_seconds,
            } => {
                assert_eq!(topic, "x");
                assert_eq!(allowed_choices, Some(vec!["yes".to_string(), "no".to_string()]));
                assert_eq!(voting_time_seconds, Some(60));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn start_with_multi_word_topic_and_seconds_only() {
        let args = vec!["Q".to_string(), "120".to_string()];
        match parse_start(&args) {
            Command::Start {
                topic,
                allowed_choices,
                voting_time_seconds,
            } => {
                assert_eq!(topic, "Q");
                assert_eq!(allowed_choices, None);
                assert_eq!(voting_time_seconds, Some(120));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn start_with_no_trailing_integer_or_comma_is_all_topic() {
        let args = vec!["Deploy".to_string(), "tonight".to_string()];
        match parse_start(&args) {
            Command::Start {
                topic,
                allowed_choices,
                voting_time_seconds,
            } => {
                assert_eq!(topic, "Deploy tonight");
                assert_eq!(allowed_choices, None);
                assert_eq!(voting_time_seconds, None);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_command_is_a_policy_error() {
        assert!(parse("frobnicate", &[]).is_err());
    }

    #[test]
    fn split_line_handles_extra_whitespace() {
        let (cmd, args) = split_line("  start   Deploy?  yes,no   40 ").unwrap();
        assert_eq!(cmd, "start");
        assert_eq!(args, vec!["Deploy?", "yes,no", "40"]);
    }
}
