//! Operator commands typed into a running session.

use anyhow::{anyhow, bail, Context, Result};
use shared::domain::{CallKey, ResourceKey, ResourceType};

pub const HELP: &str = "commands:
  dispatch <type> <qty> <county>/<city> -> <county>/<city>
  select <county>/<city> | clear
  queue
  interval <secs> | autofetch on|off
  stop | quit";

#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    Dispatch {
        source: ResourceKey,
        target: CallKey,
        quantity: i64,
    },
    Select(CallKey),
    ClearSelection,
    ShowQueue,
    AutoFetchInterval(u64),
    AutoFetchEnabled(bool),
    Stop,
    Quit,
    Help,
}

pub fn parse_command(line: &str) -> Result<OperatorCommand> {
    let line = line.trim();
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();

    let command = match verb.to_ascii_lowercase().as_str() {
        "dispatch" | "d" => parse_dispatch(rest)?,
        "select" => OperatorCommand::Select(parse_location(rest)?),
        "clear" => OperatorCommand::ClearSelection,
        "queue" | "q" => OperatorCommand::ShowQueue,
        "interval" => OperatorCommand::AutoFetchInterval(
            rest.parse()
                .with_context(|| format!("interval expects whole seconds, got '{rest}'"))?,
        ),
        "autofetch" => match rest.to_ascii_lowercase().as_str() {
            "on" => OperatorCommand::AutoFetchEnabled(true),
            "off" => OperatorCommand::AutoFetchEnabled(false),
            other => bail!("autofetch expects on or off, got '{other}'"),
        },
        "stop" => OperatorCommand::Stop,
        "quit" | "exit" => OperatorCommand::Quit,
        "help" | "?" => OperatorCommand::Help,
        "" => bail!("empty command"),
        other => bail!("unknown command '{other}'"),
    };
    Ok(command)
}

fn parse_dispatch(rest: &str) -> Result<OperatorCommand> {
    let (head, target) = rest
        .split_once("->")
        .ok_or_else(|| anyhow!("dispatch expects '<source> -> <target>'"))?;
    let mut head = head.trim().splitn(3, char::is_whitespace);
    let (Some(kind), Some(quantity), Some(source)) = (head.next(), head.next(), head.next()) else {
        bail!("dispatch expects <type> <qty> <county>/<city> -> <county>/<city>");
    };

    let resource_type: ResourceType = kind.parse()?;
    let quantity: i64 = quantity
        .parse()
        .with_context(|| format!("quantity must be a whole number, got '{quantity}'"))?;
    let source = parse_location(source)?;
    let target = parse_location(target)?;

    Ok(OperatorCommand::Dispatch {
        source: ResourceKey::new(source.city, source.county, resource_type),
        target,
        quantity,
    })
}

/// `County/City`; either part may contain spaces. Empty parts are left for
/// order validation to reject.
fn parse_location(raw: &str) -> Result<CallKey> {
    let (county, city) = raw
        .trim()
        .split_once('/')
        .ok_or_else(|| anyhow!("location must look like County/City, got '{}'", raw.trim()))?;
    Ok(CallKey::new(city.trim(), county.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dispatch_with_spaced_names() {
        let command =
            parse_command("dispatch Fire 3 Cook County/Oak Park -> New York/New York City")
                .expect("parse");
        assert_eq!(
            command,
            OperatorCommand::Dispatch {
                source: ResourceKey::new("Oak Park", "Cook County", ResourceType::Fire),
                target: CallKey::new("New York City", "New York"),
                quantity: 3,
            }
        );
    }

    #[test]
    fn non_positive_quantity_is_left_for_validation() {
        let command = parse_command("d medical -2 A/B -> C/D").expect("parse");
        assert!(matches!(
            command,
            OperatorCommand::Dispatch { quantity: -2, .. }
        ));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse_command("dispatch fire two A/B -> C/D").is_err());
        assert!(parse_command("dispatch hovercraft 1 A/B -> C/D").is_err());
        assert!(parse_command("dispatch fire 1 A/B C/D").is_err());
        assert!(parse_command("select Springfield").is_err());
        assert!(parse_command("autofetch maybe").is_err());
        assert!(parse_command("teleport").is_err());
        assert!(parse_command("   ").is_err());
    }

    #[test]
    fn parses_session_controls() {
        assert_eq!(
            parse_command("select Sangamon/Chatham").expect("parse"),
            OperatorCommand::Select(CallKey::new("Chatham", "Sangamon"))
        );
        assert_eq!(
            parse_command("interval 12").expect("parse"),
            OperatorCommand::AutoFetchInterval(12)
        );
        assert_eq!(
            parse_command("AUTOFETCH off").expect("parse"),
            OperatorCommand::AutoFetchEnabled(false)
        );
        assert_eq!(parse_command("stop").expect("parse"), OperatorCommand::Stop);
        assert_eq!(parse_command("exit").expect("parse"), OperatorCommand::Quit);
    }
}
