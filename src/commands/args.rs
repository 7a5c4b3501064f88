//! Command argument parsing.
//!
//! The text after the command name is split into whitespace-separated
//! tokens, where `"double quoted"` text forms a single token. Tokens are
//! bound to the command's declared arguments by position and converted to
//! their declared type. Tokens beyond the declared arguments are ignored.
//!
//! [`ArgumentError`]'s `Display` output is sent verbatim to the player who
//! typed the command, so it reads as a sentence, not a log line.

use crate::event::PlayerRef;
use crate::model::{ArgumentType, ArgumentValue, CommandArgument};
use std::collections::BTreeMap;
use thiserror::Error;

/// Most candidates listed in an ambiguous player error
const MAX_LISTED_CANDIDATES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgumentError {
    #[error("The value for \"{name}\" should be a number. Please correct it and try again.")]
    NotANumber { name: String },

    #[error("The value for \"{name}\" should be true or false. Please correct it and try again.")]
    NotABoolean { name: String },

    #[error("Missing a value for \"{name}\". Please correct it and try again.")]
    Missing { name: String },

    #[error("No player found with the name or ID \"{query}\".")]
    PlayerNotFound { query: String },

    #[error("Multiple players found with the name \"{query}\": {candidates}. Please be more specific.")]
    AmbiguousPlayer { query: String, candidates: String },
}

/// Split argument text into tokens, honouring double quotes.
///
/// ```
/// use hookline::commands::args::tokenize;
///
/// assert_eq!(tokenize(r#""test test" true"#), vec!["test test", "true"]);
/// ```
pub fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    // Distinguishes `""` (an empty token) from no token at all.
    let mut started = false;

    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                started = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if started {
                    tokens.push(std::mem::take(&mut current));
                    started = false;
                }
            }
            c => {
                current.push(c);
                started = true;
            }
        }
    }

    if started {
        tokens.push(current);
    }
    tokens
}

/// Resolve a player reference typed in chat against the online players.
///
/// Exact matches on any platform identifier or (case-insensitively) the
/// name win; otherwise the query is matched as a name fragment.
pub fn resolve_player(query: &str, players: &[PlayerRef]) -> Result<PlayerRef, ArgumentError> {
    let needle = query.to_lowercase();

    let exact: Vec<&PlayerRef> = players
        .iter()
        .filter(|p| {
            p.name.to_lowercase() == needle
                || p.identifiers().any(|id| id.eq_ignore_ascii_case(query))
        })
        .collect();

    let candidates = if exact.is_empty() {
        players
            .iter()
            .filter(|p| p.name.to_lowercase().contains(&needle))
            .collect()
    } else {
        exact
    };

    match candidates.as_slice() {
        [] => Err(ArgumentError::PlayerNotFound {
            query: query.to_string(),
        }),
        [single] => Ok((*single).clone()),
        many => Err(ArgumentError::AmbiguousPlayer {
            query: query.to_string(),
            candidates: many
                .iter()
                .take(MAX_LISTED_CANDIDATES)
                .map(|p| p.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        }),
    }
}

fn convert(
    arg: &CommandArgument,
    raw: &str,
    players: &[PlayerRef],
) -> Result<ArgumentValue, ArgumentError> {
    match arg.arg_type {
        ArgumentType::String => Ok(ArgumentValue::String(raw.to_string())),
        ArgumentType::Number => raw
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .map(ArgumentValue::Number)
            .ok_or_else(|| ArgumentError::NotANumber {
                name: arg.name.clone(),
            }),
        ArgumentType::Boolean => match raw.trim().to_lowercase().as_str() {
            "true" => Ok(ArgumentValue::Boolean(true)),
            "false" => Ok(ArgumentValue::Boolean(false)),
            _ => Err(ArgumentError::NotABoolean {
                name: arg.name.clone(),
            }),
        },
        ArgumentType::Player => resolve_player(raw, players).map(ArgumentValue::Player),
    }
}

/// Bind `input` to the declared arguments.
///
/// `players` is only consulted for `player` arguments; pass an empty slice
/// when the command declares none.
pub fn parse_arguments(
    declared: &[CommandArgument],
    input: &str,
    players: &[PlayerRef],
) -> Result<BTreeMap<String, ArgumentValue>, ArgumentError> {
    let tokens = tokenize(input);

    let mut ordered: Vec<&CommandArgument> = declared.iter().collect();
    ordered.sort_by_key(|a| a.position);

    let mut values = BTreeMap::new();
    for (index, arg) in ordered.into_iter().enumerate() {
        let raw = match (tokens.get(index), &arg.default_value) {
            (Some(token), _) => token.as_str(),
            (None, Some(default)) => default.as_str(),
            (None, None) => {
                return Err(ArgumentError::Missing {
                    name: arg.name.clone(),
                })
            }
        };
        values.insert(arg.name.clone(), convert(arg, raw, players)?);
    }

    Ok(values)
}

/// Whether any declared argument needs the online player list.
pub fn needs_players(declared: &[CommandArgument]) -> bool {
    declared.iter().any(|a| a.arg_type == ArgumentType::Player)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arg(name: &str, arg_type: ArgumentType, position: u32, default: Option<&str>) -> CommandArgument {
        CommandArgument {
            name: name.to_string(),
            arg_type,
            default_value: default.map(str::to_string),
            position,
            help_text: None,
        }
    }

    fn players() -> Vec<PlayerRef> {
        vec![
            PlayerRef::new("100", "Steve").with_steam_id("76561198000000001"),
            PlayerRef::new("200", "Stella"),
            PlayerRef::new("300", "alex"),
        ]
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("  a   b "), vec!["a", "b"]);
        assert_eq!(tokenize(r#""test""#), vec!["test"]);
        assert_eq!(tokenize(r#"say "" now"#), vec!["say", "", "now"]);
        assert_eq!(tokenize(r#""unterminated quote"#), vec!["unterminated quote"]);
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn test_number_error_message() {
        let declared = vec![arg("test", ArgumentType::Number, 0, None)];

        let err = parse_arguments(&declared, r#""test""#, &[]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "The value for \"test\" should be a number. Please correct it and try again."
        );
    }

    #[test]
    fn test_defaults_fill_missing_trailing_arguments() {
        let declared = vec![
            arg("name", ArgumentType::String, 0, None),
            arg("public", ArgumentType::Boolean, 1, Some("false")),
            arg("number", ArgumentType::Number, 2, Some("42")),
        ];

        let values = parse_arguments(&declared, r#""test""#, &[]).unwrap();
        assert_eq!(values["name"], ArgumentValue::String("test".to_string()));
        assert_eq!(values["public"], ArgumentValue::Boolean(false));
        assert_eq!(values["number"], ArgumentValue::Number(42.0));
    }

    #[test]
    fn test_quoted_argument_and_position_order() {
        let declared = vec![
            arg("public", ArgumentType::Boolean, 1, None),
            arg("name", ArgumentType::String, 0, None),
        ];

        let values = parse_arguments(&declared, r#""test test" TRUE extra"#, &[]).unwrap();
        assert_eq!(values["name"], ArgumentValue::String("test test".to_string()));
        assert_eq!(values["public"], ArgumentValue::Boolean(true));
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_missing_required_argument() {
        let declared = vec![arg("amount", ArgumentType::Number, 0, None)];

        let err = parse_arguments(&declared, "", &[]).unwrap_err();
        assert_eq!(
            err,
            ArgumentError::Missing {
                name: "amount".to_string()
            }
        );
    }

    #[test]
    fn test_player_resolution() {
        let online = players();

        assert_eq!(resolve_player("STEVE", &online).unwrap().game_id, "100");
        assert_eq!(resolve_player("76561198000000001", &online).unwrap().game_id, "100");
        assert_eq!(resolve_player("300", &online).unwrap().name, "alex");
        assert_eq!(resolve_player("ale", &online).unwrap().game_id, "300");
    }

    #[test]
    fn test_player_resolution_errors() {
        let online = players();

        let ambiguous = resolve_player("ste", &online).unwrap_err();
        assert!(ambiguous.to_string().starts_with("Multiple players found"));
        assert!(ambiguous.to_string().contains("Steve, Stella"));

        let missing = resolve_player("nobody", &online).unwrap_err();
        assert!(missing
            .to_string()
            .starts_with("No player found with the name or ID"));
    }

    #[test]
    fn test_needs_players() {
        assert!(!needs_players(&[arg("n", ArgumentType::Number, 0, None)]));
        assert!(needs_players(&[arg("who", ArgumentType::Player, 0, None)]));
    }
}
