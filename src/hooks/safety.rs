//! Static safety check for hook patterns.
//!
//! Patterns are checked once when a hook is created or updated. The check
//! rejects shapes that explode on backtracking engines: nested unbounded
//! repetition (star height above one) and patterns with an excessive number
//! of repetitions. Matching later trusts the stored pattern and applies no
//! timeout.

use crate::error::EngineError;
use regex::RegexBuilder;
use regex_syntax::ast::{parse::Parser, Ast, RepetitionKind, RepetitionRange};

/// Longest pattern accepted for a hook
pub const MAX_PATTERN_LEN: usize = 512;

/// Upper bound on repetition operators in a single pattern
const MAX_REPETITIONS: usize = 25;

/// Compiled program size limit (bytes)
const COMPILED_SIZE_LIMIT: usize = 1 << 20;

/// Validate a hook pattern, returning `InvalidTrigger` with the reason.
///
/// # Examples
///
/// ```
/// use hookline::hooks::safety::check_pattern;
///
/// assert!(check_pattern("^/tp (\\w+)$").is_ok());
/// assert!(check_pattern("(a+)+$").is_err());
/// ```
pub fn check_pattern(pattern: &str) -> Result<(), EngineError> {
    if pattern.len() > MAX_PATTERN_LEN {
        return Err(EngineError::InvalidTrigger(format!(
            "pattern is longer than {MAX_PATTERN_LEN} characters"
        )));
    }

    let ast = Parser::new()
        .parse(pattern)
        .map_err(|e| EngineError::InvalidTrigger(format!("pattern does not parse: {e}")))?;

    if star_height(&ast) > 1 {
        return Err(EngineError::InvalidTrigger(format!(
            "pattern '{pattern}' nests unbounded repetition and may backtrack exponentially"
        )));
    }

    if count_repetitions(&ast) > MAX_REPETITIONS {
        return Err(EngineError::InvalidTrigger(format!(
            "pattern uses more than {MAX_REPETITIONS} repetition operators"
        )));
    }

    RegexBuilder::new(pattern)
        .size_limit(COMPILED_SIZE_LIMIT)
        .build()
        .map_err(|e| EngineError::InvalidTrigger(format!("pattern does not compile: {e}")))?;

    Ok(())
}

/// A repetition that can match more than one copy of its operand.
fn is_growing(kind: &RepetitionKind) -> bool {
    match kind {
        RepetitionKind::ZeroOrOne => false,
        RepetitionKind::ZeroOrMore | RepetitionKind::OneOrMore => true,
        RepetitionKind::Range(RepetitionRange::AtLeast(_)) => true,
        RepetitionKind::Range(RepetitionRange::Exactly(n)) => *n > 1,
        RepetitionKind::Range(RepetitionRange::Bounded(_, max)) => *max > 1,
    }
}

fn star_height(ast: &Ast) -> usize {
    match ast {
        Ast::Repetition(rep) => {
            let inner = star_height(&rep.ast);
            if is_growing(&rep.op.kind) {
                inner + 1
            } else {
                inner
            }
        }
        Ast::Group(group) => star_height(&group.ast),
        Ast::Alternation(alt) => alt.asts.iter().map(star_height).max().unwrap_or(0),
        Ast::Concat(concat) => concat.asts.iter().map(star_height).max().unwrap_or(0),
        _ => 0,
    }
}

fn count_repetitions(ast: &Ast) -> usize {
    match ast {
        Ast::Repetition(rep) => 1 + count_repetitions(&rep.ast),
        Ast::Group(group) => count_repetitions(&group.ast),
        Ast::Alternation(alt) => alt.asts.iter().map(count_repetitions).sum(),
        Ast::Concat(concat) => concat.asts.iter().map(count_repetitions).sum(),
        _ => 0,
    }
}
