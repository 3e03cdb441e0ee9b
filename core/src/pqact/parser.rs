//! Pattern-action file parsing.
//!
//! Lines are tab-separated: `feedtype<TAB>pattern<TAB>action<TAB>args`.
//! A line beginning with whitespace continues the previous line (joined
//! with a single tab); `#` comments run to end of line; blank lines are
//! ignored. Runs of tabs count as one separator. Everything after the
//! action keyword is the action's template string, expanded per product.

use std::fs;
use std::path::Path;

use thiserror::Error;

use super::{ActionKind, Rule, RuleTable};
use crate::class::Pattern;
use crate::feedtype::{parse_feedtype, FeedtypeTable};

/// The fallback pattern: its rule fires only when nothing above matched.
pub const ELSE_PATTERN: &str = "^_ELSE_$";

/// Flag token that marks a rule for removal on permanent action failure.
const TRANSIENT_FLAG: &str = "-transient";

#[derive(Error, Debug)]
pub enum PqactFileError {
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: String,
        source: std::io::Error,
    },

    #[error("line {line}: {reason}")]
    BadRule { line: usize, reason: String },
}

fn bad(line: usize, reason: impl Into<String>) -> PqactFileError {
    PqactFileError::BadRule {
        line,
        reason: reason.into(),
    }
}

pub fn parse_pqact_file(
    path: &Path,
    feedtypes: &FeedtypeTable,
) -> Result<RuleTable, PqactFileError> {
    let text = fs::read_to_string(path).map_err(|source| PqactFileError::Unreadable {
        path: path.display().to_string(),
        source,
    })?;
    parse_pqact_str(&text, feedtypes)
}

pub fn parse_pqact_str(
    text: &str,
    feedtypes: &FeedtypeTable,
) -> Result<RuleTable, PqactFileError> {
    let mut rules = vec![];
    for (lineno, logical) in join_continuations(text) {
        let line = match logical.find('#') {
            Some(at) => logical[..at].to_string(),
            None => logical,
        };
        if line.trim().is_empty() {
            continue;
        }
        rules.push(parse_rule(lineno, &line, feedtypes)?);
    }
    log::info!("pattern-action table: {} rules", rules.len());
    Ok(RuleTable { rules })
}

/// Folds continuation lines (leading whitespace) into their opening line.
/// Yields `(first_line_number, logical_line)` pairs.
fn join_continuations(text: &str) -> Vec<(usize, String)> {
    let mut logical: Vec<(usize, String)> = vec![];
    for (lineno, raw) in text.lines().enumerate() {
        let lineno = lineno + 1;
        let continues = raw.starts_with(|c: char| c == ' ' || c == '\t') && !raw.trim().is_empty();
        match logical.last_mut() {
            Some((_, prev)) if continues => {
                prev.push('\t');
                prev.push_str(raw.trim_start());
            }
            _ => logical.push((lineno, raw.to_string())),
        }
    }
    logical
}

fn parse_rule(
    lineno: usize,
    line: &str,
    feedtypes: &FeedtypeTable,
) -> Result<Rule, PqactFileError> {
    // The first three tab-separated fields are fixed; the rest of the line
    // is the action's template.
    let mut fields = line.split('\t').filter(|f| !f.trim().is_empty());
    let feedtype_field = fields
        .next()
        .ok_or_else(|| bad(lineno, "missing feedtype"))?;
    let pattern_field = fields.next().ok_or_else(|| bad(lineno, "missing pattern"))?;
    let action_field = fields.next().ok_or_else(|| bad(lineno, "missing action"))?;
    let template = fields.collect::<Vec<_>>().join("\t");

    let feedtype = parse_feedtype(feedtypes, feedtype_field.trim())
        .map_err(|err| bad(lineno, err.to_string()))?;
    let pattern_field = pattern_field.trim();
    let pattern =
        Pattern::compile(pattern_field).map_err(|err| bad(lineno, err.to_string()))?;
    let kind = ActionKind::parse(action_field.trim())
        .ok_or_else(|| bad(lineno, format!("unknown action {:?}", action_field.trim())))?;

    let transient = template
        .split_whitespace()
        .any(|token| token == TRANSIENT_FLAG);
    let template = if transient {
        template
            .split_whitespace()
            .filter(|token| *token != TRANSIENT_FLAG)
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        template
    };

    Ok(Rule {
        feedtype,
        pattern,
        kind,
        template,
        transient,
        is_else: pattern_field == ELSE_PATTERN,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedtype::builtin_table;

    #[test]
    fn pqparse_basic_rule() {
        let table = parse_pqact_str(
            "DDS\t^ABCD([0-9]{2})\tfile\t/var/data/(01:yyyy)/(01:mm)/\\1_(seq).txt\n",
            &builtin_table(),
        )
        .unwrap();
        assert_eq!(table.rules.len(), 1);
        let rule = &table.rules[0];
        assert_eq!(rule.kind, ActionKind::File);
        assert!(!rule.is_else);
        assert!(!rule.transient);
        assert_eq!(rule.template, "/var/data/(01:yyyy)/(01:mm)/\\1_(seq).txt");
    }

    #[test]
    fn pqparse_continuation_joins_with_tab() {
        let table = parse_pqact_str(
            "IDS|DDPLUS\t^SAUS\tfile\n\t/data/surface/sa.txt\n",
            &builtin_table(),
        )
        .unwrap();
        assert_eq!(table.rules.len(), 1);
        assert_eq!(table.rules[0].template, "/data/surface/sa.txt");
    }

    #[test]
    fn pqparse_comments_and_blanks() {
        let table = parse_pqact_str(
            "# surface obs\n\nANY\t.*\tnoop\t# trailing note\n",
            &builtin_table(),
        )
        .unwrap();
        assert_eq!(table.rules.len(), 1);
        assert_eq!(table.rules[0].kind, ActionKind::Noop);
    }

    #[test]
    fn pqparse_else_rule_flagged() {
        let table =
            parse_pqact_str("ANY\t^_ELSE_$\tnoop\n", &builtin_table()).unwrap();
        assert!(table.rules[0].is_else);
    }

    #[test]
    fn pqparse_transient_flag_stripped() {
        let table = parse_pqact_str(
            "ANY\t.*\tpipe\t-transient /usr/bin/decoder -v\n",
            &builtin_table(),
        )
        .unwrap();
        assert!(table.rules[0].transient);
        assert_eq!(table.rules[0].template, "/usr/bin/decoder -v");
    }

    #[test]
    fn pqparse_runs_of_tabs_collapse() {
        let table = parse_pqact_str(
            "NMC\t\t^model\t\t\texec\t\t/bin/run-model\n",
            &builtin_table(),
        )
        .unwrap();
        assert_eq!(table.rules[0].kind, ActionKind::Exec);
        assert_eq!(table.rules[0].template, "/bin/run-model");
    }

    #[test]
    fn pqparse_bad_action_rejected() {
        let err = parse_pqact_str("ANY\t.*\tfrobnicate\targ\n", &builtin_table()).unwrap_err();
        assert!(err.to_string().contains("frobnicate"));
    }

    #[test]
    fn pqparse_bad_regex_rejected() {
        assert!(parse_pqact_str("ANY\t([bad\tnoop\n", &builtin_table()).is_err());
    }

    #[test]
    fn pqparse_idempotent() {
        let text = "DDS\t^SA\tfile\t/d/sa.txt\nANY\t^_ELSE_$\tnoop\n";
        let once = parse_pqact_str(text, &builtin_table()).unwrap();
        let twice = parse_pqact_str(text, &builtin_table()).unwrap();
        assert_eq!(once.rules.len(), twice.rules.len());
        for (a, b) in once.rules.iter().zip(twice.rules.iter()) {
            assert_eq!(a.pattern.source(), b.pattern.source());
            assert_eq!(a.template, b.template);
            assert_eq!(a.kind, b.kind);
        }
    }
}
