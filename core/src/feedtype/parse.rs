//! Feedtype expression parsing.
//!
//! Configuration files name feedtypes with `|` unions and `-` differences,
//! evaluated left to right: `WMO|CONDUIT-IDS`.

use super::{Feedtype, FeedtypeError, FeedtypeTable};

/// Parses a feedtype expression against `table`, producing a plain mask.
pub fn parse_feedtype(table: &FeedtypeTable, expr: &str) -> Result<Feedtype, FeedtypeError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(FeedtypeError::BadExpression(expr.to_string()));
    }

    let mut result = Feedtype(0);
    let mut op = '|';
    let mut rest = expr;
    loop {
        let term_end = rest
            .find(|c| c == '|' || c == '-')
            .unwrap_or(rest.len());
        let (term, tail) = rest.split_at(term_end);
        let term = term.trim();
        if term.is_empty() {
            return Err(FeedtypeError::BadExpression(expr.to_string()));
        }
        let mask = table.mask_of(&table.lookup(term)?);
        result = match op {
            '|' => result | mask,
            _ => result & !mask,
        };
        if tail.is_empty() {
            return Ok(result);
        }
        op = tail.chars().next().unwrap();
        rest = &tail[1..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedtype::builtin_table;

    #[test]
    fn parse_single_name() {
        let t = builtin_table();
        assert_eq!(parse_feedtype(&t, "IDS").unwrap(), Feedtype(1 << 2));
    }

    #[test]
    fn parse_union() {
        let t = builtin_table();
        assert_eq!(
            parse_feedtype(&t, "IDS|DDPLUS").unwrap(),
            Feedtype(0b111)
        );
    }

    #[test]
    fn parse_difference_left_to_right() {
        let t = builtin_table();
        // WMO = 0b11111; minus IDS (bit 2) leaves 0b11011.
        assert_eq!(parse_feedtype(&t, "WMO-IDS").unwrap(), Feedtype(0b11011));
    }

    #[test]
    fn parse_unknown_name() {
        let t = builtin_table();
        assert!(matches!(
            parse_feedtype(&t, "NOSUCH"),
            Err(FeedtypeError::UnknownName(_))
        ));
    }

    #[test]
    fn parse_empty_term() {
        let t = builtin_table();
        assert!(matches!(
            parse_feedtype(&t, "IDS||DDS"),
            Err(FeedtypeError::BadExpression(_))
        ));
    }
}
