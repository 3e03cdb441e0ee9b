//! Small shared helpers.

/// Splits on whitespace, honoring double-quoted substrings: the quotes are
/// stripped and the quoted text (whitespace included) becomes one token.
pub fn tokenize_quoted(s: &str) -> Vec<String> {
    let mut tokens = vec![];
    let mut current = String::new();
    let mut in_quotes = false;
    let mut pending = false;
    for c in s.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                pending = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if pending {
                    tokens.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if pending {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn util_tokenize_plain() {
        assert_eq!(
            tokenize_quoted("a bb  ccc"),
            vec!["a".to_string(), "bb".to_string(), "ccc".to_string()]
        );
    }

    #[test]
    fn util_tokenize_quotes_preserve_whitespace() {
        assert_eq!(
            tokenize_quoted(r#"write "/data/two words.txt" -close"#),
            vec![
                "write".to_string(),
                "/data/two words.txt".to_string(),
                "-close".to_string()
            ]
        );
    }

    #[test]
    fn util_tokenize_empty_quoted_token() {
        assert_eq!(tokenize_quoted(r#"a "" b"#), vec!["a", "", "b"]);
    }

    #[test]
    fn util_tokenize_blank() {
        assert!(tokenize_quoted("   ").is_empty());
    }
}
