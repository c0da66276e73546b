//! Quote-aware splitting of command strings into argument lists.
//!
//! Commands are always executed as argument vectors, never through a shell,
//! so quoting only groups words; no expansion or escaping beyond `\"` happens.

use anyhow::{Result, anyhow};

/// Split `input` on whitespace, honoring single and double quotes.
pub fn split_args(input: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars();

    while let Some(ch) = chars.next() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some('"') if ch == '\\' => match chars.next() {
                Some(next) => current.push(next),
                None => return Err(anyhow!("trailing escape in '{input}'")),
            },
            Some(_) => current.push(ch),
            None if ch == '"' || ch == '\'' => {
                quote = Some(ch);
                in_token = true;
            }
            None if ch.is_whitespace() => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(ch);
                in_token = true;
            }
        }
    }

    if let Some(q) = quote {
        return Err(anyhow!("unterminated {q} quote in '{input}'"));
    }
    if in_token {
        args.push(current);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_plain_words() {
        assert_eq!(
            split_args("  status   --short ").expect("split"),
            vec!["status", "--short"]
        );
    }

    #[test]
    fn keeps_quoted_message_together() {
        assert_eq!(
            split_args(r#"commit -m "feat(api): add login""#).expect("split"),
            vec!["commit", "-m", "feat(api): add login"]
        );
        assert_eq!(
            split_args("commit -m 'fix: it''s'").expect("split"),
            vec!["commit", "-m", "fix: its"]
        );
    }

    #[test]
    fn empty_quotes_yield_empty_argument() {
        assert_eq!(split_args(r#"log """#).expect("split"), vec!["log", ""]);
    }

    #[test]
    fn escaped_quote_inside_double_quotes() {
        assert_eq!(
            split_args(r#"commit -m "say \"hi\"""#).expect("split"),
            vec!["commit", "-m", r#"say "hi""#]
        );
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        assert!(split_args(r#"commit -m "oops"#).is_err());
    }
}
