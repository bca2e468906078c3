//! Command-Line Tokenizer
//!
//! Splits an interactive command line into arguments: words separated by
//! whitespace, with double-quoted words allowed to contain whitespace and
//! backslash escapes. Used only by the CLI binary; the protocol layer never
//! sees raw command lines.

use std::iter::Peekable;
use std::str::Chars;

/// Errors from splitting a command line.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TokenizeError {
    #[error("unterminated quoted argument")]
    UnterminatedQuote,

    #[error("unsupported escape sequence \\{0}")]
    BadEscape(char),
}

/// Lazy argument iterator over one line of input.
pub struct Tokens<'a> {
    chars: Peekable<Chars<'a>>,
}

/// Returns a lazy iterator over the line's arguments.
pub fn tokens(line: &str) -> Tokens<'_> {
    Tokens {
        chars: line.chars().peekable(),
    }
}

/// Splits the whole line at once.
pub fn tokenize(line: &str) -> Result<Vec<String>, TokenizeError> {
    tokens(line).collect()
}

impl Iterator for Tokens<'_> {
    type Item = Result<String, TokenizeError>;

    fn next(&mut self) -> Option<Self::Item> {
        while matches!(self.chars.peek(), Some(c) if c.is_whitespace()) {
            self.chars.next();
        }
        match self.chars.peek()? {
            '"' => {
                self.chars.next();
                Some(self.quoted())
            }
            _ => Some(Ok(self.bare())),
        }
    }
}

impl Tokens<'_> {
    fn bare(&mut self) -> String {
        let mut word = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() {
                break;
            }
            word.push(c);
            self.chars.next();
        }
        word
    }

    fn quoted(&mut self) -> Result<String, TokenizeError> {
        let mut word = String::new();
        loop {
            match self.chars.next() {
                None => return Err(TokenizeError::UnterminatedQuote),
                Some('"') => return Ok(word),
                Some('\\') => match self.chars.next() {
                    None => return Err(TokenizeError::UnterminatedQuote),
                    Some('"') => word.push('"'),
                    Some('\\') => word.push('\\'),
                    Some('n') => word.push('\n'),
                    Some('r') => word.push('\r'),
                    Some('t') => word.push('\t'),
                    Some(other) => return Err(TokenizeError::BadEscape(other)),
                },
                Some(c) => word.push(c),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_plain_words() {
        assert_eq!(tokenize("set foo bar").unwrap(), ["set", "foo", "bar"]);
    }

    #[test]
    fn collapses_repeated_whitespace() {
        assert_eq!(tokenize("  get \t key  ").unwrap(), ["get", "key"]);
    }

    #[test]
    fn quoted_words_keep_whitespace() {
        assert_eq!(
            tokenize(r#"set greeting "hello world""#).unwrap(),
            ["set", "greeting", "hello world"]
        );
    }

    #[test]
    fn escapes_inside_quotes() {
        assert_eq!(
            tokenize(r#"echo "a \"b\" \\ c\n""#).unwrap(),
            ["echo", "a \"b\" \\ c\n"]
        );
    }

    #[test]
    fn empty_line_yields_nothing() {
        assert!(tokenize("").unwrap().is_empty());
        assert!(tokenize("   ").unwrap().is_empty());
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        assert_eq!(
            tokenize(r#"set key "oops"#),
            Err(TokenizeError::UnterminatedQuote)
        );
    }

    #[test]
    fn unknown_escape_is_an_error() {
        assert_eq!(
            tokenize(r#"echo "\q""#),
            Err(TokenizeError::BadEscape('q'))
        );
    }

    #[test]
    fn iteration_is_lazy() {
        let mut args = tokens(r#"first "unterminated"#);
        assert_eq!(args.next(), Some(Ok("first".to_string())));
        assert_eq!(args.next(), Some(Err(TokenizeError::UnterminatedQuote)));
        assert_eq!(args.next(), None);
    }
}
