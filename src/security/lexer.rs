//! SQL Lexer
//!
//! Conservative lexical scanner used by the guardrail. It is not a parser:
//! it only knows enough about Postgres lexical structure (literals, quoted
//! identifiers, nested comments) to make keyword, relation and LIMIT
//! scanning unambiguous. Anything it cannot classify with certainty is
//! reported as an error instead of guessed.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LexError {
    #[error("unterminated string literal")]
    UnterminatedLiteral,

    #[error("unterminated quoted identifier")]
    UnterminatedIdentifier,

    #[error("unterminated block comment")]
    UnterminatedComment,

    #[error("dollar-quoted strings and positional parameters are not supported")]
    DollarSign,

    #[error("backslash escapes are not supported inside literals")]
    Backslash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Bare word, lowercased.
    Word(String),
    /// Content of a double-quoted identifier, case preserved.
    Quoted(String),
    /// Content of a single-quoted string literal.
    Literal(String),
    Number(String),
    Symbol(char),
}

impl Token {
    pub fn is_word(&self, word: &str) -> bool {
        matches!(self, Token::Word(w) if w == word)
    }

    pub fn is_symbol(&self, symbol: char) -> bool {
        matches!(self, Token::Symbol(c) if *c == symbol)
    }
}

/// Strips comments and collapses whitespace outside literals.
/// Literal and quoted-identifier contents are copied verbatim.
pub fn normalize(raw: &str) -> Result<String, LexError> {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '-' if next == Some('-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                push_space(&mut out);
            }
            '/' if next == Some('*') => {
                i = skip_block_comment(&chars, i)?;
                push_space(&mut out);
                continue;
            }
            '\'' => {
                i = copy_quoted(&chars, i, '\'', &mut out).ok_or(LexError::UnterminatedLiteral)??;
                continue;
            }
            '"' => {
                i = copy_quoted(&chars, i, '"', &mut out).ok_or(LexError::UnterminatedIdentifier)??;
                continue;
            }
            '$' => return Err(LexError::DollarSign),
            c if c.is_whitespace() => push_space(&mut out),
            c => out.push(c),
        }
        i += 1;
    }

    Ok(out.trim().to_string())
}

fn push_space(out: &mut String) {
    if !out.is_empty() && !out.ends_with(' ') {
        out.push(' ');
    }
}

/// Returns the index just past the comment. Block comments nest in Postgres.
fn skip_block_comment(chars: &[char], start: usize) -> Result<usize, LexError> {
    let mut depth = 0usize;
    let mut i = start;
    while i < chars.len() {
        match (chars[i], chars.get(i + 1).copied()) {
            ('/', Some('*')) => {
                depth += 1;
                i += 2;
            }
            ('*', Some('/')) => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return Ok(i);
                }
            }
            _ => i += 1,
        }
    }
    Err(LexError::UnterminatedComment)
}

/// Copies a quoted run including its delimiters. Returns `None` when the
/// closing quote is missing. A doubled quote is an escaped quote.
fn copy_quoted(
    chars: &[char],
    start: usize,
    quote: char,
    out: &mut String,
) -> Option<Result<usize, LexError>> {
    out.push(quote);
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            return Some(Err(LexError::Backslash));
        }
        out.push(c);
        if c == quote {
            if chars.get(i + 1) == Some(&quote) {
                out.push(quote);
                i += 2;
                continue;
            }
            return Some(Ok(i + 1));
        }
        i += 1;
    }
    None
}

/// Tokenizes normalized SQL. Input must come from [`normalize`], so
/// literals are known to be terminated.
pub fn tokenize(sql: &str) -> Vec<Token> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '\'' || c == '"' {
            let (content, next) = read_quoted(&chars, i, c);
            tokens.push(if c == '\'' {
                Token::Literal(content)
            } else {
                Token::Quoted(content)
            });
            i = next;
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && is_word_char(chars[i]) {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            tokens.push(Token::Word(word.to_lowercase()));
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (is_word_char(chars[i]) || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token::Number(chars[start..i].iter().collect()));
        } else {
            tokens.push(Token::Symbol(c));
            i += 1;
        }
    }

    tokens
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn read_quoted(chars: &[char], start: usize, quote: char) -> (String, usize) {
    let mut content = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                content.push(quote);
                i += 2;
                continue;
            }
            return (content, i + 1);
        }
        content.push(chars[i]);
        i += 1;
    }
    (content, i)
}

/// Number of non-empty statements in `sql`, splitting on semicolons that
/// sit outside literals and comments.
pub fn statement_count(sql: &str) -> usize {
    match normalize(sql) {
        Ok(normalized) => tokenize(&normalized)
            .split(|t| t.is_symbol(';'))
            .filter(|segment| !segment.is_empty())
            .count(),
        Err(_) => sql.split(';').filter(|s| !s.trim().is_empty()).count(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_whitespace_and_comments() {
        let sql = "SELECT  a,\n\tb -- trailing note\nFROM /* c */ v";
        assert_eq!(normalize(sql).unwrap(), "SELECT a, b FROM v");
    }

    #[test]
    fn test_normalize_keeps_literal_spacing() {
        assert_eq!(normalize("SELECT 'a  b'").unwrap(), "SELECT 'a  b'");
        assert_eq!(normalize("SELECT 'it''s'").unwrap(), "SELECT 'it''s'");
    }

    #[test]
    fn test_nested_block_comment_hides_inner_text() {
        let sql = "SELECT a FROM v /* outer /* inner */ LIMIT 5 */";
        assert_eq!(normalize(sql).unwrap(), "SELECT a FROM v");
    }

    #[test]
    fn test_rejects_ambiguous_lexemes() {
        assert_eq!(normalize("SELECT 'abc"), Err(LexError::UnterminatedLiteral));
        assert_eq!(normalize("SELECT \"abc"), Err(LexError::UnterminatedIdentifier));
        assert_eq!(normalize("SELECT 1 /* x"), Err(LexError::UnterminatedComment));
        assert_eq!(normalize("SELECT $$x$$"), Err(LexError::DollarSign));
        assert_eq!(normalize("SELECT E'\\''"), Err(LexError::Backslash));
    }

    #[test]
    fn test_tokenize() {
        let tokens = tokenize("SELECT count(*) FROM \"V\".x WHERE n = 'a;b' LIMIT 10");
        assert_eq!(tokens[0], Token::Word("select".into()));
        assert!(tokens.contains(&Token::Quoted("V".into())));
        assert!(tokens.contains(&Token::Literal("a;b".into())));
        assert_eq!(tokens.last(), Some(&Token::Number("10".into())));
    }

    #[test]
    fn test_statement_count_ignores_literal_semicolons() {
        assert_eq!(statement_count("SELECT ';' FROM v;"), 1);
        assert_eq!(statement_count("SELECT 1; SELECT 2"), 2);
        assert_eq!(statement_count("-- only a comment"), 0);
    }
}
