//! Tokenizer for conversion scripts

use crate::error::ScriptError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Number(f64),
    Str(String),
    /// Identifier, possibly qualified as `hwInterface.name`
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Bang,
    Question,
    Colon,
    Comma,
    LParen,
    RParen,
    EqEq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    AndAnd,
    OrOr,
}

/// A token and the byte offset it starts at
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Spanned {
    pub token: Token,
    pub position: usize,
}

pub(crate) fn tokenize(source: &str) -> Result<Vec<Spanned>, ScriptError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];
        if c.is_ascii_whitespace() {
            pos += 1;
            continue;
        }

        let start = pos;
        let token = if c.is_ascii_digit() || (c == b'.' && bytes.get(pos + 1).is_some_and(u8::is_ascii_digit)) {
            let (number, end) = lex_number(source, pos)?;
            pos = end;
            Token::Number(number)
        } else if c.is_ascii_alphabetic() || c == b'_' {
            let end = lex_identifier(bytes, pos);
            let ident = source[pos..end].to_string();
            pos = end;
            Token::Ident(ident)
        } else if c == b'"' {
            let close = source[pos + 1..]
                .find('"')
                .ok_or_else(|| syntax(start, "unterminated string literal"))?;
            let text = source[pos + 1..pos + 1 + close].to_string();
            pos += close + 2;
            Token::Str(text)
        } else {
            let next = bytes.get(pos + 1).copied();
            let (token, width) = match (c, next) {
                (b'=', Some(b'=')) => (Token::EqEq, 2),
                (b'!', Some(b'=')) => (Token::NotEq, 2),
                (b'<', Some(b'=')) => (Token::LessEq, 2),
                (b'>', Some(b'=')) => (Token::GreaterEq, 2),
                (b'&', Some(b'&')) => (Token::AndAnd, 2),
                (b'|', Some(b'|')) => (Token::OrOr, 2),
                (b'+', _) => (Token::Plus, 1),
                (b'-', _) => (Token::Minus, 1),
                (b'*', _) => (Token::Star, 1),
                (b'/', _) => (Token::Slash, 1),
                (b'%', _) => (Token::Percent, 1),
                (b'^', _) => (Token::Caret, 1),
                (b'!', _) => (Token::Bang, 1),
                (b'?', _) => (Token::Question, 1),
                (b':', _) => (Token::Colon, 1),
                (b',', _) => (Token::Comma, 1),
                (b'(', _) => (Token::LParen, 1),
                (b')', _) => (Token::RParen, 1),
                (b'<', _) => (Token::Less, 1),
                (b'>', _) => (Token::Greater, 1),
                _ => {
                    let found = source[pos..].chars().next().unwrap_or('?');
                    return Err(syntax(start, format!("unexpected character {found:?}")));
                }
            };
            pos += width;
            token
        };

        tokens.push(Spanned {
            token,
            position: start,
        });
    }

    Ok(tokens)
}

pub(crate) fn syntax(position: usize, message: impl Into<String>) -> ScriptError {
    ScriptError::Syntax {
        position,
        message: message.into(),
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*` joined by single dots
fn lex_identifier(bytes: &[u8], start: usize) -> usize {
    let is_part = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let mut end = start;
    while end < bytes.len() && is_part(bytes[end]) {
        end += 1;
    }
    while end + 1 < bytes.len()
        && bytes[end] == b'.'
        && (bytes[end + 1].is_ascii_alphabetic() || bytes[end + 1] == b'_')
    {
        end += 1;
        while end < bytes.len() && is_part(bytes[end]) {
            end += 1;
        }
    }
    end
}

fn lex_number(source: &str, start: usize) -> Result<(f64, usize), ScriptError> {
    let bytes = source.as_bytes();

    if bytes[start] == b'0' && matches!(bytes.get(start + 1), Some(b'x') | Some(b'X')) {
        let mut end = start + 2;
        while end < bytes.len() && bytes[end].is_ascii_hexdigit() {
            end += 1;
        }
        let value = u64::from_str_radix(&source[start + 2..end], 16)
            .map_err(|_| syntax(start, "invalid hexadecimal literal"))?;
        return Ok((value as f64, end));
    }

    let mut end = start;
    while end < bytes.len() && (bytes[end].is_ascii_digit() || bytes[end] == b'.') {
        end += 1;
    }
    if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut exponent = end + 1;
        if exponent < bytes.len() && matches!(bytes[exponent], b'+' | b'-') {
            exponent += 1;
        }
        if exponent < bytes.len() && bytes[exponent].is_ascii_digit() {
            end = exponent;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
        }
    }

    let value = source[start..end]
        .parse::<f64>()
        .map_err(|_| syntax(start, format!("invalid number {:?}", &source[start..end])))?;
    Ok((value, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|spanned| spanned.token)
            .collect()
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("12 0.5 1e3 0x1F .25"),
            vec![
                Token::Number(12.0),
                Token::Number(0.5),
                Token::Number(1000.0),
                Token::Number(31.0),
                Token::Number(0.25),
            ]
        );
    }

    #[test]
    fn test_qualified_identifier() {
        assert_eq!(
            kinds("hwiTemp.offset+x"),
            vec![
                Token::Ident("hwiTemp.offset".to_string()),
                Token::Plus,
                Token::Ident("x".to_string()),
            ]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("a>=1&&!b||c!=\"on\""),
            vec![
                Token::Ident("a".to_string()),
                Token::GreaterEq,
                Token::Number(1.0),
                Token::AndAnd,
                Token::Bang,
                Token::Ident("b".to_string()),
                Token::OrOr,
                Token::Ident("c".to_string()),
                Token::NotEq,
                Token::Str("on".to_string()),
            ]
        );
    }

    #[test]
    fn test_errors_carry_position() {
        assert_eq!(
            tokenize("x # 2").unwrap_err(),
            syntax(2, "unexpected character '#'")
        );
        assert!(tokenize("\"open").is_err());
        assert!(tokenize("1.2.3").is_err());
    }
}
