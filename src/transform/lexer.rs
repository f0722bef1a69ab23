//! Tokenizer for transformation expressions.

use crate::error::EvalError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    LParen,
    RParen,
    Comma,
    Dot,
    End,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset of the token in the source text.
    pub offset: usize,
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, EvalError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];
        let start = pos;
        let kind = match c {
            b' ' | b'\t' | b'\n' | b'\r' => {
                pos += 1;
                continue;
            }
            b'+' => TokenKind::Plus,
            b'-' => TokenKind::Minus,
            b'/' => TokenKind::Slash,
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b',' => TokenKind::Comma,
            b'*' if bytes.get(pos + 1) == Some(&b'*') => {
                pos += 1;
                TokenKind::DoubleStar
            }
            b'*' => TokenKind::Star,
            b'.' if !bytes.get(pos + 1).is_some_and(u8::is_ascii_digit) => TokenKind::Dot,
            b'0'..=b'9' | b'.' => {
                let (value, end) = scan_number(source, pos)?;
                tokens.push(Token {
                    kind: TokenKind::Number(value),
                    offset: start,
                });
                pos = end;
                continue;
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let end = bytes[pos..]
                    .iter()
                    .position(|b| !(b.is_ascii_alphanumeric() || *b == b'_'))
                    .map_or(bytes.len(), |n| pos + n);
                tokens.push(Token {
                    kind: TokenKind::Ident(source[pos..end].to_string()),
                    offset: start,
                });
                pos = end;
                continue;
            }
            _ => {
                let ch = source[pos..].chars().next().unwrap_or('?');
                return Err(EvalError::Syntax {
                    offset: pos,
                    message: format!("unexpected character '{}'", ch),
                });
            }
        };
        tokens.push(Token {
            kind,
            offset: start,
        });
        pos += 1;
    }

    tokens.push(Token {
        kind: TokenKind::End,
        offset: source.len(),
    });
    Ok(tokens)
}

/// Scans `digits [. digits] [(e|E) [+-] digits]` starting at `start`.
fn scan_number(source: &str, start: usize) -> Result<(f64, usize), EvalError> {
    let bytes = source.as_bytes();
    let digits = |mut pos: usize| {
        while bytes.get(pos).is_some_and(u8::is_ascii_digit) {
            pos += 1;
        }
        pos
    };

    let mut end = digits(start);
    if bytes.get(end) == Some(&b'.') {
        end = digits(end + 1);
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp = end + 1;
        if matches!(bytes.get(exp), Some(b'+' | b'-')) {
            exp += 1;
        }
        let exp_end = digits(exp);
        if exp_end > exp {
            end = exp_end;
        }
    }

    source[start..end]
        .parse::<f64>()
        .map(|value| (value, end))
        .map_err(|e| EvalError::Syntax {
            offset: start,
            message: format!("invalid number '{}': {}", &source[start..end], e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_operators_and_numbers() {
        assert_eq!(
            kinds("3*x**2 + 1.5e1"),
            vec![
                TokenKind::Number(3.0),
                TokenKind::Star,
                TokenKind::Ident("x".into()),
                TokenKind::DoubleStar,
                TokenKind::Number(2.0),
                TokenKind::Plus,
                TokenKind::Number(15.0),
                TokenKind::End,
            ]
        );
    }

    #[test]
    fn test_dotted_names() {
        assert_eq!(
            kinds("np.exp(.5)"),
            vec![
                TokenKind::Ident("np".into()),
                TokenKind::Dot,
                TokenKind::Ident("exp".into()),
                TokenKind::LParen,
                TokenKind::Number(0.5),
                TokenKind::RParen,
                TokenKind::End,
            ]
        );
    }

    #[test]
    fn test_rejects_unknown_characters() {
        let err = tokenize("x = 1").unwrap_err();
        assert!(matches!(err, EvalError::Syntax { offset: 2, .. }));
        assert!(tokenize("x[0]").is_err());
    }
}
