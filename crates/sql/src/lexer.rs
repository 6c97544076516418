use crate::{
    error::ParseError,
    token::{Keyword, Op, Token, TokenKind},
};

/// Split `input` into tokens. Keywords are case-insensitive, string literals
/// are single-quoted with backslash escapes, and every `?` placeholder gets
/// the next positional index.
pub(crate) fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut param_index = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        let offset = i;
        match c {
            c if c.is_ascii_whitespace() => {
                i += 1;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric()
                        || bytes[i] == b'_'
                        || bytes[i] == b'.')
                {
                    i += 1;
                }
                let word = &input[start..i];
                let kind = match Keyword::parse(word) {
                    Some(keyword) => TokenKind::Keyword(keyword),
                    None => TokenKind::Ident(word.to_owned()),
                };
                tokens.push(Token { kind, offset });
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_digit()
                        || bytes[i] == b'.'
                        || bytes[i] == b'e'
                        || bytes[i] == b'E'
                        || ((bytes[i] == b'+' || bytes[i] == b'-')
                            && matches!(bytes[i - 1], b'e' | b'E')))
                {
                    i += 1;
                }
                let text = &input[start..i];
                let number: f64 = text
                    .parse()
                    .map_err(|_| ParseError::new(start, format!("bad numeric literal `{text}`")))?;
                tokens.push(Token {
                    kind: TokenKind::Number(number),
                    offset,
                });
            }
            '\'' => {
                i += 1;
                let mut text = String::new();
                loop {
                    match bytes.get(i) {
                        None => {
                            return Err(ParseError::new(offset, "unterminated string literal"))
                        }
                        Some(b'\\') => {
                            let escaped = bytes.get(i + 1).ok_or_else(|| {
                                ParseError::new(offset, "unterminated string literal")
                            })?;
                            text.push(*escaped as char);
                            i += 2;
                        }
                        Some(b'\'') => {
                            i += 1;
                            break;
                        }
                        Some(_) => {
                            // Push the whole UTF-8 character, not one byte.
                            let rest = &input[i..];
                            let ch = rest.chars().next().expect("in-bounds char");
                            text.push(ch);
                            i += ch.len_utf8();
                        }
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Str(text),
                    offset,
                });
            }
            '?' => {
                tokens.push(Token {
                    kind: TokenKind::Param(param_index),
                    offset,
                });
                param_index += 1;
                i += 1;
            }
            '=' => {
                tokens.push(Token {
                    kind: TokenKind::Op(Op::Eq),
                    offset,
                });
                i += 1;
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token {
                        kind: TokenKind::Op(Op::Ne),
                        offset,
                    });
                    i += 2;
                } else {
                    return Err(ParseError::new(offset, "expected `!=`"));
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token {
                        kind: TokenKind::Op(Op::Le),
                        offset,
                    });
                    i += 2;
                } else {
                    tokens.push(Token {
                        kind: TokenKind::Op(Op::Lt),
                        offset,
                    });
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token {
                        kind: TokenKind::Op(Op::Ge),
                        offset,
                    });
                    i += 2;
                } else {
                    tokens.push(Token {
                        kind: TokenKind::Op(Op::Gt),
                        offset,
                    });
                    i += 1;
                }
            }
            '+' => {
                tokens.push(Token {
                    kind: TokenKind::Op(Op::Plus),
                    offset,
                });
                i += 1;
            }
            '-' => {
                tokens.push(Token {
                    kind: TokenKind::Op(Op::Minus),
                    offset,
                });
                i += 1;
            }
            '*' => {
                tokens.push(Token {
                    kind: TokenKind::Op(Op::Star),
                    offset,
                });
                i += 1;
            }
            '/' => {
                tokens.push(Token {
                    kind: TokenKind::Op(Op::Slash),
                    offset,
                });
                i += 1;
            }
            ',' => {
                tokens.push(Token {
                    kind: TokenKind::Comma,
                    offset,
                });
                i += 1;
            }
            '(' => {
                tokens.push(Token {
                    kind: TokenKind::LParen,
                    offset,
                });
                i += 1;
            }
            ')' => {
                tokens.push(Token {
                    kind: TokenKind::RParen,
                    offset,
                });
                i += 1;
            }
            other => {
                return Err(ParseError::new(offset, format!("unexpected character `{other}`")))
            }
        }
    }

    tokens.push(Token {
        kind: TokenKind::Eoi,
        offset: input.len(),
    });
    Ok(tokens)
}
