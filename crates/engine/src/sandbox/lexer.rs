//! Tokenizer for the expression sandbox.

use super::SandboxError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Number(f64),
    String(String),
    /// Raw template literal chunks; expression chunks are parsed later by the parser.
    Template(Vec<TemplateChunk>),
    Regex { pattern: String, flags: String },
    Identifier(String),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TemplateChunk {
    Text(String),
    Expr { source: String, offset: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub pos: usize,
}

/// Ordered longest first so that greedy matching picks `===` before `==`.
const PUNCTUATORS: &[&str] = &[
    "===", "!==", "**=", "...", "??=", "||=", "&&=", "=>", "==", "!=", "<=", ">=", "&&", "||", "??", "?.", "++", "--", "+=", "-=",
    "*=", "/=", "%=", "**", "{", "}", "(", ")", "[", "]", ";", ",", "<", ">", "+", "-", "*", "/", "%", "!", "?", ":", "=", ".", "&",
    "|", "^", "~",
];

/// Keywords after which a `/` starts a regular expression literal rather than a division.
const EXPRESSION_KEYWORDS: &[&str] = &[
    "return", "typeof", "case", "in", "of", "delete", "void", "throw", "new", "else", "do", "instanceof",
];

pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, SandboxError> {
    Lexer {
        source,
        chars: source.char_indices().collect(),
        index: 0,
        tokens: Vec::new(),
    }
    .run()
}

struct Lexer<'a> {
    source: &'a str,
    chars: Vec<(usize, char)>,
    index: usize,
    tokens: Vec<Token>,
}

impl Lexer<'_> {
    fn run(mut self) -> Result<Vec<Token>, SandboxError> {
        loop {
            self.skip_trivia()?;
            let Some(ch) = self.peek() else {
                let pos = self.source.len();
                self.tokens.push(Token { kind: TokenKind::Eof, pos });
                return Ok(self.tokens);
            };
            let pos = self.offset();
            let kind = if ch.is_ascii_digit() || (ch == '.' && self.peek_at(1).is_some_and(|next| next.is_ascii_digit())) {
                self.number()?
            } else if ch == '"' || ch == '\'' {
                self.string(ch)?
            } else if ch == '`' {
                self.template()?
            } else if is_identifier_start(ch) {
                TokenKind::Identifier(self.identifier())
            } else if ch == '/' && self.regex_allowed() {
                self.regex()?
            } else {
                self.punct()?
            };
            self.tokens.push(Token { kind, pos });
        }
    }

    fn peek(&self) -> Option<char> {
        self.peek_at(0)
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.index + ahead).map(|(_, ch)| *ch)
    }

    fn offset(&self) -> usize {
        self.chars.get(self.index).map(|(pos, _)| *pos).unwrap_or(self.source.len())
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek();
        self.index += 1;
        ch
    }

    fn error(&self, message: impl Into<String>) -> SandboxError {
        SandboxError::Syntax {
            message: message.into(),
            position: self.offset(),
        }
    }

    fn skip_trivia(&mut self) -> Result<(), SandboxError> {
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() {
                self.index += 1;
            } else if ch == '/' && self.peek_at(1) == Some('/') {
                while let Some(next) = self.peek() {
                    if next == '\n' {
                        break;
                    }
                    self.index += 1;
                }
            } else if ch == '/' && self.peek_at(1) == Some('*') {
                self.index += 2;
                loop {
                    match self.bump() {
                        Some('*') if self.peek() == Some('/') => {
                            self.index += 1;
                            break;
                        }
                        Some(_) => {}
                        None => return Err(self.error("unterminated comment")),
                    }
                }
            } else {
                break;
            }
        }
        Ok(())
    }

    fn regex_allowed(&self) -> bool {
        match self.tokens.last().map(|token| &token.kind) {
            None => true,
            Some(TokenKind::Punct(punct)) => !matches!(*punct, ")" | "]" | "}"),
            Some(TokenKind::Identifier(name)) => EXPRESSION_KEYWORDS.contains(&name.as_str()),
            Some(_) => false,
        }
    }

    fn number(&mut self) -> Result<TokenKind, SandboxError> {
        let start = self.offset();
        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x' | 'X' | 'b' | 'B' | 'o' | 'O')) {
            let radix = match self.peek_at(1) {
                Some('x' | 'X') => 16,
                Some('b' | 'B') => 2,
                _ => 8,
            };
            self.index += 2;
            let mut digits = String::new();
            while let Some(ch) = self.peek() {
                if ch.is_digit(radix) {
                    digits.push(ch);
                } else if ch != '_' {
                    break;
                }
                self.index += 1;
            }
            return u64::from_str_radix(&digits, radix)
                .map(|value| TokenKind::Number(value as f64))
                .map_err(|_| self.error("invalid numeric literal"));
        }

        let mut text = String::new();
        let mut seen_dot = false;
        let mut seen_exponent = false;
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                text.push(ch);
            } else if ch == '_' {
                // numeric separator
            } else if ch == '.' && !seen_dot && !seen_exponent && self.peek_at(1).is_some_and(|next| next.is_ascii_digit()) {
                seen_dot = true;
                text.push(ch);
            } else if (ch == 'e' || ch == 'E') && !seen_exponent {
                seen_exponent = true;
                text.push(ch);
                if let Some(sign @ ('+' | '-')) = self.peek_at(1) {
                    text.push(sign);
                    self.index += 1;
                }
            } else {
                break;
            }
            self.index += 1;
        }
        if self.peek().is_some_and(is_identifier_start) {
            return Err(SandboxError::Syntax {
                message: "identifier starts immediately after numeric literal".into(),
                position: start,
            });
        }
        text.parse::<f64>()
            .map(TokenKind::Number)
            .map_err(|_| SandboxError::Syntax {
                message: format!("invalid numeric literal '{text}'"),
                position: start,
            })
    }

    fn string(&mut self, quote: char) -> Result<TokenKind, SandboxError> {
        self.index += 1;
        let mut value = String::new();
        loop {
            match self.bump() {
                Some(ch) if ch == quote => return Ok(TokenKind::String(value)),
                Some('\\') => self.escape(&mut value)?,
                Some('\n') | None => return Err(self.error("unterminated string literal")),
                Some(ch) => value.push(ch),
            }
        }
    }

    fn escape(&mut self, out: &mut String) -> Result<(), SandboxError> {
        let Some(ch) = self.bump() else {
            return Err(self.error("unterminated escape sequence"));
        };
        match ch {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            'v' => out.push('\u{b}'),
            '0' => out.push('\0'),
            '\n' => {}
            'x' => {
                let code = self.hex_digits(2)?;
                out.push(char::from_u32(code).ok_or_else(|| self.error("invalid escape"))?);
            }
            'u' => {
                let code = if self.peek() == Some('{') {
                    self.index += 1;
                    let mut digits = String::new();
                    while let Some(next) = self.bump() {
                        if next == '}' {
                            break;
                        }
                        digits.push(next);
                    }
                    u32::from_str_radix(&digits, 16).map_err(|_| self.error("invalid unicode escape"))?
                } else {
                    self.hex_digits(4)?
                };
                out.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
            }
            other => out.push(other),
        }
        Ok(())
    }

    fn hex_digits(&mut self, count: usize) -> Result<u32, SandboxError> {
        let mut digits = String::with_capacity(count);
        for _ in 0..count {
            match self.bump() {
                Some(ch) if ch.is_ascii_hexdigit() => digits.push(ch),
                _ => return Err(self.error("invalid hexadecimal escape")),
            }
        }
        u32::from_str_radix(&digits, 16).map_err(|_| self.error("invalid hexadecimal escape"))
    }

    fn template(&mut self) -> Result<TokenKind, SandboxError> {
        self.index += 1;
        let mut chunks = Vec::new();
        let mut text = String::new();
        loop {
            match self.bump() {
                Some('`') => break,
                Some('\\') => self.escape(&mut text)?,
                Some('$') if self.peek() == Some('{') => {
                    self.index += 1;
                    if !text.is_empty() {
                        chunks.push(TemplateChunk::Text(std::mem::take(&mut text)));
                    }
                    let offset = self.offset();
                    let source = self.template_expression()?;
                    chunks.push(TemplateChunk::Expr { source, offset });
                }
                Some(ch) => text.push(ch),
                None => return Err(self.error("unterminated template literal")),
            }
        }
        if !text.is_empty() || chunks.is_empty() {
            chunks.push(TemplateChunk::Text(text));
        }
        Ok(TokenKind::Template(chunks))
    }

    /// Captures the source of a `${ ... }` substitution, honoring nested braces and literals.
    fn template_expression(&mut self) -> Result<String, SandboxError> {
        let start = self.offset();
        let mut depth = 0usize;
        loop {
            let Some(ch) = self.peek() else {
                return Err(self.error("unterminated template substitution"));
            };
            match ch {
                '{' => depth += 1,
                '}' if depth == 0 => {
                    let end = self.offset();
                    self.index += 1;
                    return Ok(self.source[start..end].to_string());
                }
                '}' => depth -= 1,
                '"' | '\'' => {
                    self.string(ch)?;
                    continue;
                }
                '`' => {
                    self.template()?;
                    continue;
                }
                _ => {}
            }
            self.index += 1;
        }
    }

    fn identifier(&mut self) -> String {
        let mut name = String::new();
        while let Some(ch) = self.peek() {
            if is_identifier_part(ch) {
                name.push(ch);
                self.index += 1;
            } else {
                break;
            }
        }
        name
    }

    fn regex(&mut self) -> Result<TokenKind, SandboxError> {
        self.index += 1;
        let mut pattern = String::new();
        let mut in_class = false;
        loop {
            match self.bump() {
                Some('\\') => {
                    pattern.push('\\');
                    match self.bump() {
                        Some(next) => pattern.push(next),
                        None => return Err(self.error("unterminated regular expression")),
                    }
                }
                Some('[') => {
                    in_class = true;
                    pattern.push('[');
                }
                Some(']') => {
                    in_class = false;
                    pattern.push(']');
                }
                Some('/') if !in_class => break,
                Some('\n') | None => return Err(self.error("unterminated regular expression")),
                Some(ch) => pattern.push(ch),
            }
        }
        let mut flags = String::new();
        while let Some(ch) = self.peek() {
            if ch.is_ascii_alphabetic() {
                flags.push(ch);
                self.index += 1;
            } else {
                break;
            }
        }
        Ok(TokenKind::Regex { pattern, flags })
    }

    fn punct(&mut self) -> Result<TokenKind, SandboxError> {
        let rest = &self.source[self.offset()..];
        for punct in PUNCTUATORS {
            if rest.starts_with(punct) {
                // `a?.5:b` is a conditional followed by a number, not optional chaining.
                if *punct == "?." && rest[2..].starts_with(|ch: char| ch.is_ascii_digit()) {
                    continue;
                }
                self.index += punct.chars().count();
                return Ok(TokenKind::Punct(punct));
            }
        }
        let ch = self.peek().unwrap_or_default();
        Err(self.error(format!("unexpected character '{ch}'")))
    }
}

fn is_identifier_start(ch: char) -> bool {
    ch == '_' || ch == '$' || ch.is_alphabetic()
}

fn is_identifier_part(ch: char) -> bool {
    ch == '_' || ch == '$' || ch.is_alphanumeric()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).expect("tokenize").into_iter().map(|token| token.kind).collect()
    }

    #[test]
    fn tokenizes_arrow_function() {
        assert_eq!(
            kinds("(ctx) => ctx.a"),
            vec![
                TokenKind::Punct("("),
                TokenKind::Identifier("ctx".into()),
                TokenKind::Punct(")"),
                TokenKind::Punct("=>"),
                TokenKind::Identifier("ctx".into()),
                TokenKind::Punct("."),
                TokenKind::Identifier("a".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn distinguishes_regex_from_division() {
        let tokens = kinds("a / b");
        assert_eq!(tokens[1], TokenKind::Punct("/"));

        let tokens = kinds("s.replace(/a\\/b/g, '')");
        assert!(tokens.contains(&TokenKind::Regex {
            pattern: "a\\/b".into(),
            flags: "g".into()
        }));
    }

    #[test]
    fn captures_template_substitutions() {
        let tokens = kinds("`id=${ item.id }&n=${ {a: 1}.a }`");
        let TokenKind::Template(chunks) = &tokens[0] else {
            panic!("expected template");
        };
        assert_eq!(chunks.len(), 4);
        assert!(matches!(&chunks[1], TemplateChunk::Expr { source, .. } if source.trim() == "item.id"));
        assert!(matches!(&chunks[3], TemplateChunk::Expr { source, .. } if source.trim() == "{a: 1}.a"));
    }

    #[test]
    fn reports_unterminated_string_with_position() {
        let error = tokenize("x + 'abc").expect_err("unterminated");
        assert!(matches!(error, SandboxError::Syntax { .. }));
    }

    #[test]
    fn skips_comments_and_parses_numbers() {
        assert_eq!(
            kinds("/* c */ 1.5e2 // tail"),
            vec![TokenKind::Number(150.0), TokenKind::Eof]
        );
        assert_eq!(kinds("0xff")[0], TokenKind::Number(255.0));
    }
}
