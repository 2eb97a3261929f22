//! The character-level scanner.
//!
//! Errors are recorded and scanning continues, so one pass over a bad file
//! can report several problems. The returned stream always ends with an
//! `Eof` token.

use glua_core::{ErrorChain, GluaError};

use crate::token::{Token, TokenKind};

/// Scan `source` into tokens plus whatever errors were encountered.
pub fn scan(source: &str) -> (Vec<Token>, ErrorChain) {
    let mut scanner = Scanner::new(source);
    scanner.scan_tokens();
    (scanner.tokens, scanner.errors)
}

struct Scanner {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    tokens: Vec<Token>,
    errors: ErrorChain,
}

impl Scanner {
    fn new(source: &str) -> Self {
        Scanner {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            tokens: Vec::new(),
            errors: ErrorChain::new(),
        }
    }

    fn scan_tokens(&mut self) {
        loop {
            self.skip_whitespace();
            let Some(c) = self.peek() else {
                self.tokens.push(Token::eof(self.line));
                return;
            };

            if c.is_ascii_digit() {
                self.scan_number();
            } else if c.is_ascii_alphabetic() {
                self.scan_word();
            } else {
                self.scan_symbol(c);
            }
        }
    }

    fn scan_symbol(&mut self, c: char) {
        self.advance();
        match c {
            '+' => self.push(TokenKind::Plus, "+"),
            '-' => self.push(TokenKind::Minus, "-"),
            '*' => self.push(TokenKind::Star, "*"),
            '/' => self.push(TokenKind::Slash, "/"),
            '^' => self.push(TokenKind::Caret, "^"),
            ';' => self.push(TokenKind::Semicolon, ";"),
            ',' => self.push(TokenKind::Comma, ","),
            '.' => self.push(TokenKind::Dot, "."),
            '!' => self.push(TokenKind::Bang, "!"),
            '{' => self.push(TokenKind::LeftBrace, "{"),
            '}' => self.push(TokenKind::RightBrace, "}"),
            '[' => self.push(TokenKind::LeftBracket, "["),
            ']' => self.push(TokenKind::RightBracket, "]"),
            '(' => self.push(TokenKind::LeftParen, "("),
            ')' => self.push(TokenKind::RightParen, ")"),
            '<' => {
                if self.check('=') {
                    self.push(TokenKind::LessEqual, "<=");
                } else {
                    self.push(TokenKind::Less, "<");
                }
            }
            '>' => {
                if self.check('=') {
                    self.push(TokenKind::GreaterEqual, ">=");
                } else {
                    self.push(TokenKind::Greater, ">");
                }
            }
            '=' => {
                if self.check('=') {
                    self.push(TokenKind::EqualEqual, "==");
                } else {
                    self.push(TokenKind::Equal, "=");
                }
            }
            '~' => {
                if self.check('=') {
                    self.push(TokenKind::TildeEqual, "~=");
                } else {
                    self.error("Unexpected character '~'");
                }
            }
            '"' => self.scan_string(),
            _ => self.error(format!("Unexpected character {c:?}")),
        }
    }

    /// Skip spaces, newlines and `//` comments, tracking lines.
    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                '\n' => {
                    self.line += 1;
                    self.advance();
                }
                c if c.is_whitespace() => {
                    self.advance();
                }
                '/' if self.peek_next() == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn scan_number(&mut self) {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.advance();
            } else if c == '_' {
                // Underscores are digit separators and carry no meaning.
                self.advance();
            } else {
                break;
            }
        }
        self.push(TokenKind::Number, text);
    }

    fn scan_word(&mut self) {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphabetic() || c.is_ascii_digit() {
                word.push(c);
                self.advance();
            } else {
                break;
            }
        }

        let kind = match word.as_str() {
            "and" => TokenKind::And,
            "assert" => TokenKind::Assert,
            "do" => TokenKind::Do,
            "else" => TokenKind::Else,
            "end" => TokenKind::End,
            "false" => TokenKind::False,
            "for" => TokenKind::For,
            "function" => TokenKind::Function,
            "global" => TokenKind::Global,
            "if" => TokenKind::If,
            "in" => TokenKind::In,
            "local" => TokenKind::Local,
            "nil" => TokenKind::Nil,
            "or" => TokenKind::Or,
            "return" => TokenKind::Return,
            "then" => TokenKind::Then,
            "true" => TokenKind::True,
            "while" => TokenKind::While,
            _ => TokenKind::Identifier,
        };
        self.push(kind, word);
    }

    /// Scan a double-quoted string. The opening quote is already consumed.
    fn scan_string(&mut self) {
        let mut literal = String::new();
        loop {
            match self.peek() {
                None => {
                    self.error("Unterminated string literal");
                    break;
                }
                Some('"') => {
                    self.advance();
                    break;
                }
                Some('\n') => {
                    // Leave the newline for skip_whitespace so line counts
                    // stay right.
                    self.error("Newline in string literal");
                    break;
                }
                Some('\\') => {
                    self.advance();
                    match self.peek() {
                        Some('\\') => {
                            literal.push('\\');
                            self.advance();
                        }
                        Some('n') => {
                            literal.push('\n');
                            self.advance();
                        }
                        Some('"') => {
                            literal.push('"');
                            self.advance();
                        }
                        Some(c) => {
                            self.error(format!("Invalid escape sequence: \\{c}"));
                            self.advance();
                        }
                        None => self.error("Failed to scan escape sequence"),
                    }
                }
                Some(c) => {
                    literal.push(c);
                    self.advance();
                }
            }
        }
        self.push(TokenKind::String, literal);
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_next(&self) -> Option<char> {
        self.chars.get(self.pos + 1).copied()
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    /// Consume the next character if it matches.
    fn check(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn push(&mut self, kind: TokenKind, text: impl Into<String>) {
        self.tokens.push(Token::new(kind, text, self.line));
    }

    fn error(&mut self, message: impl Into<String>) {
        let line = self.line;
        self.errors.push(GluaError::scan(message, line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let (tokens, errors) = scan(source);
        assert!(errors.is_empty(), "unexpected errors: {errors}");
        tokens.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_scan_arithmetic() {
        use TokenKind::*;
        assert_eq!(
            kinds("1 + 2 * 3"),
            vec![Number, Plus, Number, Star, Number, Eof]
        );
    }

    #[test]
    fn test_scan_keywords_and_identifiers() {
        use TokenKind::*;
        assert_eq!(
            kinds("while x do end"),
            vec![While, Identifier, Do, End, Eof]
        );
        assert_eq!(kinds("android"), vec![Identifier, Eof]);
    }

    #[test]
    fn test_two_character_operators() {
        use TokenKind::*;
        assert_eq!(
            kinds("== ~= <= >= < > ="),
            vec![
                EqualEqual,
                TildeEqual,
                LessEqual,
                GreaterEqual,
                Less,
                Greater,
                Equal,
                Eof
            ]
        );
    }

    #[test]
    fn test_number_underscores_are_ignored() {
        let (tokens, errors) = scan("1_000_000");
        assert!(errors.is_empty());
        assert_eq!(tokens[0].text, "1000000");
    }

    #[test]
    fn test_line_tracking() {
        let (tokens, _) = scan("1\n2\n\n3");
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[1].line, 2);
        assert_eq!(tokens[2].line, 4);
    }

    #[test]
    fn test_comments_run_to_end_of_line() {
        use TokenKind::*;
        assert_eq!(kinds("1 // ignored ; tokens\n2"), vec![Number, Number, Eof]);
    }

    #[test]
    fn test_single_slash_is_division() {
        use TokenKind::*;
        assert_eq!(kinds("1 / 2"), vec![Number, Slash, Number, Eof]);
    }

    #[test]
    fn test_string_escapes() {
        let (tokens, errors) = scan(r#""a\nb\\c\"d""#);
        assert!(errors.is_empty());
        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(tokens[0].text, "a\nb\\c\"d");
    }

    #[test]
    fn test_newline_in_string_is_an_error() {
        let (_, errors) = scan("\"abc\ndef\"");
        assert!(!errors.is_empty());
        assert!(errors
            .first()
            .unwrap()
            .to_string()
            .contains("Newline in string literal"));
    }

    #[test]
    fn test_unterminated_string_is_an_error() {
        let (_, errors) = scan("\"abc");
        assert!(!errors.is_empty());
    }

    #[test]
    fn test_invalid_escape_is_an_error() {
        let (_, errors) = scan(r#""\q""#);
        assert!(!errors.is_empty());
    }

    #[test]
    fn test_unknown_character_continues_scanning() {
        let (tokens, errors) = scan("1 @ 2");
        assert_eq!(errors.len(), 1);
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![TokenKind::Number, TokenKind::Number, TokenKind::Eof]
        );
    }

    #[test]
    fn test_stream_always_ends_with_eof() {
        let (tokens, _) = scan("");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::Eof);
    }
}
