// Single-pass tokenizer. ASCII-oriented with UTF-8 identifier payloads;
// keywords match case-insensitively; string literals use single quotes
// with a doubled quote as the escape. Whitespace, `--` line comments,
// and `/* */` block comments are skipped.

use crate::error::{DbError, Result};
use crate::sql::token::{Keyword, Span, Token, TokenSpan};

pub struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<TokenSpan>> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia()?;
            let span = Span::new(self.line, self.column);
            match self.peek() {
                None => {
                    tokens.push(TokenSpan { token: Token::Eof, span });
                    return Ok(tokens);
                }
                Some(c) => {
                    let token = self.next_token(c, span)?;
                    tokens.push(TokenSpan { token, span });
                }
            }
        }
    }

    fn next_token(&mut self, c: char, span: Span) -> Result<Token> {
        if c.is_ascii_digit() {
            return self.number(span);
        }
        if c == '\'' {
            return self.string_literal(span);
        }
        if is_ident_start(c) {
            return Ok(self.identifier());
        }
        self.advance();
        let token = match c {
            '=' => Token::Eq,
            '<' => match self.peek() {
                Some('>') => {
                    self.advance();
                    Token::NotEq
                }
                Some('=') => {
                    self.advance();
                    Token::LtEq
                }
                _ => Token::Lt,
            },
            '>' => match self.peek() {
                Some('=') => {
                    self.advance();
                    Token::GtEq
                }
                _ => Token::Gt,
            },
            '!' => match self.peek() {
                Some('=') => {
                    self.advance();
                    Token::NotEq
                }
                _ => {
                    return Err(DbError::UnknownCharacter {
                        ch: '!',
                        line: span.line,
                        column: span.column,
                    })
                }
            },
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            '.' => Token::Dot,
            ';' => Token::Semicolon,
            '?' => Token::Question,
            other => {
                return Err(DbError::UnknownCharacter {
                    ch: other,
                    line: span.line,
                    column: span.column,
                })
            }
        };
        Ok(token)
    }

    fn number(&mut self, span: Span) -> Result<Token> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.advance();
        }
        let mut is_real = false;
        if self.peek() == Some('.') && matches!(self.peek_at(1), Some(c) if c.is_ascii_digit()) {
            is_real = true;
            self.advance();
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.advance();
            }
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            let mut lookahead = 1;
            if matches!(self.peek_at(1), Some('+') | Some('-')) {
                lookahead = 2;
            }
            if matches!(self.peek_at(lookahead), Some(c) if c.is_ascii_digit()) {
                is_real = true;
                for _ in 0..=lookahead {
                    self.advance();
                }
                while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                    self.advance();
                }
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        if is_real {
            let value = text.parse::<f64>().map_err(|_| DbError::Syntax {
                message: format!("malformed numeric literal '{}'", text),
                line: span.line,
                column: span.column,
            })?;
            Ok(Token::Real(value))
        } else {
            match text.parse::<i64>() {
                Ok(value) => Ok(Token::Int(value)),
                // Too large for i64: fall back to a real literal.
                Err(_) => {
                    let value = text.parse::<f64>().map_err(|_| DbError::Syntax {
                        message: format!("malformed numeric literal '{}'", text),
                        line: span.line,
                        column: span.column,
                    })?;
                    Ok(Token::Real(value))
                }
            }
        }
    }

    fn string_literal(&mut self, span: Span) -> Result<Token> {
        self.advance(); // opening quote
        let mut out = String::new();
        loop {
            match self.peek() {
                None => {
                    return Err(DbError::UnterminatedString {
                        line: span.line,
                        column: span.column,
                    })
                }
                Some('\'') => {
                    self.advance();
                    if self.peek() == Some('\'') {
                        out.push('\'');
                        self.advance();
                    } else {
                        return Ok(Token::Str(out));
                    }
                }
                Some(c) => {
                    out.push(c);
                    self.advance();
                }
            }
        }
    }

    fn identifier(&mut self) -> Token {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if is_ident_continue(c)) {
            self.advance();
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        match Keyword::from_ident(&text) {
            Some(keyword) => Token::Keyword(keyword),
            None => Token::Ident(text),
        }
    }

    fn skip_trivia(&mut self) -> Result<()> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('-') if self.peek_at(1) == Some('-') => {
                    while !matches!(self.peek(), None | Some('\n')) {
                        self.advance();
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    let span = Span::new(self.line, self.column);
                    self.advance();
                    self.advance();
                    loop {
                        match self.peek() {
                            None => {
                                return Err(DbError::Syntax {
                                    message: "unterminated block comment".into(),
                                    line: span.line,
                                    column: span.column,
                                })
                            }
                            Some('*') if self.peek_at(1) == Some('/') => {
                                self.advance();
                                self.advance();
                                break;
                            }
                            _ => {
                                self.advance();
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) {
        if let Some(c) = self.peek() {
            self.pos += 1;
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn is_ident_continue(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(sql: &str) -> Vec<Token> {
        Lexer::new(sql)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.token)
            .collect()
    }

    #[test]
    fn test_select_statement() {
        let tokens = lex("SELECT name FROM users WHERE id = 2;");
        assert_eq!(
            tokens,
            vec![
                Token::Keyword(Keyword::Select),
                Token::Ident("name".into()),
                Token::Keyword(Keyword::From),
                Token::Ident("users".into()),
                Token::Keyword(Keyword::Where),
                Token::Ident("id".into()),
                Token::Eq,
                Token::Int(2),
                Token::Semicolon,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(lex("42")[0], Token::Int(42));
        assert_eq!(lex("3.25")[0], Token::Real(3.25));
        assert_eq!(lex("1e3")[0], Token::Real(1000.0));
        assert_eq!(lex("2.5e-1")[0], Token::Real(0.25));
    }

    #[test]
    fn test_string_with_escaped_quote() {
        assert_eq!(lex("'it''s'")[0], Token::Str("it's".into()));
    }

    #[test]
    fn test_unterminated_string() {
        assert!(matches!(
            Lexer::new("'oops").tokenize(),
            Err(DbError::UnterminatedString { line: 1, column: 1 })
        ));
    }

    #[test]
    fn test_comments_are_skipped() {
        let tokens = lex("SELECT -- trailing\n /* block\n comment */ 1");
        assert_eq!(
            tokens,
            vec![Token::Keyword(Keyword::Select), Token::Int(1), Token::Eof]
        );
    }

    #[test]
    fn test_operators() {
        let tokens = lex("<> <= >= != < >");
        assert_eq!(
            tokens,
            vec![
                Token::NotEq,
                Token::LtEq,
                Token::GtEq,
                Token::NotEq,
                Token::Lt,
                Token::Gt,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_spans_track_lines() {
        let tokens = Lexer::new("SELECT\n  id").tokenize().unwrap();
        assert_eq!(tokens[0].span, Span::new(1, 1));
        assert_eq!(tokens[1].span, Span::new(2, 3));
    }

    #[test]
    fn test_unknown_character() {
        assert!(matches!(
            Lexer::new("SELECT @").tokenize(),
            Err(DbError::UnknownCharacter { ch: '@', .. })
        ));
    }

    #[test]
    fn test_unicode_identifier() {
        assert_eq!(lex("tabelle_größe")[0], Token::Ident("tabelle_größe".into()));
    }
}
