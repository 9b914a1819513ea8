//! Single-line lexer for the control-map language. Column aware so errors in
//! long host lines stay findable.
use std::iter::Peekable;
use std::str::Chars;

use crate::control::{Column, LexError, Span, Spanned, Token};

pub struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
    // Used to create spans for tokens
    // If we enumerate chars it's not peekable anymore!
    col: Column,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Lexer<'a> {
        Lexer {
            chars: input.chars().peekable(),
            col: 0,
        }
    }

    /// Advances the iterator and increments the column counter.
    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next();
        if c.is_some() {
            self.col += 1;
        }
        c
    }

    pub fn next(&mut self) -> Spanned<Token> {
        self.skip_whitespace();
        let start = self.col;
        let token = match self.chars.peek() {
            Some(&c) => match c {
                '{' => {
                    self.bump();
                    Token::Lbrace
                }
                '}' => {
                    self.bump();
                    Token::Rbrace
                }
                '[' => {
                    self.bump();
                    Token::Lbracket
                }
                ']' => {
                    self.bump();
                    Token::Rbracket
                }
                ':' => {
                    self.bump();
                    Token::Colon
                }
                ',' => {
                    self.bump();
                    Token::Comma
                }
                '\'' | '"' => self.lex_string(c),
                '-' | '0'..='9' => self.lex_number(),
                c if c.is_ascii_alphabetic() || c == '_' => self.lex_word(),
                _ => {
                    self.bump();
                    Token::Err(LexError::UnexpectedChar(c))
                }
            },
            None => Token::Eof,
        };

        // Every arm besides Eof does a bump, so the end of THIS token is
        // actually the last column
        let end = if self.col > start {
            self.col.saturating_sub(1)
        } else {
            start
        };
        Spanned::new(token, Span::new(start, end))
    }

    fn skip_whitespace(&mut self) {
        while let Some(&peeked) = self.chars.peek() {
            if peeked.is_whitespace() {
                self.bump();
            } else {
                return;
            }
        }
    }

    /// Lexes a quoted string. Either quote character works; the opener picks
    /// the closer.
    fn lex_string(&mut self, quote: char) -> Token {
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(c) if c == quote => return Token::Str(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('0') => out.push('\0'),
                    Some('\\') => out.push('\\'),
                    Some('\'') => out.push('\''),
                    Some('"') => out.push('"'),
                    Some('/') => out.push('/'),
                    Some(other) => return Token::Err(LexError::BadEscape(other)),
                    None => return Token::Err(LexError::UnterminatedString),
                },
                Some(c) => out.push(c),
                None => return Token::Err(LexError::UnterminatedString),
            }
        }
    }

    /// Lexes a decimal int or float. Floats are anything with a '.' or an
    /// exponent; both parse through the std machinery.
    fn lex_number(&mut self) -> Token {
        let mut digits = String::new();
        if let Some(&'-') = self.chars.peek() {
            digits.push(self.bump().unwrap());
        }
        let mut float = false;
        while let Some(&peeked) = self.chars.peek() {
            match peeked {
                '0'..='9' => digits.push(self.bump().unwrap()),
                '.' if !float => {
                    float = true;
                    digits.push(self.bump().unwrap());
                }
                'e' | 'E' => {
                    float = true;
                    digits.push(self.bump().unwrap());
                    if matches!(self.chars.peek(), Some(&('+' | '-'))) {
                        digits.push(self.bump().unwrap());
                    }
                }
                _ => break,
            }
        }

        if float {
            digits
                .parse::<f64>()
                .map(Token::Float)
                .unwrap_or_else(|_| Token::Err(LexError::ImproperNumber(digits)))
        } else {
            digits
                .parse::<i64>()
                .map(Token::Int)
                .unwrap_or_else(|_| Token::Err(LexError::ImproperNumber(digits)))
        }
    }

    /// Keywords in both the Python and JSON spellings. Anything else is an
    /// error; the language has no bare identifiers.
    fn lex_word(&mut self) -> Token {
        let mut word = String::new();
        while let Some(&peeked) = self.chars.peek() {
            if peeked.is_ascii_alphanumeric() || peeked == '_' {
                word.push(self.bump().unwrap());
            } else {
                break;
            }
        }
        match word.as_str() {
            "True" | "true" => Token::True,
            "False" | "false" => Token::False,
            "None" | "null" => Token::None,
            _ => Token::Err(LexError::ImproperWord(word)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_token(lexer: &mut Lexer, expected: Token, start: Column, end: Column) {
        let spanned = lexer.next();
        assert_eq!(spanned.node, expected, "Token mismatch at col {start}..{end}");
        assert_eq!(spanned.span.start, start, "Start column mismatch");
        assert_eq!(spanned.span.end, end, "End column mismatch");
    }

    #[test]
    fn test_punctuation() {
        let mut lexer = Lexer::new("{}[]:,");
        assert_token(&mut lexer, Token::Lbrace, 0, 0);
        assert_token(&mut lexer, Token::Rbrace, 1, 1);
        assert_token(&mut lexer, Token::Lbracket, 2, 2);
        assert_token(&mut lexer, Token::Rbracket, 3, 3);
        assert_token(&mut lexer, Token::Colon, 4, 4);
        assert_token(&mut lexer, Token::Comma, 5, 5);
        assert_token(&mut lexer, Token::Eof, 6, 6);
    }

    #[test]
    fn test_single_quoted_string() {
        let mut lexer = Lexer::new("'abc'");
        assert_token(&mut lexer, Token::Str("abc".into()), 0, 4);
    }

    #[test]
    fn test_double_quoted_string() {
        let mut lexer = Lexer::new(r#""abc""#);
        assert_token(&mut lexer, Token::Str("abc".into()), 0, 4);
    }

    #[test]
    fn test_string_with_other_quote_inside() {
        let mut lexer = Lexer::new(r#"'it is "fine"'"#);
        assert_token(&mut lexer, Token::Str(r#"it is "fine""#.into()), 0, 13);
    }

    #[test]
    fn test_string_escapes() {
        let mut lexer = Lexer::new(r"'a\nb\'c\\d'");
        assert_token(&mut lexer, Token::Str("a\nb'c\\d".into()), 0, 11);
    }

    #[test]
    fn test_bad_escape() {
        let mut lexer = Lexer::new(r"'a\qb'");
        let spanned = lexer.next();
        assert!(matches!(spanned.node, Token::Err(LexError::BadEscape('q'))));
    }

    #[test]
    fn test_unterminated_string() {
        let mut lexer = Lexer::new("'abc");
        let spanned = lexer.next();
        assert!(matches!(
            spanned.node,
            Token::Err(LexError::UnterminatedString)
        ));
    }

    #[test]
    fn test_integers() {
        let mut lexer = Lexer::new("0 42 -7");
        assert_token(&mut lexer, Token::Int(0), 0, 0);
        assert_token(&mut lexer, Token::Int(42), 2, 3);
        assert_token(&mut lexer, Token::Int(-7), 5, 6);
    }

    #[test]
    fn test_floats() {
        let mut lexer = Lexer::new("1.5 -0.25 2e3");
        assert_token(&mut lexer, Token::Float(1.5), 0, 2);
        assert_token(&mut lexer, Token::Float(-0.25), 4, 8);
        assert_token(&mut lexer, Token::Float(2000.0), 10, 12);
    }

    #[test]
    fn test_number_overflow_is_error() {
        let mut lexer = Lexer::new("99999999999999999999");
        let spanned = lexer.next();
        assert!(matches!(
            spanned.node,
            Token::Err(LexError::ImproperNumber(_))
        ));
    }

    #[test]
    fn test_keywords_both_spellings() {
        let mut lexer = Lexer::new("True true False false None null");
        assert_token(&mut lexer, Token::True, 0, 3);
        assert_token(&mut lexer, Token::True, 5, 8);
        assert_token(&mut lexer, Token::False, 10, 14);
        assert_token(&mut lexer, Token::False, 16, 20);
        assert_token(&mut lexer, Token::None, 22, 25);
        assert_token(&mut lexer, Token::None, 27, 30);
    }

    #[test]
    fn test_unknown_word() {
        let mut lexer = Lexer::new("maybe");
        let spanned = lexer.next();
        assert_eq!(
            spanned.node,
            Token::Err(LexError::ImproperWord("maybe".into()))
        );
    }

    #[test]
    fn test_unexpected_char() {
        let mut lexer = Lexer::new("@");
        assert_token(&mut lexer, Token::Err(LexError::UnexpectedChar('@')), 0, 0);
    }

    #[test]
    fn test_eof_empty_and_whitespace() {
        let mut lexer = Lexer::new("");
        assert_token(&mut lexer, Token::Eof, 0, 0);
        let mut lexer = Lexer::new("   ");
        assert_token(&mut lexer, Token::Eof, 3, 3);
    }
}
