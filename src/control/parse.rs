//! Recursive-descent parser over the lexer. One line must hold exactly one
//! map; nesting below that is unrestricted.
use std::collections::HashMap;

use super::lex::Lexer;
use super::{ParseError, Span, Spanned, Token, Value};

/// Wraps a lexer and pulls tokens out to build a [`Value`] tree.
pub struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Spanned<Token>,
}

impl<'a> Parser<'a> {
    pub fn new(input: &'a str) -> Self {
        let mut lexer = Lexer::new(input);
        let current = lexer.next();
        Parser { lexer, current }
    }

    fn advance(&mut self) {
        self.current = self.lexer.next();
    }

    fn take(&mut self) -> Spanned<Token> {
        let next = self.lexer.next();
        std::mem::replace(&mut self.current, next)
    }

    /// Checks the current token for a deferred lexer error and promotes it.
    fn check_lex(&self) -> Result<(), ParseError> {
        match &self.current.node {
            Token::Err(e) => Err(ParseError::Lex(e.clone(), self.current.span)),
            _ => Ok(()),
        }
    }

    pub fn parse_line(&mut self) -> Result<Value, ParseError> {
        self.check_lex()?;
        if !matches!(*self.current, Token::Lbrace) {
            let at = self.take();
            return Err(ParseError::ExpectedMap(at.node, at.span));
        }
        let map = self.parse_value()?;
        match &self.current.node {
            Token::Eof => Ok(map),
            _ => {
                let at = self.take();
                Err(ParseError::TrailingInput(at.node, at.span))
            }
        }
    }

    fn parse_value(&mut self) -> Result<Value, ParseError> {
        self.check_lex()?;
        let span = self.current.span;
        match self.take() {
            Spanned {
                node: Token::Int(n),
                ..
            } => Ok(Value::Int(n)),
            Spanned {
                node: Token::Float(f),
                ..
            } => Ok(Value::Float(f)),
            Spanned {
                node: Token::Str(s),
                ..
            } => Ok(Value::Str(s)),
            Spanned {
                node: Token::True, ..
            } => Ok(Value::Bool(true)),
            Spanned {
                node: Token::False, ..
            } => Ok(Value::Bool(false)),
            Spanned {
                node: Token::None, ..
            } => Ok(Value::None),
            Spanned {
                node: Token::Lbrace,
                ..
            } => self.parse_map(span),
            Spanned {
                node: Token::Lbracket,
                ..
            } => self.parse_list(span),
            Spanned {
                node: Token::Eof, ..
            } => Err(ParseError::UnexpectedEof(span)),
            Spanned { node, span } => Err(ParseError::ExpectedValue(node, span)),
        }
    }

    /// Called with the opening brace consumed. Trailing commas are accepted
    /// because both host spellings emit them freely.
    fn parse_map(&mut self, open: Span) -> Result<Value, ParseError> {
        let mut map = HashMap::new();
        loop {
            self.check_lex()?;
            match &self.current.node {
                Token::Rbrace => {
                    self.advance();
                    return Ok(Value::Map(map));
                }
                Token::Eof => return Err(ParseError::UnexpectedEof(open)),
                _ => {}
            }

            let key = match self.take() {
                Spanned {
                    node: Token::Str(s),
                    ..
                } => s,
                Spanned { node, span } => return Err(ParseError::ExpectedKey(node, span)),
            };
            self.check_lex()?;
            match self.take() {
                Spanned {
                    node: Token::Colon, ..
                } => {}
                Spanned { node, span } => return Err(ParseError::ExpectedColon(node, span)),
            }
            let value = self.parse_value()?;
            map.insert(key, value);

            self.check_lex()?;
            match &self.current.node {
                Token::Comma => self.advance(),
                Token::Rbrace => {}
                _ => {
                    let at = self.take();
                    return Err(ParseError::ExpectedComma('}', at.node, at.span));
                }
            }
        }
    }

    fn parse_list(&mut self, open: Span) -> Result<Value, ParseError> {
        let mut items = Vec::new();
        loop {
            self.check_lex()?;
            match &self.current.node {
                Token::Rbracket => {
                    self.advance();
                    return Ok(Value::List(items));
                }
                Token::Eof => return Err(ParseError::UnexpectedEof(open)),
                _ => {}
            }

            items.push(self.parse_value()?);

            self.check_lex()?;
            match &self.current.node {
                Token::Comma => self.advance(),
                Token::Rbracket => {}
                _ => {
                    let at = self.take();
                    return Err(ParseError::ExpectedComma(']', at.node, at.span));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::LexError;

    #[test]
    fn test_empty_map() {
        assert_eq!(Value::parse_line("{}").unwrap(), Value::Map(HashMap::new()));
    }

    #[test]
    fn test_trailing_comma_in_map_and_list() {
        let value = Value::parse_line("{'cancel': [1, 2,], }").unwrap();
        assert_eq!(value.get("cancel").unwrap().as_list().unwrap().len(), 2);
    }

    #[test]
    fn test_empty_list() {
        let value = Value::parse_line("{'cancel': []}").unwrap();
        assert_eq!(value.get("cancel").unwrap().as_list().unwrap().len(), 0);
    }

    #[test]
    fn test_missing_colon() {
        let err = Value::parse_line("{'version' 1}").unwrap_err();
        assert!(matches!(err, ParseError::ExpectedColon(..)));
    }

    #[test]
    fn test_non_string_key() {
        let err = Value::parse_line("{1: 2}").unwrap_err();
        assert!(matches!(err, ParseError::ExpectedKey(..)));
    }

    #[test]
    fn test_unclosed_map_reports_eof() {
        let err = Value::parse_line("{'version': 1").unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedEof(..)));
    }

    #[test]
    fn test_unclosed_list_reports_eof() {
        let err = Value::parse_line("{'cancel': [1, 2").unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedEof(..)));
    }

    #[test]
    fn test_lex_error_surfaces_with_span() {
        let err = Value::parse_line("{'version': @}").unwrap_err();
        match err {
            ParseError::Lex(LexError::UnexpectedChar('@'), span) => {
                assert_eq!(span.start, 12);
            }
            other => panic!("expected lex error, got {other:?}"),
        }
    }

    #[test]
    fn test_deep_nesting() {
        let value = Value::parse_line("{'next': {'next': {'version': 9}}}").unwrap();
        let version = value
            .get("next")
            .and_then(|v| v.get("next"))
            .and_then(|v| v.get("version"))
            .and_then(Value::as_u64);
        assert_eq!(version, Some(9));
    }

    #[test]
    fn test_missing_comma_between_entries() {
        let err = Value::parse_line("{'a': 1 'b': 2}").unwrap_err();
        assert!(matches!(err, ParseError::ExpectedComma('}', ..)));
    }
}
