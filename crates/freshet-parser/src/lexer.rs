//! Lexer for FQL using Logos
//!
//! FQL keywords are case-insensitive but remain valid node names
//! (`CREATE SOURCE source ...` names a source "source"), so keywords are not
//! lexed as distinct tokens. Every word becomes [`Token::Ident`] and the
//! parser matches keywords case-insensitively where the grammar expects them.

use logos::Logos;
use std::fmt;

/// Token type for FQL.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"--[^\n]*")]
#[logos(skip r"/\*([^*]|\*[^/])*\*/")]
pub enum Token {
    // === Operators ===
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("||")]
    Concat,

    #[token("=")]
    Eq,
    #[token("!=")]
    #[token("<>")]
    NotEq,
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,

    // === Delimiters ===
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token(";")]
    Semicolon,
    #[token("..")]
    DotDot,
    #[token(".")]
    Dot,

    // === Literals ===
    // Ordinal wins over Integer on "3RD" by the longest-match rule.
    #[regex(r"(?i)[0-9]+-?(st|nd|rd|th)", |lex| {
        let s = lex.slice();
        let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse::<i64>().ok()
    })]
    Ordinal(i64),

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Integer(i64),

    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),

    // Double-quoted strings escape the quote by doubling it; single-quoted
    // strings likewise.
    #[regex(r#""([^"]|"")*""#, |lex| {
        let s = lex.slice();
        Some(s[1..s.len()-1].replace("\"\"", "\""))
    })]
    #[regex(r#"'([^']|'')*'"#, |lex| {
        let s = lex.slice();
        Some(s[1..s.len()-1].replace("''", "'"))
    })]
    String(String),

    // === Identifier (includes all keywords) ===
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| Some(lex.slice().to_string()))]
    Ident(String),

    // === Special ===
    Eof,
}

impl Token {
    /// Case-insensitive keyword check against an identifier token.
    pub fn is_kw(&self, kw: &str) -> bool {
        matches!(self, Token::Ident(s) if s.eq_ignore_ascii_case(kw))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::Concat => write!(f, "||"),
            Token::Eq => write!(f, "="),
            Token::NotEq => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
            Token::Semicolon => write!(f, ";"),
            Token::DotDot => write!(f, ".."),
            Token::Dot => write!(f, "."),
            Token::Ordinal(n) => write!(f, "{}th", n),
            Token::Integer(n) => write!(f, "{}", n),
            Token::Float(n) => write!(f, "{}", n),
            Token::String(s) => write!(f, "\"{}\"", s),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Eof => write!(f, "end of input"),
        }
    }
}

/// Spanned token with byte position information.
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub start: usize,
    pub end: usize,
}

/// Tokenize a source string into a vector of spanned tokens, terminated by
/// a single [`Token::Eof`]. Unlexable input becomes an `Ident` holding the
/// offending slice; the parser turns it into a parse error with position.
pub fn tokenize(source: &str) -> Vec<SpannedToken> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    while let Some(result) = lexer.next() {
        let span = lexer.span();
        let token = match result {
            Ok(token) => token,
            Err(_) => Token::Ident(lexer.slice().to_string()),
        };
        tokens.push(SpannedToken {
            token,
            start: span.start,
            end: span.end,
        });
    }
    let pos = source.len();
    tokens.push(SpannedToken {
        token: Token::Eof,
        start: pos,
        end: pos,
    });
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source).into_iter().map(|t| t.token).collect()
    }

    #[test]
    fn test_keywords_are_idents() {
        let tokens = kinds("SELECT select SeLeCt");
        assert_eq!(tokens.len(), 4);
        for t in &tokens[..3] {
            assert!(t.is_kw("select"));
        }
        assert_eq!(tokens[3], Token::Eof);
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("= != <> < <= > >= || + - * / %"),
            vec![
                Token::Eq,
                Token::NotEq,
                Token::NotEq,
                Token::Lt,
                Token::Le,
                Token::Gt,
                Token::Ge,
                Token::Concat,
                Token::Plus,
                Token::Minus,
                Token::Star,
                Token::Slash,
                Token::Percent,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("42 3.5 1.0e3"),
            vec![
                Token::Integer(42),
                Token::Float(3.5),
                Token::Float(1000.0),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_ordinals() {
        assert_eq!(
            kinds("1ST 2nd 3RD 4th 5-TH"),
            vec![
                Token::Ordinal(1),
                Token::Ordinal(2),
                Token::Ordinal(3),
                Token::Ordinal(4),
                Token::Ordinal(5),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_double_quoted_string_escapes() {
        assert_eq!(
            kinds(r#""a""b""#),
            vec![Token::String("a\"b".to_string()), Token::Eof]
        );
    }

    #[test]
    fn test_single_quoted_string() {
        assert_eq!(
            kinds("'source'"),
            vec![Token::String("source".to_string()), Token::Eof]
        );
    }

    #[test]
    fn test_comments_skipped() {
        assert_eq!(
            kinds("1 -- trailing comment\n2 /* block */ 3"),
            vec![
                Token::Integer(1),
                Token::Integer(2),
                Token::Integer(3),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_dots() {
        assert_eq!(
            kinds("a.b..c"),
            vec![
                Token::Ident("a".to_string()),
                Token::Dot,
                Token::Ident("b".to_string()),
                Token::DotDot,
                Token::Ident("c".to_string()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_spans() {
        let tokens = tokenize("ab cd");
        assert_eq!(tokens[0].start, 0);
        assert_eq!(tokens[0].end, 2);
        assert_eq!(tokens[1].start, 3);
        assert_eq!(tokens[1].end, 5);
        assert_eq!(tokens[2].token, Token::Eof);
        assert_eq!(tokens[2].start, 5);
    }
}
