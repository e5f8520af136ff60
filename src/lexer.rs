//! Lexer for accelerator assembly lines using logos
//!
//! Supports tokens like:
//! - Words: WRF, VFUX, SW8, VWR_0[3], CSD_2, IB0, PK8TO12, AddrFile
//! - Numbers: 12, 0x1f
//! - Comments: everything after `;`

use logos::Logos;

/// Token types for one assembly line
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")] // Skip whitespace
#[logos(skip r";[^\n]*")] // Skip comments
pub enum Token {
    #[regex(r"0[xX][0-9a-fA-F]+", |lex| u64::from_str_radix(&lex.slice()[2..], 16).ok())]
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<u64>().ok())]
    Number(u64),

    // Mnemonics, storage tokens and stream keywords
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*(\[[0-9]+\])?", |lex| lex.slice().to_string())]
    Word(String),
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{}", n),
            Token::Word(s) => write!(f, "{}", s),
        }
    }
}

/// Unlexable text within a line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    /// Byte offset in the line
    pub column: usize,
    pub text: String,
}

/// Lexer wrapper that provides a stream of tokens for one line
pub struct Lexer<'source> {
    inner: logos::Lexer<'source, Token>,
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            inner: Token::lexer(source),
        }
    }

    /// Get current position in source
    pub fn span(&self) -> std::ops::Range<usize> {
        self.inner.span()
    }

    /// Collect the whole line, stopping at the first bad token
    pub fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        while let Some(result) = self.inner.next() {
            match result {
                Ok(tok) => tokens.push(tok),
                Err(()) => {
                    return Err(LexError {
                        column: self.span().start,
                        text: self.inner.slice().to_string(),
                    })
                }
            }
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(s: &str) -> Token {
        Token::Word(s.to_string())
    }

    #[test]
    fn test_instruction_line() {
        let tokens = Lexer::new("VFUX MUL SW8 VWR_0[2] VWR_0[2] CSD_3").tokenize().unwrap();
        assert_eq!(
            tokens,
            vec![
                word("VFUX"),
                word("MUL"),
                word("SW8"),
                word("VWR_0[2]"),
                word("VWR_0[2]"),
                word("CSD_3"),
            ]
        );
    }

    #[test]
    fn test_numbers() {
        let tokens = Lexer::new("LOOP 0 0x1F 12").tokenize().unwrap();
        assert_eq!(
            tokens,
            vec![word("LOOP"), Token::Number(0), Token::Number(31), Token::Number(12)]
        );
    }

    #[test]
    fn test_comments_and_blanks() {
        assert!(Lexer::new("   ; just a comment").tokenize().unwrap().is_empty());
        assert!(Lexer::new("").tokenize().unwrap().is_empty());
        let tokens = Lexer::new("EXEC ; run it").tokenize().unwrap();
        assert_eq!(tokens, vec![word("EXEC")]);
    }

    #[test]
    fn test_bad_character() {
        let err = Lexer::new("WRF IB0 $").tokenize().unwrap_err();
        assert_eq!(err.column, 8);
        assert_eq!(err.text, "$");
    }
}
