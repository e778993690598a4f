//! Lazy tokenizer for the configuration language.

use std::fmt;
use std::io::{self, BufRead};

/// Bytes that end a string run and form tokens of their own.
const DELIMITERS: &[u8] = b"\r\n\t\x0c\x0b #\"';{}\\";

/// One structural piece of configuration text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    StringRun(String),
    Whitespace(char),
    Newline,
    DoubleQuote,
    SingleQuote,
    Hash,
    Semicolon,
    OpenBrace,
    CloseBrace,
    Backslash,
}

impl Token {
    fn from_delimiter(byte: u8) -> Self {
        match byte {
            b'\n' => Token::Newline,
            b'"' => Token::DoubleQuote,
            b'\'' => Token::SingleQuote,
            b'#' => Token::Hash,
            b';' => Token::Semicolon,
            b'{' => Token::OpenBrace,
            b'}' => Token::CloseBrace,
            b'\\' => Token::Backslash,
            other => Token::Whitespace(other as char),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::StringRun(s) => f.write_str(s),
            Token::Whitespace(c) => write!(f, "{}", c),
            Token::Newline => f.write_str("\n"),
            Token::DoubleQuote => f.write_str("\""),
            Token::SingleQuote => f.write_str("'"),
            Token::Hash => f.write_str("#"),
            Token::Semicolon => f.write_str(";"),
            Token::OpenBrace => f.write_str("{"),
            Token::CloseBrace => f.write_str("}"),
            Token::Backslash => f.write_str("\\"),
        }
    }
}

/// Splits a buffered reader into [`Token`]s on demand.
///
/// Each scan step reads up to the next delimiter and yields at most two
/// tokens: the run of text before it (when non-empty) and the delimiter.
pub struct Tokenizer<R> {
    reader: R,
    pending: Option<Token>,
}

impl<R: BufRead> Tokenizer<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pending: None,
        }
    }

    fn run(bytes: Vec<u8>) -> io::Result<Token> {
        String::from_utf8(bytes)
            .map(Token::StringRun)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn scan(&mut self) -> io::Result<Option<Token>> {
        let mut run = Vec::new();
        loop {
            let buf = match self.reader.fill_buf() {
                Ok(buf) => buf,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            if buf.is_empty() {
                return if run.is_empty() {
                    Ok(None)
                } else {
                    Self::run(run).map(Some)
                };
            }

            match buf.iter().position(|b| DELIMITERS.contains(b)) {
                Some(at) => {
                    run.extend_from_slice(&buf[..at]);
                    let delimiter = Token::from_delimiter(buf[at]);
                    self.reader.consume(at + 1);
                    if run.is_empty() {
                        return Ok(Some(delimiter));
                    }
                    self.pending = Some(delimiter);
                    return Self::run(run).map(Some);
                }
                None => {
                    let len = buf.len();
                    run.extend_from_slice(buf);
                    self.reader.consume(len);
                }
            }
        }
    }
}

impl<R: BufRead> Iterator for Tokenizer<R> {
    type Item = io::Result<Token>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(token) = self.pending.take() {
            return Some(Ok(token));
        }
        self.scan().transpose()
    }
}
