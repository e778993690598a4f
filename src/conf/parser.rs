//! Token-handler state machine and the decoder driving it.
//!
//! The handler turns [`Token`]s into [`Command`]s and dispatches them to the
//! [`Block`] on top of its scope stack. `include` is handled here rather than
//! by any block: every file matched by its globs is decoded into the scope the
//! `include` appeared in.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use super::command::{Block, Command};
use super::token::{Token, Tokenizer};
use super::unescape::unescape;
use crate::error::{Error, Result};

/// Directive intercepted by the parser itself.
pub const INCLUDE_DIRECTIVE: &str = "include";

const MAX_INCLUDE_DEPTH: usize = 32;

/// Decodes configuration text into calls on a root [`Block`].
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    expand_includes: bool,
}

impl Default for Decoder {
    fn default() -> Self {
        Self {
            expand_includes: true,
        }
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A decoder that never touches the filesystem: `include` reaches the
    /// block as an ordinary directive.
    pub fn without_includes() -> Self {
        Self {
            expand_includes: false,
        }
    }

    /// Decode one configuration file into `root`.
    pub fn decode_file(&self, root: &mut dyn Block, path: impl AsRef<Path>) -> Result<()> {
        self.decode_path(root, path.as_ref(), 0)
    }

    /// Decode in-memory configuration text into `root`. Relative includes
    /// resolve against the working directory.
    pub fn decode_str(&self, root: &mut dyn Block, text: &str) -> Result<()> {
        self.decode_reader(root, text.as_bytes(), None, 0)
    }

    /// Decode every file matching `pattern` into `block`, in path order.
    pub fn decode_glob(
        &self,
        block: &mut dyn Block,
        pattern: &str,
        base_dir: Option<&Path>,
    ) -> Result<()> {
        self.decode_glob_at(block, pattern, base_dir, 0)
    }

    fn decode_glob_at(
        &self,
        block: &mut dyn Block,
        pattern: &str,
        base_dir: Option<&Path>,
        depth: usize,
    ) -> Result<()> {
        if depth > MAX_INCLUDE_DEPTH {
            return Err(Error::config(format!(
                "includes nested deeper than {} levels at '{}'",
                MAX_INCLUDE_DEPTH, pattern
            )));
        }

        let full = match base_dir {
            Some(dir) if Path::new(pattern).is_relative() => dir.join(pattern),
            _ => PathBuf::from(pattern),
        };
        let full = full.to_string_lossy();
        let paths = glob::glob(&full).map_err(|e| {
            Error::config(format!("invalid include pattern '{}': {}", pattern, e))
        })?;

        let mut matched = false;
        for entry in paths {
            let path = entry.map_err(|e| Error::Io(e.into_error()))?;
            matched = true;
            tracing::debug!(path = %path.display(), "including config file");
            self.decode_path(block, &path, depth)?;
        }

        if !matched {
            return Err(Error::ConfigNotFound(pattern.to_string()));
        }
        Ok(())
    }

    fn decode_path(&self, block: &mut dyn Block, path: &Path, depth: usize) -> Result<()> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::ConfigNotFound(path.display().to_string()),
            _ => Error::Io(e),
        })?;
        self.decode_reader(block, BufReader::new(file), path.parent(), depth)
    }

    fn decode_reader<R: BufRead>(
        &self,
        root: &mut dyn Block,
        reader: R,
        base_dir: Option<&Path>,
        depth: usize,
    ) -> Result<()> {
        let mut handler = TokenHandler::new(self, base_dir, depth);
        for token in Tokenizer::new(reader) {
            handler.handle(root, token?)?;
        }
        handler.finish()
    }
}

/// Parser state for one file.
struct TokenHandler<'d> {
    decoder: &'d Decoder,
    base_dir: Option<PathBuf>,
    depth: usize,

    stack: Vec<Box<dyn Block>>,

    directive: String,
    args: Vec<String>,
    arg: String,

    line: String,
    line_number: usize,

    comment: bool,
    double_quote: bool,
    single_quote: bool,
    escaped: bool,
}

impl<'d> TokenHandler<'d> {
    fn new(decoder: &'d Decoder, base_dir: Option<&Path>, depth: usize) -> Self {
        Self {
            decoder,
            base_dir: base_dir.map(Path::to_path_buf),
            depth,
            stack: Vec::new(),
            directive: String::new(),
            args: Vec::new(),
            arg: String::new(),
            line: String::new(),
            line_number: 1,
            comment: false,
            double_quote: false,
            single_quote: false,
            escaped: false,
        }
    }

    fn error(&self, message: &str) -> Error {
        Error::parse(self.line_number, self.line.clone(), message)
    }

    fn is_quoted(&self) -> bool {
        self.double_quote || self.single_quote
    }

    /// Nothing is pending: no directive name and no argument in progress.
    fn is_call_committed(&self) -> bool {
        self.directive.is_empty() && self.arg.is_empty()
    }

    /// Move the argument buffer into the directive name or argument list.
    fn commit(&mut self, allow_empty: bool) {
        if self.arg.is_empty() && !allow_empty {
            return;
        }
        let arg = std::mem::take(&mut self.arg);
        if self.directive.is_empty() {
            self.directive = arg;
        } else {
            self.args.push(unescape(&arg));
        }
    }

    fn take_command(&mut self) -> Command {
        Command::new(
            self.line_number,
            std::mem::take(&mut self.directive),
            std::mem::take(&mut self.args),
        )
    }

    fn current<'s>(&'s mut self, root: &'s mut dyn Block) -> &'s mut dyn Block {
        match self.stack.last_mut() {
            Some(block) => block.as_mut(),
            None => root,
        }
    }

    fn new_line(&mut self) {
        self.line_number += 1;
        self.line.clear();
        self.comment = false;
    }

    fn handle(&mut self, root: &mut dyn Block, token: Token) -> Result<()> {
        if token != Token::Newline {
            self.line.push_str(&token.to_string());
        }

        if self.comment {
            if token == Token::Newline {
                self.new_line();
            }
            return Ok(());
        }

        if std::mem::take(&mut self.escaped) {
            self.handle_escaped(token);
            return Ok(());
        }

        match token {
            Token::StringRun(run) => self.arg.push_str(&run),
            Token::Whitespace(ch) => {
                if self.is_quoted() {
                    self.arg.push(ch);
                } else {
                    self.commit(false);
                }
            }
            Token::Newline => {
                if self.is_quoted() {
                    self.arg.push('\n');
                } else {
                    self.commit(false);
                    if !self.is_call_committed() {
                        return Err(self.error("unexpected new line"));
                    }
                }
                self.new_line();
            }
            Token::DoubleQuote => {
                if self.single_quote {
                    self.arg.push('"');
                } else if self.double_quote {
                    self.double_quote = false;
                    self.commit(true);
                } else if self.directive.is_empty() {
                    return Err(self.error("unexpected double quote"));
                } else {
                    self.double_quote = true;
                }
            }
            Token::SingleQuote => {
                if self.double_quote {
                    self.arg.push('\'');
                } else if self.single_quote {
                    self.single_quote = false;
                    self.commit(true);
                } else if self.directive.is_empty() {
                    return Err(self.error("unexpected single quote"));
                } else {
                    self.single_quote = true;
                }
            }
            Token::Hash => {
                if self.is_quoted() {
                    self.arg.push('#');
                } else if !self.is_call_committed() {
                    return Err(self.error("unexpected #"));
                } else {
                    self.comment = true;
                }
            }
            Token::Semicolon => {
                if self.is_quoted() {
                    self.arg.push(';');
                } else {
                    self.semicolon(root)?;
                }
            }
            Token::OpenBrace => {
                if self.is_quoted() {
                    self.arg.push('{');
                } else {
                    self.open_brace(root)?;
                }
            }
            Token::CloseBrace => {
                if self.is_quoted() {
                    self.arg.push('}');
                } else if !self.is_call_committed() {
                    return Err(self.error("unexpected closing curly bracket"));
                } else if self.stack.pop().is_none() {
                    return Err(self.error("unexpected closing curly bracket"));
                }
            }
            Token::Backslash => {
                if self.directive.is_empty() {
                    return Err(self.error("unexpected backslash"));
                }
                self.escaped = true;
            }
        }
        Ok(())
    }

    /// The token right after a backslash is literal text.
    fn handle_escaped(&mut self, token: Token) {
        match token {
            Token::StringRun(run) => {
                self.arg.push('\\');
                self.arg.push_str(&run);
            }
            Token::Backslash => self.arg.push_str("\\\\"),
            Token::Newline => {
                self.arg.push('\n');
                self.new_line();
            }
            other => self.arg.push_str(&other.to_string()),
        }
    }

    fn semicolon(&mut self, root: &mut dyn Block) -> Result<()> {
        if self.is_call_committed() {
            return Err(self.error("unexpected semicolon"));
        }
        self.commit(false);
        let command = self.take_command();

        let decoder = self.decoder;
        let depth = self.depth;
        let base_dir = self.base_dir.clone();
        let block = self.current(root);

        if decoder.expand_includes && command.name() == INCLUDE_DIRECTIVE {
            if command.args().is_empty() {
                return Err(Error::args_number(&command));
            }
            for pattern in command.args() {
                decoder.decode_glob_at(&mut *block, pattern, base_dir.as_deref(), depth + 1)?;
            }
            return Ok(());
        }

        block.call(&command)
    }

    fn open_brace(&mut self, root: &mut dyn Block) -> Result<()> {
        if self.is_call_committed() {
            return Err(self.error("unexpected opening curly bracket"));
        }
        self.commit(false);
        let command = self.take_command();
        if self.decoder.expand_includes && command.name() == INCLUDE_DIRECTIVE {
            return Err(Error::block_not_allowed(&command));
        }

        let nested = self.current(root).call_block(&command)?;
        self.stack.push(nested);
        Ok(())
    }

    fn finish(self) -> Result<()> {
        if self.is_quoted() || self.escaped {
            return Err(self.error("unexpected end of file, unterminated string"));
        }
        if !self.is_call_committed() {
            return Err(self.error("unexpected end of file, expected semicolon"));
        }
        if !self.stack.is_empty() {
            return Err(self.error("unexpected end of file, expected closing curly bracket"));
        }
        Ok(())
    }
}
