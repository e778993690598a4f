//! Directive calls and the scopes that receive them.

use std::fmt;

use crate::error::Result;

/// One parsed directive: `name arg1 arg2 ...` ending in `;` or `{`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    line: usize,
    name: String,
    args: Vec<String>,
}

impl Command {
    pub fn new(line: usize, name: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            line,
            name: name.into(),
            args,
        }
    }

    pub fn line(&self) -> usize {
        self.line
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The single argument of a one-argument directive.
    pub fn single_arg(&self) -> Option<&str> {
        match self.args.as_slice() {
            [arg] => Some(arg),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "'{}'", arg)?;
        }
        f.write_str(")")
    }
}

/// A configuration scope.
///
/// `call` receives `name args;` directives. `call_block` receives
/// `name args { ... }` and returns the scope that takes the nested
/// directives.
pub trait Block: Send {
    fn call(&mut self, command: &Command) -> Result<()>;

    fn call_block(&mut self, command: &Command) -> Result<Box<dyn Block>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use prifma_test_support::test_report;

    #[test]
    fn test_command_display() {
        let t = test_report!("Commands render as name('arg', ...)");
        let cmd = Command::new(3, "outgoing_ip", vec!["1.2.3.4".into(), "::1".into()]);
        t.assert_eq("display", &cmd.to_string(), &"outgoing_ip('1.2.3.4', '::1')".to_string());
        t.assert_eq(
            "no args",
            &Command::new(1, "tunnel", vec![]).to_string(),
            &"tunnel()".to_string(),
        );
    }

    #[test]
    fn test_single_arg() {
        let t = test_report!("single_arg only answers for exactly one argument");
        t.assert_eq("one", &Command::new(1, "a", vec!["x".into()]).single_arg(), &Some("x"));
        t.assert_eq("none", &Command::new(1, "a", vec![]).single_arg(), &None);
        t.assert_eq(
            "two",
            &Command::new(1, "a", vec!["x".into(), "y".into()]).single_arg(),
            &None,
        );
    }
}
