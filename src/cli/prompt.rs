//! Interactive prompts.
//!
//! The engine never asks questions; commands consult a [`Prompter`] only when
//! the answer was not given on the command line.

use std::io::{BufRead, Stderr, StdinLock, Write};

use crate::error::Result;

/// Source of interactive answers.
pub trait Prompter {
    /// Asks a yes/no question. Anything but an explicit yes is no.
    ///
    /// # Errors
    ///
    /// Returns an error if the terminal cannot be read or written.
    fn confirm(&mut self, message: &str) -> Result<bool>;

    /// Asks which target to use. Returns `None` if no valid choice was made.
    ///
    /// # Errors
    ///
    /// Returns an error if the terminal cannot be read or written.
    fn select_target(&mut self, targets: &[&str]) -> Result<Option<String>>;
}

/// Prompter reading answers from a line-oriented input.
#[derive(Debug)]
pub struct TerminalPrompter<R, W> {
    input: R,
    output: W,
}

impl TerminalPrompter<StdinLock<'static>, Stderr> {
    /// Prompts on stderr and reads from stdin.
    #[must_use]
    pub fn stdio() -> Self {
        Self::new(std::io::stdin().lock(), std::io::stderr())
    }
}

impl<R: BufRead, W: Write> TerminalPrompter<R, W> {
    /// Creates a prompter over arbitrary streams.
    pub const fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn read_answer(&mut self) -> Result<String> {
        self.output.flush()?;
        let mut line = String::new();
        self.input.read_line(&mut line)?;
        Ok(line.trim().to_string())
    }
}

impl<R: BufRead, W: Write> Prompter for TerminalPrompter<R, W> {
    fn confirm(&mut self, message: &str) -> Result<bool> {
        write!(self.output, "{message} [y/N]: ")?;
        let answer = self.read_answer()?;
        Ok(answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes"))
    }

    fn select_target(&mut self, targets: &[&str]) -> Result<Option<String>> {
        writeln!(self.output, "Available targets:")?;
        for (i, target) in targets.iter().enumerate() {
            writeln!(self.output, "  {}) {target}", i + 1)?;
        }
        write!(self.output, "Select a target: ")?;

        let answer = self.read_answer()?;
        let chosen = answer
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| targets.get(i))
            .or_else(|| targets.iter().find(|t| **t == answer));

        Ok(chosen.map(ToString::to_string))
    }
}
