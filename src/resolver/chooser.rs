//! Manual disambiguation
//!
//! The resolver calls a `Chooser` when fuzzy matching cannot decide. The
//! terminal implementation asks the operator; non-interactive runs defer.

use crate::source::ReferenceEntity;
use std::io::{self, BufRead, Write};

/// A scored match offered for selection
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub entity: ReferenceEntity,
    pub score: f64,
}

/// The operator's answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    /// Index into the candidate slice
    Select(usize),
    Skip,
}

/// Picks one of several candidates for a name
pub trait Chooser {
    fn choose(&mut self, name: &str, candidates: &[Candidate]) -> Choice;
}

/// Always skips, leaving the name unresolved for a later interactive run
#[derive(Debug, Default, Clone, Copy)]
pub struct DeferringChooser;

impl Chooser for DeferringChooser {
    fn choose(&mut self, _name: &str, _candidates: &[Candidate]) -> Choice {
        Choice::Skip
    }
}

/// Prints a numbered candidate table and reads the selection
///
/// Accepts a number, `s` to skip, or an empty line for the first
/// candidate. End of input counts as a skip.
pub struct TerminalChooser<R, W> {
    input: R,
    output: W,
}

impl TerminalChooser<io::StdinLock<'static>, io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> TerminalChooser<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn render(&mut self, name: &str, candidates: &[Candidate]) -> io::Result<()> {
        writeln!(self.output, "\nMultiple matches found for '{}':", name)?;
        writeln!(self.output, "{:>3}  {:<28} {:<24} {:>9} {:>6}", "#", "Name", "Faction/Party", "id", "Score")?;
        for (idx, c) in candidates.iter().enumerate() {
            writeln!(
                self.output,
                "{:>3}  {:<28} {:<24} {:>9} {:>5.0}%",
                idx + 1,
                c.entity.name,
                c.entity.affiliation.as_deref().unwrap_or("-"),
                c.entity.entity_id,
                c.score * 100.0
            )?;
        }
        Ok(())
    }

    fn read_choice(&mut self, count: usize) -> io::Result<Choice> {
        loop {
            write!(self.output, "Select number (or 's' to skip) [1]: ")?;
            self.output.flush()?;

            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                return Ok(Choice::Skip);
            }
            let answer = line.trim();
            if answer.is_empty() {
                return Ok(Choice::Select(0));
            }
            if answer.eq_ignore_ascii_case("s") {
                return Ok(Choice::Skip);
            }
            match answer.parse::<usize>() {
                Ok(n) if (1..=count).contains(&n) => return Ok(Choice::Select(n - 1)),
                _ => writeln!(self.output, "Please enter a number between 1 and {}, or 's'.", count)?,
            }
        }
    }
}

impl<R: BufRead, W: Write> Chooser for TerminalChooser<R, W> {
    fn choose(&mut self, name: &str, candidates: &[Candidate]) -> Choice {
        if candidates.is_empty() {
            return Choice::Skip;
        }
        let answer = self
            .render(name, candidates)
            .and_then(|_| self.read_choice(candidates.len()));
        match answer {
            Ok(choice) => choice,
            Err(e) => {
                tracing::warn!(error = %e, "could not read selection; skipping");
                Choice::Skip
            }
        }
    }
}
