//! Command-string parsing.
//!
//! Control messages between services are short strings such as
//! `set_fd|12|01000002`. Parts are separated by spaces or pipes; empty parts
//! are dropped.

use smallvec::SmallVec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command<'a> {
    parts: SmallVec<[&'a str; 8]>,
}

impl<'a> Command<'a> {
    #[must_use]
    pub fn parse(input: &'a str) -> Self {
        Self {
            parts: input
                .split(|c: char| c == ' ' || c == '|')
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// First part, or `""` for an empty command.
    #[must_use]
    pub fn verb(&self) -> &'a str {
        self.parts.first().copied().unwrap_or("")
    }

    /// Argument `i` (0-based, after the verb).
    #[must_use]
    pub fn arg(&self, i: usize) -> Option<&'a str> {
        self.parts.get(i + 1).copied()
    }

    /// Argument `i` parsed as `T`.
    #[must_use]
    pub fn arg_as<T: std::str::FromStr>(&self, i: usize) -> Option<T> {
        self.arg(i)?.parse().ok()
    }

    #[must_use]
    pub fn args(&self) -> &[&'a str] {
        self.parts.get(1..).unwrap_or(&[])
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}
