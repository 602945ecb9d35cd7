use crate::error::{err, UserError};
use crate::Result;
use std::str::{FromStr, SplitWhitespace};

/// Whitespace-separated arguments of a command. Any parsing failure is
/// reported to the user with the expected usage.
pub(crate) struct Args<'a> {
    parts: SplitWhitespace<'a>,
    expected: &'static str,
}

impl<'a> Args<'a> {
    pub(crate) fn new(input: &'a str, expected: &'static str) -> Self {
        Self {
            parts: input.split_whitespace(),
            expected,
        }
    }

    fn invalid(&self) -> crate::Error {
        err!(UserError::InvalidArgs {
            expected: self.expected
        })
    }

    pub(crate) fn next<T: FromStr>(&mut self) -> Result<T> {
        self.parts
            .next()
            .and_then(|part| part.parse().ok())
            .ok_or_else(|| self.invalid())
    }

    pub(crate) fn next_str(&mut self) -> Result<&'a str> {
        self.parts.next().ok_or_else(|| self.invalid())
    }

    pub(crate) fn next_opt(&mut self) -> Option<&'a str> {
        self.parts.next()
    }

    /// Fails if there are any arguments left
    pub(crate) fn finish(mut self) -> Result {
        match self.parts.next() {
            Some(_) => Err(self.invalid()),
            None => Ok(()),
        }
    }
}
