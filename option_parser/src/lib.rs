// Copyright © 2026 The cowsr Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Parser for `key=value,...` option strings. Values may be double quoted
//! to carry commas; a doubled quote inside quotes stands for one quote.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Default)]
pub struct OptionParser {
    options: HashMap<String, Option<String>>,
}

#[derive(Error, Debug)]
pub enum OptionParserError {
    #[error("unknown option: {0}")]
    UnknownOption(String),
    #[error("invalid syntax: {0}")]
    InvalidSyntax(String),
    #[error("unable to convert {1} for {0}")]
    Conversion(String /* field */, String /* value */),
}
type OptionParserResult<T> = std::result::Result<T, OptionParserError>;

fn split_commas(s: &str) -> OptionParserResult<Vec<String>> {
    let mut list = Vec::new();
    let mut in_quotes = false;
    let mut current = String::new();

    for c in s.trim().chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                list.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    list.push(current);

    if in_quotes {
        return Err(OptionParserError::InvalidSyntax(s.to_owned()));
    }
    Ok(list)
}

// Input quotes are balanced, split_commas made sure of it.
fn dequote(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev = '\0';
    let mut in_quotes = false;
    for c in s.chars() {
        if c == '"' {
            if prev == '"' && !in_quotes {
                out.push('"');
            }
            in_quotes = !in_quotes;
        } else {
            out.push(c);
        }
        prev = c;
    }
    out
}

impl OptionParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the values of `input`. Options not registered with
    /// [`OptionParser::add`] are rejected.
    pub fn parse(&mut self, input: &str) -> OptionParserResult<()> {
        if input.trim().is_empty() {
            return Ok(());
        }

        for option in split_commas(input)? {
            let Some((key, value)) = option.split_once('=') else {
                return Err(OptionParserError::InvalidSyntax(option.clone()));
            };
            match self.options.get_mut(key.trim()) {
                None => return Err(OptionParserError::UnknownOption(key.trim().to_owned())),
                Some(slot) => *slot = Some(value.trim().to_owned()),
            }
        }
        Ok(())
    }

    pub fn add(&mut self, option: &str) -> &mut Self {
        assert!(
            !option.contains(['"', '=', ',']),
            "forbidden character in option name"
        );
        self.options.insert(option.to_owned(), None);
        self
    }

    pub fn get(&self, option: &str) -> Option<String> {
        self.options
            .get(option)
            .and_then(|v| v.as_deref())
            .filter(|v| !v.is_empty())
            .map(dequote)
    }

    pub fn is_set(&self, option: &str) -> bool {
        self.options.get(option).is_some_and(Option::is_some)
    }

    /// Parse the value of `option`; an absent or empty value is `None`.
    pub fn convert<T: FromStr>(&self, option: &str) -> OptionParserResult<Option<T>> {
        match self.get(option) {
            None => Ok(None),
            Some(v) => v
                .parse::<T>()
                .map(Some)
                .map_err(|_| OptionParserError::Conversion(option.to_owned(), v)),
        }
    }
}

/// Byte count with an optional `K`, `M` or `G` suffix.
pub struct ByteSized(pub u64);

#[derive(Error, Debug)]
pub enum ByteSizedParseError {
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl FromStr for ByteSized {
    type Err = ByteSizedParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let (digits, shift) = if let Some(n) = s.strip_suffix('K') {
            (n, 10)
        } else if let Some(n) = s.strip_suffix('M') {
            (n, 20)
        } else if let Some(n) = s.strip_suffix('G') {
            (n, 30)
        } else {
            (s, 0)
        };

        digits
            .parse::<u64>()
            .ok()
            .and_then(|v| v.checked_mul(1 << shift))
            .map(ByteSized)
            .ok_or_else(|| ByteSizedParseError::InvalidValue(s.to_owned()))
    }
}

/// Non-negative number of seconds, fractions allowed.
pub struct Seconds(pub Duration);

#[derive(Error, Debug)]
pub enum SecondsParseError {
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl FromStr for Seconds {
    type Err = SecondsParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim()
            .parse::<f64>()
            .ok()
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .map(Seconds)
            .ok_or_else(|| SecondsParseError::InvalidValue(s.to_owned()))
    }
}
