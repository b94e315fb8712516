//! Substitution rule model and the `s/pat/repl[/count]` parser.

use std::fmt;

use crate::error::{Error, Result};

/// TTL sentinel for rules without an application limit.
pub const UNLIMITED: i32 = -1;

/// One byte-substitution rule, frozen at startup.
///
/// `from` and `to` are the decoded byte patterns; `display_from` and
/// `display_to` keep the textual forms from the command line for trace
/// output. `initial_ttl` is the per-flow application budget
/// ([`UNLIMITED`] when the rule never expires).
#[derive(Debug, Clone)]
pub struct Rule {
    /// Bytes to match. Never empty.
    pub from: Vec<u8>,
    /// Replacement bytes. May be empty.
    pub to: Vec<u8>,
    /// Match pattern as written on the command line.
    pub display_from: String,
    /// Replacement as written on the command line.
    pub display_to: String,
    /// Per-flow application budget; [`UNLIMITED`] means no limit.
    pub initial_ttl: i32,
}

impl Rule {
    /// Parse one rule of the form `s/<pat>/<repl>[/<count>]`.
    ///
    /// Both patterns accept `%%` for a literal `%` and `%HH` (case-insensitive
    /// hex) for an arbitrary byte, so `0x00` and the `/` delimiter can appear
    /// in either side. A missing, empty, or non-positive count means the rule
    /// never expires.
    pub fn parse(text: &str) -> Result<Self> {
        let rest = text
            .strip_prefix("s/")
            .ok_or_else(|| syntax(text, "missing leading 's/'"))?;
        let (pat, rest) = rest
            .split_once('/')
            .ok_or_else(|| syntax(text, "missing '/' between pattern and replacement"))?;
        let (repl, count) = match rest.split_once('/') {
            Some((repl, count)) => (repl, Some(count)),
            None => (rest, None),
        };

        let from = unescape(pat, text)?;
        if from.is_empty() {
            return Err(syntax(text, "empty match pattern"));
        }
        let to = unescape(repl, text)?;

        // Only positive counts limit the rule; everything else (missing,
        // empty, zero, negative, digit-free) means unlimited.
        let initial_ttl = count
            .map(leading_int)
            .filter(|n| *n > 0)
            .unwrap_or(UNLIMITED);

        Ok(Rule {
            from,
            to,
            display_from: pat.to_string(),
            display_to: repl.to_string(),
            initial_ttl,
        })
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s/{}/{}", self.display_from, self.display_to)
    }
}

fn syntax(rule: &str, reason: &str) -> Error {
    Error::RuleSyntax {
        rule: rule.to_string(),
        reason: reason.to_string(),
    }
}

/// Decode `%%` and `%HH` escapes into raw bytes.
fn unescape(text: &str, rule: &str) -> Result<Vec<u8>> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        match bytes.get(i + 1).copied() {
            Some(b'%') => {
                out.push(b'%');
                i += 2;
            }
            Some(hi) => {
                let lo = bytes
                    .get(i + 2)
                    .copied()
                    .ok_or_else(|| syntax(rule, "truncated '%' escape"))?;
                let hi = hex_digit(hi).ok_or_else(|| syntax(rule, "non-hex digit in '%' escape"))?;
                let lo = hex_digit(lo).ok_or_else(|| syntax(rule, "non-hex digit in '%' escape"))?;
                out.push(hi << 4 | lo);
                i += 3;
            }
            None => return Err(syntax(rule, "truncated '%' escape")),
        }
    }
    Ok(out)
}

fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

/// Read the quantifier the way C's `atoi` does: optional sign, then the
/// leading digit run; anything after it is ignored. No digits yields 0.
fn leading_int(text: &str) -> i32 {
    let text = text.trim_start();
    let (negative, digits) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    let run = digits.bytes().take_while(u8::is_ascii_digit).count();
    if run == 0 {
        return 0;
    }
    let magnitude = digits[..run]
        .parse::<i64>()
        .unwrap_or(i64::MAX)
        .min(i32::MAX as i64) as i32;
    if negative { -magnitude } else { magnitude }
}

/// Ordered rule list, frozen at startup.
///
/// Order is the command-line order and is semantically significant: during
/// substitution the first non-expired rule that matches wins.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        RuleSet { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    /// Fresh TTL vector for a new flow, one element per rule.
    pub fn initial_ttls(&self) -> Vec<i32> {
        self.rules.iter().map(|r| r.initial_ttl).collect()
    }
}
