//! The substitution engine: rewrites one received payload through the rule
//! list.
//!
//! Scanning is left to right and non-overlapping. At each position the first
//! non-expired rule whose pattern matches fires, its replacement is emitted,
//! and scanning resumes after the matched bytes; replacement bytes are never
//! rescanned. Rules are applied within a single receive event only — a
//! pattern that straddles two reads never matches.

use bytes::BytesMut;

use crate::error::{Error, Result};
use crate::rules::RuleSet;

/// Largest payload pulled off a socket in one receive event.
pub const MAX_BUF: usize = 100_000;

/// Cap on the rewritten size of one event. Replacements may expand the
/// payload; growth past this cap terminates the flow.
pub const MAX_REWRITE: usize = 2 * MAX_BUF;

/// Outcome of rewriting one receive event.
#[derive(Debug)]
pub struct Rewrite {
    /// The rewritten payload. May be larger, smaller, or empty.
    pub data: BytesMut,
    /// Number of substitutions performed.
    pub replacements: usize,
}

/// Apply `rules` to `input`, consuming per-flow budgets from `ttl`.
///
/// `ttl` is parallel to the rule list: element `k` is the remaining
/// application budget for rule `k` on this flow. A negative budget never
/// changes (unlimited); a positive budget decrements on each application; a
/// rule at zero is inert.
pub fn rewrite(rules: &RuleSet, ttl: &mut [i32], input: &[u8]) -> Result<Rewrite> {
    debug_assert_eq!(ttl.len(), rules.len());

    let overflow = || Error::RewriteOverflow {
        input: input.len(),
        max: MAX_REWRITE,
    };

    let mut out = BytesMut::with_capacity(input.len());
    let mut replacements = 0;
    let mut i = 0;
    'scan: while i < input.len() {
        for (k, rule) in rules.iter().enumerate() {
            if ttl[k] != 0 && input[i..].starts_with(&rule.from) {
                println!("    Applying rule {rule}...");
                if ttl[k] > 0 {
                    ttl[k] -= 1;
                    if ttl[k] == 0 {
                        println!("    (rule just expired)");
                    }
                }
                if out.len() + rule.to.len() > MAX_REWRITE {
                    return Err(overflow());
                }
                out.extend_from_slice(&rule.to);
                replacements += 1;
                i += rule.from.len();
                continue 'scan;
            }
        }
        if out.len() >= MAX_REWRITE {
            return Err(overflow());
        }
        out.extend_from_slice(&input[i..i + 1]);
        i += 1;
    }

    Ok(Rewrite {
        data: out,
        replacements,
    })
}
