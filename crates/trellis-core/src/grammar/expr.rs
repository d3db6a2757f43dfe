//! Grammar expression nodes.

use super::RuleId;

/// Index into the grammar's expression arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(pub u32);

impl ExprId {
    /// The arena index.
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

/// A grammar expression node.
///
/// Expressions live in a flat arena on the grammar and reference each other
/// by [`ExprId`]; rules are referenced by [`RuleId`]. The arena-and-index
/// model keeps grammars cheap to clone and free of shared-ownership cycles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    /// The empty string `""`.
    EmptyString,

    /// A literal byte string.
    ByteString(Vec<u8>),

    /// A character class over inclusive codepoint ranges, e.g. `[a-z0-9]`.
    CharacterClass {
        /// Match any codepoint NOT in the ranges.
        negated: bool,
        /// Inclusive `(lo, hi)` codepoint ranges.
        ranges: Vec<(u32, u32)>,
    },

    /// Kleene star of a character class, e.g. `[^"\\]*`.
    CharacterClassStar {
        /// Match any codepoint NOT in the ranges.
        negated: bool,
        /// Inclusive `(lo, hi)` codepoint ranges.
        ranges: Vec<(u32, u32)>,
    },

    /// A reference to another rule.
    RuleRef(RuleId),

    /// Bounded repetition of a rule: `rule{min, max}`. `max = None` is
    /// unbounded.
    Repeat {
        /// The repeated rule.
        rule: RuleId,
        /// Minimum repetition count.
        min: u32,
        /// Maximum repetition count, unbounded if `None`.
        max: Option<u32>,
    },

    /// An ordered sequence of expressions.
    Sequence(Vec<ExprId>),

    /// A choice between expressions.
    Choices(Vec<ExprId>),

    /// The tag-dispatch macro: scan text for tag strings and dispatch.
    TagDispatch(TagDispatch),
}

impl Expr {
    /// True for the node kinds that are deduplicated by the builder.
    pub(crate) fn is_literal(&self) -> bool {
        matches!(
            self,
            Expr::EmptyString
                | Expr::ByteString(_)
                | Expr::CharacterClass { .. }
                | Expr::CharacterClassStar { .. }
        )
    }
}

/// Payload of [`Expr::TagDispatch`].
///
/// Scans arbitrary text until one of the tag strings occurs, then dispatches
/// to the tag's rule. After a dispatch the scan either loops back or stops.
/// Generation ends at EOS (`stop_eos`) or at one of the stop strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TagDispatch {
    /// `(tag string, dispatched rule)` pairs, in priority order.
    pub tag_rule_pairs: Vec<(Vec<u8>, RuleId)>,
    /// Whether generation may stop at EOS while scanning.
    pub stop_eos: bool,
    /// Stop strings terminating the scan when `stop_eos` is false.
    pub stop_strings: Vec<Vec<u8>>,
    /// Whether to resume scanning after a dispatched rule completes.
    pub loop_after_dispatch: bool,
    /// Strings that must not occur anywhere in the scanned text.
    pub excluded_strings: Vec<Vec<u8>>,
}
