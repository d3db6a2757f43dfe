//! Grammar intermediate representation and its compilation pipeline.
//!
//! A [`Grammar`] owns an ordered rule list and a typed expression arena.
//! Front-ends construct it through [`GrammarBuilder`]; the normalizer and
//! optimizer lower it to canonical form and attach per-rule automata, after
//! which it is immutable.

mod builder;
mod expr;
mod fsm_builder;
mod hasher;
mod normalizer;
mod optimizer;

pub use builder::GrammarBuilder;
pub use expr::{Expr, ExprId, TagDispatch};
pub use normalizer::normalize;
pub use optimizer::optimize;
pub(crate) use fsm_builder::build_fsms;
pub(crate) use hasher::hash_fsms;

use std::fmt;
use std::sync::Arc;

use crate::fsm::{CompactFsm, CompactFsmWithStartEnd};
use crate::support::{hash_bytes, hash_combine64};

/// Index into the grammar's rule list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(pub u32);

impl RuleId {
    /// The rule-list index.
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

/// A named production.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Rule name, unique within the grammar.
    pub name: String,
    /// Body expression.
    pub body: ExprId,
    /// Optional right-context assertion, always a `Sequence` after
    /// normalization.
    pub lookahead: Option<ExprId>,
    /// Whether the lookahead captures the rule's complete right context.
    pub is_exact_lookahead: bool,
}

/// A context-free grammar with per-rule automata attached after
/// optimization.
#[derive(Debug, Clone, Default)]
pub struct Grammar {
    pub(crate) rules: Vec<Rule>,
    pub(crate) exprs: Vec<Expr>,
    pub(crate) root_rule: RuleId,
    /// Rule ids that can derive the empty string, sorted ascending.
    pub(crate) allow_empty_rule_ids: Vec<RuleId>,
    /// The shared complete automaton, present after optimization.
    pub(crate) complete_fsm: Option<Arc<CompactFsm>>,
    /// Per-rule automata in complete-FSM numbering, indexed by rule id.
    pub(crate) per_rule_fsms: Vec<Option<CompactFsmWithStartEnd>>,
    /// Per-rule canonical fingerprints, indexed by rule id.
    pub(crate) per_rule_fsm_hashes: Vec<Option<u64>>,
    /// Per-rule `(old state id, BFS-renumbered id)` pairs, sorted by old id.
    pub(crate) per_rule_new_state_ids: Vec<Option<Vec<(usize, u32)>>>,
}

impl Grammar {
    /// The root rule id.
    pub fn root_rule_id(&self) -> RuleId {
        self.root_rule
    }

    /// The root rule.
    pub fn root_rule(&self) -> &Rule {
        self.rule(self.root_rule)
    }

    /// Get a rule by id.
    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id.idx()]
    }

    /// Get an expression by id.
    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.idx()]
    }

    /// Number of rules.
    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    /// All rules, in id order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// True if `rule` can derive the empty string (set by the optimizer).
    pub fn allows_empty(&self, rule: RuleId) -> bool {
        self.allow_empty_rule_ids.binary_search(&rule).is_ok()
    }

    /// The rule's automaton, if its body lowered to one.
    pub fn per_rule_fsm(&self, rule: RuleId) -> Option<&CompactFsmWithStartEnd> {
        self.per_rule_fsms.get(rule.idx()).and_then(|f| f.as_ref())
    }

    /// The rule's canonical automaton fingerprint, if it was hashable.
    pub fn fsm_hash(&self, rule: RuleId) -> Option<u64> {
        self.per_rule_fsm_hashes.get(rule.idx()).and_then(|h| *h)
    }

    /// BFS-renumbered id of `state` within the rule's hashed automaton.
    pub fn renumbered_state(&self, rule: RuleId, state: usize) -> Option<u32> {
        let mapping = self.per_rule_new_state_ids.get(rule.idx())?.as_ref()?;
        mapping
            .binary_search_by_key(&state, |&(old, _)| old)
            .ok()
            .map(|i| mapping[i].1)
    }

    /// Structural 64-bit hash of a normalized sequence expression, used to
    /// refine crossing-cache keys with the lookahead assertion.
    ///
    /// Returns `None` when the sequence contains an element whose identity
    /// is not stable across grammars (an unhashed rule reference or a
    /// repetition).
    pub fn sequence_hash(&self, id: ExprId) -> Option<u64> {
        let Expr::Sequence(elements) = self.expr(id) else {
            return None;
        };
        let mut acc = hash_combine64(&[elements.len() as u64]);
        for &element in elements {
            let h = match self.expr(element) {
                Expr::EmptyString => hash_combine64(&[1]),
                Expr::ByteString(bytes) => hash_combine64(&[2, hash_bytes(bytes)]),
                Expr::CharacterClass { negated, ranges }
                | Expr::CharacterClassStar { negated, ranges } => {
                    let star = matches!(self.expr(element), Expr::CharacterClassStar { .. });
                    let mut tokens = vec![3, u64::from(*negated), u64::from(star)];
                    for &(lo, hi) in ranges {
                        tokens.push(lo as u64);
                        tokens.push(hi as u64);
                    }
                    hash_combine64(&tokens)
                }
                Expr::RuleRef(rule) => hash_combine64(&[4, self.fsm_hash(*rule)?]),
                _ => return None,
            };
            acc = hash_combine64(&[acc, h]);
        }
        Some(acc)
    }

    /// Estimated heap footprint in bytes, used by the compiled-grammar
    /// cache's size accounting.
    pub fn memory_bytes(&self) -> usize {
        let rules: usize = self
            .rules
            .iter()
            .map(|r| std::mem::size_of::<Rule>() + r.name.len())
            .sum();
        let exprs: usize = self
            .exprs
            .iter()
            .map(|e| {
                std::mem::size_of::<Expr>()
                    + match e {
                        Expr::ByteString(b) => b.len(),
                        Expr::CharacterClass { ranges, .. }
                        | Expr::CharacterClassStar { ranges, .. } => ranges.len() * 8,
                        Expr::Sequence(ids) | Expr::Choices(ids) => ids.len() * 4,
                        Expr::TagDispatch(td) => {
                            td.tag_rule_pairs.iter().map(|(t, _)| t.len() + 8).sum::<usize>()
                                + td.stop_strings.iter().map(Vec::len).sum::<usize>()
                                + td.excluded_strings.iter().map(Vec::len).sum::<usize>()
                        }
                        _ => 0,
                    }
            })
            .sum();
        let fsm = self
            .complete_fsm
            .as_ref()
            .map_or(0, |f| f.memory_bytes());
        rules + exprs + fsm
    }

    /// Build a grammar accepting any of `grammars` (a fresh root choosing
    /// between their roots).
    pub fn union_of(grammars: &[Grammar]) -> Grammar {
        let mut builder = GrammarBuilder::new();
        let root = builder.add_empty_rule("root");
        let mut choices = Vec::with_capacity(grammars.len());
        for grammar in grammars {
            let sub_root = copy_sub_grammar(&mut builder, grammar);
            let rule_ref = builder.add_rule_ref(sub_root);
            choices.push(builder.add_sequence(vec![rule_ref]));
        }
        let body = builder.add_choices(choices);
        builder.update_rule_body(root, body);
        builder.build(root)
    }

    /// Build a grammar accepting the concatenation of `grammars` in order.
    pub fn concat_of(grammars: &[Grammar]) -> Grammar {
        let mut builder = GrammarBuilder::new();
        let root = builder.add_empty_rule("root");
        let mut sequence = Vec::with_capacity(grammars.len());
        for grammar in grammars {
            let sub_root = copy_sub_grammar(&mut builder, grammar);
            sequence.push(builder.add_rule_ref(sub_root));
        }
        let seq = builder.add_sequence(sequence);
        let body = builder.add_choices(vec![seq]);
        builder.update_rule_body(root, body);
        builder.build(root)
    }
}

/// Copy every rule of `sub` into `builder` under fresh unique names,
/// remapping rule references. Returns the new id of `sub`'s root rule.
pub(crate) fn copy_sub_grammar(builder: &mut GrammarBuilder, sub: &Grammar) -> RuleId {
    let rule_map: Vec<RuleId> = sub
        .rules
        .iter()
        .map(|rule| {
            let name = builder.fresh_rule_name(&rule.name);
            builder.add_empty_rule(&name)
        })
        .collect();
    for (old_id, rule) in sub.rules.iter().enumerate() {
        let body = copy_expr(builder, sub, rule.body, &rule_map);
        builder.update_rule_body(rule_map[old_id], body);
        if let Some(lookahead) = rule.lookahead {
            let new_lookahead = copy_expr(builder, sub, lookahead, &rule_map);
            builder.update_lookahead_assertion(rule_map[old_id], Some(new_lookahead));
            builder.update_lookahead_exact(rule_map[old_id], rule.is_exact_lookahead);
        }
    }
    rule_map[sub.root_rule.idx()]
}

fn copy_expr(
    builder: &mut GrammarBuilder,
    sub: &Grammar,
    id: ExprId,
    rule_map: &[RuleId],
) -> ExprId {
    match sub.expr(id) {
        Expr::EmptyString => builder.add_empty_string(),
        Expr::ByteString(bytes) => builder.add_byte_string(bytes.clone()),
        Expr::CharacterClass { negated, ranges } => {
            builder.add_character_class(ranges.clone(), *negated)
        }
        Expr::CharacterClassStar { negated, ranges } => {
            builder.add_character_class_star(ranges.clone(), *negated)
        }
        Expr::RuleRef(rule) => builder.add_rule_ref(rule_map[rule.idx()]),
        Expr::Repeat { rule, min, max } => builder.add_repeat(rule_map[rule.idx()], *min, *max),
        Expr::Sequence(elements) => {
            let new: Vec<ExprId> = elements
                .clone()
                .into_iter()
                .map(|e| copy_expr(builder, sub, e, rule_map))
                .collect();
            builder.add_sequence(new)
        }
        Expr::Choices(choices) => {
            let new: Vec<ExprId> = choices
                .clone()
                .into_iter()
                .map(|e| copy_expr(builder, sub, e, rule_map))
                .collect();
            builder.add_choices(new)
        }
        Expr::TagDispatch(td) => {
            let mut new_td = td.clone();
            for (_, rule) in &mut new_td.tag_rule_pairs {
                *rule = rule_map[rule.idx()];
            }
            builder.add_tag_dispatch(new_td)
        }
    }
}

impl fmt::Display for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rule) in self.rules.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{} ::= ", rule.name)?;
            self.fmt_expr(f, rule.body)?;
            if let Some(lookahead) = rule.lookahead {
                write!(f, " (= ")?;
                self.fmt_expr(f, lookahead)?;
                write!(f, ")")?;
            }
        }
        Ok(())
    }
}

impl Grammar {
    fn fmt_expr(&self, f: &mut fmt::Formatter<'_>, id: ExprId) -> fmt::Result {
        match self.expr(id) {
            Expr::EmptyString => write!(f, "\"\""),
            Expr::ByteString(bytes) => {
                write!(f, "\"")?;
                for &b in bytes {
                    match b {
                        b'\\' => write!(f, "\\\\")?,
                        b'"' => write!(f, "\\\"")?,
                        b'\n' => write!(f, "\\n")?,
                        b'\r' => write!(f, "\\r")?,
                        b'\t' => write!(f, "\\t")?,
                        0x20..=0x7e => write!(f, "{}", b as char)?,
                        _ => write!(f, "\\x{:02x}", b)?,
                    }
                }
                write!(f, "\"")
            }
            Expr::CharacterClass { negated, ranges } => fmt_class(f, *negated, ranges, false),
            Expr::CharacterClassStar { negated, ranges } => fmt_class(f, *negated, ranges, true),
            Expr::RuleRef(rule) => write!(f, "{}", self.rule(*rule).name),
            Expr::Repeat { rule, min, max } => match max {
                Some(max) => write!(f, "{}{{{},{}}}", self.rule(*rule).name, min, max),
                None => write!(f, "{}{{{},}}", self.rule(*rule).name, min),
            },
            Expr::Sequence(elements) => {
                write!(f, "(")?;
                for (i, &e) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    self.fmt_expr(f, e)?;
                }
                write!(f, ")")
            }
            Expr::Choices(choices) => {
                write!(f, "(")?;
                for (i, &e) in choices.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    self.fmt_expr(f, e)?;
                }
                write!(f, ")")
            }
            Expr::TagDispatch(td) => {
                write!(f, "TagDispatch(")?;
                for (i, (tag, rule)) in td.tag_rule_pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(
                        f,
                        "(\"{}\", {})",
                        String::from_utf8_lossy(tag),
                        self.rule(*rule).name
                    )?;
                }
                write!(
                    f,
                    ", stop_eos={}, loop_after_dispatch={})",
                    td.stop_eos, td.loop_after_dispatch
                )
            }
        }
    }
}

fn fmt_class(
    f: &mut fmt::Formatter<'_>,
    negated: bool,
    ranges: &[(u32, u32)],
    star: bool,
) -> fmt::Result {
    write!(f, "[")?;
    if negated {
        write!(f, "^")?;
    }
    for &(lo, hi) in ranges {
        fmt_class_char(f, lo)?;
        if lo != hi {
            write!(f, "-")?;
            fmt_class_char(f, hi)?;
        }
    }
    write!(f, "]")?;
    if star {
        write!(f, "*")?;
    }
    Ok(())
}

fn fmt_class_char(f: &mut fmt::Formatter<'_>, cp: u32) -> fmt::Result {
    match cp {
        0x5c => write!(f, "\\\\"),
        0x5d => write!(f, "\\]"),
        0x5e => write!(f, "\\^"),
        0x2d => write!(f, "\\-"),
        0x09 => write!(f, "\\t"),
        0x0a => write!(f, "\\n"),
        0x0d => write!(f, "\\r"),
        0x20..=0x7e => write!(f, "{}", char::from_u32(cp).unwrap_or('?')),
        cp if cp <= 0xffff => write!(f, "\\u{:04x}", cp),
        cp => write!(f, "\\U{:08x}", cp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trips_simple_rules() {
        let mut b = GrammarBuilder::new();
        let root = b.add_empty_rule("root");
        let a = b.add_byte_string(b"a".to_vec());
        let class = b.add_character_class(vec![(b'0' as u32, b'9' as u32)], false);
        let seq = b.add_sequence(vec![a, class]);
        let body = b.add_choices(vec![seq]);
        b.update_rule_body(root, body);
        let grammar = b.build(root);
        assert_eq!(grammar.to_string(), "root ::= ((\"a\" [0-9]))");
    }

    #[test]
    fn union_of_two_grammars_references_both_roots() {
        let make = |s: &[u8]| {
            let mut b = GrammarBuilder::new();
            let root = b.add_empty_rule("root");
            let lit = b.add_byte_string(s.to_vec());
            let seq = b.add_sequence(vec![lit]);
            let body = b.add_choices(vec![seq]);
            b.update_rule_body(root, body);
            b.build(root)
        };
        let union = Grammar::union_of(&[make(b"x"), make(b"y")]);
        assert_eq!(union.num_rules(), 3);
        let Expr::Choices(choices) = union.expr(union.root_rule().body) else {
            panic!("root body must be choices");
        };
        assert_eq!(choices.len(), 2);
    }

    #[test]
    fn sequence_hash_ignores_rule_identity_only_when_unhashed() {
        let mut b = GrammarBuilder::new();
        let root = b.add_empty_rule("root");
        let a = b.add_byte_string(b"ab".to_vec());
        let seq = b.add_sequence(vec![a]);
        let body = b.add_choices(vec![seq]);
        b.update_rule_body(root, body);
        let g = b.build(root);
        assert!(g.sequence_hash(seq).is_some());

        let mut b2 = GrammarBuilder::new();
        let root2 = b2.add_empty_rule("other");
        let a2 = b2.add_byte_string(b"ab".to_vec());
        let seq2 = b2.add_sequence(vec![a2]);
        let body2 = b2.add_choices(vec![seq2]);
        b2.update_rule_body(root2, body2);
        let g2 = b2.build(root2);
        assert_eq!(g.sequence_hash(seq), g2.sequence_hash(seq2));
    }
}
