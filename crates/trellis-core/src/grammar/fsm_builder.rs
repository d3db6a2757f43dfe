//! Per-rule automaton construction.
//!
//! Each normalized rule body lowers to an automaton over bytes:
//! `ByteString` to an edge chain, character classes through the UTF-8
//! range splitter, `RuleRef` to a rule-reference edge, and `TagDispatch`
//! to a scanner trie with dispatch edges. Rules containing elements with no
//! automaton form (`Repeat`) are left without one and are walked
//! element-by-element by the parser instead.
//!
//! All per-rule automata are then copied into one complete FSM with a
//! shared state pool and frozen into the compact layout.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Result, TrellisError};
use crate::fsm::{CompactFsmWithStartEnd, Fsm, FsmWithStartEnd, TrieBuilder};

use super::{Expr, ExprId, Grammar, TagDispatch};

const MAX_CODEPOINT: u32 = 0x10FFFF;
const SURROGATE_LO: u32 = 0xD800;
const SURROGATE_HI: u32 = 0xDFFF;

/// Build every rule's automaton and assemble the complete FSM.
pub(crate) fn build_fsms(grammar: &mut Grammar) -> Result<()> {
    let mut complete = Fsm::new();
    let mut handles: Vec<Option<(usize, HashSet<usize>)>> = vec![None; grammar.num_rules()];
    let mut mapping = Vec::new();

    for (idx, rule) in grammar.rules().iter().enumerate() {
        match grammar.expr(rule.body) {
            Expr::TagDispatch(td) => {
                let fsm = build_tag_dispatch(td).ok_or_else(|| {
                    TrellisError::InvalidGrammar(format!(
                        "cannot build tag dispatch automaton for rule {}",
                        rule.name
                    ))
                })?;
                handles[idx] = Some(fsm.add_to_complete_fsm(&mut complete, &mut mapping));
            }
            Expr::Choices(_) => {
                if let Some(fsm) = build_choices(grammar, rule.body) {
                    handles[idx] = Some(fsm.add_to_complete_fsm(&mut complete, &mut mapping));
                }
            }
            other => unreachable!("non-normalized rule body: {other:?}"),
        }
    }

    let compact = Arc::new(complete.to_compact());
    grammar.per_rule_fsms = handles
        .into_iter()
        .map(|handle| {
            handle.map(|(start, ends)| CompactFsmWithStartEnd::new(compact.clone(), start, ends))
        })
        .collect();
    grammar.complete_fsm = Some(compact);
    Ok(())
}

/// Lower a `Choices` body. Returns `None` when some element has no
/// automaton form; the rule is then walked element-by-element at runtime.
fn build_choices(grammar: &Grammar, body: ExprId) -> Option<FsmWithStartEnd> {
    let Expr::Choices(choices) = grammar.expr(body) else {
        unreachable!("build_choices on non-choices body");
    };
    let mut parts = Vec::new();
    let mut nullable = false;
    for &choice in choices {
        match grammar.expr(choice) {
            Expr::EmptyString => nullable = true,
            Expr::Sequence(_) => parts.push(build_sequence(grammar, choice)?),
            other => unreachable!("non-normalized choice: {other:?}"),
        }
    }
    if parts.is_empty() {
        return Some(FsmWithStartEnd::accepting_empty());
    }
    if nullable {
        parts.push(FsmWithStartEnd::accepting_empty());
    }

    let unioned = FsmWithStartEnd::union(parts);
    let merged = unioned.simplify_epsilon().merge_equivalent_successors();
    // Minimization is best-effort; keep the merged automaton on failure.
    Some(merged.minimize_dfa().unwrap_or(merged))
}

fn build_sequence(grammar: &Grammar, seq: ExprId) -> Option<FsmWithStartEnd> {
    let Expr::Sequence(elements) = grammar.expr(seq) else {
        unreachable!("build_sequence on non-sequence expression");
    };
    let mut parts = Vec::new();
    for &element in elements {
        let part = match grammar.expr(element) {
            Expr::ByteString(bytes) => build_byte_string(bytes),
            Expr::RuleRef(rule) => build_rule_ref(rule.idx()),
            Expr::CharacterClass { negated, ranges } => {
                build_character_class(*negated, ranges, false)
            }
            Expr::CharacterClassStar { negated, ranges } => {
                build_character_class(*negated, ranges, true)
            }
            _ => return None,
        };
        parts.push(part);
    }
    if parts.is_empty() {
        return Some(FsmWithStartEnd::accepting_empty());
    }
    Some(FsmWithStartEnd::concat(parts))
}

fn build_byte_string(bytes: &[u8]) -> FsmWithStartEnd {
    let mut fsm = FsmWithStartEnd::new();
    let mut cur = fsm.add_state();
    fsm.set_start(cur);
    for &b in bytes {
        let next = fsm.add_state();
        fsm.fsm_mut().add_edge(cur, next, b, b);
        cur = next;
    }
    fsm.add_end(cur);
    fsm
}

fn build_rule_ref(rule: usize) -> FsmWithStartEnd {
    let mut fsm = FsmWithStartEnd::new();
    let start = fsm.add_state();
    let end = fsm.add_state();
    fsm.set_start(start);
    fsm.add_end(end);
    fsm.fsm_mut().add_rule_edge(start, end, rule);
    fsm
}

fn build_character_class(negated: bool, ranges: &[(u32, u32)], star: bool) -> FsmWithStartEnd {
    let mut fsm = FsmWithStartEnd::new();
    let start = fsm.add_state();
    fsm.set_start(start);
    let end = if star { start } else { fsm.add_state() };
    fsm.add_end(end);

    if negated {
        // Complement against ASCII, then accept the whole non-ASCII plane.
        let mut ascii = [false; 128];
        for &(lo, hi) in ranges {
            if lo > 0x7F {
                continue;
            }
            let hi = hi.min(0x7F);
            for b in lo..=hi {
                ascii[b as usize] = true;
            }
        }
        let mut b = 0usize;
        while b < 128 {
            if ascii[b] {
                b += 1;
                continue;
            }
            let run_start = b;
            while b < 128 && !ascii[b] {
                b += 1;
            }
            fsm.fsm_mut()
                .add_edge(start, end, run_start as u8, (b - 1) as u8);
        }
        add_codepoint_range(&mut fsm, start, end, 0x80, MAX_CODEPOINT);
    } else {
        for &(lo, hi) in ranges {
            if lo > hi {
                continue;
            }
            add_codepoint_range(&mut fsm, start, end, lo, hi);
        }
    }
    fsm
}

/// Add transitions from `from` to `to` accepting exactly the UTF-8 encodings
/// of codepoints in `[min, max]`.
///
/// The range is split by encoded length (1..4 bytes); within one length
/// class it factors into a low-border / full-middle / high-border triple so
/// the edge count stays proportional to the encoded length. `max` is
/// clamped to U+10FFFF and the surrogate gap is skipped.
pub(crate) fn add_codepoint_range(
    fsm: &mut FsmWithStartEnd,
    from: usize,
    to: usize,
    min: u32,
    max: u32,
) {
    let max = max.min(MAX_CODEPOINT);
    if min > max {
        return;
    }
    // Length-class boundaries, with the surrogate gap removed.
    let classes: [(u32, u32); 5] = [
        (0x0, 0x7F),
        (0x80, 0x7FF),
        (0x800, SURROGATE_LO - 1),
        (SURROGATE_HI + 1, 0xFFFF),
        (0x10000, MAX_CODEPOINT),
    ];
    for (class_lo, class_hi) in classes {
        let lo = min.max(class_lo);
        let hi = max.min(class_hi);
        if lo > hi {
            continue;
        }
        let lo_bytes = encode_utf8(lo);
        let hi_bytes = encode_utf8(hi);
        debug_assert_eq!(lo_bytes.len(), hi_bytes.len());
        add_same_length_range(fsm, from, to, &lo_bytes, &hi_bytes);
    }
}

fn encode_utf8(cp: u32) -> Vec<u8> {
    let c = char::from_u32(cp).expect("surrogates are split out before encoding");
    let mut buf = [0u8; 4];
    c.encode_utf8(&mut buf).as_bytes().to_vec()
}

/// Add transitions for a codepoint range whose encodings share one length.
fn add_same_length_range(
    fsm: &mut FsmWithStartEnd,
    from: usize,
    to: usize,
    lo: &[u8],
    hi: &[u8],
) {
    debug_assert!(!lo.is_empty() && lo.len() == hi.len());
    if lo.len() == 1 {
        fsm.fsm_mut().add_edge(from, to, lo[0], hi[0]);
        return;
    }
    if lo[0] == hi[0] {
        let mid = fsm.add_state();
        fsm.fsm_mut().add_edge(from, mid, lo[0], lo[0]);
        add_same_length_range(fsm, mid, to, &lo[1..], &hi[1..]);
        return;
    }

    let tail_len = lo.len() - 1;
    let cont_lo = vec![0x80u8; tail_len];
    let cont_hi = vec![0xBFu8; tail_len];

    // A border lead byte whose continuation already spans the full
    // [0x80, 0xBF] space folds into the middle block; otherwise it gets its
    // own sub-range.
    let mut middle_lo = lo[0];
    let mut middle_hi = hi[0];
    if lo[1..] != cont_lo[..] {
        let s = fsm.add_state();
        fsm.fsm_mut().add_edge(from, s, lo[0], lo[0]);
        add_same_length_range(fsm, s, to, &lo[1..], &cont_hi);
        middle_lo = lo[0] + 1;
    }
    if hi[1..] != cont_hi[..] {
        let s = fsm.add_state();
        fsm.fsm_mut().add_edge(from, s, hi[0], hi[0]);
        add_same_length_range(fsm, s, to, &cont_lo, &hi[1..]);
        middle_hi = hi[0] - 1;
    }
    if middle_lo <= middle_hi {
        let mut cur = fsm.add_state();
        fsm.fsm_mut().add_edge(from, cur, middle_lo, middle_hi);
        for depth in 0..tail_len {
            let next = if depth + 1 == tail_len { to } else { fsm.add_state() };
            fsm.fsm_mut().add_edge(cur, next, 0x80, 0xBF);
            cur = next;
        }
    }
}

/// Lower a tag-dispatch body to its scanner automaton.
fn build_tag_dispatch(td: &TagDispatch) -> Option<FsmWithStartEnd> {
    if td.stop_eos {
        build_tag_dispatch_eos(td)
    } else {
        build_tag_dispatch_stop_strings(td)
    }
}

/// `stop_eos = true`: every non-tag-end state accepts (EOS may arrive at
/// any scan position). Tag ends dispatch via rule edges.
fn build_tag_dispatch_eos(td: &TagDispatch) -> Option<FsmWithStartEnd> {
    let patterns: Vec<Vec<u8>> = td.tag_rule_pairs.iter().map(|(t, _)| t.clone()).collect();
    let (mut fsm, tag_ends) = TrieBuilder::build_scanner(&patterns)?;
    let start = fsm.start();

    let mut ends = HashSet::new();
    for state in 0..fsm.num_states() {
        if !tag_ends.contains(&state) {
            ends.insert(state);
        }
    }

    for (i, &(_, rule)) in td.tag_rule_pairs.iter().enumerate() {
        let next = if td.loop_after_dispatch {
            start
        } else {
            let fresh = fsm.add_state();
            ends.insert(fresh);
            fresh
        };
        fsm.fsm_mut().add_rule_edge(tag_ends[i], next, rule.idx());
    }
    fsm.set_ends(ends);
    Some(fsm)
}

/// `stop_eos = false`: the scan terminates only at a stop string. Excluded
/// strings become dead scanner states.
fn build_tag_dispatch_stop_strings(td: &TagDispatch) -> Option<FsmWithStartEnd> {
    if td.stop_strings.is_empty() {
        return None;
    }
    let num_tags = td.tag_rule_pairs.len();
    let num_stops = td.stop_strings.len();
    let mut patterns: Vec<Vec<u8>> =
        td.tag_rule_pairs.iter().map(|(t, _)| t.clone()).collect();
    patterns.extend(td.stop_strings.iter().cloned());
    patterns.extend(td.excluded_strings.iter().cloned());
    let (mut fsm, pattern_ends) = TrieBuilder::build_scanner(&patterns)?;
    let start = fsm.start();

    // Stop-string ends accept; excluded-string ends are dead states.
    let mut ends: HashSet<usize> = pattern_ends[num_tags..num_tags + num_stops]
        .iter()
        .copied()
        .collect();

    if td.loop_after_dispatch {
        for (i, &(_, rule)) in td.tag_rule_pairs.iter().enumerate() {
            fsm.fsm_mut().add_rule_edge(pattern_ends[i], start, rule.idx());
        }
    } else {
        // After a single dispatch only a stop string may follow.
        let (stop_trie, stop_trie_ends) = TrieBuilder::build_exact(&td.stop_strings)?;
        let mut mapping = Vec::new();
        fsm.fsm_mut().add_fsm(stop_trie.fsm(), &mut mapping);
        let stop_start = mapping[stop_trie.start()];
        for &end in &stop_trie_ends {
            ends.insert(mapping[end]);
        }
        for (i, &(_, rule)) in td.tag_rule_pairs.iter().enumerate() {
            fsm.fsm_mut()
                .add_rule_edge(pattern_ends[i], stop_start, rule.idx());
        }
    }
    fsm.set_ends(ends);
    Some(fsm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::FsmEdge;
    use crate::grammar::{normalize, GrammarBuilder, RuleId};

    fn accepts(f: &FsmWithStartEnd, input: &[u8]) -> bool {
        let mut states: HashSet<usize> = [f.start()].into();
        for &b in input {
            let mut next = HashSet::new();
            for &s in &states {
                for edge in f.fsm().edges(s) {
                    if let FsmEdge::Byte { min, max, target } = *edge {
                        if min <= b && b <= max {
                            next.insert(target);
                        }
                    }
                }
            }
            states = next;
            if states.is_empty() {
                return false;
            }
        }
        states.iter().any(|&s| f.is_end(s))
    }

    fn class_fsm(negated: bool, ranges: &[(u32, u32)]) -> FsmWithStartEnd {
        build_character_class(negated, ranges, false)
    }

    #[test]
    fn ascii_class_accepts_exact_bytes() {
        let f = class_fsm(false, &[(b'a' as u32, b'z' as u32)]);
        assert!(accepts(&f, b"m"));
        assert!(!accepts(&f, b"A"));
        assert!(!accepts(&f, b"mm"));
    }

    #[test]
    fn unicode_class_accepts_multibyte_encodings() {
        // CJK Unified Ideographs block.
        let f = class_fsm(false, &[(0x4E00, 0x9FFF)]);
        assert!(accepts(&f, "中".as_bytes()));
        assert!(accepts(&f, "一".as_bytes()));
        assert!(!accepts(&f, "z".as_bytes()));
        assert!(!accepts(&f, "é".as_bytes()));
    }

    #[test]
    fn codepoint_range_spanning_length_classes() {
        let f = class_fsm(false, &[(0x20, 0x2603)]);
        assert!(accepts(&f, b" "));
        assert!(accepts(&f, "é".as_bytes()));
        assert!(accepts(&f, "\u{2603}".as_bytes()));
        assert!(!accepts(&f, "\u{2604}".as_bytes()));
    }

    #[test]
    fn surrogate_gap_is_skipped() {
        let f = class_fsm(false, &[(0xD000, 0xE010)]);
        assert!(accepts(&f, "\u{D000}".as_bytes()));
        assert!(accepts(&f, "\u{E010}".as_bytes()));
        // Bytes 0xED 0xA0 0x80 would encode U+D800.
        assert!(!accepts(&f, &[0xED, 0xA0, 0x80]));
    }

    #[test]
    fn negated_class_accepts_complement_and_non_ascii() {
        let f = class_fsm(true, &[(b'"' as u32, b'"' as u32), (b'\\' as u32, b'\\' as u32)]);
        assert!(accepts(&f, b"x"));
        assert!(!accepts(&f, b"\""));
        assert!(!accepts(&f, b"\\"));
        assert!(accepts(&f, "中".as_bytes()));
    }

    #[test]
    fn star_class_loops_on_start() {
        let f = build_character_class(false, &[(b'a' as u32, b'b' as u32)], true);
        assert!(accepts(&f, b""));
        assert!(accepts(&f, b"abba"));
        assert!(!accepts(&f, b"abc"));
    }

    #[test]
    fn choices_fsm_accepts_either_branch() {
        let mut b = GrammarBuilder::new();
        let root = b.add_empty_rule("root");
        let x = b.add_byte_string(b"cat".to_vec());
        let y = b.add_byte_string(b"car".to_vec());
        let body = b.add_choices(vec![x, y]);
        b.update_rule_body(root, body);
        let grammar = normalize(&b.build(root)).unwrap();

        let fsm = build_choices(&grammar, grammar.rule(RuleId(0)).body).unwrap();
        assert!(accepts(&fsm, b"cat"));
        assert!(accepts(&fsm, b"car"));
        assert!(!accepts(&fsm, b"can"));
    }

    #[test]
    fn sequence_with_repeat_has_no_fsm() {
        let mut b = GrammarBuilder::new();
        let root = b.add_empty_rule("root");
        let item = b.add_empty_rule("item");
        let x = b.add_byte_string(b"x".to_vec());
        b.update_rule_body(item, x);
        let repeat = b.add_repeat(item, 1, Some(3));
        b.update_rule_body(root, repeat);
        let grammar = normalize(&b.build(root)).unwrap();

        assert!(build_choices(&grammar, grammar.rule(RuleId(0)).body).is_none());
    }

    #[test]
    fn eos_tag_dispatch_dispatches_and_accepts_mid_scan() {
        let mut b = GrammarBuilder::new();
        let root = b.add_empty_rule("root");
        let a = b.add_empty_rule("a");
        let lit = b.add_byte_string(b"1".to_vec());
        b.update_rule_body(a, lit);
        let td = TagDispatch {
            tag_rule_pairs: vec![(b"<A>".to_vec(), a)],
            stop_eos: true,
            stop_strings: vec![],
            loop_after_dispatch: true,
            excluded_strings: vec![],
        };
        let td_expr = b.add_tag_dispatch(td.clone());
        b.update_rule_body(root, td_expr);
        let _ = normalize(&b.build(root)).unwrap();

        let fsm = build_tag_dispatch(&td).unwrap();
        // Mid-scan states accept (EOS can arrive any time)...
        assert!(accepts(&fsm, b"free text"));
        assert!(accepts(&fsm, b"<"));
        // ...but a completed tag end is not an accepting state; it carries
        // the dispatch rule edge instead.
        let mut state = fsm.start();
        for &byte in b"<A>" {
            let mut next = None;
            for edge in fsm.fsm().edges(state) {
                if let FsmEdge::Byte { min, max, target } = *edge {
                    if min <= byte && byte <= max {
                        next = Some(target);
                    }
                }
            }
            state = next.unwrap();
        }
        assert!(!fsm.is_end(state));
        assert!(fsm.fsm().edges(state).iter().any(|e| e.is_rule()));
    }
}
