//! Per-state adaptive token mask computation.
//!
//! For one scannable parser state, [`MaskBuilder`] classifies every
//! vocabulary token as accepted, rejected, or uncertain. The sweep visits
//! tokens in byte-sorted order so consecutive tokens share parser work
//! through their longest common prefix, rejected prefixes skip their whole
//! trie subtree, and two speculative shortcuts (self-recursion, tag-dispatch
//! second-byte slicing) classify hot tokens without running the parser at
//! all. Results are exchanged with other compilations through the
//! crossing-grammar cache.

use std::collections::HashMap;

use tracing::debug;

use crate::grammar::{Expr, Grammar, RuleId};
use crate::parser::{EarleyParser, ParserState};
use crate::support::{hash_combine64, Bitset};
use crate::tokenizer::TokenizerInfo;

use super::crossing_cache::{CrossingCache, CrossingKey};
use super::mask::{
    bitset_from_accepted, difference_sorted, union_sorted, AdaptiveTokenMask, MaskStore,
    USE_BITSET_THRESHOLD,
};

/// Compute the `parser state → mask` map for an optimized grammar.
///
/// The per-state tasks are independent; with `max_threads > 1` they run on
/// a scoped worker pool, and the resulting map is deterministic regardless
/// of schedule.
pub(crate) fn compile_masks(
    grammar: &Grammar,
    tokenizer: &TokenizerInfo,
    max_threads: usize,
    crossing: &CrossingCache,
) -> HashMap<ParserState, AdaptiveTokenMask> {
    let tasks = enumerate_scannable_states(grammar);
    let second_slices = tag_dispatch_second_slices(grammar, tokenizer);
    debug!(states = tasks.len(), "computing adaptive token masks");

    if max_threads <= 1 {
        let mut masks = HashMap::with_capacity(tasks.len());
        for &(state, is_root) in &tasks {
            let mask =
                MaskBuilder::new(grammar, tokenizer, state, &second_slices, crossing)
                    .compute(is_root);
            masks.insert(state, mask);
        }
        return masks;
    }

    let masks = parking_lot::Mutex::new(HashMap::with_capacity(tasks.len()));
    let cursor = std::sync::atomic::AtomicUsize::new(0);
    std::thread::scope(|scope| {
        for _ in 0..max_threads {
            scope.spawn(|| loop {
                let i = cursor.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let Some(&(state, is_root)) = tasks.get(i) else {
                    break;
                };
                let mask =
                    MaskBuilder::new(grammar, tokenizer, state, &second_slices, crossing)
                        .compute(is_root);
                masks.lock().insert(state, mask);
            });
        }
    });
    masks.into_inner()
}

/// Every position the parser can stop at between tokens.
///
/// For automaton-backed rules these are the reachable states with outgoing
/// edges. For element-walked rules they are every byte offset of a byte
/// string and every pending-continuation count of a character class; rule
/// references and repetitions expand to other rules' positions.
fn enumerate_scannable_states(grammar: &Grammar) -> Vec<(ParserState, bool)> {
    let root = grammar.root_rule_id();
    let mut tasks = Vec::new();
    for (idx, rule) in grammar.rules().iter().enumerate() {
        let rule_id = RuleId(idx as u32);
        let is_root = rule_id == root;
        if let Some(fsm) = grammar.per_rule_fsm(rule_id) {
            for state in fsm.reachable_states() {
                if fsm.is_scannable(state) {
                    tasks.push((
                        ParserState::at(Some(rule_id), rule.body, state as u32, 0),
                        is_root,
                    ));
                }
            }
            continue;
        }
        let Expr::Choices(choices) = grammar.expr(rule.body) else {
            unreachable!("non-normalized rule body");
        };
        for &choice in choices {
            let Expr::Sequence(elements) = grammar.expr(choice) else {
                continue;
            };
            for (element_idx, &element) in elements.iter().enumerate() {
                match grammar.expr(element) {
                    Expr::RuleRef(_) | Expr::Repeat { .. } => {}
                    Expr::ByteString(bytes) => {
                        for sub in 0..bytes.len() {
                            tasks.push((
                                ParserState::at(
                                    Some(rule_id),
                                    choice,
                                    element_idx as u32,
                                    sub as u32,
                                ),
                                is_root,
                            ));
                        }
                    }
                    Expr::CharacterClass { .. } | Expr::CharacterClassStar { .. } => {
                        for left_utf8_bytes in 0..=3u32 {
                            tasks.push((
                                ParserState::at(
                                    Some(rule_id),
                                    choice,
                                    element_idx as u32,
                                    left_utf8_bytes,
                                ),
                                is_root,
                            ));
                        }
                    }
                    other => unreachable!("non-normalized sequence element: {other:?}"),
                }
            }
        }
    }
    tasks
}

/// Per-tag-dispatch-rule second-byte slice: bit `i` is set when token `i`'s
/// bytes after the first contain none of the tag, stop, or excluded
/// strings, so the scan provably returns to the dispatch start.
pub(crate) fn tag_dispatch_second_slices(
    grammar: &Grammar,
    tokenizer: &TokenizerInfo,
) -> HashMap<RuleId, Bitset> {
    let sorted = tokenizer.sorted_decoded_vocab();
    let mut out = HashMap::new();
    for (idx, rule) in grammar.rules().iter().enumerate() {
        let Expr::TagDispatch(td) = grammar.expr(rule.body) else {
            continue;
        };
        let mut bits = Bitset::new(sorted.len());
        let needles: Vec<&[u8]> = td
            .tag_rule_pairs
            .iter()
            .map(|(t, _)| t.as_slice())
            .chain(td.stop_strings.iter().map(Vec::as_slice))
            .chain(td.excluded_strings.iter().map(Vec::as_slice))
            .collect();
        for (i, (_, token)) in sorted.iter().enumerate() {
            let tail = if token.is_empty() { &[][..] } else { &token[1..] };
            if needles.iter().all(|needle| !contains_subslice(tail, needle)) {
                bits.set(i);
            }
        }
        out.insert(RuleId(idx as u32), bits);
    }
    out
}

fn contains_subslice(hay: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && hay.windows(needle.len()).any(|w| w == needle)
}

/// Sorted-vocab index intervals whose first byte is allowed by the mask,
/// plus their total size.
fn possible_token_intervals(
    sorted: &[(u32, Vec<u8>)],
    first_char_mask: &[bool; 256],
) -> (Vec<(usize, usize)>, usize) {
    let mut intervals = Vec::new();
    let mut total = 0;
    let mut matched = 0usize;
    let mut byte = 0usize;
    while byte < 256 {
        if !first_char_mask[byte] {
            byte += 1;
            continue;
        }
        let lo = byte as u8;
        while byte < 256 && first_char_mask[byte] {
            byte += 1;
        }
        let hi = (byte - 1) as u8;
        let left = matched + sorted[matched..].partition_point(|(_, s)| s[0] < lo);
        let right = left + sorted[left..].partition_point(|(_, s)| s[0] <= hi);
        if left < right {
            intervals.push((left, right));
            total += right - left;
        }
        matched = right;
    }
    (intervals, total)
}

/// One mask computation, bound to a single parser state.
pub(crate) struct MaskBuilder<'a> {
    grammar: &'a Grammar,
    tokenizer: &'a TokenizerInfo,
    init_state: ParserState,
    init_rule: RuleId,
    second_slices: &'a HashMap<RuleId, Bitset>,
    crossing: &'a CrossingCache,
    parser: EarleyParser<'a>,

    accepted: Vec<u32>,
    rejected: Vec<u32>,
    uncertain: Vec<u32>,
    accepted_by_lookahead: Vec<u32>,
    rejected_by_lookahead: Vec<u32>,
    /// `can_reach_end[k]`: the initial rule can complete after the current
    /// token's first `k` bytes.
    can_reach_end: Vec<bool>,
    can_reach_end_prefix_or: Vec<bool>,
}

impl<'a> MaskBuilder<'a> {
    pub(crate) fn new(
        grammar: &'a Grammar,
        tokenizer: &'a TokenizerInfo,
        init_state: ParserState,
        second_slices: &'a HashMap<RuleId, Bitset>,
        crossing: &'a CrossingCache,
    ) -> Self {
        let init_rule = init_state.rule_id.expect("mask states carry their rule");
        Self {
            grammar,
            tokenizer,
            init_state,
            init_rule,
            second_slices,
            crossing,
            parser: EarleyParser::new(grammar, init_state),
            accepted: Vec::new(),
            rejected: Vec::new(),
            uncertain: Vec::new(),
            accepted_by_lookahead: Vec::new(),
            rejected_by_lookahead: Vec::new(),
            can_reach_end: vec![false],
            can_reach_end_prefix_or: vec![false],
        }
    }

    /// Compute the mask for the initial state.
    ///
    /// With `is_root` set the mask may not contain uncertain tokens: a token
    /// that would be uncertain is rejected instead.
    pub(crate) fn compute(mut self, is_root: bool) -> AdaptiveTokenMask {
        let rule = self.grammar.rule(self.init_rule);
        let lookahead_id = rule.lookahead;
        let is_exact = rule.is_exact_lookahead;

        // Crossing-cache probe, refined key first.
        let crossing_available =
            self.crossing.is_enabled() && self.grammar.fsm_hash(self.init_rule).is_some();
        let mut fsm_hash = 0u64;
        let mut state_id = 0u32;
        let mut lookahead_hash = None;
        if crossing_available {
            fsm_hash = self.grammar.fsm_hash(self.init_rule).unwrap();
            state_id = self
                .grammar
                .renumbered_state(self.init_rule, self.init_state.element_id as usize)
                .expect("scannable states are BFS-reachable");
            lookahead_hash = lookahead_id.and_then(|id| self.grammar.sequence_hash(id));
            if let Some(lh) = lookahead_hash {
                let refined = CrossingKey {
                    fsm_hash: hash_combine64(&[fsm_hash, lh, u64::from(is_exact)]),
                    state_id,
                    tokenizer_hash: self.tokenizer.tokenizer_hash(),
                };
                if let Some(mask) = self.crossing.get(&refined) {
                    return mask;
                }
            }
            let basic = CrossingKey {
                fsm_hash,
                state_id,
                tokenizer_hash: self.tokenizer.tokenizer_hash(),
            };
            if let Some(mut mask) = self.crossing.get(&basic) {
                self.adapt_cache_with_lookahead(&mut mask, is_root);
                return mask;
            }
        }

        let first_char_mask = self.first_character_mask();
        let rejected_filled = self.sweep(&first_char_mask, is_root, is_exact);

        let vocab_size = self.tokenizer.vocab_size();
        let sorted = self.tokenizer.sorted_decoded_vocab();
        let mask = if rejected_filled {
            AdaptiveTokenMask::with_rejected(
                vocab_size,
                sorted,
                self.accepted.clone(),
                self.rejected.clone(),
                self.uncertain.clone(),
            )
        } else {
            AdaptiveTokenMask::accepted_only(
                vocab_size,
                sorted,
                self.accepted.clone(),
                self.uncertain.clone(),
            )
        };

        if crossing_available {
            let tokenizer_hash = self.tokenizer.tokenizer_hash();
            let basic_key = CrossingKey {
                fsm_hash,
                state_id,
                tokenizer_hash,
            };
            if lookahead_id.is_none() && !is_root {
                // No lookahead: the mask is a pure function of the automaton.
                self.crossing.add(basic_key, mask.clone());
                return mask;
            }

            // Store a lookahead-agnostic entry (lookahead-decided tokens
            // demoted to uncertain) and, when the lookahead is hashable, a
            // refined entry with the full decision.
            union_sorted(&mut self.uncertain, &self.rejected_by_lookahead);
            union_sorted(&mut self.uncertain, &self.accepted_by_lookahead);
            let accepted_basic = difference_sorted(&self.accepted, &self.accepted_by_lookahead);
            let basic_mask = if rejected_filled {
                let rejected_basic =
                    difference_sorted(&self.rejected, &self.rejected_by_lookahead);
                AdaptiveTokenMask::with_rejected(
                    vocab_size,
                    sorted,
                    accepted_basic,
                    rejected_basic,
                    self.uncertain.clone(),
                )
            } else {
                AdaptiveTokenMask::accepted_only(
                    vocab_size,
                    sorted,
                    accepted_basic,
                    self.uncertain.clone(),
                )
            };
            self.crossing.add(basic_key, basic_mask);
            if let Some(lh) = lookahead_hash {
                let refined_key = CrossingKey {
                    fsm_hash: hash_combine64(&[fsm_hash, lh, u64::from(is_exact)]),
                    state_id,
                    tokenizer_hash,
                };
                self.crossing.add(refined_key, mask.clone());
            }
        }
        mask
    }

    /// Bytes that can legally start the next token from the initial state.
    fn first_character_mask(&self) -> [bool; 256] {
        let mut mask = [false; 256];
        if let Some(fsm) = self.grammar.per_rule_fsm(self.init_rule) {
            for edge in fsm.fsm().edges(self.init_state.element_id as usize) {
                if let crate::fsm::FsmEdge::Byte { min, max, .. } = *edge {
                    for b in min..=max {
                        mask[b as usize] = true;
                    }
                }
            }
            return mask;
        }

        let Expr::Sequence(elements) = self.grammar.expr(self.init_state.sequence_id) else {
            unreachable!("element-walked state without a sequence");
        };
        let element = elements[self.init_state.element_id as usize];
        match self.grammar.expr(element) {
            Expr::ByteString(bytes) => {
                mask[bytes[self.init_state.sub_element_id as usize] as usize] = true;
            }
            Expr::CharacterClass { negated, ranges }
            | Expr::CharacterClassStar { negated, ranges } => {
                if self.init_state.sub_element_id > 0 {
                    // Mid-codepoint: any continuation byte.
                    for b in 0x80..=0xBFusize {
                        mask[b] = true;
                    }
                    return mask;
                }
                for b in 0..=0x7Fu32 {
                    let in_ranges = ranges.iter().any(|&(lo, hi)| lo <= b && b <= hi);
                    if in_ranges != *negated {
                        mask[b as usize] = true;
                    }
                }
                for b in 0xC2..=0xF4u8 {
                    let Some((span_lo, span_hi, _)) = crate::parser::utf8_lead_span(b) else {
                        continue;
                    };
                    let acceptable = *negated
                        || ranges.iter().any(|&(lo, hi)| lo <= span_hi && span_lo <= hi);
                    if acceptable {
                        mask[b as usize] = true;
                    }
                }
            }
            other => unreachable!("unsupported element for first-char mask: {other:?}"),
        }
        mask
    }

    /// Whether the speculative shortcut applies, and the byte mask tokens
    /// must stay within for it to fire.
    fn speculative_calculation(&self) -> (bool, [bool; 256]) {
        let rule = self.grammar.rule(self.init_rule);
        let is_tag_dispatch = matches!(self.grammar.expr(rule.body), Expr::TagDispatch(_));
        if is_tag_dispatch {
            // Bytes that keep the scan at the dispatch start.
            let mut mask = [false; 256];
            let fsm = self
                .grammar
                .per_rule_fsm(self.init_rule)
                .expect("tag dispatch rules always lower to an automaton");
            for edge in fsm.fsm().edges(self.init_state.element_id as usize) {
                let crate::fsm::FsmEdge::Byte { min, max, target } = *edge else {
                    continue;
                };
                if target != fsm.start() {
                    continue;
                }
                for b in min..=max {
                    mask[b as usize] = true;
                }
            }
            return (true, mask);
        }

        let Some(fsm) = self.grammar.per_rule_fsm(self.init_rule) else {
            // Element-walked positions: a star class, or the
            // `[class] Ref(self)` shape at the sequence head.
            if self.init_state.sub_element_id != 0 {
                return (false, [false; 256]);
            }
            let Expr::Sequence(elements) = self.grammar.expr(self.init_state.sequence_id) else {
                return (false, [false; 256]);
            };
            let element = elements[self.init_state.element_id as usize];
            match self.grammar.expr(element) {
                Expr::CharacterClassStar { .. } => return (true, [false; 256]),
                Expr::CharacterClass { .. }
                    if elements.len() == 2 && self.init_state.element_id == 0 =>
                {
                    if matches!(
                        self.grammar.expr(elements[1]),
                        Expr::RuleRef(r) if *r == self.init_rule
                    ) {
                        return (true, [false; 256]);
                    }
                    return (false, [false; 256]);
                }
                _ => return (false, [false; 256]),
            }
        };

        // Automaton-backed: a byte self-loop, or a start-state edge into a
        // state whose rule edge calls this rule back.
        let mut applies = false;
        let mut mask = [false; 256];
        let state = self.init_state.element_id as usize;
        for edge in fsm.fsm().edges(state) {
            let crate::fsm::FsmEdge::Byte { min, max, target } = *edge else {
                continue;
            };
            if target == state {
                applies = true;
                for b in min..=max {
                    mask[b as usize] = true;
                }
                continue;
            }
            if fsm.start() == state {
                let recurses = fsm.fsm().edges(target).iter().any(|e| {
                    matches!(e, crate::fsm::FsmEdge::Rule { rule, .. } if *rule == self.init_rule.idx())
                });
                if recurses {
                    applies = true;
                    for b in min..=max {
                        mask[b as usize] = true;
                    }
                }
            }
        }
        (applies, mask)
    }

    /// The main vocabulary sweep. Returns whether `rejected` was filled
    /// (deciding which mask constructor applies).
    fn sweep(&mut self, first_char_mask: &[bool; 256], is_root: bool, is_exact: bool) -> bool {
        let sorted = self.tokenizer.sorted_decoded_vocab();
        let subtree_ranges = self.tokenizer.trie_subtree_ranges();
        let (intervals, possible_token_num) = possible_token_intervals(sorted, first_char_mask);
        let fill_reject =
            sorted.len() - possible_token_num < USE_BITSET_THRESHOLD;

        if intervals.is_empty() {
            // No byte can start a token here (e.g. a state with only
            // rule-reference edges); everything is implicitly rejected.
            if fill_reject {
                self.rejected = (0..sorted.len() as u32).collect();
            }
            return fill_reject;
        }

        if fill_reject {
            for i in 0..intervals[0].0 {
                self.rejected.push(i as u32);
            }
        }

        let rule = self.grammar.rule(self.init_rule);
        let is_tag_dispatch = matches!(self.grammar.expr(rule.body), Expr::TagDispatch(_));
        let second_slice = if is_tag_dispatch {
            self.second_slices.get(&self.init_rule)
        } else {
            None
        };

        let (speculative, speculative_mask) = {
            let (applies, mask) = self.speculative_calculation();
            if self.grammar.per_rule_fsm(self.init_rule).is_none() {
                // Element-walked shortcut uses the first-char mask, gated on
                // covering a sizable share of the vocabulary.
                (applies && possible_token_num >= sorted.len() / 4, *first_char_mask)
            } else {
                (applies, mask)
            }
        };

        let mut prev_token: Option<&'a [u8]> = None;
        let mut prev_matched_size = 0usize;
        let mut last_rejected_range = 0usize;

        for (interval_idx, &(begin, end)) in intervals.iter().enumerate() {
            let mut i = begin;
            while i < end {
                if i < last_rejected_range {
                    if fill_reject {
                        self.rejected.push(i as u32);
                    }
                    i += 1;
                    continue;
                }
                let token = self.tokenizer.sorted_decoded_vocab()[i].1.as_slice();

                // Speculative classification without parser work.
                if speculative {
                    if let Some(slice) = second_slice {
                        if !token.is_empty()
                            && speculative_mask[token[0] as usize]
                            && slice.get(i)
                        {
                            self.accepted.push(i as u32);
                            i += 1;
                            continue;
                        }
                    } else if token
                        .iter()
                        .all(|&b| b.is_ascii() && speculative_mask[b as usize])
                    {
                        self.accepted.push(i as u32);
                        i += 1;
                        continue;
                    }
                }

                // Reuse the parser state of the previous token's longest
                // common prefix.
                let mut accepted = true;
                if let Some(prev) = prev_token {
                    let lcp = common_prefix_len(token, prev);
                    if lcp > prev_matched_size {
                        // The shared prefix was already rejected.
                        accepted = false;
                    } else if lcp < prev_matched_size {
                        let rollback = prev_matched_size - lcp;
                        self.parser.pop_last_states(rollback);
                        self.can_reach_end.truncate(self.can_reach_end.len() - rollback);
                        self.can_reach_end_prefix_or
                            .truncate(self.can_reach_end_prefix_or.len() - rollback);
                    }
                    prev_matched_size = prev_matched_size.min(lcp);
                }
                prev_token = Some(token);

                if accepted {
                    for j in prev_matched_size..token.len() {
                        if !self.parser.advance(token[j]) {
                            accepted = false;
                            break;
                        }
                        let completed = self.parser.is_completed();
                        self.can_reach_end.push(completed);
                        let prefix_or = completed || *self.can_reach_end_prefix_or.last().unwrap();
                        self.can_reach_end_prefix_or.push(prefix_or);
                        prev_matched_size = j + 1;
                    }
                }

                let can_reach_end = *self.can_reach_end_prefix_or.last().unwrap();
                if accepted {
                    self.accepted.push(i as u32);
                } else if can_reach_end && prev_matched_size > 0 {
                    let (lookahead_accepted, lookahead_completed) = self.lookahead_check(token);
                    if !is_root && lookahead_accepted {
                        if lookahead_completed || !is_exact {
                            self.uncertain.push(i as u32);
                        } else {
                            self.accepted.push(i as u32);
                            self.accepted_by_lookahead.push(i as u32);
                        }
                    } else {
                        let range = subtree_ranges[i] as usize;
                        for j in i..range {
                            self.rejected.push(j as u32);
                            self.rejected_by_lookahead.push(j as u32);
                        }
                        i = range;
                        continue;
                    }
                } else {
                    self.rejected.push(i as u32);
                    last_rejected_range = subtree_ranges[i] as usize;
                }
                i += 1;
            }

            if fill_reject {
                let next_begin = intervals
                    .get(interval_idx + 1)
                    .map_or(sorted.len(), |&(b, _)| b);
                for j in end..next_begin {
                    self.rejected.push(j as u32);
                }
            }
        }

        self.parser.pop_last_states(prev_matched_size);
        fill_reject
    }

    /// Check the token's tail against the rule's lookahead assertion.
    ///
    /// Returns `(accepted, completed)`: `accepted` when the assertion is
    /// consistent with some suffix starting at a reach-end position,
    /// `completed` when it matched in full within the token.
    fn lookahead_check(&mut self, token: &[u8]) -> (bool, bool) {
        let Some(lookahead_id) = self.grammar.rule(self.init_rule).lookahead else {
            return (true, true);
        };
        self.parser
            .push_state_and_expand(ParserState::at(None, lookahead_id, 0, 0));
        if self.parser.is_completed() {
            self.parser.pop_last_states(1);
            return (true, true);
        }

        for start in (0..self.can_reach_end.len()).rev() {
            if !self.can_reach_end[start] {
                continue;
            }
            let mut last_accept = start as i64 - 1;
            for pos in start..token.len() {
                if !self.parser.advance(token[pos]) {
                    break;
                }
                last_accept = pos as i64;
                if self.parser.is_completed() {
                    // Assertion fully matched inside the token.
                    self.parser.pop_last_states(pos - start + 2);
                    return (true, true);
                }
            }
            if last_accept == token.len() as i64 - 1 {
                // The token ends mid-assertion.
                self.parser
                    .pop_last_states((last_accept - start as i64 + 2) as usize);
                return (true, false);
            }
            self.parser
                .pop_last_states((last_accept - start as i64 + 1) as usize);
        }

        self.parser.pop_last_states(1);
        (false, false)
    }

    /// Re-walk a cached lookahead-agnostic mask's uncertain tokens under
    /// the current rule's lookahead, folding the refined decisions back in.
    fn adapt_cache_with_lookahead(&mut self, cache: &mut AdaptiveTokenMask, is_root: bool) {
        let sorted = self.tokenizer.sorted_decoded_vocab();
        let subtree_ranges = self.tokenizer.trie_subtree_ranges();
        let rule = self.grammar.rule(self.init_rule);
        let is_exact = rule.is_exact_lookahead;

        let mut newly_accepted: Vec<u32> = Vec::new();
        let mut newly_rejected: Vec<u32> = Vec::new();
        let mut still_uncertain: Vec<u32> = Vec::new();

        if is_root {
            // Root masks may not carry uncertainty.
            newly_rejected = std::mem::take(&mut cache.uncertain_indices);
        } else {
            if rule.lookahead.is_none() {
                return;
            }
            let mut prev_token: Option<&'a [u8]> = None;
            let mut prev_matched_size = 0usize;
            let mut last_rejected_range = 0usize;
            for &u in &cache.uncertain_indices {
                let i = u as usize;
                if i < last_rejected_range {
                    newly_rejected.push(u);
                    continue;
                }
                let token = self.tokenizer.sorted_decoded_vocab()[i].1.as_slice();

                let mut accepted = true;
                if let Some(prev) = prev_token {
                    let lcp = common_prefix_len(token, prev);
                    if lcp > prev_matched_size {
                        accepted = false;
                    } else if lcp < prev_matched_size {
                        let rollback = prev_matched_size - lcp;
                        self.parser.pop_last_states(rollback);
                        self.can_reach_end.truncate(self.can_reach_end.len() - rollback);
                        self.can_reach_end_prefix_or
                            .truncate(self.can_reach_end_prefix_or.len() - rollback);
                    }
                    prev_matched_size = prev_matched_size.min(lcp);
                }
                prev_token = Some(token);

                if accepted {
                    for j in prev_matched_size..token.len() {
                        if !self.parser.advance(token[j]) {
                            accepted = false;
                            break;
                        }
                        let completed = self.parser.is_completed();
                        self.can_reach_end.push(completed);
                        let prefix_or =
                            completed || *self.can_reach_end_prefix_or.last().unwrap();
                        self.can_reach_end_prefix_or.push(prefix_or);
                        prev_matched_size = j + 1;
                    }
                }

                let can_reach_end = *self.can_reach_end_prefix_or.last().unwrap();
                if accepted {
                    newly_accepted.push(u);
                } else if can_reach_end && prev_matched_size > 0 {
                    let (lookahead_accepted, lookahead_completed) = self.lookahead_check(token);
                    if lookahead_accepted {
                        if lookahead_completed || !is_exact {
                            still_uncertain.push(u);
                        } else {
                            newly_accepted.push(u);
                        }
                    } else {
                        newly_rejected.push(u);
                        last_rejected_range = subtree_ranges[i] as usize;
                    }
                } else {
                    newly_rejected.push(u);
                    last_rejected_range = subtree_ranges[i] as usize;
                }
            }
        }

        cache.uncertain_indices = still_uncertain;
        let vocab_size = self.tokenizer.vocab_size();
        match cache.store {
            MaskStore::Accepted => {
                if cache.accepted_indices.len() + newly_accepted.len() < USE_BITSET_THRESHOLD {
                    union_sorted(&mut cache.accepted_indices, &newly_accepted);
                } else {
                    let mut bitset =
                        bitset_from_accepted(vocab_size, sorted, &cache.accepted_indices);
                    for &idx in &newly_accepted {
                        bitset.set(sorted[idx as usize].0 as usize);
                    }
                    cache.store = MaskStore::AcceptedBitset;
                    cache.accepted_bitset = Some(bitset);
                    cache.accepted_indices.clear();
                }
            }
            MaskStore::Rejected => {
                if cache.rejected_indices.len() + newly_rejected.len() < USE_BITSET_THRESHOLD {
                    union_sorted(&mut cache.rejected_indices, &newly_rejected);
                } else {
                    let mut all_rejected = cache.rejected_indices.clone();
                    union_sorted(&mut all_rejected, &newly_rejected);
                    let bitset = AdaptiveTokenMask::bitset_from_rejected(
                        vocab_size,
                        sorted,
                        self.tokenizer.special_token_ids(),
                        &all_rejected,
                        &cache.uncertain_indices,
                    );
                    cache.store = MaskStore::AcceptedBitset;
                    cache.accepted_bitset = Some(bitset);
                    cache.rejected_indices.clear();
                }
            }
            MaskStore::AcceptedBitset => {
                let bitset = cache
                    .accepted_bitset
                    .as_mut()
                    .expect("bitset store carries a bitset");
                for &idx in &newly_accepted {
                    bitset.set(sorted[idx as usize].0 as usize);
                }
            }
        }
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}
