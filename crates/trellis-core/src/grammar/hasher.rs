//! Canonical per-rule automaton fingerprints.
//!
//! Two rule automata that are bisimilar modulo state renumbering must get
//! the same 64-bit fingerprint, so grammars that differ only syntactically
//! share crossing-cache entries. Hashing BFS-renumbers states from the
//! start; rule-reference edges contribute the referee's fingerprint as
//! their alphabet token, which forces a dependency order across rules.
//! Mutually recursive rules are handled as simple cycles whose member
//! hashes are combined rotationally, and rules blocked by an unhashable
//! referee can still be partially hashed when the unknown reference sits
//! alone at the start state.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::support::hash_combine64;

use super::{Expr, Grammar, RuleId};

const NOT_END_FLAG: u64 = -0x100i64 as u64;
const END_FLAG: u64 = -0x200i64 as u64;
const SELF_FLAG: u64 = -0x300i64 as u64;
const CYCLE_FLAG: u64 = -0x400i64 as u64;
const UNKNOWN_FLAG: u64 = -0x500i64 as u64;

/// Compute fingerprints and BFS renumbering maps for every hashable rule
/// automaton, storing them on the grammar.
pub(crate) fn hash_fsms(grammar: &mut Grammar) {
    let n = grammar.num_rules();
    let mut hasher = Hasher {
        grammar,
        hashes: vec![None; n],
        mappings: vec![None; n],
        visited: vec![false; n],
        referees: vec![Vec::new(); n],
        referrers: vec![Vec::new(); n],
        has_inward: Vec::new(),
    };
    hasher.run();
    let Hasher {
        grammar, hashes, mappings, ..
    } = hasher;
    grammar.per_rule_fsm_hashes = hashes;
    grammar.per_rule_new_state_ids = mappings;
}

struct Hasher<'a> {
    grammar: &'a mut Grammar,
    hashes: Vec<Option<u64>>,
    mappings: Vec<Option<Vec<(usize, u32)>>>,
    visited: Vec<bool>,
    /// Unhashed referees per referrer (deduplicated, self included).
    referees: Vec<Vec<usize>>,
    /// Referrers per referee.
    referrers: Vec<Vec<usize>>,
    /// Complete-FSM states with at least one incoming edge.
    has_inward: Vec<bool>,
}

impl Hasher<'_> {
    fn run(&mut self) {
        let n = self.grammar.num_rules();
        self.build_ref_graph();
        self.build_inward_flags();

        // Rules without an automaton are never hashed; their referee
        // entries keep their referrers from being fully hashed.
        for i in 0..n {
            if self.grammar.per_rule_fsm(RuleId(i as u32)).is_none() {
                self.visited[i] = true;
            }
        }

        while let Some(rule) = self.find_hashable() {
            self.visited[rule] = true;
            let (hash, mapping) = self
                .hash_one(rule, false)
                .expect("a rule with all referees hashed must hash");
            self.hashes[rule] = Some(hash);
            self.mappings[rule] = Some(mapping);
            self.remove_from_graph(rule);
        }

        // Partially hashable leftovers: start state without inward edges
        // and at most one unknown reference leaving the start.
        let mut partial = Vec::new();
        for i in 0..n {
            if self.hashes[i].is_some() {
                continue;
            }
            let Some(fsm) = self.grammar.per_rule_fsm(RuleId(i as u32)) else {
                continue;
            };
            if self.has_inward[fsm.start()] {
                continue;
            }
            if let Some(result) = self.hash_one(i, true) {
                partial.push((i, result));
            }
        }
        for (rule, (hash, mapping)) in partial {
            self.hashes[rule] = Some(hash);
            self.mappings[rule] = Some(mapping);
        }
    }

    fn build_ref_graph(&mut self) {
        for (idx, rule) in self.grammar.rules().iter().enumerate() {
            let mut stack = vec![rule.body];
            let mut seen = BTreeSet::new();
            while let Some(expr_id) = stack.pop() {
                match self.grammar.expr(expr_id) {
                    Expr::RuleRef(r) | Expr::Repeat { rule: r, .. } => {
                        seen.insert(r.idx());
                    }
                    Expr::Sequence(ids) | Expr::Choices(ids) => stack.extend_from_slice(ids),
                    Expr::TagDispatch(td) => {
                        seen.extend(td.tag_rule_pairs.iter().map(|&(_, r)| r.idx()));
                    }
                    _ => {}
                }
            }
            for referee in seen {
                self.referees[idx].push(referee);
                self.referrers[referee].push(idx);
            }
        }
    }

    fn build_inward_flags(&mut self) {
        let Some(complete) = self.grammar.complete_fsm.as_ref() else {
            return;
        };
        self.has_inward = vec![false; complete.num_states()];
        for state in 0..complete.num_states() {
            for edge in complete.edges(state) {
                self.has_inward[edge.target()] = true;
            }
        }
    }

    /// A rule is immediately hashable when all its referees are hashed, or
    /// when its only unhashed referee is itself. When none exists, try to
    /// break a simple cycle.
    fn find_hashable(&mut self) -> Option<usize> {
        loop {
            for i in 0..self.referees.len() {
                if self.visited[i] {
                    continue;
                }
                if self.referees[i].is_empty() || self.referees[i] == [i] {
                    return Some(i);
                }
            }
            if !self.break_simple_cycle() {
                return None;
            }
        }
    }

    /// Find a strongly-connected chain where each member has exactly one
    /// unhashed referee (the next member), hash its members, and remove it
    /// from the graph. Returns false when no such cycle exists.
    fn break_simple_cycle(&mut self) -> bool {
        let n = self.referees.len();
        let mut not_simple = self.visited.clone();
        for i in 0..n {
            if not_simple[i] {
                continue;
            }
            let mut stack = vec![i];
            let mut in_stack = vec![false; n];
            in_stack[i] = true;
            let mut current = i;
            let mut cycle = Vec::new();
            while self.referees[current].len() == 1 && !not_simple[current] {
                debug_assert_ne!(
                    current, self.referees[current][0],
                    "self-recursive rules are hashable directly"
                );
                not_simple[current] = true;
                current = self.referees[current][0];
                if in_stack[current] {
                    cycle.push(current);
                    while *stack.last().unwrap() != current {
                        cycle.push(stack.pop().unwrap());
                    }
                    break;
                }
                stack.push(current);
                in_stack[current] = true;
            }
            if !cycle.is_empty() {
                self.hash_cycle(&cycle);
                return true;
            }
        }
        false
    }

    fn hash_cycle(&mut self, cycle: &[usize]) {
        for &member in cycle {
            self.visited[member] = true;
            self.hashes[member] = Some(CYCLE_FLAG);
        }
        let mut local = Vec::with_capacity(cycle.len());
        for &member in cycle {
            let (hash, mapping) = self
                .hash_one(member, false)
                .expect("cycle members have all out-of-cycle referees hashed");
            self.mappings[member] = Some(mapping);
            local.push(hash);
        }
        // Each member gets the cyclic combination starting at itself, so a
        // rotation of the same cycle in another grammar lines up.
        let len = local.len();
        for (i, &member) in cycle.iter().enumerate() {
            let mut combined = 0u64;
            for j in 0..len {
                combined = hash_combine64(&[combined, local[(i + j) % len]]);
            }
            self.hashes[member] = Some(combined);
        }
        for &member in cycle {
            self.remove_from_graph(member);
        }
    }

    fn remove_from_graph(&mut self, rule: usize) {
        for referrer_idx in 0..self.referrers[rule].len() {
            let referrer = self.referrers[rule][referrer_idx];
            self.referees[referrer].retain(|&r| r != rule);
        }
    }

    /// Hash one rule automaton by BFS renumbering from its start state.
    ///
    /// Emits, per state, an accepting flag token and then every outgoing
    /// edge: rule-reference edges first in alphabet-token order, byte-range
    /// edges after in stored order. Returns `None` when an unhashed referee
    /// is encountered in a disallowed position.
    fn hash_one(&self, rule: usize, allow_unknown: bool) -> Option<(u64, Vec<(usize, u32)>)> {
        let fsm = self
            .grammar
            .per_rule_fsm(RuleId(rule as u32))
            .expect("hash_one needs an automaton");
        let start = fsm.start();

        let mut new_ids: HashMap<usize, u32> = HashMap::new();
        new_ids.insert(start, 0);
        let mut queue = VecDeque::new();
        queue.push_back(start);
        let mut acc = 0u64;

        while let Some(state) = queue.pop_front() {
            let new_id = new_ids[&state] as u64;
            let flag = if fsm.is_end(state) { END_FLAG } else { NOT_END_FLAG };
            acc = hash_combine64(&[acc, new_id, flag, flag, new_id]);

            // Rule-reference edges, in canonical alphabet-token order.
            let mut rule_tokens: BTreeSet<(u64, usize)> = BTreeSet::new();
            let mut unknown_count = 0;
            for edge in fsm.fsm().edges(state) {
                let crate::fsm::FsmEdge::Rule { rule: referee, target } = *edge else {
                    continue;
                };
                if referee == rule {
                    rule_tokens.insert((SELF_FLAG, target));
                    continue;
                }
                match self.hashes[referee] {
                    Some(hash) => {
                        rule_tokens.insert((hash, target));
                    }
                    None => {
                        if !allow_unknown || state != start {
                            return None;
                        }
                        unknown_count += 1;
                        if unknown_count > 1 {
                            return None;
                        }
                        rule_tokens.insert((UNKNOWN_FLAG, target));
                    }
                }
            }
            for (token, target) in rule_tokens {
                let next_id = new_ids.len() as u32;
                let target_id = *new_ids.entry(target).or_insert_with(|| {
                    queue.push_back(target);
                    next_id
                });
                acc = hash_combine64(&[acc, new_id, token, target_id as u64]);
            }

            // Byte-range edges, in stored (sorted compact) order.
            for edge in fsm.fsm().edges(state) {
                let target = edge.target();
                let next_id = new_ids.len() as u32;
                let target_id = *new_ids.entry(target).or_insert_with(|| {
                    queue.push_back(target);
                    next_id
                });
                let crate::fsm::FsmEdge::Byte { min, max, .. } = *edge else {
                    continue;
                };
                acc = hash_combine64(&[acc, new_id, min as u64, max as u64, target_id as u64]);
            }
        }

        let mut mapping: Vec<(usize, u32)> = new_ids.into_iter().collect();
        mapping.sort_unstable_by_key(|&(old, _)| old);
        Some((acc, mapping))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::{normalize, optimize, GrammarBuilder};

    fn compiled(build: impl FnOnce(&mut GrammarBuilder) -> RuleId) -> Grammar {
        let mut builder = GrammarBuilder::new();
        let root = build(&mut builder);
        let mut grammar = optimize(&normalize(&builder.build(root)).unwrap()).unwrap();
        hash_fsms(&mut grammar);
        grammar
    }

    fn star_grammar(root_name: &str, sub_name: &str) -> Grammar {
        compiled(|b| {
            let root = b.add_empty_rule(root_name);
            let sub = b.add_empty_rule(sub_name);
            let star = b.add_character_class_star(vec![(b'x' as u32, b'x' as u32)], false);
            b.update_rule_body(sub, star);
            let sub_ref = b.add_rule_ref(sub);
            b.update_rule_body(root, sub_ref);
            root
        })
    }

    #[test]
    fn renamed_rules_share_fingerprints() {
        let g1 = star_grammar("root", "foo");
        let g2 = star_grammar("root", "bar");
        let h1 = g1.fsm_hash(RuleId(1)).unwrap();
        let h2 = g2.fsm_hash(RuleId(1)).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn different_bytes_change_fingerprints() {
        let make = |byte: u8| {
            compiled(move |b| {
                let root = b.add_empty_rule("root");
                let lit = b.add_byte_string(vec![byte]);
                b.update_rule_body(root, lit);
                root
            })
        };
        let g1 = make(b'a');
        let g2 = make(b'b');
        assert_ne!(
            g1.fsm_hash(RuleId(0)).unwrap(),
            g2.fsm_hash(RuleId(0)).unwrap()
        );
    }

    #[test]
    fn accepting_membership_changes_fingerprints() {
        let plain = compiled(|b| {
            let root = b.add_empty_rule("root");
            let lit = b.add_byte_string(b"a".to_vec());
            b.update_rule_body(root, lit);
            root
        });
        let nullable = compiled(|b| {
            let root = b.add_empty_rule("root");
            let lit = b.add_byte_string(b"a".to_vec());
            let empty = b.add_empty_string();
            let body = b.add_choices(vec![empty, lit]);
            b.update_rule_body(root, body);
            root
        });
        assert_ne!(
            plain.fsm_hash(RuleId(0)).unwrap(),
            nullable.fsm_hash(RuleId(0)).unwrap()
        );
    }

    #[test]
    fn mutual_recursion_hashes_as_cycle() {
        // a ::= "x" b | "done"; b ::= "y" a | "fin"
        let grammar = compiled(|b| {
            let root = b.add_empty_rule("root");
            let a = b.add_empty_rule("a");
            let bb = b.add_empty_rule("b");
            let x = b.add_byte_string(b"x".to_vec());
            let y = b.add_byte_string(b"y".to_vec());
            let done = b.add_byte_string(b"done".to_vec());
            let fin = b.add_byte_string(b"fin".to_vec());
            let b_ref = b.add_rule_ref(bb);
            let a_ref = b.add_rule_ref(a);
            let a_seq = b.add_sequence(vec![x, b_ref]);
            let a_body = b.add_choices(vec![a_seq, done]);
            b.update_rule_body(a, a_body);
            let b_seq = b.add_sequence(vec![y, a_ref]);
            let b_body = b.add_choices(vec![b_seq, fin]);
            b.update_rule_body(bb, b_body);
            let root_ref = b.add_rule_ref(a);
            b.update_rule_body(root, root_ref);
            root
        });
        for idx in 0..grammar.num_rules() {
            assert!(
                grammar.fsm_hash(RuleId(idx as u32)).is_some(),
                "rule {idx} should be hashed"
            );
        }
    }

    #[test]
    fn repeat_blocked_rules_stay_unhashed() {
        // root ::= "(" item{2,4} ")" — the repeat keeps root from lowering
        // to an automaton at all, and item is hashed normally.
        let grammar = compiled(|b| {
            let root = b.add_empty_rule("root");
            let item = b.add_empty_rule("item");
            let x = b.add_byte_string(b"x".to_vec());
            b.update_rule_body(item, x);
            let open = b.add_byte_string(b"(".to_vec());
            let close = b.add_byte_string(b")".to_vec());
            let repeat = b.add_repeat(item, 2, Some(4));
            let seq = b.add_sequence(vec![open, repeat, close]);
            b.update_rule_body(root, seq);
            root
        });
        assert!(grammar.per_rule_fsm(RuleId(0)).is_none());
        assert!(grammar.fsm_hash(RuleId(0)).is_none());
        assert!(grammar.fsm_hash(RuleId(1)).is_some());
    }

    #[test]
    fn renumbering_map_covers_reachable_states() {
        let grammar = star_grammar("root", "sub");
        let fsm = grammar.per_rule_fsm(RuleId(1)).unwrap();
        for state in fsm.reachable_states() {
            assert!(grammar.renumbered_state(RuleId(1), state).is_some());
        }
        assert_eq!(grammar.renumbered_state(RuleId(1), fsm.start()), Some(0));
    }
}
