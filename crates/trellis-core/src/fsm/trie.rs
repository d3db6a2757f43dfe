//! Byte-trie automata over pattern sets.
//!
//! Tag-dispatch rules scan free text for the first occurrence of any tag
//! string. [`TrieBuilder::build_scanner`] produces an Aho-Corasick-style
//! automaton: trie transitions plus suffix-link closure, so every state has
//! a full transition function (range-compressed) and pattern-end states are
//! terminal. [`TrieBuilder::build_exact`] produces the plain trie that
//! accepts exactly the pattern set.

use std::collections::HashMap;
use std::collections::VecDeque;

use super::FsmWithStartEnd;

#[derive(Default)]
struct TrieNode {
    children: HashMap<u8, usize>,
    /// Index of the pattern ending here, if any.
    pattern: Option<usize>,
}

/// Builder for pattern-set automata.
pub struct TrieBuilder;

impl TrieBuilder {
    /// Build the plain trie accepting exactly `patterns`.
    ///
    /// Returns the automaton and, per pattern (in input order), the state
    /// where it ends. Fails on empty or duplicate patterns.
    pub fn build_exact(patterns: &[Vec<u8>]) -> Option<(FsmWithStartEnd, Vec<usize>)> {
        let nodes = build_nodes(patterns)?;

        let mut fsm = FsmWithStartEnd::new();
        for _ in 0..nodes.len() {
            fsm.add_state();
        }
        fsm.set_start(0);
        let mut end_states = vec![0usize; patterns.len()];
        for (id, node) in nodes.iter().enumerate() {
            for (&byte, &child) in &node.children {
                fsm.fsm_mut().add_edge(id, child, byte, byte);
            }
            if let Some(pattern) = node.pattern {
                fsm.add_end(id);
                end_states[pattern] = id;
            }
        }
        Some((fsm, end_states))
    }

    /// Build a scanner automaton: reads arbitrary bytes and lands on a
    /// pattern-end state exactly when the input ends with that pattern's
    /// first occurrence.
    ///
    /// Pattern-end states are terminal. Fails when a pattern is empty, when
    /// patterns duplicate, or when one pattern occurs inside another in a
    /// way that makes the first match ambiguous (a pattern end reachable on
    /// a suffix link of an interior state).
    pub fn build_scanner(patterns: &[Vec<u8>]) -> Option<(FsmWithStartEnd, Vec<usize>)> {
        let nodes = build_nodes(patterns)?;
        let n = nodes.len();

        // Suffix links, BFS from the root.
        let mut fail = vec![0usize; n];
        let mut order = Vec::with_capacity(n);
        let mut queue = VecDeque::new();
        for &child in nodes[0].children.values() {
            fail[child] = 0;
            queue.push_back(child);
        }
        while let Some(u) = queue.pop_front() {
            order.push(u);
            for (&byte, &child) in &nodes[u].children {
                let mut f = fail[u];
                loop {
                    if let Some(&next) = nodes[f].children.get(&byte) {
                        if next != child {
                            fail[child] = next;
                        }
                        break;
                    }
                    if f == 0 {
                        break;
                    }
                    f = fail[f];
                }
                queue.push_back(child);
            }
        }

        // A pattern hidden inside another pattern's path would complete
        // before the longer one; the scan result would be ambiguous.
        for state in 0..n {
            if nodes[state].pattern.is_some() {
                continue;
            }
            let mut f = fail[state];
            loop {
                if nodes[f].pattern.is_some() {
                    return None;
                }
                if f == 0 {
                    break;
                }
                f = fail[f];
            }
        }

        // Full transition tables via the suffix-link closure.
        let mut table = vec![[0usize; 256]; n];
        let mut bfs: Vec<usize> = Vec::with_capacity(n);
        bfs.push(0);
        bfs.extend(order.iter().copied());
        for &state in &bfs {
            for byte in 0..=255u8 {
                table[state][byte as usize] = match nodes[state].children.get(&byte) {
                    Some(&child) => child,
                    None if state == 0 => 0,
                    None => table[fail[state]][byte as usize],
                };
            }
        }

        let mut fsm = FsmWithStartEnd::new();
        for _ in 0..n {
            fsm.add_state();
        }
        fsm.set_start(0);
        let mut end_states = vec![0usize; patterns.len()];
        for state in 0..n {
            if let Some(pattern) = nodes[state].pattern {
                fsm.add_end(state);
                end_states[pattern] = state;
                continue;
            }
            // Range-compress the 256-entry table.
            let mut run_start = 0usize;
            for byte in 1..=256usize {
                if byte == 256 || table[state][byte] != table[state][run_start] {
                    fsm.fsm_mut().add_edge(
                        state,
                        table[state][run_start],
                        run_start as u8,
                        (byte - 1) as u8,
                    );
                    run_start = byte;
                }
            }
        }
        Some((fsm, end_states))
    }
}

fn build_nodes(patterns: &[Vec<u8>]) -> Option<Vec<TrieNode>> {
    if patterns.iter().any(|p| p.is_empty()) {
        return None;
    }
    let mut nodes = vec![TrieNode::default()];
    for (pattern_idx, pattern) in patterns.iter().enumerate() {
        let mut cur = 0usize;
        for &byte in pattern {
            cur = match nodes[cur].children.get(&byte) {
                Some(&child) => child,
                None => {
                    nodes.push(TrieNode::default());
                    let child = nodes.len() - 1;
                    nodes[cur].children.insert(byte, child);
                    child
                }
            };
        }
        if nodes[cur].pattern.is_some() {
            return None;
        }
        nodes[cur].pattern = Some(pattern_idx);
    }
    Some(nodes)
}
