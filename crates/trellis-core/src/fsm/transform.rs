//! Automaton transformations: ε-elimination, determinization, minimization,
//! successor merging, and the union / concat / intersect compositions.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use super::{Fsm, FsmEdge, FsmWithStartEnd};

/// Returned when a transformation cannot be applied to this automaton.
///
/// Minimization is best-effort in the presence of rule-reference edges; the
/// caller keeps the untransformed automaton on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformError;

/// A symbol of the determinized alphabet: a disjoint byte range or a rule id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Symbol {
    Byte(u8, u8),
    Rule(usize),
}

impl FsmWithStartEnd {
    /// Return an equivalent automaton with no ε-edges.
    ///
    /// Each state's edges become the non-ε edges of its ε-closure; a state
    /// is accepting iff any closure member is.
    pub fn simplify_epsilon(&self) -> FsmWithStartEnd {
        let n = self.fsm.num_states();
        let mut out = FsmWithStartEnd::new();
        for _ in 0..n {
            out.add_state();
        }
        out.set_start(self.start);

        for state in 0..n {
            let closure = self.epsilon_closure(state);
            let mut seen = HashSet::new();
            for &member in &closure {
                if self.is_end(member) {
                    out.add_end(state);
                }
                for edge in self.fsm.edges(member) {
                    if let FsmEdge::Epsilon { .. } = edge {
                        continue;
                    }
                    if seen.insert(*edge) {
                        out.fsm_mut().edges[state].push(*edge);
                    }
                }
            }
        }
        out.trim_unreachable()
    }

    fn epsilon_closure(&self, state: usize) -> Vec<usize> {
        let mut seen = HashSet::new();
        let mut stack = vec![state];
        seen.insert(state);
        while let Some(s) = stack.pop() {
            for edge in self.fsm.edges(s) {
                if let FsmEdge::Epsilon { target } = edge {
                    if seen.insert(*target) {
                        stack.push(*target);
                    }
                }
            }
        }
        let mut closure: Vec<usize> = seen.into_iter().collect();
        closure.sort_unstable();
        closure
    }

    /// Subset construction.
    ///
    /// The alphabet is disjoint byte ranges; rule-reference edges are
    /// treated as opaque alphabet symbols keyed by the rule id. ε-edges are
    /// eliminated first.
    pub fn to_dfa(&self) -> FsmWithStartEnd {
        let src = if self.has_epsilon() {
            self.simplify_epsilon()
        } else {
            self.clone()
        };

        let mut out = FsmWithStartEnd::new();
        let mut subset_ids: HashMap<BTreeSet<usize>, usize> = HashMap::new();
        let mut queue = VecDeque::new();

        let start_set: BTreeSet<usize> = [src.start].into();
        let start_id = out.add_state();
        out.set_start(start_id);
        subset_ids.insert(start_set.clone(), start_id);
        queue.push_back(start_set);

        while let Some(subset) = queue.pop_front() {
            let id = subset_ids[&subset];
            if subset.iter().any(|&s| src.is_end(s)) {
                out.add_end(id);
            }
            for (symbol, targets) in symbol_successors(&src.fsm, &subset) {
                let target_id = *subset_ids.entry(targets.clone()).or_insert_with(|| {
                    queue.push_back(targets.clone());
                    out.fsm.add_state()
                });
                match symbol {
                    Symbol::Byte(min, max) => out.fsm.add_edge(id, target_id, min, max),
                    Symbol::Rule(rule) => out.fsm.add_rule_edge(id, target_id, rule),
                }
            }
        }
        out
    }

    /// Merge right-equivalent states: states with identical acceptance and
    /// identical outgoing edges collapse into one, to a fixed point.
    pub fn merge_equivalent_successors(&self) -> FsmWithStartEnd {
        let mut cur = self.clone();
        loop {
            let n = cur.fsm.num_states();
            let mut remap: Vec<usize> = (0..n).collect();
            let mut groups: HashMap<(bool, Vec<FsmEdge>), usize> = HashMap::new();
            let mut changed = false;
            for state in 0..n {
                let mut signature = cur.fsm.edges(state).to_vec();
                signature.sort_unstable();
                signature.dedup();
                let key = (cur.is_end(state), signature);
                match groups.get(&key) {
                    Some(&representative) => {
                        remap[state] = representative;
                        changed = true;
                    }
                    None => {
                        groups.insert(key, state);
                    }
                }
            }
            if !changed {
                return cur.trim_unreachable();
            }
            cur = cur.remapped(&remap);
        }
    }

    /// Full DFA minimization by partition refinement.
    ///
    /// Fails when the automaton still has ε-edges, or when it is
    /// nondeterministic and contains rule-reference edges (the rule-ref
    /// alphabet cannot be determinized safely). On failure the caller keeps
    /// the unminimized automaton.
    pub fn minimize_dfa(&self) -> Result<FsmWithStartEnd, TransformError> {
        if self.has_epsilon() {
            return Err(TransformError);
        }
        let dfa = if self.is_deterministic() {
            self.clone()
        } else if self.has_rule_edges() {
            return Err(TransformError);
        } else {
            self.to_dfa()
        };
        let dfa = dfa.trim_unreachable();
        let n = dfa.fsm.num_states();
        if n == 0 {
            return Ok(dfa);
        }

        // Global disjoint alphabet so per-state successor keys line up.
        let all_states: BTreeSet<usize> = (0..n).collect();
        let alphabet: Vec<Symbol> = symbol_successors(&dfa.fsm, &all_states)
            .into_iter()
            .map(|(symbol, _)| symbol)
            .collect();

        let mut block_of: Vec<usize> = (0..n).map(|s| usize::from(dfa.is_end(s))).collect();
        loop {
            let mut next_ids: HashMap<(usize, Vec<Option<usize>>), usize> = HashMap::new();
            let mut next_block_of = vec![0usize; n];
            for state in 0..n {
                let successors: Vec<Option<usize>> = alphabet
                    .iter()
                    .map(|&symbol| dfa.symbol_target(state, symbol).map(|t| block_of[t]))
                    .collect();
                let key = (block_of[state], successors);
                let next = next_ids.len();
                let id = *next_ids.entry(key).or_insert(next);
                next_block_of[state] = id;
            }
            let stable = next_ids.len() == block_of.iter().collect::<HashSet<_>>().len();
            block_of = next_block_of;
            if stable {
                break;
            }
        }

        Ok(dfa.remapped_to_blocks(&block_of))
    }

    /// Concatenate a non-empty list of automata: the ends of each element
    /// ε-link to the start of the next.
    pub fn concat(parts: Vec<FsmWithStartEnd>) -> FsmWithStartEnd {
        debug_assert!(!parts.is_empty());
        let mut out = FsmWithStartEnd::new();
        let mut mapping = Vec::new();
        let mut prev_ends: Vec<usize> = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            out.fsm.add_fsm(&part.fsm, &mut mapping);
            let part_start = mapping[part.start];
            if i == 0 {
                out.set_start(part_start);
            } else {
                for &end in &prev_ends {
                    out.fsm.add_epsilon_edge(end, part_start);
                }
            }
            prev_ends = part.ends.iter().map(|&e| mapping[e]).collect();
        }
        for &end in &prev_ends {
            out.add_end(end);
        }
        out
    }

    /// Union of a list of automata: a fresh start state ε-links to every
    /// child start.
    pub fn union(parts: Vec<FsmWithStartEnd>) -> FsmWithStartEnd {
        let mut out = FsmWithStartEnd::new();
        let start = out.add_state();
        out.set_start(start);
        let mut mapping = Vec::new();
        for part in &parts {
            out.fsm.add_fsm(&part.fsm, &mut mapping);
            out.fsm.add_epsilon_edge(start, mapping[part.start]);
            for &end in &part.ends {
                out.add_end(mapping[end]);
            }
        }
        out
    }

    /// Product-construction intersection over byte alphabets.
    ///
    /// Fails if either input contains rule-reference edges.
    pub fn intersect(
        a: &FsmWithStartEnd,
        b: &FsmWithStartEnd,
    ) -> Result<FsmWithStartEnd, TransformError> {
        if a.has_rule_edges() || b.has_rule_edges() {
            return Err(TransformError);
        }
        let a = a.to_dfa();
        let b = b.to_dfa();

        let mut out = FsmWithStartEnd::new();
        let mut pair_ids: HashMap<(usize, usize), usize> = HashMap::new();
        let mut queue = VecDeque::new();
        let start = out.add_state();
        out.set_start(start);
        pair_ids.insert((a.start, b.start), start);
        queue.push_back((a.start, b.start));

        while let Some((sa, sb)) = queue.pop_front() {
            let id = pair_ids[&(sa, sb)];
            if a.is_end(sa) && b.is_end(sb) {
                out.add_end(id);
            }
            for ea in a.fsm.edges(sa) {
                let FsmEdge::Byte {
                    min: amin,
                    max: amax,
                    target: ta,
                } = *ea
                else {
                    continue;
                };
                for eb in b.fsm.edges(sb) {
                    let FsmEdge::Byte {
                        min: bmin,
                        max: bmax,
                        target: tb,
                    } = *eb
                    else {
                        continue;
                    };
                    let min = amin.max(bmin);
                    let max = amax.min(bmax);
                    if min > max {
                        continue;
                    }
                    let target = *pair_ids.entry((ta, tb)).or_insert_with(|| {
                        queue.push_back((ta, tb));
                        out.fsm.add_state()
                    });
                    out.fsm.add_edge(id, target, min, max);
                }
            }
        }
        Ok(out)
    }

    /// True if any state has an ε-edge.
    pub fn has_epsilon(&self) -> bool {
        (0..self.fsm.num_states())
            .any(|s| self.fsm.edges(s).iter().any(|e| matches!(e, FsmEdge::Epsilon { .. })))
    }

    /// True if any state has a rule-reference edge.
    pub fn has_rule_edges(&self) -> bool {
        (0..self.fsm.num_states()).any(|s| self.fsm.edges(s).iter().any(FsmEdge::is_rule))
    }

    fn is_deterministic(&self) -> bool {
        for state in 0..self.fsm.num_states() {
            let mut rule_targets: HashMap<usize, usize> = HashMap::new();
            let mut byte_target = [None::<usize>; 256];
            for edge in self.fsm.edges(state) {
                match *edge {
                    FsmEdge::Epsilon { .. } => return false,
                    FsmEdge::Rule { rule, target } => {
                        if *rule_targets.entry(rule).or_insert(target) != target {
                            return false;
                        }
                    }
                    FsmEdge::Byte { min, max, target } => {
                        for b in min..=max {
                            match byte_target[b as usize] {
                                Some(t) if t != target => return false,
                                _ => byte_target[b as usize] = Some(target),
                            }
                        }
                    }
                }
            }
        }
        true
    }

    /// The unique successor of `state` on `symbol`, if the automaton is
    /// deterministic on that symbol.
    fn symbol_target(&self, state: usize, symbol: Symbol) -> Option<usize> {
        for edge in self.fsm.edges(state) {
            match (symbol, *edge) {
                (Symbol::Byte(min, _), FsmEdge::Byte { min: emin, max: emax, target })
                    if emin <= min && min <= emax =>
                {
                    return Some(target);
                }
                (Symbol::Rule(rule), FsmEdge::Rule { rule: erule, target }) if rule == erule => {
                    return Some(target);
                }
                _ => {}
            }
        }
        None
    }

    /// Rewrite every state id through `remap`, deduplicating edges, then
    /// drop unreachable states.
    fn remapped(&self, remap: &[usize]) -> FsmWithStartEnd {
        let n = self.fsm.num_states();
        let mut out = FsmWithStartEnd::new();
        for _ in 0..n {
            out.add_state();
        }
        out.set_start(remap[self.start]);
        for state in 0..n {
            let new_state = remap[state];
            for edge in self.fsm.edges(state) {
                let new_edge = edge.with_target(remap[edge.target()]);
                if !out.fsm.edges[new_state].contains(&new_edge) {
                    out.fsm.edges[new_state].push(new_edge);
                }
            }
            if self.is_end(state) {
                out.add_end(new_state);
            }
        }
        out.trim_unreachable()
    }

    fn remapped_to_blocks(&self, block_of: &[usize]) -> FsmWithStartEnd {
        let num_blocks = block_of.iter().copied().max().map_or(0, |m| m + 1);
        let mut out = FsmWithStartEnd::new();
        for _ in 0..num_blocks {
            out.add_state();
        }
        out.set_start(block_of[self.start]);
        for state in 0..self.fsm.num_states() {
            let new_state = block_of[state];
            for edge in self.fsm.edges(state) {
                let new_edge = edge.with_target(block_of[edge.target()]);
                if !out.fsm.edges[new_state].contains(&new_edge) {
                    out.fsm.edges[new_state].push(new_edge);
                }
            }
            if self.is_end(state) {
                out.add_end(new_state);
            }
        }
        out.trim_unreachable()
    }

    /// Renumber states so only start-reachable ones remain.
    pub(crate) fn trim_unreachable(&self) -> FsmWithStartEnd {
        let order = self.reachable_states();
        let mut new_id = vec![usize::MAX; self.fsm.num_states()];
        for (new, &old) in order.iter().enumerate() {
            new_id[old] = new;
        }
        let mut out = FsmWithStartEnd::new();
        for _ in 0..order.len() {
            out.add_state();
        }
        out.set_start(new_id[self.start]);
        for &old in &order {
            for edge in self.fsm.edges(old) {
                out.fsm.edges[new_id[old]].push(edge.with_target(new_id[edge.target()]));
            }
            if self.is_end(old) {
                out.add_end(new_id[old]);
            }
        }
        out
    }
}

/// For a set of source states, the disjoint-symbol successor sets.
///
/// Byte edges are split at every range boundary occurring in the set, so
/// each returned byte symbol maps to a single well-defined successor set.
fn symbol_successors(fsm: &Fsm, states: &BTreeSet<usize>) -> Vec<(Symbol, BTreeSet<usize>)> {
    // Collect boundaries: range starts, and one past range ends.
    let mut boundaries = BTreeSet::new();
    let mut rules: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    for &s in states {
        for edge in fsm.edges(s) {
            match *edge {
                FsmEdge::Byte { min, max, .. } => {
                    boundaries.insert(min as u16);
                    boundaries.insert(max as u16 + 1);
                }
                FsmEdge::Rule { rule, target } => {
                    rules.entry(rule).or_default().insert(target);
                }
                FsmEdge::Epsilon { .. } => {
                    debug_assert!(false, "epsilon edges must be eliminated first");
                }
            }
        }
    }

    let mut out = Vec::new();
    let bounds: Vec<u16> = boundaries.into_iter().collect();
    for window in bounds.windows(2) {
        let (lo, hi) = (window[0], window[1] - 1);
        let mut targets = BTreeSet::new();
        for &s in states {
            for edge in fsm.edges(s) {
                if let FsmEdge::Byte { min, max, target } = *edge {
                    if (min as u16) <= lo && hi <= (max as u16) {
                        targets.insert(target);
                    }
                }
            }
        }
        if !targets.is_empty() {
            out.push((Symbol::Byte(lo as u8, hi as u8), targets));
        }
    }
    for (rule, targets) in rules {
        out.push((Symbol::Rule(rule), targets));
    }
    out
}
