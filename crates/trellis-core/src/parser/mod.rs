//! Earley-style byte parser driver.
//!
//! The mask compiler drives this parser one byte at a time from an
//! arbitrary grammar position: [`EarleyParser::advance`] consumes a byte,
//! [`EarleyParser::is_completed`] reports whether the initial rule can end
//! here, and [`EarleyParser::push_state_and_expand`] /
//! [`EarleyParser::pop_last_states`] stack speculative frames for lookahead
//! checks and longest-common-prefix rollback.
//!
//! Internally the parser keeps a stack of rows, one per consumed byte (plus
//! one per pushed frame). A row holds the set of live items; completions
//! propagate to parent items through the row index recorded at prediction
//! time. Rules with an attached automaton are tracked by automaton state;
//! rules without one are walked element-by-element through their
//! normalized sequences.

use std::collections::HashSet;

use crate::grammar::{Expr, ExprId, Grammar, RuleId};

/// Row index recorded at prediction time, or the sentinel for frame roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PrevInputPos {
    /// The item is a root of its frame; completing it completes the frame.
    None,
    /// The item's rule was predicted at this row.
    At(u32),
}

/// A position in the grammar, used both as a parser item and as the key of
/// the compiled mask map.
///
/// For rules with an automaton, `sequence_id` is the rule body and
/// `element_id` is the automaton state. For element-walked rules,
/// `sequence_id` is one sequence of the body choices, `element_id` indexes
/// into it, and `sub_element_id` is the byte offset within a byte string,
/// the remaining continuation-byte count within a character class, or the
/// completed iteration count at a repetition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParserState {
    /// The rule this item belongs to; `None` for lookahead frames.
    pub rule_id: Option<RuleId>,
    /// Body expression (automaton rules) or sequence expression.
    pub sequence_id: ExprId,
    /// Automaton state or element index.
    pub element_id: u32,
    /// Where the enclosing rule instance was predicted.
    pub prev_input_pos: PrevInputPos,
    /// Sub-element progress (see type docs).
    pub sub_element_id: u32,
}

impl ParserState {
    /// The canonical mask-map key for a position: no prediction context.
    pub fn at(
        rule_id: Option<RuleId>,
        sequence_id: ExprId,
        element_id: u32,
        sub_element_id: u32,
    ) -> Self {
        Self {
            rule_id,
            sequence_id,
            element_id,
            prev_input_pos: PrevInputPos::None,
            sub_element_id,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Row {
    items: Vec<ParserState>,
    completed: bool,
}

/// The parser driver.
pub struct EarleyParser<'a> {
    grammar: &'a Grammar,
    rows: Vec<Row>,
}

impl<'a> EarleyParser<'a> {
    /// Create a parser whose first frame is `init`.
    pub fn new(grammar: &'a Grammar, init: ParserState) -> Self {
        let mut parser = Self {
            grammar,
            rows: Vec::new(),
        };
        parser.push_state_and_expand(init);
        parser
    }

    /// Whether the current frame's root can be complete here.
    pub fn is_completed(&self) -> bool {
        self.rows.last().is_some_and(|row| row.completed)
    }

    /// Consume one byte. Returns false (leaving the state unchanged) when
    /// no live item can scan it.
    pub fn advance(&mut self, byte: u8) -> bool {
        let mut next_items = Vec::new();
        if let Some(row) = self.rows.last() {
            for item in &row.items {
                self.scan(item, byte, &mut next_items);
            }
        }
        if next_items.is_empty() {
            return false;
        }
        let row = self.close(next_items);
        self.rows.push(row);
        true
    }

    /// Push a new frame rooted at `state` and expand its closure.
    pub fn push_state_and_expand(&mut self, state: ParserState) {
        let row = self.close(vec![state]);
        self.rows.push(row);
    }

    /// Drop the last `n` rows (successful advances and pushed frames).
    pub fn pop_last_states(&mut self, n: usize) {
        debug_assert!(n <= self.rows.len());
        self.rows.truncate(self.rows.len().saturating_sub(n));
    }

    /// Number of live rows.
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    fn is_fsm_item(&self, item: &ParserState) -> bool {
        item.rule_id
            .is_some_and(|r| self.grammar.per_rule_fsm(r).is_some())
    }

    /// Scan `byte` from a single item, appending raw successors.
    fn scan(&self, item: &ParserState, byte: u8, out: &mut Vec<ParserState>) {
        if self.is_fsm_item(item) {
            let fsm = self
                .grammar
                .per_rule_fsm(item.rule_id.unwrap())
                .expect("automaton item");
            for target in fsm.fsm().byte_targets(item.element_id as usize, byte) {
                out.push(ParserState {
                    element_id: target as u32,
                    ..*item
                });
            }
            return;
        }

        let Expr::Sequence(elements) = self.grammar.expr(item.sequence_id) else {
            return;
        };
        let Some(&element) = elements.get(item.element_id as usize) else {
            return;
        };
        match self.grammar.expr(element) {
            Expr::ByteString(bytes) => {
                let pos = item.sub_element_id as usize;
                if bytes.get(pos) == Some(&byte) {
                    if pos + 1 < bytes.len() {
                        out.push(ParserState {
                            sub_element_id: item.sub_element_id + 1,
                            ..*item
                        });
                    } else {
                        out.push(ParserState {
                            element_id: item.element_id + 1,
                            sub_element_id: 0,
                            ..*item
                        });
                    }
                }
            }
            Expr::CharacterClass { negated, ranges } => {
                self.scan_class(item, byte, *negated, ranges, false, out);
            }
            Expr::CharacterClassStar { negated, ranges } => {
                self.scan_class(item, byte, *negated, ranges, true, out);
            }
            // Rule references and repetitions are expanded by the closure;
            // nothing scans here.
            _ => {}
        }
    }

    /// Scan one byte of a (possibly starred) character class.
    ///
    /// `sub_element_id` counts the continuation bytes still owed for the
    /// current codepoint; continuation bytes are checked for shape
    /// (`0x80..=0xBF`) only, matching the first-character-mask contract.
    fn scan_class(
        &self,
        item: &ParserState,
        byte: u8,
        negated: bool,
        ranges: &[(u32, u32)],
        star: bool,
        out: &mut Vec<ParserState>,
    ) {
        let left = item.sub_element_id;
        if left > 0 {
            if (0x80..=0xBF).contains(&byte) {
                if left > 1 {
                    out.push(ParserState {
                        sub_element_id: left - 1,
                        ..*item
                    });
                } else {
                    self.push_class_char_done(item, star, out);
                }
            }
            return;
        }

        if byte < 0x80 {
            let in_ranges = ranges
                .iter()
                .any(|&(lo, hi)| lo <= byte as u32 && byte as u32 <= hi);
            if in_ranges != negated {
                self.push_class_char_done(item, star, out);
            }
            return;
        }

        // Lead byte of a multi-byte codepoint: accept when the covered
        // codepoint span can satisfy the class.
        let Some((span_lo, span_hi, continuations)) = utf8_lead_span(byte) else {
            return;
        };
        let acceptable = if negated {
            true
        } else {
            ranges
                .iter()
                .any(|&(lo, hi)| lo <= span_hi && span_lo <= hi)
        };
        if acceptable {
            out.push(ParserState {
                sub_element_id: continuations,
                ..*item
            });
        }
    }

    fn push_class_char_done(&self, item: &ParserState, star: bool, out: &mut Vec<ParserState>) {
        if star {
            out.push(ParserState {
                sub_element_id: 0,
                ..*item
            });
        } else {
            out.push(ParserState {
                element_id: item.element_id + 1,
                sub_element_id: 0,
                ..*item
            });
        }
    }

    /// Compute the closure of `items`: predictions, nullable skips, and
    /// completions into earlier rows.
    fn close(&self, items: Vec<ParserState>) -> Row {
        let row_index = self.rows.len() as u32;
        let mut row = Row {
            items,
            completed: false,
        };
        let mut seen: HashSet<ParserState> = row.items.iter().copied().collect();

        let mut i = 0;
        while i < row.items.len() {
            let item = row.items[i];
            i += 1;

            if self.is_fsm_item(&item) {
                let rule = item.rule_id.unwrap();
                let fsm = self.grammar.per_rule_fsm(rule).expect("automaton item");
                if fsm.is_end(item.element_id as usize) {
                    self.complete(&item, row_index, &mut row, &mut seen);
                }
                for edge in fsm.fsm().edges(item.element_id as usize) {
                    let crate::fsm::FsmEdge::Rule { rule: referee, target } = *edge else {
                        continue;
                    };
                    self.predict(RuleId(referee as u32), row_index, &mut row, &mut seen);
                    if self.grammar.allows_empty(RuleId(referee as u32)) {
                        push_item(
                            ParserState {
                                element_id: target as u32,
                                ..item
                            },
                            &mut row,
                            &mut seen,
                        );
                    }
                }
                continue;
            }

            let Expr::Sequence(elements) = self.grammar.expr(item.sequence_id) else {
                continue;
            };
            match elements.get(item.element_id as usize) {
                None => {
                    // Dot at the end of the sequence: the rule instance is
                    // complete.
                    self.complete(&item, row_index, &mut row, &mut seen);
                }
                Some(&element) => match self.grammar.expr(element) {
                    Expr::RuleRef(rule) => {
                        self.predict(*rule, row_index, &mut row, &mut seen);
                        if self.grammar.allows_empty(*rule) {
                            push_item(
                                ParserState {
                                    element_id: item.element_id + 1,
                                    sub_element_id: 0,
                                    ..item
                                },
                                &mut row,
                                &mut seen,
                            );
                        }
                    }
                    Expr::Repeat { rule, min, max } => {
                        let count = item.sub_element_id;
                        if count >= *min || self.grammar.allows_empty(*rule) {
                            push_item(
                                ParserState {
                                    element_id: item.element_id + 1,
                                    sub_element_id: 0,
                                    ..item
                                },
                                &mut row,
                                &mut seen,
                            );
                        }
                        if max.map_or(true, |m| count < m) {
                            self.predict(*rule, row_index, &mut row, &mut seen);
                        }
                    }
                    Expr::CharacterClassStar { .. } => {
                        if item.sub_element_id == 0 {
                            push_item(
                                ParserState {
                                    element_id: item.element_id + 1,
                                    sub_element_id: 0,
                                    ..item
                                },
                                &mut row,
                                &mut seen,
                            );
                        }
                    }
                    _ => {}
                },
            }
        }
        row
    }

    /// Predict `rule` at `row_index`: add its start items.
    fn predict(&self, rule: RuleId, row_index: u32, row: &mut Row, seen: &mut HashSet<ParserState>) {
        if let Some(fsm) = self.grammar.per_rule_fsm(rule) {
            push_item(
                ParserState {
                    rule_id: Some(rule),
                    sequence_id: self.grammar.rule(rule).body,
                    element_id: fsm.start() as u32,
                    prev_input_pos: PrevInputPos::At(row_index),
                    sub_element_id: 0,
                },
                row,
                seen,
            );
            return;
        }
        let Expr::Choices(choices) = self.grammar.expr(self.grammar.rule(rule).body) else {
            unreachable!("non-normalized rule body");
        };
        for &choice in choices {
            if matches!(self.grammar.expr(choice), Expr::EmptyString) {
                // Nullability is handled at the prediction site.
                continue;
            }
            push_item(
                ParserState {
                    rule_id: Some(rule),
                    sequence_id: choice,
                    element_id: 0,
                    prev_input_pos: PrevInputPos::At(row_index),
                    sub_element_id: 0,
                },
                row,
                seen,
            );
        }
    }

    /// Complete `item`'s rule instance: advance every parent waiting on it
    /// in the prediction row.
    ///
    /// Same-row completions (empty derivations) are already covered by the
    /// nullable skip at prediction time, so only strictly earlier rows are
    /// consulted.
    fn complete(
        &self,
        item: &ParserState,
        row_index: u32,
        row: &mut Row,
        seen: &mut HashSet<ParserState>,
    ) {
        let completed_rule = match item.prev_input_pos {
            PrevInputPos::None => {
                row.completed = true;
                return;
            }
            PrevInputPos::At(p) if p == row_index => return,
            PrevInputPos::At(p) => {
                let Some(rule) = item.rule_id else {
                    return;
                };
                (rule, p)
            }
        };
        let (rule, parent_row) = completed_rule;
        let parents: Vec<ParserState> = self.rows[parent_row as usize].items.clone();
        for parent in parents {
            self.advance_parent_over(&parent, rule, row, seen);
        }
    }

    /// If `parent` is waiting on `rule`, push its continuation items.
    fn advance_parent_over(
        &self,
        parent: &ParserState,
        rule: RuleId,
        row: &mut Row,
        seen: &mut HashSet<ParserState>,
    ) {
        if self.is_fsm_item(parent) {
            let fsm = self
                .grammar
                .per_rule_fsm(parent.rule_id.unwrap())
                .expect("automaton item");
            for edge in fsm.fsm().edges(parent.element_id as usize) {
                let crate::fsm::FsmEdge::Rule { rule: referee, target } = *edge else {
                    continue;
                };
                if referee == rule.idx() {
                    push_item(
                        ParserState {
                            element_id: target as u32,
                            ..*parent
                        },
                        row,
                        seen,
                    );
                }
            }
            return;
        }
        let Expr::Sequence(elements) = self.grammar.expr(parent.sequence_id) else {
            return;
        };
        let Some(&element) = elements.get(parent.element_id as usize) else {
            return;
        };
        match self.grammar.expr(element) {
            Expr::RuleRef(r) if *r == rule => {
                push_item(
                    ParserState {
                        element_id: parent.element_id + 1,
                        sub_element_id: 0,
                        ..*parent
                    },
                    row,
                    seen,
                );
            }
            Expr::Repeat { rule: r, .. } if *r == rule => {
                // One more iteration done; the closure re-evaluates the
                // bounds at the new count.
                push_item(
                    ParserState {
                        sub_element_id: parent.sub_element_id + 1,
                        ..*parent
                    },
                    row,
                    seen,
                );
            }
            _ => {}
        }
    }
}

/// Span of codepoints covered by a UTF-8 lead byte, plus its continuation
/// count. Returns `None` for bytes that cannot begin a codepoint.
pub(crate) fn utf8_lead_span(byte: u8) -> Option<(u32, u32, u32)> {
    match byte {
        0xC2..=0xDF => {
            let base = ((byte - 0xC0) as u32) << 6;
            Some((base, base | 0x3F, 1))
        }
        0xE0..=0xEF => {
            let base = ((byte - 0xE0) as u32) << 12;
            Some((base, base | 0xFFF, 2))
        }
        0xF0..=0xF4 => {
            let base = ((byte - 0xF0) as u32) << 18;
            Some((base, (base | 0x3FFFF).min(0x10FFFF), 3))
        }
        _ => None,
    }
}

fn push_item(item: ParserState, row: &mut Row, seen: &mut HashSet<ParserState>) {
    if seen.insert(item) {
        row.items.push(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::{normalize, optimize, GrammarBuilder};

    fn compile(build: impl FnOnce(&mut GrammarBuilder) -> RuleId) -> Grammar {
        let mut builder = GrammarBuilder::new();
        let root = build(&mut builder);
        optimize(&normalize(&builder.build(root)).unwrap()).unwrap()
    }

    fn root_parser(grammar: &Grammar) -> EarleyParser<'_> {
        let root = grammar.root_rule_id();
        let init = if let Some(fsm) = grammar.per_rule_fsm(root) {
            ParserState::at(
                Some(root),
                grammar.rule(root).body,
                fsm.start() as u32,
                0,
            )
        } else {
            let Expr::Choices(choices) = grammar.expr(grammar.rule(root).body) else {
                panic!("non-normalized root");
            };
            ParserState::at(Some(root), choices[0], 0, 0)
        };
        EarleyParser::new(grammar, init)
    }

    fn matches(grammar: &Grammar, input: &[u8]) -> bool {
        let mut parser = root_parser(grammar);
        for &b in input {
            if !parser.advance(b) {
                return false;
            }
        }
        parser.is_completed()
    }

    #[test]
    fn literal_choice_grammar() {
        // root ::= "cat" | "car"
        let grammar = compile(|b| {
            let root = b.add_empty_rule("root");
            let cat = b.add_byte_string(b"cat".to_vec());
            let car = b.add_byte_string(b"car".to_vec());
            let body = b.add_choices(vec![cat, car]);
            b.update_rule_body(root, body);
            root
        });
        assert!(matches(&grammar, b"cat"));
        assert!(matches(&grammar, b"car"));
        assert!(!matches(&grammar, b"ca"));
        assert!(!matches(&grammar, b"can"));
        assert!(!matches(&grammar, b"cats"));
    }

    #[test]
    fn rule_reference_and_completion() {
        // root ::= "(" inner ")"; inner ::= "x" | "y"
        let grammar = compile(|b| {
            let root = b.add_empty_rule("root");
            let inner = b.add_empty_rule("inner");
            let x = b.add_byte_string(b"x".to_vec());
            let y = b.add_byte_string(b"y".to_vec());
            let inner_body = b.add_choices(vec![x, y]);
            b.update_rule_body(inner, inner_body);
            let open = b.add_byte_string(b"(".to_vec());
            let close = b.add_byte_string(b")".to_vec());
            let inner_ref = b.add_rule_ref(inner);
            let seq = b.add_sequence(vec![open, inner_ref, close]);
            b.update_rule_body(root, seq);
            root
        });
        assert!(matches(&grammar, b"(x)"));
        assert!(matches(&grammar, b"(y)"));
        assert!(!matches(&grammar, b"()"));
        assert!(!matches(&grammar, b"(x"));
        assert!(!matches(&grammar, b"(xy)"));
    }

    #[test]
    fn self_recursive_rule() {
        // root ::= "a" root | ""
        let grammar = compile(|b| {
            let root = b.add_empty_rule("root");
            let a = b.add_byte_string(b"a".to_vec());
            let root_ref = b.add_rule_ref(root);
            let seq = b.add_sequence(vec![a, root_ref]);
            let empty = b.add_empty_string();
            let body = b.add_choices(vec![seq, empty]);
            b.update_rule_body(root, body);
            root
        });
        assert!(matches(&grammar, b""));
        assert!(matches(&grammar, b"a"));
        assert!(matches(&grammar, b"aaaa"));
        assert!(!matches(&grammar, b"ab"));
    }

    #[test]
    fn repeat_bounds_are_enforced() {
        // root ::= item{2,3}; item ::= "x"
        let grammar = compile(|b| {
            let root = b.add_empty_rule("root");
            let item = b.add_empty_rule("item");
            let x = b.add_byte_string(b"x".to_vec());
            b.update_rule_body(item, x);
            let repeat = b.add_repeat(item, 2, Some(3));
            b.update_rule_body(root, repeat);
            root
        });
        assert!(!matches(&grammar, b"x"));
        assert!(matches(&grammar, b"xx"));
        assert!(matches(&grammar, b"xxx"));
        assert!(!matches(&grammar, b"xxxx"));
    }

    #[test]
    fn character_class_star_walks_utf8() {
        // root ::= [^"]* "\""  — a JSON-ish string body.
        let grammar = compile(|b| {
            let root = b.add_empty_rule("root");
            let content = b.add_character_class_star(vec![(b'"' as u32, b'"' as u32)], true);
            let quote = b.add_byte_string(b"\"".to_vec());
            let seq = b.add_sequence(vec![content, quote]);
            b.update_rule_body(root, seq);
            root
        });
        assert!(matches(&grammar, b"\""));
        assert!(matches(&grammar, b"abc\""));
        assert!(matches(&grammar, "héllo中\"".as_bytes()));
        assert!(!matches(&grammar, b"abc"));
    }

    #[test]
    fn advance_failure_leaves_state_intact() {
        let grammar = compile(|b| {
            let root = b.add_empty_rule("root");
            let ab = b.add_byte_string(b"ab".to_vec());
            b.update_rule_body(root, ab);
            root
        });
        let mut parser = root_parser(&grammar);
        assert!(parser.advance(b'a'));
        let rows_before = parser.num_rows();
        assert!(!parser.advance(b'x'));
        assert_eq!(parser.num_rows(), rows_before);
        assert!(parser.advance(b'b'));
        assert!(parser.is_completed());
    }

    #[test]
    fn pop_last_states_rolls_back() {
        let grammar = compile(|b| {
            let root = b.add_empty_rule("root");
            let abc = b.add_byte_string(b"abc".to_vec());
            b.update_rule_body(root, abc);
            root
        });
        let mut parser = root_parser(&grammar);
        assert!(parser.advance(b'a'));
        assert!(parser.advance(b'b'));
        parser.pop_last_states(1);
        assert!(parser.advance(b'b'));
        assert!(parser.advance(b'c'));
        assert!(parser.is_completed());
    }

    #[test]
    fn lookahead_frame_is_independent() {
        // root ::= "ab"; push a frame for sequence "cd" mid-parse.
        let grammar = compile(|b| {
            let root = b.add_empty_rule("root");
            let helper = b.add_empty_rule("helper");
            let cd = b.add_byte_string(b"cd".to_vec());
            b.update_rule_body(helper, cd);
            let ab = b.add_byte_string(b"ab".to_vec());
            let helper_ref = b.add_rule_ref(helper);
            let seq = b.add_sequence(vec![ab, helper_ref]);
            b.update_rule_body(root, seq);
            root
        });
        let mut parser = root_parser(&grammar);
        assert!(parser.advance(b'a'));

        // Lookahead frame over helper's sequence.
        let Expr::Choices(choices) = grammar.expr(grammar.rule(RuleId(1)).body) else {
            panic!();
        };
        let frame = ParserState::at(None, choices[0], 0, 0);
        parser.push_state_and_expand(frame);
        assert!(!parser.is_completed());
        assert!(parser.advance(b'c'));
        assert!(parser.advance(b'd'));
        assert!(parser.is_completed());
        parser.pop_last_states(3);

        // The original parse resumes untouched.
        assert!(parser.advance(b'b'));
    }
}
