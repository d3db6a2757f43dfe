//! Grammar optimization passes.
//!
//! Runs after normalization, in a fixed order: byte-string fusion, rule
//! inlining, dead-rule elimination, lookahead-assertion analysis, empty-rule
//! analysis, repetition normalization, and finally per-rule FSM
//! construction. The output grammar is immutable.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::Result;

use super::{build_fsms, Expr, ExprId, Grammar, GrammarBuilder, RuleId};

/// Run the full optimization pipeline on a normalized grammar.
pub fn optimize(grammar: &Grammar) -> Result<Grammar> {
    let fused = fuse_byte_strings(grammar);
    let inlined = inline_rules(&fused);
    let mut out = eliminate_dead_rules(&inlined);
    analyze_lookaheads(&mut out);
    out.allow_empty_rule_ids = analyze_empty_rules(&out);
    normalize_repetitions(&mut out);
    build_fsms(&mut out)?;
    Ok(out)
}

/// Rebuild a normalized grammar, transforming each choice sequence's
/// elements with `transform_sequence`.
fn rebuild_bodies<F>(grammar: &Grammar, mut transform_sequence: F) -> Grammar
where
    F: FnMut(&Grammar, &mut GrammarBuilder, &[ExprId], &mut Vec<ExprId>),
{
    let mut builder = GrammarBuilder::new();
    for rule in grammar.rules() {
        builder.add_empty_rule(&rule.name);
    }
    for (idx, rule) in grammar.rules().iter().enumerate() {
        let id = RuleId(idx as u32);
        let body = match grammar.expr(rule.body) {
            Expr::TagDispatch(td) => builder.add_tag_dispatch(td.clone()),
            Expr::Choices(choices) => {
                let mut new_choices = Vec::new();
                for &choice in choices {
                    match grammar.expr(choice) {
                        Expr::EmptyString => new_choices.push(builder.add_empty_string()),
                        Expr::Sequence(elements) => {
                            transform_sequence(grammar, &mut builder, elements, &mut new_choices);
                        }
                        other => unreachable!("non-normalized choice: {other:?}"),
                    }
                }
                builder.add_choices(new_choices)
            }
            other => unreachable!("non-normalized rule body: {other:?}"),
        };
        builder.update_rule_body(id, body);
        if let Some(lookahead) = rule.lookahead {
            let Expr::Sequence(elements) = grammar.expr(lookahead) else {
                unreachable!("non-normalized lookahead");
            };
            let new: Vec<ExprId> = elements.iter().map(|&e| builder.add_leaf(grammar.expr(e))).collect();
            let seq = builder.add_sequence(new);
            builder.update_lookahead_assertion(id, Some(seq));
            builder.update_lookahead_exact(id, rule.is_exact_lookahead);
        }
    }
    builder.build(grammar.root_rule_id())
}

/// Pass 1: merge consecutive `ByteString` elements within each sequence.
fn fuse_byte_strings(grammar: &Grammar) -> Grammar {
    rebuild_bodies(grammar, |grammar, builder, elements, out| {
        let mut new_elements: Vec<ExprId> = Vec::new();
        let mut pending: Vec<u8> = Vec::new();
        for &element in elements {
            match grammar.expr(element) {
                Expr::ByteString(bytes) => pending.extend_from_slice(bytes),
                other => {
                    if !pending.is_empty() {
                        new_elements.push(builder.add_byte_string(std::mem::take(&mut pending)));
                    }
                    new_elements.push(builder.add_leaf(other));
                }
            }
        }
        if !pending.is_empty() {
            new_elements.push(builder.add_byte_string(pending));
        }
        out.push(builder.add_sequence(new_elements));
    })
}

/// Pass 2: inline first-position rule references.
///
/// `Ref(r) · rest` expands to one choice per alternative of `r` when `r` is
/// a choices-of-nonempty-sequences body with no rule references inside.
fn inline_rules(grammar: &Grammar) -> Grammar {
    let mut can_inline: HashMap<RuleId, bool> = HashMap::new();
    rebuild_bodies(grammar, move |grammar, builder, elements, out| {
        let first_ref = match grammar.expr(elements[0]) {
            Expr::RuleRef(rule) => Some(*rule),
            _ => None,
        };
        let inlinable = first_ref.is_some_and(|rule| {
            *can_inline
                .entry(rule)
                .or_insert_with(|| rule_is_inlinable(grammar, rule))
        });
        if let (Some(rule), true) = (first_ref, inlinable) {
            let rest: Vec<ExprId> = elements[1..]
                .iter()
                .map(|&e| builder.add_leaf(grammar.expr(e)))
                .collect();
            let Expr::Choices(ref_choices) = grammar.expr(grammar.rule(rule).body) else {
                unreachable!("inlinable rule body must be choices");
            };
            for &ref_choice in ref_choices {
                let Expr::Sequence(ref_elements) = grammar.expr(ref_choice) else {
                    unreachable!("inlinable choices must be sequences");
                };
                let mut fused: Vec<ExprId> = ref_elements
                    .iter()
                    .map(|&e| builder.add_leaf(grammar.expr(e)))
                    .collect();
                fused.extend_from_slice(&rest);
                out.push(builder.add_sequence(fused));
            }
        } else {
            let copied: Vec<ExprId> = elements
                .iter()
                .map(|&e| builder.add_leaf(grammar.expr(e)))
                .collect();
            out.push(builder.add_sequence(copied));
        }
    })
}

fn rule_is_inlinable(grammar: &Grammar, rule: RuleId) -> bool {
    let Expr::Choices(choices) = grammar.expr(grammar.rule(rule).body) else {
        return false;
    };
    if choices.is_empty() {
        return false;
    }
    choices.iter().all(|&choice| match grammar.expr(choice) {
        Expr::Sequence(elements) => elements
            .iter()
            .all(|&e| !matches!(grammar.expr(e), Expr::RuleRef(_))),
        _ => false,
    })
}

/// Pass 3: drop rules unreachable from the root.
fn eliminate_dead_rules(grammar: &Grammar) -> Grammar {
    let mut reachable = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(grammar.root_rule_id());
    while let Some(rule_id) = queue.pop_front() {
        if !reachable.insert(rule_id) {
            continue;
        }
        let rule = grammar.rule(rule_id);
        let mut stack = vec![rule.body];
        if let Some(lookahead) = rule.lookahead {
            stack.push(lookahead);
        }
        while let Some(expr_id) = stack.pop() {
            match grammar.expr(expr_id) {
                Expr::RuleRef(r) | Expr::Repeat { rule: r, .. } => queue.push_back(*r),
                Expr::Sequence(ids) | Expr::Choices(ids) => stack.extend_from_slice(ids),
                Expr::TagDispatch(td) => {
                    queue.extend(td.tag_rule_pairs.iter().map(|&(_, r)| r));
                }
                _ => {}
            }
        }
    }

    let mut kept: Vec<RuleId> = reachable.into_iter().collect();
    kept.sort_unstable();
    let remap: HashMap<RuleId, RuleId> = kept
        .iter()
        .enumerate()
        .map(|(new, &old)| (old, RuleId(new as u32)))
        .collect();

    let mut builder = GrammarBuilder::new();
    for &old in &kept {
        builder.add_empty_rule(&grammar.rule(old).name);
    }
    for &old in &kept {
        let rule = grammar.rule(old);
        let body = copy_normalized_expr(grammar, &mut builder, rule.body, &remap);
        builder.update_rule_body(remap[&old], body);
        if let Some(lookahead) = rule.lookahead {
            let new = copy_normalized_expr(grammar, &mut builder, lookahead, &remap);
            builder.update_lookahead_assertion(remap[&old], Some(new));
            builder.update_lookahead_exact(remap[&old], rule.is_exact_lookahead);
        }
    }
    builder.build(remap[&grammar.root_rule_id()])
}

fn copy_normalized_expr(
    grammar: &Grammar,
    builder: &mut GrammarBuilder,
    id: ExprId,
    remap: &HashMap<RuleId, RuleId>,
) -> ExprId {
    match grammar.expr(id) {
        Expr::RuleRef(rule) => builder.add_rule_ref(remap[rule]),
        Expr::Repeat { rule, min, max } => builder.add_repeat(remap[rule], *min, *max),
        Expr::Sequence(ids) => {
            let new: Vec<ExprId> = ids
                .clone()
                .iter()
                .map(|&e| copy_normalized_expr(grammar, builder, e, remap))
                .collect();
            builder.add_sequence(new)
        }
        Expr::Choices(ids) => {
            let new: Vec<ExprId> = ids
                .clone()
                .iter()
                .map(|&e| copy_normalized_expr(grammar, builder, e, remap))
                .collect();
            builder.add_choices(new)
        }
        Expr::TagDispatch(td) => {
            let mut new_td = td.clone();
            for (_, rule) in &mut new_td.tag_rule_pairs {
                *rule = remap[rule];
            }
            builder.add_tag_dispatch(new_td)
        }
        leaf => builder.add_leaf(leaf),
    }
}

/// Pass 4: classify explicit lookaheads as exact, and detect implicit ones.
///
/// A rule's right context is unique when it is referenced at exactly one
/// non-last sequence position grammar-wide, never as a trailing element of
/// another rule, never from a tag dispatch, and never from itself. The
/// suffix at that unique position is the (exact) lookahead.
fn analyze_lookaheads(grammar: &mut Grammar) {
    if matches!(
        grammar.expr(grammar.root_rule().body),
        Expr::TagDispatch(_)
    ) {
        return;
    }
    for idx in 0..grammar.num_rules() {
        let rule_id = RuleId(idx as u32);
        if rule_id == grammar.root_rule_id() {
            continue;
        }
        let unique_suffix = unique_right_context(grammar, rule_id);
        if grammar.rule(rule_id).lookahead.is_some() {
            grammar.rules[idx].is_exact_lookahead = unique_suffix.is_some();
        } else if let Some(suffix) = unique_suffix {
            let seq = ExprId(grammar.exprs.len() as u32);
            grammar.exprs.push(Expr::Sequence(suffix));
            grammar.rules[idx].lookahead = Some(seq);
            grammar.rules[idx].is_exact_lookahead = true;
        }
    }
}

/// If `target`'s right context is unique, return the element ids following
/// its single non-last occurrence.
fn unique_right_context(grammar: &Grammar, target: RuleId) -> Option<Vec<ExprId>> {
    let mut found: Option<Vec<ExprId>> = None;
    for (idx, rule) in grammar.rules().iter().enumerate() {
        let referrer = RuleId(idx as u32);
        match grammar.expr(rule.body) {
            Expr::TagDispatch(td) => {
                if td.tag_rule_pairs.iter().any(|&(_, r)| r == target) {
                    return None;
                }
            }
            Expr::Choices(choices) => {
                for &choice in choices {
                    let Expr::Sequence(elements) = grammar.expr(choice) else {
                        continue;
                    };
                    for (j, &element) in elements.iter().enumerate() {
                        if !matches!(grammar.expr(element), Expr::RuleRef(r) if *r == target) {
                            continue;
                        }
                        if referrer == target {
                            // Self-reference: the right context recurses.
                            return None;
                        }
                        if j + 1 == elements.len() {
                            // Trailing position: the context continues in
                            // the caller.
                            return None;
                        }
                        if found.is_some() {
                            return None;
                        }
                        found = Some(elements[j + 1..].to_vec());
                    }
                }
            }
            other => unreachable!("non-normalized rule body: {other:?}"),
        }
    }
    found
}

/// Pass 5: fixed-point empty-capability analysis.
fn analyze_empty_rules(grammar: &Grammar) -> Vec<RuleId> {
    let mut empty: HashSet<RuleId> = HashSet::new();

    // Rules that match empty on their own.
    for (idx, rule) in grammar.rules().iter().enumerate() {
        let rule_id = RuleId(idx as u32);
        let Expr::Choices(choices) = grammar.expr(rule.body) else {
            continue;
        };
        let explicit = choices.first().is_some_and(|&first| {
            matches!(grammar.expr(first), Expr::EmptyString)
        });
        let all_star = choices.iter().any(|&choice| match grammar.expr(choice) {
            Expr::Sequence(elements) => elements
                .iter()
                .all(|&e| matches!(grammar.expr(e), Expr::CharacterClassStar { .. })),
            _ => false,
        });
        if explicit || all_star {
            empty.insert(rule_id);
        }
    }

    // Inverted reference graph: referee -> referrers.
    let mut referrers: Vec<Vec<RuleId>> = vec![Vec::new(); grammar.num_rules()];
    for (idx, rule) in grammar.rules().iter().enumerate() {
        let referrer = RuleId(idx as u32);
        let mut stack = vec![rule.body];
        while let Some(expr_id) = stack.pop() {
            match grammar.expr(expr_id) {
                Expr::RuleRef(r) | Expr::Repeat { rule: r, .. } => {
                    referrers[r.idx()].push(referrer);
                }
                Expr::Sequence(ids) | Expr::Choices(ids) => stack.extend_from_slice(ids),
                Expr::TagDispatch(td) => {
                    for &(_, r) in &td.tag_rule_pairs {
                        referrers[r.idx()].push(referrer);
                    }
                }
                _ => {}
            }
        }
    }

    // Propagate: a referrer becomes empty-capable when one of its choices is
    // made entirely of empty-capable pieces.
    let mut queue: VecDeque<RuleId> = empty.iter().copied().collect();
    while let Some(rule_id) = queue.pop_front() {
        for &referrer in &referrers[rule_id.idx()] {
            if empty.contains(&referrer) {
                continue;
            }
            let Expr::Choices(choices) = grammar.expr(grammar.rule(referrer).body) else {
                continue;
            };
            let nullable = choices.iter().any(|&choice| match grammar.expr(choice) {
                Expr::EmptyString => true,
                Expr::Sequence(elements) => elements.iter().all(|&e| match grammar.expr(e) {
                    Expr::CharacterClassStar { .. } => true,
                    Expr::RuleRef(r) => empty.contains(r),
                    Expr::Repeat { rule, min, .. } => *min == 0 || empty.contains(rule),
                    _ => false,
                }),
                _ => false,
            });
            if nullable {
                empty.insert(referrer);
                queue.push_back(referrer);
            }
        }
    }

    let mut out: Vec<RuleId> = empty.into_iter().collect();
    out.sort_unstable();
    out
}

/// Pass 6: repetition normalization.
///
/// Every repeated rule gets an exact lookahead flag, and repetitions over
/// empty-capable rules have their minimum forced to zero.
fn normalize_repetitions(grammar: &mut Grammar) {
    for idx in 0..grammar.exprs.len() {
        let Expr::Repeat { rule, min, .. } = grammar.exprs[idx] else {
            continue;
        };
        grammar.rules[rule.idx()].is_exact_lookahead = true;
        if min != 0 && grammar.allow_empty_rule_ids.binary_search(&rule).is_ok() {
            if let Expr::Repeat { min, .. } = &mut grammar.exprs[idx] {
                *min = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::normalize;

    fn grammar_from(build: impl FnOnce(&mut GrammarBuilder) -> RuleId) -> Grammar {
        let mut builder = GrammarBuilder::new();
        let root = build(&mut builder);
        normalize(&builder.build(root)).unwrap()
    }

    fn first_sequence(grammar: &Grammar, rule: RuleId) -> Vec<ExprId> {
        let Expr::Choices(choices) = grammar.expr(grammar.rule(rule).body) else {
            panic!("body is not choices");
        };
        let Expr::Sequence(elements) = grammar.expr(choices[0]) else {
            panic!("first choice is not a sequence");
        };
        elements.clone()
    }

    #[test]
    fn byte_strings_fuse_within_sequence() {
        let grammar = grammar_from(|b| {
            let root = b.add_empty_rule("root");
            let x = b.add_byte_string(b"ab".to_vec());
            let y = b.add_byte_string(b"cd".to_vec());
            let class = b.add_character_class(vec![(b'0' as u32, b'9' as u32)], false);
            let z = b.add_byte_string(b"e".to_vec());
            let seq = b.add_sequence(vec![x, y, class, z]);
            b.update_rule_body(root, seq);
            root
        });
        let fused = fuse_byte_strings(&grammar);
        let elements = first_sequence(&fused, RuleId(0));
        assert_eq!(elements.len(), 3);
        assert!(matches!(
            fused.expr(elements[0]),
            Expr::ByteString(bytes) if bytes == b"abcd"
        ));
        assert!(matches!(
            fused.expr(elements[2]),
            Expr::ByteString(bytes) if bytes == b"e"
        ));
    }

    #[test]
    fn first_position_rule_ref_inlines() {
        let grammar = grammar_from(|b| {
            let root = b.add_empty_rule("root");
            let sub = b.add_empty_rule("sub");
            let a = b.add_byte_string(b"a".to_vec());
            let c = b.add_byte_string(b"c".to_vec());
            let sub_body = b.add_choices(vec![a, c]);
            b.update_rule_body(sub, sub_body);
            let sub_ref = b.add_rule_ref(sub);
            let tail = b.add_byte_string(b"z".to_vec());
            let seq = b.add_sequence(vec![sub_ref, tail]);
            b.update_rule_body(root, seq);
            root
        });
        let inlined = inline_rules(&grammar);
        let Expr::Choices(choices) = inlined.expr(inlined.rule(RuleId(0)).body) else {
            panic!("body is not choices");
        };
        // One root choice expands into sub's two alternatives.
        assert_eq!(choices.len(), 2);
    }

    #[test]
    fn dead_rules_are_removed_and_ids_remapped() {
        let grammar = grammar_from(|b| {
            let root = b.add_empty_rule("root");
            let dead = b.add_empty_rule("dead");
            let live = b.add_empty_rule("live");
            let x = b.add_byte_string(b"x".to_vec());
            b.update_rule_body(dead, x);
            b.update_rule_body(live, x);
            let live_ref = b.add_rule_ref(live);
            b.update_rule_body(root, live_ref);
            root
        });
        let cleaned = eliminate_dead_rules(&grammar);
        assert_eq!(cleaned.num_rules(), 2);
        assert_eq!(cleaned.rule(RuleId(0)).name, "root");
        assert_eq!(cleaned.rule(RuleId(1)).name, "live");
        let elements = first_sequence(&cleaned, RuleId(0));
        assert!(matches!(
            cleaned.expr(elements[0]),
            Expr::RuleRef(r) if *r == RuleId(1)
        ));
    }

    #[test]
    fn lookahead_detected_for_unique_right_context() {
        // root ::= sub "tail"; sub is used exactly once, non-last.
        let mut grammar = grammar_from(|b| {
            let root = b.add_empty_rule("root");
            let sub = b.add_empty_rule("sub");
            let s = b.add_byte_string(b"s".to_vec());
            b.update_rule_body(sub, s);
            let sub_ref = b.add_rule_ref(sub);
            let tail = b.add_byte_string(b"tail".to_vec());
            let seq = b.add_sequence(vec![sub_ref, tail]);
            b.update_rule_body(root, seq);
            root
        });
        analyze_lookaheads(&mut grammar);
        let sub = grammar.rule(RuleId(1));
        assert!(sub.lookahead.is_some());
        assert!(sub.is_exact_lookahead);
    }

    #[test]
    fn lookahead_not_detected_for_trailing_reference() {
        let mut grammar = grammar_from(|b| {
            let root = b.add_empty_rule("root");
            let sub = b.add_empty_rule("sub");
            let s = b.add_byte_string(b"s".to_vec());
            b.update_rule_body(sub, s);
            let head = b.add_byte_string(b"h".to_vec());
            let sub_ref = b.add_rule_ref(sub);
            let seq = b.add_sequence(vec![head, sub_ref]);
            b.update_rule_body(root, seq);
            root
        });
        analyze_lookaheads(&mut grammar);
        assert!(grammar.rule(RuleId(1)).lookahead.is_none());
    }

    #[test]
    fn empty_rule_analysis_propagates_through_references() {
        // a ::= "" | "x"; b ::= a; c ::= "y"
        let grammar = grammar_from(|b| {
            let root = b.add_empty_rule("root");
            let a = b.add_empty_rule("a");
            let c = b.add_empty_rule("c");
            let empty = b.add_empty_string();
            let x = b.add_byte_string(b"x".to_vec());
            let a_body = b.add_choices(vec![empty, x]);
            b.update_rule_body(a, a_body);
            let y = b.add_byte_string(b"y".to_vec());
            b.update_rule_body(c, y);
            let a_ref = b.add_rule_ref(a);
            let c_ref = b.add_rule_ref(c);
            let root_body = b.add_choices(vec![a_ref, c_ref]);
            b.update_rule_body(root, root_body);
            root
        });
        let empty_ids = analyze_empty_rules(&grammar);
        // "a" is explicitly empty-capable; "root" inherits via a's choice.
        assert!(empty_ids.contains(&RuleId(1)));
        assert!(empty_ids.contains(&RuleId(0)));
        assert!(!empty_ids.contains(&RuleId(2)));
    }

    #[test]
    fn star_only_sequences_are_empty_capable() {
        let grammar = grammar_from(|b| {
            let root = b.add_empty_rule("root");
            let star = b.add_character_class_star(vec![(b'a' as u32, b'z' as u32)], false);
            b.update_rule_body(root, star);
            root
        });
        let empty_ids = analyze_empty_rules(&grammar);
        assert_eq!(empty_ids, vec![RuleId(0)]);
    }

    #[test]
    fn repeat_over_empty_capable_rule_gets_min_zero() {
        let mut grammar = grammar_from(|b| {
            let root = b.add_empty_rule("root");
            let item = b.add_empty_rule("item");
            let empty = b.add_empty_string();
            let x = b.add_byte_string(b"x".to_vec());
            let item_body = b.add_choices(vec![empty, x]);
            b.update_rule_body(item, item_body);
            let repeat = b.add_repeat(item, 2, Some(5));
            b.update_rule_body(root, repeat);
            root
        });
        grammar.allow_empty_rule_ids = analyze_empty_rules(&grammar);
        normalize_repetitions(&mut grammar);
        assert!(grammar.rule(RuleId(1)).is_exact_lookahead);
        let repeat = grammar
            .exprs
            .iter()
            .find_map(|e| match e {
                Expr::Repeat { min, max, .. } => Some((*min, *max)),
                _ => None,
            })
            .unwrap();
        assert_eq!(repeat, (0, Some(5)));
    }
}
