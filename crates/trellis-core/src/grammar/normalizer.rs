//! Grammar normalization.
//!
//! Two passes lower front-end output to the canonical shape the optimizer
//! and the mask compiler rely on:
//!
//! 1. Single-element elimination: `Choices(x)` and `Sequence(x)` collapse to
//!    `x`; a one-codepoint positive character class becomes its UTF-8 byte
//!    string.
//! 2. Structure normalization: every rule body becomes
//!    `Choices(Sequence(leaf*)*)` with at most one leading `EmptyString`, or
//!    a `TagDispatch`. Nested choices are flattened or lifted to fresh
//!    rules; nested tag dispatches are always lifted. Lookahead assertions
//!    become flat sequences.

use crate::error::{Result, TrellisError};

use super::{Expr, ExprId, Grammar, GrammarBuilder, RuleId};

/// Normalize a grammar into canonical rule-body shape.
pub fn normalize(grammar: &Grammar) -> Result<Grammar> {
    let simplified = eliminate_single_elements(grammar);
    normalize_structure(&simplified)
}

fn utf8_bytes(cp: u32) -> Option<Vec<u8>> {
    let c = char::from_u32(cp)?;
    let mut buf = [0u8; 4];
    Some(c.encode_utf8(&mut buf).as_bytes().to_vec())
}

/// Pass 1: collapse single-element composites and one-codepoint classes.
fn eliminate_single_elements(grammar: &Grammar) -> Grammar {
    let mut builder = GrammarBuilder::new();
    for rule in grammar.rules() {
        builder.add_empty_rule(&rule.name);
    }
    for (idx, rule) in grammar.rules().iter().enumerate() {
        let body = visit_simplify(grammar, &mut builder, rule.body);
        builder.update_rule_body(RuleId(idx as u32), body);
        if let Some(lookahead) = rule.lookahead {
            let new = visit_simplify(grammar, &mut builder, lookahead);
            builder.update_lookahead_assertion(RuleId(idx as u32), Some(new));
            builder.update_lookahead_exact(RuleId(idx as u32), rule.is_exact_lookahead);
        }
    }
    builder.build(grammar.root_rule_id())
}

fn visit_simplify(grammar: &Grammar, builder: &mut GrammarBuilder, id: ExprId) -> ExprId {
    match grammar.expr(id) {
        Expr::Sequence(elements) => {
            let new: Vec<ExprId> = elements
                .clone()
                .iter()
                .map(|&e| visit_simplify(grammar, builder, e))
                .collect();
            if new.len() == 1 {
                new[0]
            } else {
                builder.add_sequence(new)
            }
        }
        Expr::Choices(choices) => {
            let new: Vec<ExprId> = choices
                .clone()
                .iter()
                .map(|&e| visit_simplify(grammar, builder, e))
                .collect();
            if new.len() == 1 {
                new[0]
            } else {
                builder.add_choices(new)
            }
        }
        Expr::CharacterClass { negated, ranges } if !negated && ranges.len() == 1 => {
            let (lo, hi) = ranges[0];
            if lo == hi {
                if let Some(bytes) = utf8_bytes(lo) {
                    return builder.add_byte_string(bytes);
                }
            }
            builder.add_character_class(ranges.clone(), false)
        }
        Expr::TagDispatch(td) => builder.add_tag_dispatch(td.clone()),
        leaf => builder.add_leaf(leaf),
    }
}

/// Pass 2: flatten into `Choices(Sequence(leaf*)*)` / `TagDispatch` shape.
fn normalize_structure(grammar: &Grammar) -> Result<Grammar> {
    let mut ctx = Normalizer {
        grammar,
        builder: GrammarBuilder::new(),
        cur_rule_name: String::new(),
    };
    for rule in grammar.rules() {
        ctx.builder.add_empty_rule(&rule.name);
    }
    for (idx, rule) in grammar.rules().iter().enumerate() {
        ctx.cur_rule_name = rule.name.clone();
        let body = ctx.visit_rule_body(rule.body)?;
        ctx.builder.update_rule_body(RuleId(idx as u32), body);
        if let Some(lookahead) = rule.lookahead {
            let new = ctx.visit_lookahead(lookahead)?;
            ctx.builder
                .update_lookahead_assertion(RuleId(idx as u32), Some(new));
            ctx.builder
                .update_lookahead_exact(RuleId(idx as u32), rule.is_exact_lookahead);
        }
    }
    Ok(ctx.builder.build(grammar.root_rule_id()))
}

struct Normalizer<'a> {
    grammar: &'a Grammar,
    builder: GrammarBuilder,
    cur_rule_name: String,
}

impl Normalizer<'_> {
    fn visit_rule_body(&mut self, id: ExprId) -> Result<ExprId> {
        match self.grammar.expr(id) {
            Expr::Sequence(_) => {
                let elements = self.visit_sequence(id)?;
                let seq = self.builder.add_sequence(elements);
                Ok(self.builder.add_choices(vec![seq]))
            }
            Expr::Choices(_) => {
                let choices = self.visit_choices(id)?;
                Ok(self.builder.add_choices(choices))
            }
            Expr::EmptyString => {
                let empty = self.builder.add_empty_string();
                Ok(self.builder.add_choices(vec![empty]))
            }
            Expr::TagDispatch(td) => Ok(self.builder.add_tag_dispatch(td.clone())),
            leaf => {
                let element = self.builder.add_leaf(leaf);
                let seq = self.builder.add_sequence(vec![element]);
                Ok(self.builder.add_choices(vec![seq]))
            }
        }
    }

    fn visit_lookahead(&mut self, id: ExprId) -> Result<ExprId> {
        match self.grammar.expr(id) {
            Expr::Sequence(_) => {
                let elements = self.visit_sequence(id)?;
                Ok(self.builder.add_sequence(elements))
            }
            Expr::Choices(_) => Err(TrellisError::InvalidGrammar(
                "choices are not supported in lookahead assertions".into(),
            )),
            Expr::EmptyString => Err(TrellisError::InvalidGrammar(
                "empty string is not allowed in lookahead assertions".into(),
            )),
            Expr::TagDispatch(_) => Err(TrellisError::InvalidGrammar(
                "tag dispatch is not allowed in lookahead assertions".into(),
            )),
            leaf => {
                let element = self.builder.add_leaf(leaf);
                Ok(self.builder.add_sequence(vec![element]))
            }
        }
    }

    /// Flatten a choices node. The result is a list of sequence ids in the
    /// new arena; a leading `EmptyString` is prepended iff any branch was
    /// nullable.
    fn visit_choices(&mut self, id: ExprId) -> Result<Vec<ExprId>> {
        let Expr::Choices(choices) = self.grammar.expr(id) else {
            unreachable!("visit_choices on non-choices expression");
        };
        let mut new_choices = Vec::new();
        let mut found_empty = false;
        for &choice in &choices.clone() {
            match self.grammar.expr(choice) {
                Expr::Sequence(_) => {
                    let elements = self.visit_sequence(choice)?;
                    if elements.is_empty() {
                        found_empty = true;
                    } else {
                        new_choices.push(self.builder.add_sequence(elements));
                    }
                }
                Expr::Choices(_) => {
                    let sub = self.visit_choices(choice)?;
                    let starts_empty = sub
                        .first()
                        .is_some_and(|&c| matches!(self.builder.expr(c), Expr::EmptyString));
                    if starts_empty {
                        found_empty = true;
                        new_choices.extend_from_slice(&sub[1..]);
                    } else {
                        new_choices.extend_from_slice(&sub);
                    }
                }
                Expr::EmptyString => found_empty = true,
                Expr::TagDispatch(td) => {
                    let td_expr = self.builder.add_tag_dispatch(td.clone());
                    let rule = self
                        .builder
                        .add_rule_with_hint(&self.cur_rule_name.clone(), td_expr);
                    let rule_ref = self.builder.add_rule_ref(rule);
                    new_choices.push(self.builder.add_sequence(vec![rule_ref]));
                }
                leaf => {
                    let element = self.builder.add_leaf(leaf);
                    new_choices.push(self.builder.add_sequence(vec![element]));
                }
            }
        }
        if found_empty {
            let empty = self.builder.add_empty_string();
            new_choices.insert(0, empty);
        }
        Ok(new_choices)
    }

    /// Flatten a sequence node into a list of leaf element ids in the new
    /// arena.
    fn visit_sequence(&mut self, id: ExprId) -> Result<Vec<ExprId>> {
        let Expr::Sequence(elements) = self.grammar.expr(id) else {
            unreachable!("visit_sequence on non-sequence expression");
        };
        let mut new_elements = Vec::new();
        for &element in &elements.clone() {
            match self.grammar.expr(element) {
                Expr::Sequence(_) => {
                    new_elements.extend(self.visit_sequence(element)?);
                }
                Expr::Choices(_) => {
                    let sub = self.visit_choices(element)?;
                    if sub.len() == 1 {
                        // A single non-nullable branch splices in place.
                        match self.builder.expr(sub[0]).clone() {
                            Expr::Sequence(inner) => new_elements.extend(inner),
                            Expr::EmptyString => {}
                            _ => unreachable!("choices branches are sequences"),
                        }
                    } else {
                        let choices = self.builder.add_choices(sub);
                        let rule = self
                            .builder
                            .add_rule_with_hint(&self.cur_rule_name.clone(), choices);
                        new_elements.push(self.builder.add_rule_ref(rule));
                    }
                }
                Expr::EmptyString => {}
                Expr::TagDispatch(td) => {
                    let td_expr = self.builder.add_tag_dispatch(td.clone());
                    let rule = self
                        .builder
                        .add_rule_with_hint(&self.cur_rule_name.clone(), td_expr);
                    new_elements.push(self.builder.add_rule_ref(rule));
                }
                leaf => {
                    new_elements.push(self.builder.add_leaf(leaf));
                }
            }
        }
        Ok(new_elements)
    }
}
