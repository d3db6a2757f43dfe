//! Grammar front-ends: lower user-facing formats into grammar IR.
//!
//! Each front-end produces a [`Grammar`](crate::grammar::Grammar) through
//! the builder; normalization and optimization happen downstream in the
//! compiler.

mod builtin_json;
mod ebnf;
mod json_schema;
mod regex;
mod structural_tag;

pub use builtin_json::builtin_json_grammar;
pub use ebnf::grammar_from_ebnf;
pub use json_schema::{grammar_from_json_schema, JsonSchemaOptions};
pub use regex::grammar_from_regex;
pub use structural_tag::grammar_from_structural_tag;

use crate::grammar::{Expr, ExprId, GrammarBuilder};

/// Lower a quantified expression `inner{min, max}` into IR.
///
/// Character classes star directly; general expressions are lifted into a
/// fresh rule so bounded repetition and self-recursive stars stay
/// rule-shaped, which is what the optimizer's repetition handling expects.
pub(crate) fn quantify(
    builder: &mut GrammarBuilder,
    name_hint: &str,
    inner: ExprId,
    min: u32,
    max: Option<u32>,
) -> ExprId {
    // `e?` — no helper rule needed.
    if min == 0 && max == Some(1) {
        let empty = builder.add_empty_string();
        return builder.add_choices(vec![empty, inner]);
    }

    // `[class]*` — dedicated star node.
    if min == 0 && max.is_none() {
        if let Expr::CharacterClass { negated, ranges } = builder.expr(inner).clone() {
            return builder.add_character_class_star(ranges, negated);
        }
        // R ::= "" | inner R
        let rule = builder.add_rule_with_hint(name_hint, inner);
        let star_name = builder.fresh_rule_name(name_hint);
        let star_rule = builder.add_empty_rule(&star_name);
        let inner_ref = builder.add_rule_ref(rule);
        let star_ref = builder.add_rule_ref(star_rule);
        let seq = builder.add_sequence(vec![inner_ref, star_ref]);
        let empty = builder.add_empty_string();
        let body = builder.add_choices(vec![empty, seq]);
        builder.update_rule_body(star_rule, body);
        return builder.add_rule_ref(star_rule);
    }

    // `e+` — one mandatory copy then a star.
    if min == 1 && max.is_none() {
        let star = quantify(builder, name_hint, inner, 0, None);
        return builder.add_sequence(vec![inner, star]);
    }

    // General bounds via a repetition node over a lifted rule.
    let rule = builder.add_rule_with_hint(name_hint, inner);
    builder.add_repeat(rule, min, max)
}
