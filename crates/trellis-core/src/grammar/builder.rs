//! Builder for constructing grammar IR.

use std::collections::HashMap;

use super::{Expr, ExprId, Grammar, Rule, RuleId, TagDispatch};

/// Constructs a [`Grammar`] incrementally.
///
/// Literal nodes (empty string, byte strings, character classes) are
/// deduplicated by structural equality; composite nodes are appended as-is.
/// Rule names are kept unique: [`GrammarBuilder::add_rule_with_hint`] and
/// [`GrammarBuilder::fresh_rule_name`] derive `name_1`, `name_2`, … from a
/// taken prefix.
#[derive(Debug, Default)]
pub struct GrammarBuilder {
    rules: Vec<Rule>,
    exprs: Vec<Expr>,
    literal_ids: HashMap<Expr, ExprId>,
    rule_name_to_id: HashMap<String, RuleId>,
}

impl GrammarBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the empty-string expression.
    pub fn add_empty_string(&mut self) -> ExprId {
        self.add_expr(Expr::EmptyString)
    }

    /// Add a byte-string expression.
    pub fn add_byte_string(&mut self, bytes: Vec<u8>) -> ExprId {
        self.add_expr(Expr::ByteString(bytes))
    }

    /// Add a character-class expression.
    pub fn add_character_class(&mut self, ranges: Vec<(u32, u32)>, negated: bool) -> ExprId {
        self.add_expr(Expr::CharacterClass { negated, ranges })
    }

    /// Add a starred character-class expression.
    pub fn add_character_class_star(&mut self, ranges: Vec<(u32, u32)>, negated: bool) -> ExprId {
        self.add_expr(Expr::CharacterClassStar { negated, ranges })
    }

    /// Add a rule-reference expression.
    pub fn add_rule_ref(&mut self, rule: RuleId) -> ExprId {
        self.add_expr(Expr::RuleRef(rule))
    }

    /// Add a bounded-repetition expression.
    pub fn add_repeat(&mut self, rule: RuleId, min: u32, max: Option<u32>) -> ExprId {
        self.add_expr(Expr::Repeat { rule, min, max })
    }

    /// Add a sequence expression.
    pub fn add_sequence(&mut self, elements: Vec<ExprId>) -> ExprId {
        self.add_expr(Expr::Sequence(elements))
    }

    /// Add a choices expression.
    pub fn add_choices(&mut self, choices: Vec<ExprId>) -> ExprId {
        self.add_expr(Expr::Choices(choices))
    }

    /// Add a tag-dispatch expression.
    pub fn add_tag_dispatch(&mut self, tag_dispatch: TagDispatch) -> ExprId {
        self.add_expr(Expr::TagDispatch(tag_dispatch))
    }

    /// Copy a leaf expression from another arena.
    ///
    /// Composite nodes carry arena-local child ids and must be rebuilt
    /// explicitly by the caller.
    pub fn add_leaf(&mut self, expr: &Expr) -> ExprId {
        debug_assert!(
            !matches!(
                expr,
                Expr::Sequence(_) | Expr::Choices(_) | Expr::TagDispatch(_)
            ),
            "composite expressions must be rebuilt child-by-child"
        );
        self.add_expr(expr.clone())
    }

    fn add_expr(&mut self, expr: Expr) -> ExprId {
        if expr.is_literal() {
            if let Some(&id) = self.literal_ids.get(&expr) {
                return id;
            }
            let id = ExprId(self.exprs.len() as u32);
            self.literal_ids.insert(expr.clone(), id);
            self.exprs.push(expr);
            return id;
        }
        let id = ExprId(self.exprs.len() as u32);
        self.exprs.push(expr);
        id
    }

    /// Read back an expression added to this builder.
    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.idx()]
    }

    /// Add a rule with no body yet. The name must be unused.
    pub fn add_empty_rule(&mut self, name: &str) -> RuleId {
        debug_assert!(
            !self.rule_name_to_id.contains_key(name),
            "duplicate rule name: {name}"
        );
        let id = RuleId(self.rules.len() as u32);
        self.rules.push(Rule {
            name: name.to_string(),
            body: ExprId(u32::MAX),
            lookahead: None,
            is_exact_lookahead: false,
        });
        self.rule_name_to_id.insert(name.to_string(), id);
        id
    }

    /// Add a rule named after `name_hint` (made unique) with the given body.
    pub fn add_rule_with_hint(&mut self, name_hint: &str, body: ExprId) -> RuleId {
        let name = self.fresh_rule_name(name_hint);
        let id = self.add_empty_rule(&name);
        self.update_rule_body(id, body);
        id
    }

    /// Derive an unused rule name from `prefix`.
    pub fn fresh_rule_name(&self, prefix: &str) -> String {
        if !self.rule_name_to_id.contains_key(prefix) {
            return prefix.to_string();
        }
        let mut i = 1;
        loop {
            let candidate = format!("{prefix}_{i}");
            if !self.rule_name_to_id.contains_key(&candidate) {
                return candidate;
            }
            i += 1;
        }
    }

    /// Look up a rule id by name.
    pub fn rule_id(&self, name: &str) -> Option<RuleId> {
        self.rule_name_to_id.get(name).copied()
    }

    /// Number of rules added so far.
    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    /// Replace a rule's body.
    pub fn update_rule_body(&mut self, rule: RuleId, body: ExprId) {
        self.rules[rule.idx()].body = body;
    }

    /// Replace a rule's lookahead assertion.
    pub fn update_lookahead_assertion(&mut self, rule: RuleId, lookahead: Option<ExprId>) {
        self.rules[rule.idx()].lookahead = lookahead;
    }

    /// Set whether a rule's lookahead is exact.
    pub fn update_lookahead_exact(&mut self, rule: RuleId, is_exact: bool) {
        self.rules[rule.idx()].is_exact_lookahead = is_exact;
    }

    /// Finalize into a grammar rooted at `root`.
    ///
    /// Every rule must have been given a body.
    pub fn build(self, root: RuleId) -> Grammar {
        debug_assert!(
            self.rules.iter().all(|r| r.body.0 != u32::MAX),
            "every rule needs a body before build()"
        );
        let num_rules = self.rules.len();
        Grammar {
            rules: self.rules,
            exprs: self.exprs,
            root_rule: root,
            allow_empty_rule_ids: Vec::new(),
            complete_fsm: None,
            per_rule_fsms: vec![None; num_rules],
            per_rule_fsm_hashes: vec![None; num_rules],
            per_rule_new_state_ids: vec![None; num_rules],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_are_deduplicated() {
        let mut b = GrammarBuilder::new();
        let a = b.add_byte_string(b"abc".to_vec());
        let also_a = b.add_byte_string(b"abc".to_vec());
        assert_eq!(a, also_a);

        let class = b.add_character_class(vec![(48, 57)], false);
        let also_class = b.add_character_class(vec![(48, 57)], false);
        assert_eq!(class, also_class);

        let negated = b.add_character_class(vec![(48, 57)], true);
        assert_ne!(class, negated);
    }

    #[test]
    fn composites_are_not_deduplicated() {
        let mut b = GrammarBuilder::new();
        let a = b.add_byte_string(b"a".to_vec());
        let s1 = b.add_sequence(vec![a]);
        let s2 = b.add_sequence(vec![a]);
        assert_ne!(s1, s2);
    }

    #[test]
    fn fresh_rule_name_skips_taken_names() {
        let mut b = GrammarBuilder::new();
        b.add_empty_rule("rule");
        assert_eq!(b.fresh_rule_name("rule"), "rule_1");
        b.add_empty_rule("rule_1");
        assert_eq!(b.fresh_rule_name("rule"), "rule_2");
        assert_eq!(b.fresh_rule_name("other"), "other");
    }

    #[test]
    fn add_rule_with_hint_builds_named_rule() {
        let mut b = GrammarBuilder::new();
        let body_owner = b.add_empty_rule("root");
        let empty = b.add_empty_string();
        let body = b.add_choices(vec![empty]);
        b.update_rule_body(body_owner, body);

        let hinted = b.add_rule_with_hint("root", body);
        assert_eq!(hinted, RuleId(1));
        let grammar = b.build(body_owner);
        assert_eq!(grammar.rule(hinted).name, "root_1");
    }
}
