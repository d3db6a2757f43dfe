//! Structural-tag front-end.
//!
//! A structural tag constrains free-form generation only around tagged
//! regions: the model emits arbitrary text until one of the trigger strings
//! occurs, then the matching tag's `begin … schema … end` template takes
//! over, after which scanning resumes (or stops). Lowered to a root
//! `TagDispatch` whose dispatched rules hold the per-tag templates.

use serde::Deserialize;

use crate::error::{Result, TrellisError};
use crate::grammar::{Grammar, GrammarBuilder, TagDispatch};

use super::json_schema::{grammar_from_json_schema, JsonSchemaOptions};
use crate::grammar::copy_sub_grammar;

#[derive(Debug, Deserialize)]
struct StructuralTagDocument {
    /// Dispatch trigger strings; defaults to the tag `begin` strings.
    #[serde(default)]
    triggers: Vec<String>,
    tags: Vec<TagEntry>,
    #[serde(default)]
    stop_strings: Vec<String>,
    #[serde(default = "default_true")]
    stop_eos: bool,
    #[serde(default = "default_true")]
    loop_after_dispatch: bool,
    #[serde(default)]
    excluded_strings: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    begin: String,
    #[serde(default)]
    schema: Option<serde_json::Value>,
    end: String,
}

fn default_true() -> bool {
    true
}

/// Convert a structural-tag JSON document into grammar IR.
pub fn grammar_from_structural_tag(tag_json: &str) -> Result<Grammar> {
    let doc: StructuralTagDocument = serde_json::from_str(tag_json)?;
    if doc.tags.is_empty() {
        return Err(TrellisError::StructuralTagError(
            "a structural tag needs at least one tag".into(),
        ));
    }

    let triggers: Vec<String> = if doc.triggers.is_empty() {
        doc.tags.iter().map(|t| t.begin.clone()).collect()
    } else {
        doc.triggers.clone()
    };

    let mut builder = GrammarBuilder::new();
    let root = builder.add_empty_rule("root");

    // One dispatched rule per trigger, choosing between the tags whose
    // begin string extends it.
    let mut tag_rule_pairs = Vec::with_capacity(triggers.len());
    for (trigger_idx, trigger) in triggers.iter().enumerate() {
        let matching: Vec<&TagEntry> = doc
            .tags
            .iter()
            .filter(|t| t.begin.starts_with(trigger.as_str()))
            .collect();
        if matching.is_empty() {
            return Err(TrellisError::StructuralTagError(format!(
                "trigger \"{trigger}\" matches no tag"
            )));
        }
        let rule_name = builder.fresh_rule_name(&format!("tag_{trigger_idx}"));
        let rule = builder.add_empty_rule(&rule_name);
        let mut choices = Vec::with_capacity(matching.len());
        for tag in matching {
            let mut parts = Vec::new();
            let begin_rest = &tag.begin[trigger.len()..];
            if !begin_rest.is_empty() {
                parts.push(builder.add_byte_string(begin_rest.as_bytes().to_vec()));
            }
            if let Some(schema) = &tag.schema {
                let schema_grammar =
                    grammar_from_json_schema(&schema.to_string(), &JsonSchemaOptions::default())?;
                let schema_root = copy_sub_grammar(&mut builder, &schema_grammar);
                parts.push(builder.add_rule_ref(schema_root));
            }
            if !tag.end.is_empty() {
                parts.push(builder.add_byte_string(tag.end.as_bytes().to_vec()));
            }
            let choice = if parts.is_empty() {
                builder.add_empty_string()
            } else {
                builder.add_sequence(parts)
            };
            choices.push(choice);
        }
        let body = if choices.len() == 1 {
            choices.pop().unwrap()
        } else {
            builder.add_choices(choices)
        };
        builder.update_rule_body(rule, body);
        tag_rule_pairs.push((trigger.as_bytes().to_vec(), rule));
    }

    let dispatch = builder.add_tag_dispatch(TagDispatch {
        tag_rule_pairs,
        stop_eos: doc.stop_eos,
        stop_strings: doc.stop_strings.iter().map(|s| s.as_bytes().to_vec()).collect(),
        loop_after_dispatch: doc.loop_after_dispatch,
        excluded_strings: doc
            .excluded_strings
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect(),
    });
    builder.update_rule_body(root, dispatch);
    Ok(builder.build(root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::Expr;

    #[test]
    fn tags_lower_to_tag_dispatch() {
        let grammar = grammar_from_structural_tag(
            r#"{
                "tags": [
                    {"begin": "<A>", "schema": {"type": "integer"}, "end": "</A>"},
                    {"begin": "<B>", "end": "</B>"}
                ]
            }"#,
        )
        .unwrap();
        let Expr::TagDispatch(td) = grammar.expr(grammar.root_rule().body) else {
            panic!("root must be a tag dispatch");
        };
        assert_eq!(td.tag_rule_pairs.len(), 2);
        assert!(td.stop_eos);
        assert!(td.loop_after_dispatch);
        assert_eq!(td.tag_rule_pairs[0].0, b"<A>".to_vec());
    }

    #[test]
    fn shared_trigger_groups_tags() {
        let grammar = grammar_from_structural_tag(
            r#"{
                "triggers": ["<fn="],
                "tags": [
                    {"begin": "<fn=get>", "schema": {"type": "object"}, "end": "</fn>"},
                    {"begin": "<fn=put>", "schema": {"type": "object"}, "end": "</fn>"}
                ]
            }"#,
        )
        .unwrap();
        let Expr::TagDispatch(td) = grammar.expr(grammar.root_rule().body) else {
            panic!("root must be a tag dispatch");
        };
        assert_eq!(td.tag_rule_pairs.len(), 1);
        // The dispatched rule offers both completions of the trigger.
        let rule = td.tag_rule_pairs[0].1;
        assert!(matches!(
            grammar.expr(grammar.rule(rule).body),
            Expr::Choices(c) if c.len() == 2
        ));
    }

    #[test]
    fn stop_strings_and_flags_deserialize() {
        let grammar = grammar_from_structural_tag(
            r#"{
                "tags": [{"begin": "<t>", "end": "</t>"}],
                "stop_strings": ["<end>"],
                "stop_eos": false,
                "loop_after_dispatch": false
            }"#,
        )
        .unwrap();
        let Expr::TagDispatch(td) = grammar.expr(grammar.root_rule().body) else {
            panic!("root must be a tag dispatch");
        };
        assert!(!td.stop_eos);
        assert!(!td.loop_after_dispatch);
        assert_eq!(td.stop_strings, vec![b"<end>".to_vec()]);
    }

    #[test]
    fn unmatched_trigger_is_an_error() {
        let result = grammar_from_structural_tag(
            r#"{"triggers": ["<x>"], "tags": [{"begin": "<y>", "end": "</y>"}]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn empty_tags_are_an_error() {
        assert!(grammar_from_structural_tag(r#"{"tags": []}"#).is_err());
    }
}
