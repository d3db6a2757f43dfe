//! End-to-end compilation scenarios.
//!
//! Each test compiles a small grammar against a hand-picked vocabulary and
//! checks the adaptive token mask at specific parser states, plus the
//! cross-cutting properties: the accepted/rejected/uncertain partition,
//! root-mask purity, cache equivalence, and threading determinism.

use trellis_core::compiler::{
    AdaptiveTokenMask, CompiledGrammar, CompilerConfig, GrammarCompiler, MaskStore,
};
use trellis_core::grammar::{Expr, GrammarBuilder, RuleId, TagDispatch};
use trellis_core::parser::ParserState;
use trellis_core::tokenizer::TokenizerInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    Accepted,
    Rejected,
    Uncertain,
}

fn tokenizer(vocab: &[&str]) -> TokenizerInfo {
    TokenizerInfo::from_str_vocab(vocab).unwrap()
}

fn compiler(vocab: &[&str]) -> GrammarCompiler {
    GrammarCompiler::new(tokenizer(vocab), CompilerConfig::default()).unwrap()
}

fn compiler_with(vocab: &[&str], config: CompilerConfig) -> GrammarCompiler {
    GrammarCompiler::new(tokenizer(vocab), config).unwrap()
}

/// The mask key for the root rule's initial state.
fn root_start_state(compiled: &CompiledGrammar) -> ParserState {
    let grammar = compiled.grammar();
    let root = grammar.root_rule_id();
    match grammar.per_rule_fsm(root) {
        Some(fsm) => ParserState::at(
            Some(root),
            grammar.rule(root).body,
            fsm.start() as u32,
            0,
        ),
        None => {
            let Expr::Choices(choices) = grammar.expr(grammar.rule(root).body) else {
                panic!("non-normalized root body");
            };
            ParserState::at(Some(root), choices[0], 0, 0)
        }
    }
}

fn classify(compiled: &CompiledGrammar, mask: &AdaptiveTokenMask, token: &str) -> Class {
    let sorted = compiled.tokenizer_info().sorted_decoded_vocab();
    let idx = sorted
        .iter()
        .position(|(_, bytes)| bytes == token.as_bytes())
        .unwrap_or_else(|| panic!("token {token:?} is not in the vocabulary")) as u32;
    if mask.uncertain_indices.contains(&idx) {
        return Class::Uncertain;
    }
    match mask.store {
        MaskStore::Accepted => {
            if mask.accepted_indices.contains(&idx) {
                Class::Accepted
            } else {
                Class::Rejected
            }
        }
        MaskStore::Rejected => {
            if mask.rejected_indices.contains(&idx) {
                Class::Rejected
            } else {
                Class::Accepted
            }
        }
        MaskStore::AcceptedBitset => {
            let token_id = sorted[idx as usize].0 as usize;
            if mask
                .accepted_bitset
                .as_ref()
                .is_some_and(|bitset| bitset.get(token_id))
            {
                Class::Accepted
            } else {
                Class::Rejected
            }
        }
    }
}

/// Union classification across every mask state: a token is acceptable
/// somewhere, uncertain somewhere, or rejected everywhere.
fn classify_anywhere(compiled: &CompiledGrammar, token: &str) -> Class {
    let mut best = Class::Rejected;
    for mask in compiled.masks().values() {
        match classify(compiled, mask, token) {
            Class::Accepted => return Class::Accepted,
            Class::Uncertain => best = Class::Uncertain,
            Class::Rejected => {}
        }
    }
    best
}

#[test]
fn s1_literal_choice_at_root() {
    let compiler = compiler(&["a", "b", "c", "ab"]);
    let compiled = compiler.compile_ebnf(r#"root ::= "a" | "b""#, "root").unwrap();
    let mask = compiled.token_mask(&root_start_state(&compiled)).unwrap();

    assert_eq!(classify(&compiled, mask, "a"), Class::Accepted);
    assert_eq!(classify(&compiled, mask, "b"), Class::Accepted);
    assert_eq!(classify(&compiled, mask, "c"), Class::Rejected);
    // "ab" over-runs the grammar: the parser completes after "a" but the
    // root rule has no continuation for "b".
    assert_eq!(classify(&compiled, mask, "ab"), Class::Rejected);
    assert!(mask.uncertain_indices.is_empty());
}

#[test]
fn s2_self_recursive_shortcut() {
    let compiler = compiler(&["a", "aa", "aaa", "b"]);
    let compiled = compiler
        .compile_ebnf(r#"root ::= "a" root | """#, "root")
        .unwrap();
    let mask = compiled.token_mask(&root_start_state(&compiled)).unwrap();

    assert_eq!(classify(&compiled, mask, "a"), Class::Accepted);
    assert_eq!(classify(&compiled, mask, "aa"), Class::Accepted);
    assert_eq!(classify(&compiled, mask, "aaa"), Class::Accepted);
    assert_eq!(classify(&compiled, mask, "b"), Class::Rejected);
    assert!(mask.uncertain_indices.is_empty());
}

#[test]
fn s3_json_string_schema() {
    let vocab = &[
        "\"", "x", "hello", " ", "~", "\u{1}", "\u{1f}", "ab", "\\n",
    ];
    let compiler = compiler(vocab);
    let compiled = compiler
        .compile_json_schema(r#"{"type": "string"}"#, Default::default())
        .unwrap();

    // Somewhere inside the string body the closing quote is legal.
    assert_eq!(classify_anywhere(&compiled, "\""), Class::Accepted);
    // Printable ASCII is always writable inside a string.
    assert_eq!(classify_anywhere(&compiled, "x"), Class::Accepted);
    assert_eq!(classify_anywhere(&compiled, "~"), Class::Accepted);
    // A multi-character token spans string elements; it may be accepted or
    // left to runtime verification, but never ruled out.
    assert_ne!(classify_anywhere(&compiled, "hello"), Class::Rejected);
    // Bare control bytes are never legal in a JSON string.
    assert_eq!(classify_anywhere(&compiled, "\u{1}"), Class::Rejected);
    assert_eq!(classify_anywhere(&compiled, "\u{1f}"), Class::Rejected);
}

#[test]
fn s4_regex_digits() {
    let compiler = compiler(&["1", "12", "12a", "a"]);
    let compiled = compiler.compile_regex("[0-9]+").unwrap();
    let mask = compiled.token_mask(&root_start_state(&compiled)).unwrap();

    assert_eq!(classify(&compiled, mask, "1"), Class::Accepted);
    assert_eq!(classify(&compiled, mask, "12"), Class::Accepted);
    assert_eq!(classify(&compiled, mask, "12a"), Class::Rejected);
    assert_eq!(classify(&compiled, mask, "a"), Class::Rejected);
}

#[test]
fn s5_crossing_cache_shares_identical_automata() {
    let vocab = &["x", "xx", "xxx", "y"];
    let g1 = r#"
        root ::= foo
        foo ::= "x"*
    "#;
    let g2 = r#"
        root ::= bar
        bar ::= "x"*
    "#;

    let shared = compiler(vocab);
    let c1 = shared.compile_ebnf(g1, "root").unwrap();
    let c2 = shared.compile_ebnf(g2, "root").unwrap();

    // foo and bar get identical canonical fingerprints.
    let h1 = c1.grammar().fsm_hash(RuleId(1)).unwrap();
    let h2 = c2.grammar().fsm_hash(RuleId(1)).unwrap();
    assert_eq!(h1, h2);

    // The second compilation, served partly from the crossing cache, must
    // agree with a cache-free compilation everywhere.
    let cold = compiler_with(
        vocab,
        CompilerConfig {
            cache_enabled: false,
            ..CompilerConfig::default()
        },
    );
    let c2_cold = cold.compile_ebnf(g2, "root").unwrap();
    for (state, mask) in c2.masks() {
        let cold_mask = c2_cold.token_mask(state).unwrap();
        for token in ["x", "xx", "xxx", "y"] {
            assert_eq!(
                classify(&c2, mask, token),
                classify(&c2_cold, cold_mask, token),
                "divergence at {state:?} for {token:?}"
            );
        }
    }
}

#[test]
fn s6_tag_dispatch_second_byte_slice() {
    let vocab = &["hi", "free text", "<", "<A>", "<B>", "a<", "1", "2"];
    let compiler = compiler(vocab);

    let mut b = GrammarBuilder::new();
    let root = b.add_empty_rule("root");
    let rule_a = b.add_empty_rule("a");
    let rule_b = b.add_empty_rule("b");
    let one = b.add_byte_string(b"1".to_vec());
    b.update_rule_body(rule_a, one);
    let two = b.add_byte_string(b"2".to_vec());
    b.update_rule_body(rule_b, two);
    let dispatch = b.add_tag_dispatch(TagDispatch {
        tag_rule_pairs: vec![(b"<A>".to_vec(), rule_a), (b"<B>".to_vec(), rule_b)],
        stop_eos: true,
        stop_strings: vec![],
        loop_after_dispatch: true,
        excluded_strings: vec![],
    });
    b.update_rule_body(root, dispatch);
    let grammar = b.build(root);

    let compiled = compiler.compile_grammar(&grammar).unwrap();
    let mask = compiled.token_mask(&root_start_state(&compiled)).unwrap();

    // Tokens without any tag occurrence past their first byte are accepted
    // unconditionally (EOS may stop the scan at any point).
    assert_eq!(classify(&compiled, mask, "hi"), Class::Accepted);
    assert_eq!(classify(&compiled, mask, "free text"), Class::Accepted);
    assert_eq!(classify(&compiled, mask, "a<"), Class::Accepted);
    // Tokens walking into or through a tag are legal too: the parser
    // verifies them byte-by-byte.
    assert_eq!(classify(&compiled, mask, "<"), Class::Accepted);
    assert_eq!(classify(&compiled, mask, "<A>"), Class::Accepted);
}

#[test]
fn partition_is_disjoint_and_exhaustive() {
    let compiler = compiler(&["a", "ab", "abc", "b", "ba", "c", "x"]);
    let compiled = compiler
        .compile_ebnf(r#"root ::= "ab" | "ba" | "c""#, "root")
        .unwrap();

    for mask in compiled.masks().values() {
        match mask.store {
            MaskStore::Accepted => {
                for idx in &mask.accepted_indices {
                    assert!(!mask.uncertain_indices.contains(idx));
                }
            }
            MaskStore::Rejected => {
                for idx in &mask.rejected_indices {
                    assert!(!mask.uncertain_indices.contains(idx));
                }
            }
            MaskStore::AcceptedBitset => {
                let sorted = compiled.tokenizer_info().sorted_decoded_vocab();
                let bitset = mask.accepted_bitset.as_ref().unwrap();
                for idx in &mask.uncertain_indices {
                    assert!(!bitset.get(sorted[*idx as usize].0 as usize));
                }
            }
        }
    }
}

#[test]
fn root_masks_have_no_uncertainty() {
    let compiler = compiler(&["{", "}", "\"", "a", ":", ",", "1", " "]);
    let compiled = compiler.compile_builtin_json_grammar().unwrap();
    let grammar = compiled.grammar();
    let root = grammar.root_rule_id();
    for (state, mask) in compiled.masks() {
        if state.rule_id == Some(root) {
            assert!(
                mask.uncertain_indices.is_empty(),
                "root state {state:?} carries uncertain tokens"
            );
        }
    }
}

#[test]
fn cache_equivalence_same_input_twice() {
    let vocab = &["a", "b", "ab", "c"];
    let compiler = compiler(vocab);
    let first = compiler
        .compile_ebnf(r#"root ::= "a" "b" | "c""#, "root")
        .unwrap();
    let second = compiler
        .compile_ebnf(r#"root ::= "a" "b" | "c""#, "root")
        .unwrap();

    assert_eq!(first.masks().len(), second.masks().len());
    for (state, mask) in first.masks() {
        assert_eq!(second.token_mask(state), Some(mask));
    }
}

#[test]
fn cache_disabled_matches_cache_enabled() {
    let vocab = &["0", "1", "01", "10", "a"];
    let warm = compiler(vocab);
    let cold = compiler_with(
        vocab,
        CompilerConfig {
            cache_enabled: false,
            ..CompilerConfig::default()
        },
    );
    let pattern = "[01]+";
    let warm_compiled = warm.compile_regex(pattern).unwrap();
    let cold_compiled = cold.compile_regex(pattern).unwrap();

    assert_eq!(warm_compiled.masks().len(), cold_compiled.masks().len());
    for (state, mask) in warm_compiled.masks() {
        let cold_mask = cold_compiled.token_mask(state).unwrap();
        for token in *vocab {
            assert_eq!(
                classify(&warm_compiled, mask, token),
                classify(&cold_compiled, cold_mask, token)
            );
        }
    }
}

#[test]
fn threading_determinism() {
    let vocab = &["{", "}", "[", "]", "\"", "a", "b", ":", ",", "1", "2", " ", "null"];
    let single = compiler_with(
        vocab,
        CompilerConfig {
            max_threads: 1,
            ..CompilerConfig::default()
        },
    );
    let pooled = compiler_with(
        vocab,
        CompilerConfig {
            max_threads: 4,
            ..CompilerConfig::default()
        },
    );
    let schema = r#"{
        "type": "object",
        "properties": {"a": {"type": "integer"}},
        "required": ["a"],
        "additionalProperties": false
    }"#;
    let s = single.compile_json_schema(schema, Default::default()).unwrap();
    let p = pooled.compile_json_schema(schema, Default::default()).unwrap();

    assert_eq!(s.masks().len(), p.masks().len());
    for (state, mask) in s.masks() {
        let pooled_mask = p.token_mask(state).unwrap();
        for token in *vocab {
            assert_eq!(
                classify(&s, mask, token),
                classify(&p, pooled_mask, token),
                "thread count changed the decision at {state:?} for {token:?}"
            );
        }
    }
}

#[test]
fn empty_vocabulary_compiles_to_empty_masks() {
    let info = TokenizerInfo::new(Vec::new(), Vec::new(), None).unwrap();
    let compiler = GrammarCompiler::new(info, CompilerConfig::default()).unwrap();
    let compiled = compiler.compile_ebnf(r#"root ::= "a""#, "root").unwrap();
    assert!(compiled.masks().is_empty());
}

#[test]
fn invalid_configuration_is_rejected() {
    let info = tokenizer(&["a"]);
    assert!(GrammarCompiler::new(
        info.clone(),
        CompilerConfig {
            max_memory_bytes: -2,
            ..CompilerConfig::default()
        }
    )
    .is_err());
    assert!(GrammarCompiler::new(
        info,
        CompilerConfig {
            max_threads: 0,
            ..CompilerConfig::default()
        }
    )
    .is_err());
}

#[test]
fn lru_bound_holds_after_adds() {
    let vocab = &["a", "b", "c", "d"];
    let compiler = compiler_with(
        vocab,
        CompilerConfig {
            max_memory_bytes: 16 * 1024,
            ..CompilerConfig::default()
        },
    );
    for i in 0..20 {
        let text = format!("root ::= \"a\"{{0,{i}}}");
        let _ = compiler.compile_ebnf(&text, "root").unwrap();
        assert!(compiler.cache_size_bytes() <= compiler.cache_limit_bytes());
    }
}

#[test]
fn structural_tag_end_to_end() {
    let vocab = &["say ", "<", "<fn>", "1", "2", "</fn>", "bye"];
    let compiler = compiler(vocab);
    let compiled = compiler
        .compile_structural_tag(
            r#"{
                "tags": [{"begin": "<fn>", "schema": {"type": "integer"}, "end": "</fn>"}]
            }"#,
        )
        .unwrap();
    let mask = compiled.token_mask(&root_start_state(&compiled)).unwrap();
    assert_eq!(classify(&compiled, mask, "say "), Class::Accepted);
    assert_eq!(classify(&compiled, mask, "bye"), Class::Accepted);
    assert_eq!(classify(&compiled, mask, "<fn>"), Class::Accepted);
}
