//! Benchmarks for grammar compilation.
//!
//! Compilation is the one-time cost paid before constrained sampling; the
//! interesting metrics are schema-to-mask compile time across grammar
//! complexity, vocabulary size scaling, and the warm-cache hit path.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use trellis_core::compiler::{CompilerConfig, GrammarCompiler};
use trellis_core::frontend::JsonSchemaOptions;
use trellis_core::tokenizer::TokenizerInfo;

/// Sample JSON schemas for benchmarking.
mod schemas {
    pub const SIMPLE_STRING: &str = r#"{"type": "string"}"#;

    pub const PERSON: &str = r#"{
        "type": "object",
        "properties": {
            "name": {"type": "string"},
            "age": {"type": "integer"}
        },
        "required": ["name", "age"],
        "additionalProperties": false
    }"#;

    pub const NESTED_OBJECT: &str = r#"{
        "type": "object",
        "properties": {
            "user": {
                "type": "object",
                "properties": {
                    "id": {"type": "integer"},
                    "profile": {
                        "type": "object",
                        "properties": {
                            "name": {"type": "string"},
                            "theme": {"enum": ["light", "dark"]}
                        },
                        "required": ["name"],
                        "additionalProperties": false
                    }
                },
                "required": ["id"],
                "additionalProperties": false
            }
        },
        "required": ["user"],
        "additionalProperties": false
    }"#;
}

/// Sample regex patterns.
mod patterns {
    pub const SIMPLE_WORD: &str = r"[a-z]+";
    pub const UUID: &str = r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}";
    pub const ISO_DATE: &str = r"[0-9]{4}-[0-9]{2}-[0-9]{2}";
}

/// A synthetic vocabulary of `size` distinct tokens with realistic shapes:
/// punctuation, digits, short words, and space-prefixed words.
fn synthetic_vocab(size: usize) -> TokenizerInfo {
    let mut vocab = Vec::with_capacity(size);
    for b in b'!'..=b'~' {
        vocab.push((b as char).to_string());
    }
    let mut i = 0usize;
    while vocab.len() < size {
        let word = format!("w{i:x}");
        vocab.push(word.clone());
        if vocab.len() < size {
            vocab.push(format!(" {word}"));
        }
        i += 1;
    }
    vocab.truncate(size);
    TokenizerInfo::from_str_vocab(&vocab).unwrap()
}

fn bench_schema_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("schema_compile");
    group.sample_size(20);

    for (name, schema) in [
        ("simple", schemas::SIMPLE_STRING),
        ("person", schemas::PERSON),
        ("nested", schemas::NESTED_OBJECT),
    ] {
        let tokenizer = synthetic_vocab(2000);
        group.bench_with_input(BenchmarkId::new("vocab_2k", name), &schema, |b, schema| {
            b.iter(|| {
                // A fresh compiler per iteration keeps the cache cold.
                let compiler = GrammarCompiler::new(
                    tokenizer.clone(),
                    CompilerConfig {
                        max_threads: 1,
                        cache_enabled: false,
                        max_memory_bytes: -1,
                    },
                )
                .unwrap();
                let compiled = compiler
                    .compile_json_schema(black_box(schema), JsonSchemaOptions::default())
                    .unwrap();
                black_box(compiled)
            })
        });
    }
    group.finish();
}

fn bench_regex_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("regex_compile");
    group.sample_size(20);

    for (name, pattern) in [
        ("word", patterns::SIMPLE_WORD),
        ("uuid", patterns::UUID),
        ("date", patterns::ISO_DATE),
    ] {
        let tokenizer = synthetic_vocab(2000);
        group.bench_with_input(BenchmarkId::new("vocab_2k", name), &pattern, |b, pattern| {
            b.iter(|| {
                let compiler = GrammarCompiler::new(
                    tokenizer.clone(),
                    CompilerConfig {
                        max_threads: 1,
                        cache_enabled: false,
                        max_memory_bytes: -1,
                    },
                )
                .unwrap();
                black_box(compiler.compile_regex(black_box(pattern)).unwrap())
            })
        });
    }
    group.finish();
}

fn bench_vocab_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("vocab_scaling");
    group.sample_size(10);

    for vocab_size in [500usize, 2000, 8000] {
        let tokenizer = synthetic_vocab(vocab_size);
        group.bench_with_input(
            BenchmarkId::new("person_schema", vocab_size),
            &vocab_size,
            |b, _| {
                b.iter(|| {
                    let compiler = GrammarCompiler::new(
                        tokenizer.clone(),
                        CompilerConfig {
                            max_threads: 1,
                            cache_enabled: false,
                            max_memory_bytes: -1,
                        },
                    )
                    .unwrap();
                    black_box(
                        compiler
                            .compile_json_schema(schemas::PERSON, JsonSchemaOptions::default())
                            .unwrap(),
                    )
                })
            },
        );
    }
    group.finish();
}

fn bench_cache_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_hit");

    let tokenizer = synthetic_vocab(2000);
    let compiler = GrammarCompiler::new(tokenizer, CompilerConfig::default()).unwrap();
    // Warm the cache.
    let _ = compiler
        .compile_json_schema(schemas::PERSON, JsonSchemaOptions::default())
        .unwrap();

    group.bench_function("person_schema_warm", |b| {
        b.iter(|| {
            black_box(
                compiler
                    .compile_json_schema(schemas::PERSON, JsonSchemaOptions::default())
                    .unwrap(),
            )
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_schema_compile,
    bench_regex_compile,
    bench_vocab_scaling,
    bench_cache_hit,
);

criterion_main!(benches);
