//! The grammar compiler: public compile API, configuration, and the
//! compiled-grammar artifact.
//!
//! [`GrammarCompiler`] is bound to one tokenizer vocabulary. Each
//! `compile_*` entry point converts its input to grammar IR through the
//! front-ends, lowers it through the normalizer and optimizer, and runs the
//! adaptive token-mask compiler over every scannable parser state. Results
//! are cached in an outer LRU keyed by the input, and per-automaton mask
//! work is shared across grammars through the crossing cache.

mod compile_cache;
mod crossing_cache;
mod mask;
mod matcher;

pub use crossing_cache::{CrossingCache, CrossingKey};
pub use mask::{AdaptiveTokenMask, MaskStore, USE_BITSET_THRESHOLD};

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, TrellisError};
use crate::frontend::{self, JsonSchemaOptions};
use crate::grammar::{hash_fsms, normalize, optimize, Grammar};
use crate::parser::ParserState;
use crate::tokenizer::TokenizerInfo;

use compile_cache::ThreadSafeLruCache;

/// Compiler configuration.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Worker threads for mask compilation. With 1, no pool or lock is
    /// touched at all.
    pub max_threads: usize,
    /// Whether compiled grammars and crossing-cache entries are retained.
    pub cache_enabled: bool,
    /// Cache budget in bytes; -1 means unlimited. Split 1/3 for the
    /// crossing cache and 2/3 for the compiled-grammar cache.
    pub max_memory_bytes: i64,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            max_threads: 8,
            cache_enabled: true,
            max_memory_bytes: -1,
        }
    }
}

/// The five cacheable input kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GrammarInput {
    /// The built-in whitespace-tolerant JSON grammar.
    BuiltinJson,
    /// A JSON Schema plus its conversion options.
    JsonSchema {
        /// Schema text.
        schema: String,
        /// Conversion options.
        options: JsonSchemaOptions,
    },
    /// A structural-tag JSON document.
    StructuralTag {
        /// The tag document.
        tag_json: String,
    },
    /// EBNF text with a designated root rule.
    Ebnf {
        /// Grammar text.
        text: String,
        /// Name of the root rule.
        root_rule_name: String,
    },
    /// A regular expression.
    Regex {
        /// The pattern.
        pattern: String,
    },
}

struct CompiledGrammarData {
    grammar: Grammar,
    tokenizer_info: TokenizerInfo,
    masks: HashMap<ParserState, AdaptiveTokenMask>,
}

/// An immutable compiled grammar: the optimized IR, the vocabulary it was
/// compiled against, and the per-state adaptive token masks.
#[derive(Clone)]
pub struct CompiledGrammar {
    data: Arc<CompiledGrammarData>,
}

impl CompiledGrammar {
    fn new(
        grammar: Grammar,
        tokenizer_info: TokenizerInfo,
        masks: HashMap<ParserState, AdaptiveTokenMask>,
    ) -> Self {
        Self {
            data: Arc::new(CompiledGrammarData {
                grammar,
                tokenizer_info,
                masks,
            }),
        }
    }

    /// The optimized grammar.
    pub fn grammar(&self) -> &Grammar {
        &self.data.grammar
    }

    /// The vocabulary this grammar was compiled against.
    pub fn tokenizer_info(&self) -> &TokenizerInfo {
        &self.data.tokenizer_info
    }

    /// The mask for one scannable parser state.
    pub fn token_mask(&self, state: &ParserState) -> Option<&AdaptiveTokenMask> {
        self.data.masks.get(state)
    }

    /// All per-state masks.
    pub fn masks(&self) -> &HashMap<ParserState, AdaptiveTokenMask> {
        &self.data.masks
    }

    /// Estimated memory footprint, used for cache accounting.
    pub fn memory_bytes(&self) -> usize {
        self.data.grammar.memory_bytes()
            + self
                .data
                .masks
                .values()
                .map(|m| m.memory_bytes() + std::mem::size_of::<ParserState>())
                .sum::<usize>()
    }
}

/// Compiles grammars into per-state adaptive token masks for one
/// vocabulary.
pub struct GrammarCompiler {
    tokenizer_info: TokenizerInfo,
    config: CompilerConfig,
    crossing_cache: CrossingCache,
    compile_cache: ThreadSafeLruCache<GrammarInput, CompiledGrammar>,
}

impl GrammarCompiler {
    /// Create a compiler.
    ///
    /// Fails with [`TrellisError::InvalidConfiguration`] when `max_threads`
    /// is zero or `max_memory_bytes` is below -1.
    pub fn new(tokenizer_info: TokenizerInfo, config: CompilerConfig) -> Result<Self> {
        if config.max_threads == 0 {
            return Err(TrellisError::InvalidConfiguration(
                "max_threads must be at least 1".into(),
            ));
        }
        if config.max_memory_bytes < -1 {
            return Err(TrellisError::InvalidConfiguration(format!(
                "max_memory_bytes must be -1 (unlimited) or non-negative, got {}",
                config.max_memory_bytes
            )));
        }

        let (crossing_capacity, compile_capacity) = if !config.cache_enabled {
            (0, 0)
        } else if config.max_memory_bytes == -1 {
            (usize::MAX, usize::MAX)
        } else {
            let bytes = config.max_memory_bytes as usize;
            (bytes / 3, bytes / 3 * 2)
        };

        Ok(Self {
            tokenizer_info,
            config,
            crossing_cache: CrossingCache::new(crossing_capacity),
            compile_cache: ThreadSafeLruCache::new(compile_capacity),
        })
    }

    /// The vocabulary this compiler is bound to.
    pub fn tokenizer_info(&self) -> &TokenizerInfo {
        &self.tokenizer_info
    }

    /// Compile a pre-built grammar IR.
    pub fn compile_grammar(&self, grammar: &Grammar) -> Result<CompiledGrammar> {
        if !self.config.cache_enabled {
            return self.compile_ir(grammar);
        }
        let key = GrammarInput::Ebnf {
            text: grammar.to_string(),
            root_rule_name: grammar.root_rule().name.clone(),
        };
        self.compile_cache.get_or_compute(key, || {
            let compiled = self.compile_ir(grammar)?;
            let size = compiled.memory_bytes();
            Ok((compiled, size))
        })
    }

    /// Compile EBNF text rooted at `root_rule_name`.
    pub fn compile_ebnf(&self, text: &str, root_rule_name: &str) -> Result<CompiledGrammar> {
        self.compile_input(GrammarInput::Ebnf {
            text: text.to_string(),
            root_rule_name: root_rule_name.to_string(),
        })
    }

    /// Compile a regular expression.
    pub fn compile_regex(&self, pattern: &str) -> Result<CompiledGrammar> {
        self.compile_input(GrammarInput::Regex {
            pattern: pattern.to_string(),
        })
    }

    /// Compile a JSON Schema.
    pub fn compile_json_schema(
        &self,
        schema: &str,
        options: JsonSchemaOptions,
    ) -> Result<CompiledGrammar> {
        self.compile_input(GrammarInput::JsonSchema {
            schema: schema.to_string(),
            options,
        })
    }

    /// Compile a structural-tag document.
    pub fn compile_structural_tag(&self, tag_json: &str) -> Result<CompiledGrammar> {
        self.compile_input(GrammarInput::StructuralTag {
            tag_json: tag_json.to_string(),
        })
    }

    /// Compile the built-in JSON grammar.
    pub fn compile_builtin_json_grammar(&self) -> Result<CompiledGrammar> {
        self.compile_input(GrammarInput::BuiltinJson)
    }

    /// Drop both caches.
    pub fn clear_cache(&self) {
        self.compile_cache.clear();
        self.crossing_cache.clear();
    }

    /// Current total cache size in bytes.
    pub fn cache_size_bytes(&self) -> i64 {
        (self.compile_cache.size_bytes() + self.crossing_cache.size_bytes()) as i64
    }

    /// Configured cache limit in bytes, -1 when unlimited.
    pub fn cache_limit_bytes(&self) -> i64 {
        if self.compile_cache.capacity_bytes() == usize::MAX {
            return -1;
        }
        (self.compile_cache.capacity_bytes() + self.crossing_cache.capacity_bytes()) as i64
    }

    fn compile_input(&self, input: GrammarInput) -> Result<CompiledGrammar> {
        if !self.config.cache_enabled {
            return self.compute(&input);
        }
        self.compile_cache.get_or_compute(input.clone(), || {
            let compiled = self.compute(&input)?;
            let size = compiled.memory_bytes();
            Ok((compiled, size))
        })
    }

    fn compute(&self, input: &GrammarInput) -> Result<CompiledGrammar> {
        let grammar = match input {
            GrammarInput::BuiltinJson => frontend::builtin_json_grammar(),
            GrammarInput::JsonSchema { schema, options } => {
                frontend::grammar_from_json_schema(schema, options)?
            }
            GrammarInput::StructuralTag { tag_json } => {
                frontend::grammar_from_structural_tag(tag_json)?
            }
            GrammarInput::Ebnf {
                text,
                root_rule_name,
            } => frontend::grammar_from_ebnf(text, root_rule_name)?,
            GrammarInput::Regex { pattern } => frontend::grammar_from_regex(pattern)?,
        };
        self.compile_ir(&grammar)
    }

    /// The uncached compilation pipeline.
    fn compile_ir(&self, grammar: &Grammar) -> Result<CompiledGrammar> {
        let normalized = normalize(grammar)?;
        let mut optimized = optimize(&normalized)?;

        if self.tokenizer_info.vocab_size() == 0 {
            debug!("empty vocabulary, emitting empty mask map");
            return Ok(CompiledGrammar::new(
                optimized,
                self.tokenizer_info.clone(),
                HashMap::new(),
            ));
        }

        if self.crossing_cache.is_enabled() {
            hash_fsms(&mut optimized);
        }

        let masks = matcher::compile_masks(
            &optimized,
            &self.tokenizer_info,
            self.config.max_threads,
            &self.crossing_cache,
        );
        debug!(masks = masks.len(), "grammar compiled");
        Ok(CompiledGrammar::new(
            optimized,
            self.tokenizer_info.clone(),
            masks,
        ))
    }
}
