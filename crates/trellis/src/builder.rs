//! High-level compiler handle.

use anyhow::Result;
use trellis_core::compiler::{CompiledGrammar, CompilerConfig, GrammarCompiler};
use trellis_core::frontend::JsonSchemaOptions;
use trellis_core::grammar::Grammar;
use trellis_core::tokenizer::TokenizerInfo;

/// Builder for creating a [`Compiler`].
pub struct CompilerBuilder {
    tokenizer_info: Option<TokenizerInfo>,
    config: CompilerConfig,
}

impl CompilerBuilder {
    /// Create a new compiler builder.
    pub fn new() -> Self {
        Self {
            tokenizer_info: None,
            config: CompilerConfig::default(),
        }
    }

    /// Set the tokenizer vocabulary to compile against.
    pub fn tokenizer_info(mut self, info: TokenizerInfo) -> Self {
        self.tokenizer_info = Some(info);
        self
    }

    /// Set the worker-thread count for mask compilation.
    pub fn max_threads(mut self, threads: usize) -> Self {
        self.config.max_threads = threads;
        self
    }

    /// Enable or disable the compiled-grammar and crossing caches.
    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.config.cache_enabled = enabled;
        self
    }

    /// Bound the caches to `bytes` (-1 for unlimited).
    pub fn max_memory_bytes(mut self, bytes: i64) -> Self {
        self.config.max_memory_bytes = bytes;
        self
    }

    /// Build the compiler.
    pub fn build(self) -> Result<Compiler> {
        let tokenizer_info = self
            .tokenizer_info
            .ok_or_else(|| anyhow::anyhow!("a tokenizer vocabulary is required"))?;
        let inner = GrammarCompiler::new(tokenizer_info, self.config)?;
        Ok(Compiler { inner })
    }
}

impl Default for CompilerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// High-level grammar compiler bound to one vocabulary.
pub struct Compiler {
    inner: GrammarCompiler,
}

impl Compiler {
    /// Start building a compiler.
    pub fn builder() -> CompilerBuilder {
        CompilerBuilder::new()
    }

    /// Compile a JSON Schema with default options.
    pub fn compile_json_schema(&self, schema: &str) -> Result<CompiledGrammar> {
        Ok(self
            .inner
            .compile_json_schema(schema, JsonSchemaOptions::default())?)
    }

    /// Compile a JSON Schema with explicit options.
    pub fn compile_json_schema_with_options(
        &self,
        schema: &str,
        options: JsonSchemaOptions,
    ) -> Result<CompiledGrammar> {
        Ok(self.inner.compile_json_schema(schema, options)?)
    }

    /// Compile EBNF text rooted at `root_rule_name`.
    pub fn compile_ebnf(&self, text: &str, root_rule_name: &str) -> Result<CompiledGrammar> {
        Ok(self.inner.compile_ebnf(text, root_rule_name)?)
    }

    /// Compile a regular expression.
    pub fn compile_regex(&self, pattern: &str) -> Result<CompiledGrammar> {
        Ok(self.inner.compile_regex(pattern)?)
    }

    /// Compile a structural-tag document.
    pub fn compile_structural_tag(&self, tag_json: &str) -> Result<CompiledGrammar> {
        Ok(self.inner.compile_structural_tag(tag_json)?)
    }

    /// Compile the built-in JSON grammar.
    pub fn compile_builtin_json(&self) -> Result<CompiledGrammar> {
        Ok(self.inner.compile_builtin_json_grammar()?)
    }

    /// Compile a pre-built grammar IR.
    pub fn compile_grammar(&self, grammar: &Grammar) -> Result<CompiledGrammar> {
        Ok(self.inner.compile_grammar(grammar)?)
    }

    /// Drop both caches.
    pub fn clear_cache(&self) {
        self.inner.clear_cache();
    }

    /// Current total cache size in bytes.
    pub fn cache_size_bytes(&self) -> i64 {
        self.inner.cache_size_bytes()
    }

    /// Configured cache limit in bytes (-1 when unlimited).
    pub fn cache_limit_bytes(&self) -> i64 {
        self.inner.cache_limit_bytes()
    }

    /// Access the underlying core compiler.
    pub fn core(&self) -> &GrammarCompiler {
        &self.inner
    }
}
