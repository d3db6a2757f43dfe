//! Error types for Trellis Core.

use thiserror::Error;

/// Result type alias for Trellis operations.
pub type Result<T> = std::result::Result<T, TrellisError>;

/// Errors that can occur while building or compiling grammars.
#[derive(Error, Debug)]
pub enum TrellisError {
    /// Compiler configuration is invalid (e.g. negative memory limit).
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The grammar IR violates a structural invariant.
    #[error("invalid grammar: {0}")]
    InvalidGrammar(String),

    /// EBNF text could not be parsed.
    #[error("ebnf error: {0}")]
    EbnfError(String),

    /// Regex text could not be parsed.
    #[error("regex error: {0}")]
    RegexError(String),

    /// JSON Schema could not be converted to a grammar.
    #[error("json schema error: {0}")]
    JsonSchemaError(String),

    /// Structural-tag JSON could not be converted to a grammar.
    #[error("structural tag error: {0}")]
    StructuralTagError(String),

    /// Tokenizer vocabulary is malformed.
    #[error("tokenizer error: {0}")]
    TokenizerError(String),

    /// JSON parsing error from serde.
    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),
}
