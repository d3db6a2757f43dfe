//! # Trellis Core
//!
//! Core engine for grammar-constrained decoding: compile a formal grammar
//! plus a tokenizer vocabulary into per-parser-state *adaptive token masks*
//! that tell a sampler which tokens are legal next.
//!
//! The expensive part of constrained decoding — deciding, for every
//! position the parser can stop at, which of the ~10⁵ vocabulary tokens can
//! follow — is amortized into an offline compile step:
//!
//! 1. Front-ends lower EBNF, JSON Schema, regexes, or structural tags into
//!    a builder-based grammar IR ([`grammar`]).
//! 2. The normalizer and optimizer canonicalize rule bodies and attach a
//!    per-rule finite automaton over bytes ([`fsm`]).
//! 3. Each rule automaton gets a canonical fingerprint, so grammars that
//!    differ syntactically but share automata also share cached mask work.
//! 4. The mask compiler sweeps the byte-sorted vocabulary once per
//!    scannable state, driving an Earley-style parser ([`parser`]) with
//!    longest-common-prefix reuse and trie subtree skipping
//!    ([`compiler`]).
//!
//! ## Example
//!
//! ```rust,ignore
//! use trellis_core::prelude::*;
//!
//! let tokenizer = TokenizerInfo::from_str_vocab(&["1", "12", "a", "\""])?;
//! let compiler = GrammarCompiler::new(tokenizer, CompilerConfig::default())?;
//! let compiled = compiler.compile_regex("[0-9]+")?;
//! // compiled.masks() maps every scannable parser state to the tokens
//! // that may follow there.
//! ```
//!
//! ## Module Overview
//!
//! - [`grammar`] - Grammar IR, builder, normalizer, optimizer
//! - [`fsm`] - Byte-range automata with rule-reference edges
//! - [`parser`] - Earley-style parser driver
//! - [`tokenizer`] - Frozen vocabulary artifact
//! - [`compiler`] - Adaptive token-mask compilation and caches
//! - [`frontend`] - EBNF / regex / JSON Schema / structural-tag lowering
//! - [`error`] - Error types and Result alias

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod compiler;
pub mod error;
pub mod frontend;
pub mod fsm;
pub mod grammar;
pub mod parser;
mod support;
pub mod tokenizer;

pub use error::{Result, TrellisError};
pub use support::Bitset;

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::compiler::{
        AdaptiveTokenMask, CompiledGrammar, CompilerConfig, GrammarCompiler, MaskStore,
    };
    pub use crate::error::{Result, TrellisError};
    pub use crate::frontend::JsonSchemaOptions;
    pub use crate::grammar::{Grammar, GrammarBuilder};
    pub use crate::parser::ParserState;
    pub use crate::tokenizer::TokenizerInfo;
}
