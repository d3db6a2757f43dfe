//! # Trellis
//!
//! Grammar-constrained decoding for LLMs: compile a grammar and a tokenizer
//! vocabulary into adaptive token masks, once, ahead of sampling.
//!
//! Trellis turns formal output constraints into precomputed per-state token
//! sets:
//! - **JSON Schema**: guarantee schema-conformant JSON
//! - **EBNF grammars**: arbitrary context-free output languages
//! - **Regexes**: anchored pattern-shaped output
//! - **Structural tags**: free text with grammar-locked tagged regions
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use trellis::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let tokenizer = TokenizerInfo::from_str_vocab(&vocab)?;
//!     let compiler = Compiler::builder()
//!         .tokenizer_info(tokenizer)
//!         .max_threads(8)
//!         .build()?;
//!
//!     let compiled = compiler.compile_json_schema(r#"{"type": "object"}"#)?;
//!     // Feed compiled masks to the sampler's logit processor.
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export the core crate.
pub use trellis_core::*;

mod builder;

pub use builder::{Compiler, CompilerBuilder};

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::builder::{Compiler, CompilerBuilder};
    pub use trellis_core::prelude::*;
}
