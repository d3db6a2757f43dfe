//! JSON output example.
//!
//! Compiles a JSON Schema into adaptive token masks and inspects the mask
//! at the grammar's starting position.

use anyhow::Result;
use trellis::prelude::*;

fn main() -> Result<()> {
    // A toy vocabulary; in a real integration this comes from the model's
    // tokenizer (decoded token byte strings).
    let vocab: Vec<String> = [
        "{", "}", "{\"", "\"", ":", ",", " ", "name", "age", "hobbies", "[", "]", "0", "1",
        "2", "3", "42", "true", "false", "null", "a", "b", "c",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let tokenizer = TokenizerInfo::from_str_vocab(&vocab)?;

    let compiler = Compiler::builder()
        .tokenizer_info(tokenizer)
        .max_threads(4)
        .build()?;

    // Define a JSON schema for the output
    let schema = r#"{
        "type": "object",
        "properties": {
            "name": { "type": "string" },
            "age": { "type": "integer" },
            "hobbies": {
                "type": "array",
                "items": { "type": "string" }
            }
        },
        "required": ["name", "age", "hobbies"],
        "additionalProperties": false
    }"#;

    let compiled = compiler.compile_json_schema(schema)?;

    println!("Compiled grammar with {} mask states", compiled.masks().len());
    println!("Cache size: {} bytes", compiler.cache_size_bytes());

    // In a real scenario, you would:
    // 1. At each decode step, look up the masks for the matcher's current
    //    parser states and union them
    // 2. Apply the union to the logits before sampling
    // 3. Advance the matcher with the sampled token's bytes
    // 4. Continue until the matcher reports completion

    Ok(())
}
