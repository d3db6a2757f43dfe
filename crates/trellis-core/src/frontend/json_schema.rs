//! JSON Schema front-end.
//!
//! Converts a schema into a grammar describing exactly the JSON documents
//! it admits. Supported keywords: `type` (including arrays of types),
//! `enum`, `const`, `anyOf` / `oneOf`, `$ref` into `$defs` /
//! `definitions`, `properties` + `required` + `additionalProperties`,
//! `items` / `prefixItems`, `minItems` / `maxItems`, and string
//! `minLength` / `maxLength`. Unknown keywords are ignored in
//! non-strict mode and rejected in strict mode.
//!
//! Output formatting follows the options: free-form whitespace
//! (`any_whitespace`, optionally bounded by `max_whitespace_cnt`), or fixed
//! separators with optional pretty-printing indentation.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::error::{Result, TrellisError};
use crate::grammar::{ExprId, Grammar, GrammarBuilder, RuleId};

/// Conversion options for [`grammar_from_json_schema`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JsonSchemaOptions {
    /// Allow arbitrary whitespace between JSON punctuation.
    pub any_whitespace: bool,
    /// Pretty-print indentation width; `None` emits compact output. Only
    /// used when `any_whitespace` is false.
    pub indent: Option<usize>,
    /// `(item separator, key separator)` for fixed formatting; defaults to
    /// `(", ", ": ")` compact and `(",", ": ")` indented.
    pub separators: Option<(String, String)>,
    /// Reject schemas using unsupported keywords instead of relaxing them.
    pub strict_mode: bool,
    /// Upper bound on a single whitespace run when `any_whitespace` is set.
    pub max_whitespace_cnt: Option<usize>,
}

impl Default for JsonSchemaOptions {
    fn default() -> Self {
        Self {
            any_whitespace: true,
            indent: None,
            separators: None,
            strict_mode: true,
            max_whitespace_cnt: None,
        }
    }
}

/// Convert a JSON Schema document into grammar IR.
pub fn grammar_from_json_schema(schema: &str, options: &JsonSchemaOptions) -> Result<Grammar> {
    let schema: Value = serde_json::from_str(schema)?;
    let mut converter = Converter {
        builder: GrammarBuilder::new(),
        options,
        root_schema: &schema,
        basics: HashMap::new(),
        ref_rules: HashMap::new(),
    };
    let root = converter.builder.add_empty_rule("root");
    let body = converter.visit(&schema, "root", 0)?;
    converter.builder.update_rule_body(root, body);
    Ok(converter.builder.build(root))
}

/// Keywords the converter understands; anything else trips strict mode.
const KNOWN_KEYWORDS: &[&str] = &[
    "$defs",
    "$id",
    "$ref",
    "$schema",
    "additionalProperties",
    "anyOf",
    "const",
    "definitions",
    "description",
    "enum",
    "items",
    "maxItems",
    "maxLength",
    "minItems",
    "minLength",
    "oneOf",
    "prefixItems",
    "properties",
    "required",
    "title",
    "type",
];

struct Converter<'a> {
    builder: GrammarBuilder,
    options: &'a JsonSchemaOptions,
    root_schema: &'a Value,
    basics: HashMap<&'static str, RuleId>,
    ref_rules: HashMap<String, RuleId>,
}

impl<'a> Converter<'a> {
    fn visit(&mut self, schema: &'a Value, hint: &str, level: usize) -> Result<ExprId> {
        match schema {
            Value::Bool(true) => {
                let any = self.basic_rule("any")?;
                return Ok(self.builder.add_rule_ref(any));
            }
            Value::Bool(false) => {
                return Err(TrellisError::JsonSchemaError(
                    "the `false` schema admits no document".into(),
                ));
            }
            Value::Object(_) => {}
            other => {
                return Err(TrellisError::JsonSchemaError(format!(
                    "schema must be an object or boolean, got {other}"
                )));
            }
        }
        let object = schema.as_object().unwrap();

        if self.options.strict_mode {
            for key in object.keys() {
                if !KNOWN_KEYWORDS.contains(&key.as_str()) {
                    return Err(TrellisError::JsonSchemaError(format!(
                        "unsupported keyword \"{key}\" in strict mode"
                    )));
                }
            }
        }

        if let Some(reference) = object.get("$ref").and_then(Value::as_str) {
            let rule = self.ref_rule(reference, level)?;
            return Ok(self.builder.add_rule_ref(rule));
        }
        if let Some(constant) = object.get("const") {
            return self.literal_value(constant);
        }
        if let Some(variants) = object.get("enum").and_then(Value::as_array) {
            let choices: Vec<ExprId> = variants
                .iter()
                .map(|v| self.literal_value(v))
                .collect::<Result<_>>()?;
            return Ok(self.builder.add_choices(choices));
        }
        if let Some(variants) = object
            .get("anyOf")
            .or_else(|| object.get("oneOf"))
            .and_then(Value::as_array)
        {
            let choices: Vec<ExprId> = variants
                .iter()
                .enumerate()
                .map(|(i, v)| self.visit(v, &format!("{hint}_case_{i}"), level))
                .collect::<Result<_>>()?;
            return Ok(self.builder.add_choices(choices));
        }

        match object.get("type") {
            None => {
                let any = self.basic_rule("any")?;
                Ok(self.builder.add_rule_ref(any))
            }
            Some(Value::String(ty)) => self.typed(object, ty, hint, level),
            Some(Value::Array(types)) => {
                let choices: Vec<ExprId> = types
                    .iter()
                    .map(|ty| {
                        let ty = ty.as_str().ok_or_else(|| {
                            TrellisError::JsonSchemaError("non-string entry in `type` array".into())
                        })?;
                        self.typed(object, ty, hint, level)
                    })
                    .collect::<Result<_>>()?;
                Ok(self.builder.add_choices(choices))
            }
            Some(other) => Err(TrellisError::JsonSchemaError(format!(
                "`type` must be a string or array, got {other}"
            ))),
        }
    }

    fn typed(
        &mut self,
        object: &'a serde_json::Map<String, Value>,
        ty: &str,
        hint: &str,
        level: usize,
    ) -> Result<ExprId> {
        match ty {
            "null" => Ok(self.builder.add_byte_string(b"null".to_vec())),
            "boolean" => {
                let rule = self.basic_rule("boolean")?;
                Ok(self.builder.add_rule_ref(rule))
            }
            "integer" => {
                let rule = self.basic_rule("integer")?;
                Ok(self.builder.add_rule_ref(rule))
            }
            "number" => {
                let rule = self.basic_rule("number")?;
                Ok(self.builder.add_rule_ref(rule))
            }
            "string" => self.string_schema(object),
            "object" => self.object_schema(object, hint, level),
            "array" => self.array_schema(object, hint, level),
            other => Err(TrellisError::JsonSchemaError(format!(
                "unknown type \"{other}\""
            ))),
        }
    }

    fn string_schema(&mut self, object: &serde_json::Map<String, Value>) -> Result<ExprId> {
        if object.contains_key("pattern") {
            if self.options.strict_mode {
                return Err(TrellisError::JsonSchemaError(
                    "string `pattern` is not supported in strict mode".into(),
                ));
            }
            // Relaxed: any string.
        }
        let min = object
            .get("minLength")
            .and_then(Value::as_u64)
            .map(|v| v as u32);
        let max = object
            .get("maxLength")
            .and_then(Value::as_u64)
            .map(|v| v as u32);
        if min.is_none() && max.is_none() {
            let rule = self.basic_rule("string")?;
            return Ok(self.builder.add_rule_ref(rule));
        }
        // Bounded string: quote, a length-bounded repetition of string
        // characters, quote.
        let char_rule = self.basic_rule("string_char")?;
        let quote = self.builder.add_byte_string(b"\"".to_vec());
        let repeat = self
            .builder
            .add_repeat(char_rule, min.unwrap_or(0), max);
        Ok(self.builder.add_sequence(vec![quote, repeat, quote]))
    }

    fn object_schema(
        &mut self,
        object: &'a serde_json::Map<String, Value>,
        hint: &str,
        level: usize,
    ) -> Result<ExprId> {
        let properties: Vec<(&'a String, &'a Value)> = object
            .get("properties")
            .and_then(Value::as_object)
            .map(|m| m.iter().collect())
            .unwrap_or_default();
        let required: HashSet<&str> = object
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let allow_additional = match object.get("additionalProperties") {
            Some(Value::Bool(false)) => false,
            Some(Value::Bool(true)) | Some(Value::Object(_)) => true,
            // Unconstrained objects admit extra members outside strict mode.
            None => !self.options.strict_mode,
            Some(other) => {
                return Err(TrellisError::JsonSchemaError(format!(
                    "`additionalProperties` must be a boolean or schema, got {other}"
                )));
            }
        };
        let additional_schema = match object.get("additionalProperties") {
            Some(schema @ Value::Object(_)) => Some(schema),
            _ => None,
        };

        // Per-property member expressions: "name" <key-sep> value.
        let mut members = Vec::with_capacity(properties.len());
        let mut required_flags = Vec::with_capacity(properties.len());
        for &(name, prop_schema) in &properties {
            let key_text = serde_json::to_string(name)?;
            let key = self.builder.add_byte_string(key_text.into_bytes());
            let key_sep = self.key_sep_expr()?;
            let value = self.visit(prop_schema, &format!("{hint}_{name}"), level + 1)?;
            members.push(self.builder.add_sequence(vec![key, key_sep, value]));
            required_flags.push(required.contains(name.as_str()));
        }

        // Expression matching one additional (free-form) member.
        let extra_member = if allow_additional {
            let key_rule = self.basic_rule("string")?;
            let key = self.builder.add_rule_ref(key_rule);
            let key_sep = self.key_sep_expr()?;
            let value = match additional_schema {
                Some(schema) => self.visit(schema, &format!("{hint}_extra"), level + 1)?,
                None => {
                    let any = self.basic_rule("any")?;
                    self.builder.add_rule_ref(any)
                }
            };
            Some(self.builder.add_sequence(vec![key, key_sep, value]))
        } else {
            None
        };

        let open = self.open_expr(b'{', level)?;
        let close = self.close_expr(b'}', level)?;
        let sep = self.item_sep_expr(level)?;

        // Tail expressions: tail_i matches the members from index i onward,
        // each preceded by a separator. A required member bounds how much
        // can be skipped. Additional members may follow the defined ones.
        let extra_tail = match extra_member {
            None => None,
            Some(extra) => {
                let name = self.builder.fresh_rule_name(&format!("{hint}_more"));
                let tail = self.builder.add_empty_rule(&name);
                let tail_ref = self.builder.add_rule_ref(tail);
                let rec = self.builder.add_sequence(vec![sep, extra, tail_ref]);
                let empty = self.builder.add_empty_string();
                let body = self.builder.add_choices(vec![empty, rec]);
                self.builder.update_rule_body(tail, body);
                Some(tail)
            }
        };

        let end_tail_expr = |builder: &mut GrammarBuilder| match extra_tail {
            Some(tail) => builder.add_rule_ref(tail),
            None => builder.add_empty_string(),
        };

        let mut tails: Vec<ExprId> = Vec::with_capacity(members.len() + 1);
        let end = end_tail_expr(&mut self.builder);
        tails.push(end);
        for i in (0..members.len()).rev() {
            let mut choices = Vec::new();
            if !required_flags[i..].iter().any(|&r| r) {
                let empty_or_extra = end_tail_expr(&mut self.builder);
                choices.push(empty_or_extra);
            }
            for j in i..members.len() {
                let next_tail = tails[members.len() - j - 1];
                choices.push(
                    self.builder
                        .add_sequence(vec![sep, members[j], next_tail]),
                );
                if required_flags[j] {
                    break;
                }
            }
            let tail_expr = if choices.len() == 1 {
                choices.pop().unwrap()
            } else {
                self.builder.add_choices(choices)
            };
            tails.push(tail_expr);
        }
        tails.reverse();

        // Head alternatives: which member comes first (no separator).
        let mut head_choices = Vec::new();
        for i in 0..members.len() {
            let tail = tails[i + 1];
            head_choices.push(self.builder.add_sequence(vec![members[i], tail]));
            if required_flags[i] {
                break;
            }
        }
        let no_required = !required_flags.iter().any(|&r| r);
        if no_required {
            if let Some(tail) = extra_tail {
                // First member is a free-form one.
                let extra = extra_member.expect("extra_tail implies extra_member");
                let tail_ref = self.builder.add_rule_ref(tail);
                head_choices.push(self.builder.add_sequence(vec![extra, tail_ref]));
            }
        }

        let mut obj_choices = Vec::new();
        if no_required {
            let empty_open = self.builder.add_byte_string(b"{".to_vec());
            let empty_ws = self.empty_body_ws_expr()?;
            let empty_close = self.builder.add_byte_string(b"}".to_vec());
            obj_choices.push(
                self.builder
                    .add_sequence(vec![empty_open, empty_ws, empty_close]),
            );
        }
        if !head_choices.is_empty() {
            let heads = if head_choices.len() == 1 {
                head_choices.pop().unwrap()
            } else {
                self.builder.add_choices(head_choices)
            };
            obj_choices.push(self.builder.add_sequence(vec![open, heads, close]));
        }
        if obj_choices.is_empty() {
            return Err(TrellisError::JsonSchemaError(
                "object schema admits no document (required properties without definitions)".into(),
            ));
        }
        if obj_choices.len() == 1 {
            Ok(obj_choices.pop().unwrap())
        } else {
            Ok(self.builder.add_choices(obj_choices))
        }
    }

    fn array_schema(
        &mut self,
        object: &'a serde_json::Map<String, Value>,
        hint: &str,
        level: usize,
    ) -> Result<ExprId> {
        let min_items = object
            .get("minItems")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        let max_items = object
            .get("maxItems")
            .and_then(Value::as_u64)
            .map(|v| v as u32);

        let prefix_exprs: Vec<ExprId> = match object.get("prefixItems").and_then(Value::as_array) {
            Some(prefix) => prefix
                .iter()
                .enumerate()
                .map(|(i, schema)| self.visit(schema, &format!("{hint}_prefix_{i}"), level + 1))
                .collect::<Result<_>>()?,
            None => Vec::new(),
        };
        let item_expr = match object.get("items") {
            Some(Value::Bool(false)) => None,
            Some(schema) => Some(self.visit(schema, &format!("{hint}_item"), level + 1)?),
            None if prefix_exprs.is_empty() => {
                let any = self.basic_rule("any")?;
                Some(self.builder.add_rule_ref(any))
            }
            None => None,
        };

        let open = self.open_expr(b'[', level)?;
        let close = self.close_expr(b']', level)?;
        let sep = self.item_sep_expr(level)?;

        let mut body_parts: Vec<ExprId> = Vec::new();
        for (i, &prefix) in prefix_exprs.iter().enumerate() {
            if i > 0 {
                body_parts.push(sep);
            }
            body_parts.push(prefix);
        }

        if let Some(item) = item_expr {
            let fixed = prefix_exprs.len() as u32;
            let rep_min = min_items.saturating_sub(fixed);
            let rep_max = max_items.map(|m| m.saturating_sub(fixed));
            if rep_max != Some(0) {
                // sep-item pairs after the first free item.
                let sep_item = self.builder.add_sequence(vec![sep, item]);
                let sep_item_rule = self
                    .builder
                    .add_rule_with_hint(&format!("{hint}_item_cont"), sep_item);
                if prefix_exprs.is_empty() {
                    let rest = self.builder.add_repeat(
                        sep_item_rule,
                        rep_min.saturating_sub(1),
                        rep_max.map(|m| m - 1),
                    );
                    let non_empty = self.builder.add_sequence(vec![item, rest]);
                    if rep_min == 0 {
                        let empty_arr = self.empty_array_expr()?;
                        let full = self.builder.add_sequence(vec![open, non_empty, close]);
                        return Ok(self.builder.add_choices(vec![empty_arr, full]));
                    }
                    body_parts.push(non_empty);
                } else {
                    let rest = self
                        .builder
                        .add_repeat(sep_item_rule, rep_min, rep_max);
                    body_parts.push(rest);
                }
            }
        }

        if body_parts.is_empty() {
            return self.empty_array_expr();
        }
        let mut seq = vec![open];
        seq.extend(body_parts);
        seq.push(close);
        Ok(self.builder.add_sequence(seq))
    }

    /// A JSON literal (for `const` / `enum`), serialized compactly.
    fn literal_value(&mut self, value: &Value) -> Result<ExprId> {
        let text = serde_json::to_string(value)?;
        Ok(self.builder.add_byte_string(text.into_bytes()))
    }

    /// Lazily build one of the shared primitive rules.
    fn basic_rule(&mut self, kind: &'static str) -> Result<RuleId> {
        if let Some(&rule) = self.basics.get(kind) {
            return Ok(rule);
        }
        let name = self.builder.fresh_rule_name(&format!("basic_{kind}"));
        let rule = self.builder.add_empty_rule(&name);
        self.basics.insert(kind, rule);
        let body = match kind {
            "boolean" => {
                let t = self.builder.add_byte_string(b"true".to_vec());
                let f = self.builder.add_byte_string(b"false".to_vec());
                self.builder.add_choices(vec![t, f])
            }
            "integer" => {
                // -? (0 | [1-9][0-9]*)
                let minus = self.builder.add_byte_string(b"-".to_vec());
                let empty = self.builder.add_empty_string();
                let opt_minus = self.builder.add_choices(vec![empty, minus]);
                let zero = self.builder.add_byte_string(b"0".to_vec());
                let lead = self
                    .builder
                    .add_character_class(vec![(b'1' as u32, b'9' as u32)], false);
                let digits = self
                    .builder
                    .add_character_class_star(vec![(b'0' as u32, b'9' as u32)], false);
                let nonzero = self.builder.add_sequence(vec![lead, digits]);
                let magnitude = self.builder.add_choices(vec![zero, nonzero]);
                self.builder.add_sequence(vec![opt_minus, magnitude])
            }
            "number" => {
                let int_rule = self.basic_rule("integer")?;
                let int_ref = self.builder.add_rule_ref(int_rule);
                let empty = self.builder.add_empty_string();
                let dot = self.builder.add_byte_string(b".".to_vec());
                let digit = self
                    .builder
                    .add_character_class(vec![(b'0' as u32, b'9' as u32)], false);
                let digits = self
                    .builder
                    .add_character_class_star(vec![(b'0' as u32, b'9' as u32)], false);
                let frac = self.builder.add_sequence(vec![dot, digit, digits]);
                let opt_frac = self.builder.add_choices(vec![empty, frac]);
                let e = self.builder.add_character_class(
                    vec![(b'e' as u32, b'e' as u32), (b'E' as u32, b'E' as u32)],
                    false,
                );
                let sign = self.builder.add_character_class(
                    vec![(b'+' as u32, b'+' as u32), (b'-' as u32, b'-' as u32)],
                    false,
                );
                let opt_sign = self.builder.add_choices(vec![empty, sign]);
                let exp = self.builder.add_sequence(vec![e, opt_sign, digit, digits]);
                let opt_exp = self.builder.add_choices(vec![empty, exp]);
                self.builder.add_sequence(vec![int_ref, opt_frac, opt_exp])
            }
            "string_char" => {
                // One string character: unescaped or an escape sequence.
                let normal = self.builder.add_character_class(
                    vec![
                        (0x00, 0x1F),
                        (b'"' as u32, b'"' as u32),
                        (b'\\' as u32, b'\\' as u32),
                    ],
                    true,
                );
                let backslash = self.builder.add_byte_string(b"\\".to_vec());
                let simple = self.builder.add_character_class(
                    vec![
                        (b'"' as u32, b'"' as u32),
                        (b'\\' as u32, b'\\' as u32),
                        (b'/' as u32, b'/' as u32),
                        (b'b' as u32, b'b' as u32),
                        (b'f' as u32, b'f' as u32),
                        (b'n' as u32, b'n' as u32),
                        (b'r' as u32, b'r' as u32),
                        (b't' as u32, b't' as u32),
                    ],
                    false,
                );
                let hex = self.builder.add_character_class(
                    vec![
                        (b'0' as u32, b'9' as u32),
                        (b'a' as u32, b'f' as u32),
                        (b'A' as u32, b'F' as u32),
                    ],
                    false,
                );
                let u = self.builder.add_byte_string(b"u".to_vec());
                let unicode = self.builder.add_sequence(vec![u, hex, hex, hex, hex]);
                let kinds = self.builder.add_choices(vec![simple, unicode]);
                let escape = self.builder.add_sequence(vec![backslash, kinds]);
                self.builder.add_choices(vec![normal, escape])
            }
            "string" => {
                let char_rule = self.basic_rule("string_char")?;
                let quote = self.builder.add_byte_string(b"\"".to_vec());
                let chars_name = self.builder.fresh_rule_name("basic_string_chars");
                let chars = self.builder.add_empty_rule(&chars_name);
                let char_ref = self.builder.add_rule_ref(char_rule);
                let chars_ref = self.builder.add_rule_ref(chars);
                let rec = self.builder.add_sequence(vec![char_ref, chars_ref]);
                let empty = self.builder.add_empty_string();
                let chars_body = self.builder.add_choices(vec![empty, rec]);
                self.builder.update_rule_body(chars, chars_body);
                self.builder.add_sequence(vec![quote, chars_ref, quote])
            }
            "any" => {
                // A free-form JSON value, recursively.
                let string = self.basic_rule("string")?;
                let number = self.basic_rule("number")?;
                let boolean = self.basic_rule("boolean")?;
                let any_ref = self.builder.add_rule_ref(rule);
                let ws = self.ws_rule()?;
                let ws_ref = self.builder.add_rule_ref(ws);

                let string_ref = self.builder.add_rule_ref(string);
                let number_ref = self.builder.add_rule_ref(number);
                let boolean_ref = self.builder.add_rule_ref(boolean);
                let null = self.builder.add_byte_string(b"null".to_vec());

                // members ::= member | member ws "," ws members
                let comma = self.builder.add_byte_string(b",".to_vec());
                let colon = self.builder.add_byte_string(b":".to_vec());
                let member = self.builder.add_sequence(vec![
                    string_ref, ws_ref, colon, ws_ref, any_ref,
                ]);
                let members_name = self.builder.fresh_rule_name("basic_any_members");
                let members = self.builder.add_empty_rule(&members_name);
                let members_ref = self.builder.add_rule_ref(members);
                let members_rec = self
                    .builder
                    .add_sequence(vec![member, ws_ref, comma, ws_ref, members_ref]);
                let members_body = self.builder.add_choices(vec![member, members_rec]);
                self.builder.update_rule_body(members, members_body);

                let open_brace = self.builder.add_byte_string(b"{".to_vec());
                let close_brace = self.builder.add_byte_string(b"}".to_vec());
                let empty_obj =
                    self.builder
                        .add_sequence(vec![open_brace, ws_ref, close_brace]);
                let full_obj = self.builder.add_sequence(vec![
                    open_brace, ws_ref, members_ref, ws_ref, close_brace,
                ]);

                // elements ::= any | any ws "," ws elements
                let elements_name = self.builder.fresh_rule_name("basic_any_elements");
                let elements = self.builder.add_empty_rule(&elements_name);
                let elements_ref = self.builder.add_rule_ref(elements);
                let elements_rec = self
                    .builder
                    .add_sequence(vec![any_ref, ws_ref, comma, ws_ref, elements_ref]);
                let elements_body = self.builder.add_choices(vec![any_ref, elements_rec]);
                self.builder.update_rule_body(elements, elements_body);

                let open_bracket = self.builder.add_byte_string(b"[".to_vec());
                let close_bracket = self.builder.add_byte_string(b"]".to_vec());
                let empty_arr =
                    self.builder
                        .add_sequence(vec![open_bracket, ws_ref, close_bracket]);
                let full_arr = self.builder.add_sequence(vec![
                    open_bracket, ws_ref, elements_ref, ws_ref, close_bracket,
                ]);

                self.builder.add_choices(vec![
                    string_ref, number_ref, boolean_ref, null, empty_obj, full_obj, empty_arr,
                    full_arr,
                ])
            }
            other => unreachable!("unknown basic rule kind {other}"),
        };
        self.builder.update_rule_body(rule, body);
        Ok(rule)
    }

    /// The whitespace rule for `any_whitespace` mode.
    fn ws_rule(&mut self) -> Result<RuleId> {
        if let Some(&rule) = self.basics.get("ws") {
            return Ok(rule);
        }
        let name = self.builder.fresh_rule_name("basic_ws");
        let rule = self.builder.add_empty_rule(&name);
        self.basics.insert("ws", rule);
        let body = match self.options.max_whitespace_cnt {
            None => self.builder.add_character_class_star(
                vec![(0x20, 0x20), (0x09, 0x09), (0x0A, 0x0A), (0x0D, 0x0D)],
                false,
            ),
            Some(bound) => {
                let ws_char = self.builder.add_character_class(
                    vec![(0x20, 0x20), (0x09, 0x09), (0x0A, 0x0A), (0x0D, 0x0D)],
                    false,
                );
                let char_rule = self.builder.add_rule_with_hint("basic_ws_char", ws_char);
                self.builder.add_repeat(char_rule, 0, Some(bound as u32))
            }
        };
        self.builder.update_rule_body(rule, body);
        Ok(rule)
    }

    fn ws_expr(&mut self) -> Result<ExprId> {
        let rule = self.ws_rule()?;
        Ok(self.builder.add_rule_ref(rule))
    }

    fn default_separators(&self) -> (String, String) {
        match &self.options.separators {
            Some(pair) => pair.clone(),
            None if self.options.indent.is_some() => (",".into(), ": ".into()),
            None => (", ".into(), ": ".into()),
        }
    }

    /// Separator between members/items at `level`.
    fn item_sep_expr(&mut self, level: usize) -> Result<ExprId> {
        if self.options.any_whitespace {
            let ws = self.ws_expr()?;
            let comma = self.builder.add_byte_string(b",".to_vec());
            return Ok(self.builder.add_sequence(vec![ws, comma, ws]));
        }
        let (item_sep, _) = self.default_separators();
        match self.options.indent {
            None => Ok(self.builder.add_byte_string(item_sep.into_bytes())),
            Some(width) => {
                let mut text = item_sep.into_bytes();
                text.push(b'\n');
                text.extend(std::iter::repeat(b' ').take(width * (level + 1)));
                Ok(self.builder.add_byte_string(text))
            }
        }
    }

    /// Separator between a key and its value.
    fn key_sep_expr(&mut self) -> Result<ExprId> {
        if self.options.any_whitespace {
            let ws = self.ws_expr()?;
            let colon = self.builder.add_byte_string(b":".to_vec());
            return Ok(self.builder.add_sequence(vec![ws, colon, ws]));
        }
        let (_, key_sep) = self.default_separators();
        Ok(self.builder.add_byte_string(key_sep.into_bytes()))
    }

    /// Opening punctuation (plus post-open whitespace) at `level`.
    fn open_expr(&mut self, bracket: u8, level: usize) -> Result<ExprId> {
        if self.options.any_whitespace {
            let open = self.builder.add_byte_string(vec![bracket]);
            let ws = self.ws_expr()?;
            return Ok(self.builder.add_sequence(vec![open, ws]));
        }
        match self.options.indent {
            None => Ok(self.builder.add_byte_string(vec![bracket])),
            Some(width) => {
                let mut text = vec![bracket, b'\n'];
                text.extend(std::iter::repeat(b' ').take(width * (level + 1)));
                Ok(self.builder.add_byte_string(text))
            }
        }
    }

    /// Closing punctuation (plus pre-close whitespace) at `level`.
    fn close_expr(&mut self, bracket: u8, level: usize) -> Result<ExprId> {
        if self.options.any_whitespace {
            let ws = self.ws_expr()?;
            let close = self.builder.add_byte_string(vec![bracket]);
            return Ok(self.builder.add_sequence(vec![ws, close]));
        }
        match self.options.indent {
            None => Ok(self.builder.add_byte_string(vec![bracket])),
            Some(width) => {
                let mut text = vec![b'\n'];
                text.extend(std::iter::repeat(b' ').take(width * level));
                text.push(bracket);
                Ok(self.builder.add_byte_string(text))
            }
        }
    }

    /// Whitespace inside `{}` / `[]` with no members.
    fn empty_body_ws_expr(&mut self) -> Result<ExprId> {
        if self.options.any_whitespace {
            self.ws_expr()
        } else {
            Ok(self.builder.add_empty_string())
        }
    }

    fn empty_array_expr(&mut self) -> Result<ExprId> {
        let open = self.builder.add_byte_string(b"[".to_vec());
        let ws = self.empty_body_ws_expr()?;
        let close = self.builder.add_byte_string(b"]".to_vec());
        Ok(self.builder.add_sequence(vec![open, ws, close]))
    }

    /// Resolve a `$ref` pointer into a (possibly recursive) rule.
    fn ref_rule(&mut self, reference: &str, level: usize) -> Result<RuleId> {
        if let Some(&rule) = self.ref_rules.get(reference) {
            return Ok(rule);
        }
        let target = self.resolve_pointer(reference)?;
        let hint = reference
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty() && *s != "#")
            .unwrap_or("ref");
        let name = self.builder.fresh_rule_name(hint);
        let rule = self.builder.add_empty_rule(&name);
        self.ref_rules.insert(reference.to_string(), rule);
        let body = self.visit(target, hint, level)?;
        self.builder.update_rule_body(rule, body);
        Ok(rule)
    }

    fn resolve_pointer(&self, reference: &str) -> Result<&'a Value> {
        if reference == "#" {
            return Ok(self.root_schema);
        }
        let path = reference.strip_prefix("#/").ok_or_else(|| {
            TrellisError::JsonSchemaError(format!("unsupported $ref \"{reference}\""))
        })?;
        let mut cursor = self.root_schema;
        for segment in path.split('/') {
            cursor = cursor.get(segment).ok_or_else(|| {
                TrellisError::JsonSchemaError(format!("$ref \"{reference}\" does not resolve"))
            })?;
        }
        Ok(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert(schema: &str) -> Grammar {
        grammar_from_json_schema(schema, &JsonSchemaOptions::default()).unwrap()
    }

    #[test]
    fn string_type_produces_string_rule() {
        let grammar = convert(r#"{"type": "string"}"#);
        assert!(grammar.rules().iter().any(|r| r.name.starts_with("basic_string")));
    }

    #[test]
    fn enum_produces_literal_choices() {
        let grammar = convert(r#"{"enum": ["a", 1, null]}"#);
        let crate::grammar::Expr::Choices(choices) = grammar.expr(grammar.root_rule().body)
        else {
            panic!("expected choices");
        };
        assert_eq!(choices.len(), 3);
    }

    #[test]
    fn object_with_required_properties() {
        let grammar = convert(
            r#"{
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "age": {"type": "integer"}
                },
                "required": ["name", "age"],
                "additionalProperties": false
            }"#,
        );
        assert!(grammar.num_rules() >= 3);
    }

    #[test]
    fn recursive_ref_resolves() {
        let grammar = convert(
            r##"{
                "$defs": {
                    "node": {
                        "type": "object",
                        "properties": {
                            "next": {"anyOf": [{"$ref": "#/$defs/node"}, {"type": "null"}]}
                        },
                        "additionalProperties": false
                    }
                },
                "$ref": "#/$defs/node"
            }"##,
        );
        assert!(grammar.rules().iter().any(|r| r.name.starts_with("node")));
    }

    #[test]
    fn strict_mode_rejects_unknown_keywords() {
        let result = grammar_from_json_schema(
            r#"{"type": "string", "format": "email"}"#,
            &JsonSchemaOptions::default(),
        );
        assert!(result.is_err());

        let relaxed = grammar_from_json_schema(
            r#"{"type": "string", "format": "email"}"#,
            &JsonSchemaOptions {
                strict_mode: false,
                ..JsonSchemaOptions::default()
            },
        );
        assert!(relaxed.is_ok());
    }

    #[test]
    fn array_bounds_lower_to_repeat() {
        let grammar = convert(
            r#"{"type": "array", "items": {"type": "integer"}, "minItems": 1, "maxItems": 3}"#,
        );
        let has_repeat = (0..grammar.num_rules()).any(|i| {
            let body = grammar.rules()[i].body;
            fn contains_repeat(g: &Grammar, id: crate::grammar::ExprId) -> bool {
                match g.expr(id) {
                    crate::grammar::Expr::Repeat { .. } => true,
                    crate::grammar::Expr::Sequence(ids)
                    | crate::grammar::Expr::Choices(ids) => {
                        ids.iter().any(|&c| contains_repeat(g, c))
                    }
                    _ => false,
                }
            }
            contains_repeat(&grammar, body)
        });
        assert!(has_repeat);
    }

    #[test]
    fn false_schema_is_rejected() {
        assert!(grammar_from_json_schema("false", &JsonSchemaOptions::default()).is_err());
    }
}
