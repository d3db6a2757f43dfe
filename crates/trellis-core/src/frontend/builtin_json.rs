//! The built-in whitespace-tolerant JSON grammar, hand-built through the
//! builder. Used for unconstrained-but-valid JSON output.

use crate::grammar::{Grammar, GrammarBuilder};

/// Build the builtin JSON value grammar.
pub fn builtin_json_grammar() -> Grammar {
    let mut b = GrammarBuilder::new();

    let root = b.add_empty_rule("root");
    let value = b.add_empty_rule("value");
    let object = b.add_empty_rule("object");
    let members = b.add_empty_rule("members");
    let member = b.add_empty_rule("member");
    let array = b.add_empty_rule("array");
    let elements = b.add_empty_rule("elements");
    let string = b.add_empty_rule("string");
    let chars = b.add_empty_rule("chars");
    let escape = b.add_empty_rule("escape");
    let number = b.add_empty_rule("number");
    let ws = b.add_empty_rule("ws");

    // ws ::= [ \t\n\r]*
    let ws_star = b.add_character_class_star(
        vec![(0x20, 0x20), (0x09, 0x09), (0x0A, 0x0A), (0x0D, 0x0D)],
        false,
    );
    b.update_rule_body(ws, ws_star);

    // root ::= ws value ws
    let ws_ref = b.add_rule_ref(ws);
    let value_ref = b.add_rule_ref(value);
    let root_seq = b.add_sequence(vec![ws_ref, value_ref, ws_ref]);
    b.update_rule_body(root, root_seq);

    // value ::= object | array | string | number | "true" | "false" | "null"
    let object_ref = b.add_rule_ref(object);
    let array_ref = b.add_rule_ref(array);
    let string_ref = b.add_rule_ref(string);
    let number_ref = b.add_rule_ref(number);
    let lit_true = b.add_byte_string(b"true".to_vec());
    let lit_false = b.add_byte_string(b"false".to_vec());
    let lit_null = b.add_byte_string(b"null".to_vec());
    let value_body = b.add_choices(vec![
        object_ref, array_ref, string_ref, number_ref, lit_true, lit_false, lit_null,
    ]);
    b.update_rule_body(value, value_body);

    // object ::= "{" ws "}" | "{" ws members ws "}"
    let open_brace = b.add_byte_string(b"{".to_vec());
    let close_brace = b.add_byte_string(b"}".to_vec());
    let members_ref = b.add_rule_ref(members);
    let empty_obj = b.add_sequence(vec![open_brace, ws_ref, close_brace]);
    let full_obj = b.add_sequence(vec![open_brace, ws_ref, members_ref, ws_ref, close_brace]);
    let object_body = b.add_choices(vec![empty_obj, full_obj]);
    b.update_rule_body(object, object_body);

    // members ::= member | member ws "," ws members
    let member_ref = b.add_rule_ref(member);
    let comma = b.add_byte_string(b",".to_vec());
    let members_rec = b.add_sequence(vec![member_ref, ws_ref, comma, ws_ref, members_ref]);
    let members_body = b.add_choices(vec![member_ref, members_rec]);
    b.update_rule_body(members, members_body);

    // member ::= string ws ":" ws value
    let colon = b.add_byte_string(b":".to_vec());
    let member_seq = b.add_sequence(vec![string_ref, ws_ref, colon, ws_ref, value_ref]);
    b.update_rule_body(member, member_seq);

    // array ::= "[" ws "]" | "[" ws elements ws "]"
    let open_bracket = b.add_byte_string(b"[".to_vec());
    let close_bracket = b.add_byte_string(b"]".to_vec());
    let elements_ref = b.add_rule_ref(elements);
    let empty_arr = b.add_sequence(vec![open_bracket, ws_ref, close_bracket]);
    let full_arr = b.add_sequence(vec![
        open_bracket,
        ws_ref,
        elements_ref,
        ws_ref,
        close_bracket,
    ]);
    let array_body = b.add_choices(vec![empty_arr, full_arr]);
    b.update_rule_body(array, array_body);

    // elements ::= value | value ws "," ws elements
    let elements_rec = b.add_sequence(vec![value_ref, ws_ref, comma, ws_ref, elements_ref]);
    let elements_body = b.add_choices(vec![value_ref, elements_rec]);
    b.update_rule_body(elements, elements_body);

    // string ::= "\"" chars "\""
    let quote = b.add_byte_string(b"\"".to_vec());
    let chars_ref = b.add_rule_ref(chars);
    let string_seq = b.add_sequence(vec![quote, chars_ref, quote]);
    b.update_rule_body(string, string_seq);

    // chars ::= "" | [^"\\\x00-\x1f] chars | escape chars
    let normal_char = b.add_character_class(
        vec![(0x00, 0x1F), (b'"' as u32, b'"' as u32), (b'\\' as u32, b'\\' as u32)],
        true,
    );
    let escape_ref = b.add_rule_ref(escape);
    let empty = b.add_empty_string();
    let chars_normal = b.add_sequence(vec![normal_char, chars_ref]);
    let chars_escape = b.add_sequence(vec![escape_ref, chars_ref]);
    let chars_body = b.add_choices(vec![empty, chars_normal, chars_escape]);
    b.update_rule_body(chars, chars_body);

    // escape ::= "\\" (["\\/bfnrt] | "u" hex{4})
    let backslash = b.add_byte_string(b"\\".to_vec());
    let simple_escape = b.add_character_class(
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
    let hex = b.add_character_class(
        vec![
            (b'0' as u32, b'9' as u32),
            (b'a' as u32, b'f' as u32),
            (b'A' as u32, b'F' as u32),
        ],
        false,
    );
    let u_lit = b.add_byte_string(b"u".to_vec());
    let unicode_escape = b.add_sequence(vec![u_lit, hex, hex, hex, hex]);
    let escape_kinds = b.add_choices(vec![simple_escape, unicode_escape]);
    let escape_seq = b.add_sequence(vec![backslash, escape_kinds]);
    b.update_rule_body(escape, escape_seq);

    // number ::= "-"? int frac? exp?
    let minus = b.add_byte_string(b"-".to_vec());
    let empty2 = b.add_empty_string();
    let opt_minus = b.add_choices(vec![empty2, minus]);
    let zero = b.add_byte_string(b"0".to_vec());
    let digit19 = b.add_character_class(vec![(b'1' as u32, b'9' as u32)], false);
    let digit_star = b.add_character_class_star(vec![(b'0' as u32, b'9' as u32)], false);
    let nonzero_int = b.add_sequence(vec![digit19, digit_star]);
    let int_part = b.add_choices(vec![zero, nonzero_int]);
    let dot = b.add_byte_string(b".".to_vec());
    let digit = b.add_character_class(vec![(b'0' as u32, b'9' as u32)], false);
    let frac = b.add_sequence(vec![dot, digit, digit_star]);
    let opt_frac = b.add_choices(vec![empty2, frac]);
    let e_class = b.add_character_class(
        vec![(b'e' as u32, b'e' as u32), (b'E' as u32, b'E' as u32)],
        false,
    );
    let sign = b.add_character_class(
        vec![(b'+' as u32, b'+' as u32), (b'-' as u32, b'-' as u32)],
        false,
    );
    let opt_sign = b.add_choices(vec![empty2, sign]);
    let exp = b.add_sequence(vec![e_class, opt_sign, digit, digit_star]);
    let opt_exp = b.add_choices(vec![empty2, exp]);
    let number_seq = b.add_sequence(vec![opt_minus, int_part, opt_frac, opt_exp]);
    b.update_rule_body(number, number_seq);

    b.build(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::{normalize, optimize};
    use crate::parser::{EarleyParser, ParserState};

    fn json_matches(input: &[u8]) -> bool {
        let grammar = optimize(&normalize(&builtin_json_grammar()).unwrap()).unwrap();
        let root = grammar.root_rule_id();
        let init = if let Some(fsm) = grammar.per_rule_fsm(root) {
            ParserState::at(Some(root), grammar.rule(root).body, fsm.start() as u32, 0)
        } else {
            let crate::grammar::Expr::Choices(choices) =
                grammar.expr(grammar.rule(root).body)
            else {
                panic!("non-normalized root");
            };
            ParserState::at(Some(root), choices[0], 0, 0)
        };
        let mut parser = EarleyParser::new(&grammar, init);
        for &b in input {
            if !parser.advance(b) {
                return false;
            }
        }
        parser.is_completed()
    }

    #[test]
    fn accepts_scalars() {
        assert!(json_matches(b"true"));
        assert!(json_matches(b"null"));
        assert!(json_matches(b"-12.5e3"));
        assert!(json_matches(b"\"hi\\n\""));
    }

    #[test]
    fn accepts_nested_structures() {
        assert!(json_matches(br#"{"a": [1, 2, {"b": null}], "c": "x"}"#));
        assert!(json_matches(b"[ ]"));
        assert!(json_matches(b"{ }"));
    }

    #[test]
    fn rejects_malformed_documents() {
        assert!(!json_matches(b"{"));
        assert!(!json_matches(b"[1,]"));
        assert!(!json_matches(b"01"));
        assert!(!json_matches(b"\"unterminated"));
    }
}
