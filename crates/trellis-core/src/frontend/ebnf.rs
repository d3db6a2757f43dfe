//! EBNF front-end.
//!
//! Grammar of the accepted notation:
//!
//! ```text
//! grammar    ::= (rule)*
//! rule       ::= name "::=" alternation lookahead?
//! lookahead  ::= "(=" sequence ")"
//! alternation::= sequence ("|" sequence)*
//! sequence   ::= item*
//! item       ::= primary ("*" | "+" | "?" | "{" n ("," m?)? "}")?
//! primary    ::= string | class | name | "(" alternation ")"
//! ```
//!
//! Strings use double quotes with the usual escapes; character classes
//! support negation (`[^…]`), ranges, and Unicode escapes; `#` starts a
//! comment running to end of line.

use crate::error::{Result, TrellisError};
use crate::grammar::{ExprId, Grammar, GrammarBuilder, RuleId};

use super::quantify;

/// Parse EBNF text into a grammar rooted at `root_rule_name`.
pub fn grammar_from_ebnf(text: &str, root_rule_name: &str) -> Result<Grammar> {
    let mut parser = EbnfParser {
        input: text.as_bytes(),
        pos: 0,
        line: 1,
        builder: GrammarBuilder::new(),
        defined: std::collections::HashSet::new(),
        referenced: std::collections::HashSet::new(),
    };
    parser.parse_all()?;

    if let Some(name) = parser.referenced.difference(&parser.defined).next() {
        return Err(TrellisError::EbnfError(format!(
            "rule \"{name}\" is referenced but never defined"
        )));
    }
    let builder = parser.builder;
    let root = builder.rule_id(root_rule_name).ok_or_else(|| {
        TrellisError::EbnfError(format!("root rule \"{root_rule_name}\" is not defined"))
    })?;
    Ok(builder.build(root))
}

struct EbnfParser<'a> {
    input: &'a [u8],
    pos: usize,
    line: usize,
    builder: GrammarBuilder,
    /// Rule names that received a definition.
    defined: std::collections::HashSet<String>,
    /// Rule names used in rule bodies.
    referenced: std::collections::HashSet<String>,
}

impl EbnfParser<'_> {
    fn parse_all(&mut self) -> Result<()> {
        loop {
            self.skip_trivia();
            if self.peek().is_none() {
                return Ok(());
            }
            self.parse_rule()?;
        }
    }

    fn parse_rule(&mut self) -> Result<()> {
        let name = self.parse_name()?;
        self.skip_trivia();
        self.expect_str("::=")?;

        let rule = self.declare_rule(&name);
        if !self.defined.insert(name.clone()) {
            return Err(self.err(format!("rule \"{name}\" is defined twice")));
        }

        let body = self.parse_alternation(&name)?;
        self.builder.update_rule_body(rule, body);

        // Optional trailing lookahead assertion: (= ...)
        self.skip_inline_trivia();
        if self.peek() == Some(b'(') && self.peek_at(1) == Some(b'=') {
            self.pos += 2;
            let lookahead = self.parse_sequence(&name)?;
            self.skip_trivia();
            self.expect(b')')?;
            self.builder
                .update_lookahead_assertion(rule, Some(lookahead));
        }
        Ok(())
    }

    fn parse_alternation(&mut self, hint: &str) -> Result<ExprId> {
        let mut choices = vec![self.parse_sequence(hint)?];
        loop {
            self.skip_inline_trivia();
            if self.peek() == Some(b'|') {
                self.pos += 1;
                choices.push(self.parse_sequence(hint)?);
            } else {
                break;
            }
        }
        if choices.len() == 1 {
            Ok(choices.pop().unwrap())
        } else {
            Ok(self.builder.add_choices(choices))
        }
    }

    fn parse_sequence(&mut self, hint: &str) -> Result<ExprId> {
        let mut items = Vec::new();
        loop {
            self.skip_inline_trivia();
            match self.peek() {
                Some(b'"') | Some(b'[') | Some(b'(') => {}
                Some(c) if is_name_start(c) => {}
                _ => break,
            }
            // `(=` opens a lookahead, not a group.
            if self.peek() == Some(b'(') && self.peek_at(1) == Some(b'=') {
                break;
            }
            items.push(self.parse_item(hint)?);
        }
        if items.is_empty() {
            return Ok(self.builder.add_empty_string());
        }
        if items.len() == 1 {
            return Ok(items.pop().unwrap());
        }
        Ok(self.builder.add_sequence(items))
    }

    fn parse_item(&mut self, hint: &str) -> Result<ExprId> {
        let primary = self.parse_primary(hint)?;
        self.parse_quantifier(hint, primary)
    }

    fn parse_quantifier(&mut self, hint: &str, primary: ExprId) -> Result<ExprId> {
        match self.peek() {
            Some(b'*') => {
                self.pos += 1;
                Ok(quantify(&mut self.builder, hint, primary, 0, None))
            }
            Some(b'+') => {
                self.pos += 1;
                Ok(quantify(&mut self.builder, hint, primary, 1, None))
            }
            Some(b'?') => {
                self.pos += 1;
                Ok(quantify(&mut self.builder, hint, primary, 0, Some(1)))
            }
            Some(b'{') => {
                self.pos += 1;
                self.skip_inline_trivia();
                let min = self.parse_integer()?;
                self.skip_inline_trivia();
                let max = if self.peek() == Some(b',') {
                    self.pos += 1;
                    self.skip_inline_trivia();
                    if self.peek() == Some(b'}') {
                        None
                    } else {
                        Some(self.parse_integer()?)
                    }
                } else {
                    Some(min)
                };
                self.skip_inline_trivia();
                self.expect(b'}')?;
                if let Some(max) = max {
                    if max < min {
                        return Err(self.err(format!("repetition bounds {{{min},{max}}} are inverted")));
                    }
                }
                Ok(quantify(&mut self.builder, hint, primary, min, max))
            }
            _ => Ok(primary),
        }
    }

    fn parse_primary(&mut self, hint: &str) -> Result<ExprId> {
        match self.peek() {
            Some(b'"') => self.parse_string_literal(),
            Some(b'[') => self.parse_character_class(),
            Some(b'(') => {
                self.pos += 1;
                let inner = self.parse_alternation(hint)?;
                self.skip_trivia();
                self.expect(b')')?;
                Ok(inner)
            }
            Some(c) if is_name_start(c) => {
                let name = self.parse_name()?;
                self.referenced.insert(name.clone());
                let rule = self.declare_rule(&name);
                Ok(self.builder.add_rule_ref(rule))
            }
            other => Err(self.err(format!("unexpected input: {other:?}"))),
        }
    }

    fn parse_string_literal(&mut self) -> Result<ExprId> {
        self.expect(b'"')?;
        let mut bytes = Vec::new();
        loop {
            match self.peek() {
                None | Some(b'\n') => return Err(self.err("unterminated string literal".into())),
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => {
                    let (cp, consumed) = parse_escape(&self.input[self.pos..], &[])
                        .map_err(|e| self.err(e))?;
                    self.pos += consumed;
                    push_codepoint(&mut bytes, cp).map_err(|e| self.err(e))?;
                }
                Some(b) => {
                    bytes.push(b);
                    self.pos += 1;
                }
            }
        }
        if bytes.is_empty() {
            Ok(self.builder.add_empty_string())
        } else {
            Ok(self.builder.add_byte_string(bytes))
        }
    }

    fn parse_character_class(&mut self) -> Result<ExprId> {
        self.expect(b'[')?;
        let negated = if self.peek() == Some(b'^') {
            self.pos += 1;
            true
        } else {
            false
        };
        let class_escapes: &[(u8, u32)] = &[(b']', b']' as u32), (b'-', b'-' as u32), (b'^', b'^' as u32)];
        let mut ranges = Vec::new();
        loop {
            match self.peek() {
                None | Some(b'\n') => return Err(self.err("unterminated character class".into())),
                Some(b']') => {
                    self.pos += 1;
                    break;
                }
                _ => {}
            }
            let (lo, consumed) = parse_codepoint(&self.input[self.pos..], class_escapes)
                .map_err(|e| self.err(e))?;
            self.pos += consumed;
            if self.peek() == Some(b'-') && self.peek_at(1) != Some(b']') {
                self.pos += 1;
                let (hi, consumed) = parse_codepoint(&self.input[self.pos..], class_escapes)
                    .map_err(|e| self.err(e))?;
                self.pos += consumed;
                if hi < lo {
                    return Err(self.err("character range bounds are inverted".into()));
                }
                ranges.push((lo, hi));
            } else {
                ranges.push((lo, lo));
            }
        }
        if ranges.is_empty() {
            return Err(self.err("empty character class".into()));
        }
        Ok(self.builder.add_character_class(ranges, negated))
    }

    fn parse_name(&mut self) -> Result<String> {
        let start = self.pos;
        match self.peek() {
            Some(c) if is_name_start(c) => self.pos += 1,
            other => return Err(self.err(format!("expected rule name, found {other:?}"))),
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' || c == b'-' {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos]).into_owned())
    }

    fn parse_integer(&mut self) -> Result<u32> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.err("expected an integer".into()));
        }
        std::str::from_utf8(&self.input[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.err("repetition bound is too large".into()))
    }

    /// Get or forward-declare a rule by name.
    fn declare_rule(&mut self, name: &str) -> RuleId {
        if let Some(rule) = self.builder.rule_id(name) {
            return rule;
        }
        let rule = self.builder.add_empty_rule(name);
        // Forward references get a placeholder body; a reference that never
        // gets a real definition is reported after parsing.
        let placeholder = self.builder.add_empty_string();
        self.builder.update_rule_body(rule, placeholder);
        rule
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, delta: usize) -> Option<u8> {
        self.input.get(self.pos + delta).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.err(format!("expected '{}'", byte as char)))
        }
    }

    fn expect_str(&mut self, s: &str) -> Result<()> {
        if self.input[self.pos..].starts_with(s.as_bytes()) {
            self.pos += s.len();
            Ok(())
        } else {
            Err(self.err(format!("expected \"{s}\"")))
        }
    }

    /// Skip whitespace (including newlines) and comments.
    fn skip_trivia(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    if c == b'\n' {
                        self.line += 1;
                    }
                    self.pos += 1;
                }
                b'#' => {
                    while self.peek().is_some_and(|c| c != b'\n') {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    /// Skip whitespace except newlines (a newline ends a rule body unless
    /// the next line continues with `|`).
    fn skip_inline_trivia(&mut self) {
        loop {
            while self.peek().is_some_and(|c| c == b' ' || c == b'\t' || c == b'\r') {
                self.pos += 1;
            }
            if self.peek() == Some(b'#') {
                while self.peek().is_some_and(|c| c != b'\n') {
                    self.pos += 1;
                }
                continue;
            }
            if self.peek() == Some(b'\n') {
                // Look ahead: continuation lines start with '|' or ')'.
                let mut ahead = self.pos + 1;
                while self
                    .input
                    .get(ahead)
                    .is_some_and(|&c| c == b' ' || c == b'\t' || c == b'\r' || c == b'\n')
                {
                    ahead += 1;
                }
                if matches!(self.input.get(ahead), Some(b'|') | Some(b')')) {
                    self.line += 1;
                    self.pos += 1;
                    continue;
                }
            }
            break;
        }
    }

    fn err(&self, message: String) -> TrellisError {
        TrellisError::EbnfError(format!("line {}: {message}", self.line))
    }
}

fn is_name_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn push_codepoint(bytes: &mut Vec<u8>, cp: u32) -> std::result::Result<(), String> {
    if cp < 0x80 {
        bytes.push(cp as u8);
        return Ok(());
    }
    let c = char::from_u32(cp).ok_or_else(|| format!("invalid codepoint U+{cp:04X}"))?;
    let mut buf = [0u8; 4];
    bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
    Ok(())
}

/// Parse an escape sequence starting at `\`. Returns `(codepoint, bytes
/// consumed)`.
pub(crate) fn parse_escape(
    data: &[u8],
    extra_escapes: &[(u8, u32)],
) -> std::result::Result<(u32, usize), String> {
    if data.len() < 2 || data[0] != b'\\' {
        return Err("expected an escape sequence".into());
    }
    for &(ch, cp) in extra_escapes {
        if data[1] == ch {
            return Ok((cp, 2));
        }
    }
    match data[1] {
        b'"' => Ok((b'"' as u32, 2)),
        b'\'' => Ok((b'\'' as u32, 2)),
        b'\\' => Ok((b'\\' as u32, 2)),
        b'/' => Ok((b'/' as u32, 2)),
        b'0' => Ok((0x00, 2)),
        b'b' => Ok((0x08, 2)),
        b'f' => Ok((0x0C, 2)),
        b'n' => Ok((0x0A, 2)),
        b'r' => Ok((0x0D, 2)),
        b't' => Ok((0x09, 2)),
        b'v' => Ok((0x0B, 2)),
        b'e' => Ok((0x1B, 2)),
        b'x' => {
            let mut cp = 0u32;
            let mut len = 0;
            while len < 2 {
                match data.get(2 + len).copied().and_then(hex_value) {
                    Some(d) => {
                        cp = cp * 16 + d;
                        len += 1;
                    }
                    None => break,
                }
            }
            if len == 0 {
                return Err("\\x needs hex digits".into());
            }
            Ok((cp, 2 + len))
        }
        b'u' => parse_fixed_hex(data, 4),
        b'U' => parse_fixed_hex(data, 8),
        other => Err(format!("invalid escape: \\{}", other as char)),
    }
}

fn parse_fixed_hex(data: &[u8], digits: usize) -> std::result::Result<(u32, usize), String> {
    if data.len() < 2 + digits {
        return Err(format!("\\{} needs {digits} hex digits", data[1] as char));
    }
    let mut cp = 0u32;
    for i in 0..digits {
        let d = hex_value(data[2 + i])
            .ok_or_else(|| format!("invalid hex digit in \\{} escape", data[1] as char))?;
        cp = cp * 16 + d;
    }
    Ok((cp, 2 + digits))
}

fn hex_value(c: u8) -> Option<u32> {
    match c {
        b'0'..=b'9' => Some((c - b'0') as u32),
        b'a'..=b'f' => Some((c - b'a' + 10) as u32),
        b'A'..=b'F' => Some((c - b'A' + 10) as u32),
        _ => None,
    }
}

/// Parse one class member: an escape or a UTF-8 character.
fn parse_codepoint(
    data: &[u8],
    extra_escapes: &[(u8, u32)],
) -> std::result::Result<(u32, usize), String> {
    if data.first() == Some(&b'\\') {
        return parse_escape(data, extra_escapes);
    }
    let s = std::str::from_utf8(data)
        .ok()
        .or_else(|| {
            // Take the longest valid prefix.
            std::str::from_utf8(&data[..data.len().min(4)]).ok()
        })
        .and_then(|s| s.chars().next());
    match s {
        Some(c) => Ok((c as u32, c.len_utf8())),
        None => Err("invalid UTF-8 in character class".into()),
    }
}
