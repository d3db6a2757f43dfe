//! Regex front-end.
//!
//! Lowers a regular expression into grammar IR, fully anchored: the
//! compiled grammar accepts exactly the strings the pattern matches from
//! start to end. Supported syntax: literals, `.`, character classes with
//! the usual escapes (`\d` `\w` `\s` and their negations), groups
//! (capturing and `(?:…)`), alternation, and the quantifiers `*` `+` `?`
//! `{n}` `{n,}` `{n,m}`. Anchors `^`/`$` are accepted and ignored.
//! Backreferences and lookaround are not supported.

use crate::error::{Result, TrellisError};
use crate::grammar::{ExprId, Grammar, GrammarBuilder};

use super::quantify;

/// Lower a regex into a grammar rooted at `root`.
pub fn grammar_from_regex(pattern: &str) -> Result<Grammar> {
    let mut parser = RegexParser {
        input: pattern.as_bytes(),
        pos: 0,
        builder: GrammarBuilder::new(),
    };
    let root = parser.builder.add_empty_rule("root");
    let body = parser.parse_alternation()?;
    if parser.pos != parser.input.len() {
        return Err(parser.err("unbalanced ')'".into()));
    }
    parser.builder.update_rule_body(root, body);
    Ok(parser.builder.build(root))
}

struct RegexParser<'a> {
    input: &'a [u8],
    pos: usize,
    builder: GrammarBuilder,
}

impl RegexParser<'_> {
    fn parse_alternation(&mut self) -> Result<ExprId> {
        let mut choices = vec![self.parse_concat()?];
        while self.peek() == Some(b'|') {
            self.pos += 1;
            choices.push(self.parse_concat()?);
        }
        if choices.len() == 1 {
            Ok(choices.pop().unwrap())
        } else {
            Ok(self.builder.add_choices(choices))
        }
    }

    fn parse_concat(&mut self) -> Result<ExprId> {
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None | Some(b'|') | Some(b')') => break,
                Some(b'^') | Some(b'$') => {
                    // The grammar is anchored by construction.
                    self.pos += 1;
                }
                _ => {
                    let atom = self.parse_atom()?;
                    items.push(self.parse_quantifier(atom)?);
                }
            }
        }
        if items.is_empty() {
            return Ok(self.builder.add_empty_string());
        }
        if items.len() == 1 {
            return Ok(items.pop().unwrap());
        }
        Ok(self.builder.add_sequence(items))
    }

    fn parse_quantifier(&mut self, atom: ExprId) -> Result<ExprId> {
        let quantified = match self.peek() {
            Some(b'*') => {
                self.pos += 1;
                quantify(&mut self.builder, "root", atom, 0, None)
            }
            Some(b'+') => {
                self.pos += 1;
                quantify(&mut self.builder, "root", atom, 1, None)
            }
            Some(b'?') => {
                self.pos += 1;
                quantify(&mut self.builder, "root", atom, 0, Some(1))
            }
            Some(b'{') => {
                self.pos += 1;
                let min = self.parse_integer()?;
                let max = if self.peek() == Some(b',') {
                    self.pos += 1;
                    if self.peek() == Some(b'}') {
                        None
                    } else {
                        Some(self.parse_integer()?)
                    }
                } else {
                    Some(min)
                };
                self.expect(b'}')?;
                if max.is_some_and(|m| m < min) {
                    return Err(self.err(format!(
                        "repetition bounds {{{min},{}}} are inverted",
                        max.unwrap()
                    )));
                }
                quantify(&mut self.builder, "root", atom, min, max)
            }
            _ => return Ok(atom),
        };
        // Lazy/possessive markers do not change the accepted language.
        if matches!(self.peek(), Some(b'?') | Some(b'+')) {
            self.pos += 1;
        }
        Ok(quantified)
    }

    fn parse_atom(&mut self) -> Result<ExprId> {
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                if self.peek() == Some(b'?') {
                    match self.peek_at(1) {
                        Some(b':') => self.pos += 2,
                        Some(b'P') | Some(b'<') => {
                            // Named group: skip to the closing '>'.
                            while self.peek().is_some_and(|c| c != b'>') {
                                self.pos += 1;
                            }
                            self.expect(b'>')?;
                        }
                        _ => {
                            return Err(self.err("lookaround is not supported".into()));
                        }
                    }
                }
                let inner = self.parse_alternation()?;
                self.expect(b')')?;
                Ok(inner)
            }
            Some(b'[') => self.parse_class(),
            Some(b'.') => {
                self.pos += 1;
                // Any character except newline.
                Ok(self.builder.add_character_class(vec![(0x0A, 0x0A)], true))
            }
            Some(b'\\') => {
                let (expr, consumed) = self.parse_escape_atom()?;
                self.pos += consumed;
                Ok(expr)
            }
            Some(c) if !b"*+?{".contains(&c) => {
                let (cp, consumed) = self.next_char()?;
                self.pos += consumed;
                let mut bytes = Vec::new();
                push_utf8(&mut bytes, cp);
                Ok(self.builder.add_byte_string(bytes))
            }
            other => Err(self.err(format!("unexpected input: {other:?}"))),
        }
    }

    /// `\d` `\w` `\s` and friends, or an escaped literal.
    fn parse_escape_atom(&mut self) -> Result<(ExprId, usize)> {
        let next = self
            .input
            .get(self.pos + 1)
            .copied()
            .ok_or_else(|| self.err("dangling backslash".into()))?;
        let class = |b: &mut GrammarBuilder, negated: bool, ranges: Vec<(u32, u32)>| {
            b.add_character_class(ranges, negated)
        };
        let expr = match next {
            b'd' => class(&mut self.builder, false, digit_ranges()),
            b'D' => class(&mut self.builder, true, digit_ranges()),
            b'w' => class(&mut self.builder, false, word_ranges()),
            b'W' => class(&mut self.builder, true, word_ranges()),
            b's' => class(&mut self.builder, false, space_ranges()),
            b'S' => class(&mut self.builder, true, space_ranges()),
            _ => {
                let (cp, consumed) =
                    super::ebnf::parse_escape(&self.input[self.pos..], &[]).map_err(|e| self.err(e))?;
                let mut bytes = Vec::new();
                push_utf8(&mut bytes, cp);
                return Ok((self.builder.add_byte_string(bytes), consumed));
            }
        };
        Ok((expr, 2))
    }

    fn parse_class(&mut self) -> Result<ExprId> {
        self.expect(b'[')?;
        let negated = if self.peek() == Some(b'^') {
            self.pos += 1;
            true
        } else {
            false
        };
        let mut ranges = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.err("unterminated character class".into())),
                Some(b']') => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\')
                    if matches!(
                        self.peek_at(1),
                        Some(b'd') | Some(b'w') | Some(b's')
                    ) =>
                {
                    let kind = self.peek_at(1).unwrap();
                    self.pos += 2;
                    ranges.extend(match kind {
                        b'd' => digit_ranges(),
                        b'w' => word_ranges(),
                        _ => space_ranges(),
                    });
                    continue;
                }
                _ => {}
            }
            let (lo, consumed) = self.next_class_char()?;
            self.pos += consumed;
            if self.peek() == Some(b'-') && self.peek_at(1) != Some(b']') {
                self.pos += 1;
                let (hi, consumed) = self.next_class_char()?;
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

    fn next_class_char(&self) -> Result<(u32, usize)> {
        if self.peek() == Some(b'\\') {
            return super::ebnf::parse_escape(
                &self.input[self.pos..],
                &[(b']', b']' as u32), (b'-', b'-' as u32), (b'^', b'^' as u32)],
            )
            .map_err(|e| self.err(e));
        }
        self.next_char()
    }

    fn next_char(&self) -> Result<(u32, usize)> {
        let s = std::str::from_utf8(&self.input[self.pos..])
            .map_err(|_| self.err("invalid UTF-8 in pattern".into()))?;
        let c = s
            .chars()
            .next()
            .ok_or_else(|| self.err("unexpected end of pattern".into()))?;
        Ok((c as u32, c.len_utf8()))
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

    fn err(&self, message: String) -> TrellisError {
        TrellisError::RegexError(format!("at byte {}: {message}", self.pos))
    }
}

fn digit_ranges() -> Vec<(u32, u32)> {
    vec![(b'0' as u32, b'9' as u32)]
}

fn word_ranges() -> Vec<(u32, u32)> {
    vec![
        (b'0' as u32, b'9' as u32),
        (b'A' as u32, b'Z' as u32),
        (b'_' as u32, b'_' as u32),
        (b'a' as u32, b'z' as u32),
    ]
}

fn space_ranges() -> Vec<(u32, u32)> {
    vec![(0x09, 0x0D), (0x20, 0x20)]
}

fn push_utf8(bytes: &mut Vec<u8>, cp: u32) {
    if cp < 0x80 {
        bytes.push(cp as u8);
    } else if let Some(c) = char::from_u32(cp) {
        let mut buf = [0u8; 4];
        bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::Expr;

    #[test]
    fn literal_pattern() {
        let grammar = grammar_from_regex("abc").unwrap();
        let Expr::Sequence(items) = grammar.expr(grammar.root_rule().body) else {
            panic!("expected sequence");
        };
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn digit_plus() {
        let grammar = grammar_from_regex("[0-9]+").unwrap();
        // `+` lowers to class followed by a star.
        assert!(grammar.num_rules() >= 1);
    }

    #[test]
    fn alternation_and_groups() {
        let grammar = grammar_from_regex("(cat|dog)s?").unwrap();
        assert!(matches!(
            grammar.expr(grammar.root_rule().body),
            Expr::Sequence(_)
        ));
    }

    #[test]
    fn escape_classes() {
        let grammar = grammar_from_regex(r"\d\w\s").unwrap();
        let Expr::Sequence(items) = grammar.expr(grammar.root_rule().body) else {
            panic!("expected sequence");
        };
        assert_eq!(items.len(), 3);
        assert!(matches!(
            grammar.expr(items[0]),
            Expr::CharacterClass { negated: false, .. }
        ));
    }

    #[test]
    fn bounded_repetition() {
        let grammar = grammar_from_regex("a{2,5}").unwrap();
        let found = matches!(
            grammar.expr(grammar.root_rule().body),
            Expr::Repeat { min: 2, max: Some(5), .. }
        );
        assert!(found);
    }

    #[test]
    fn anchors_are_ignored() {
        assert!(grammar_from_regex("^abc$").is_ok());
    }

    #[test]
    fn lookaround_is_rejected() {
        assert!(grammar_from_regex("(?=x)y").is_err());
        assert!(grammar_from_regex("a{3,1}").is_err());
    }
}
