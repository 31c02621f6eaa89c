use std::collections::BTreeSet;
use std::fmt::Display;
use std::str::FromStr;

use regex::Regex;
use tracing::debug;

use crate::{
    error::Error,
    ports::{PortAttributes, WELL_KNOWN_KEYS},
};

/// A compiled port match expression.
///
/// An expression is a string of whitespace-separated terms, all of which
/// must match for a port to be accepted:
///
/// | Term | Meaning |
/// |------|---------|
/// | `VALUE` | match any attribute, case-insensitive, whole-word |
/// | `ATTR=VALUE` | attribute-scoped, case-insensitive, whole-value |
/// | `~/REGEX/` | case-sensitive regex against any attribute |
/// | `ATTR~/REGEX/` | case-sensitive regex against one attribute |
///
/// `VALUE` may use `*` (any run) and `?` (one character) wildcards, quote
/// characters with backslashes or double-quoted runs, and use the
/// `\n \t \" \\ \xHH \uHHHH` escapes. A `VALUE` that reads as an integer
/// (decimal or `0x` hex) also matches either spelling of the same number,
/// so `0x239a` finds a port with `vid` `9114`. `ATTR` may abbreviate an
/// attribute name to any unambiguous prefix. A `!` before the value or
/// the `~` inverts a term.
#[derive(Debug, Clone)]
pub struct Matcher {
    expression: String,
    terms: Vec<Term>,
}

impl Matcher {
    /// Parse and compile a match expression.
    pub fn new(expression: &str) -> Result<Self, Error> {
        let terms = parse_terms(expression).map_err(|reason| Error::Parse {
            expression: expression.to_string(),
            reason,
        })?;

        debug!(%expression, terms = terms.len(), "compiled match expression");
        Ok(Self {
            expression: expression.to_string(),
            terms,
        })
    }

    /// The source expression.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// An empty expression has no terms and matches every port.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Whether every term matches the given port.
    pub fn matches(&self, port: &PortAttributes) -> bool {
        self.terms.iter().all(|term| term.matches(port))
    }

    /// The ports from `ports` this matcher accepts, in input order.
    pub fn filter<'a>(&self, ports: &'a [PortAttributes]) -> Vec<&'a PortAttributes> {
        ports.iter().filter(|p| self.matches(p)).collect()
    }

    /// The attribute keys matched by the expression's positive terms,
    /// typically for display highlighting.
    pub fn hits(&self, port: &PortAttributes) -> BTreeSet<String> {
        port.iter()
            .filter(|(k, v)| self.terms.iter().any(|t| t.hits_key(k, v)))
            .map(|(k, _)| k.to_string())
            .collect()
    }
}

impl Display for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.expression)
    }
}

impl FromStr for Matcher {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[derive(Debug, Clone)]
struct Term {
    /// Lowercased attribute-name prefix, if the term is scoped.
    scope: Option<String>,
    negated: bool,
    regex: Regex,
}

impl Term {
    fn is_hit(&self, port: &PortAttributes) -> bool {
        match &self.scope {
            None => port.iter().any(|(_, v)| self.regex.is_match(v)),
            Some(prefix) => {
                resolve_value(port, prefix).is_some_and(|v| self.regex.is_match(v))
            }
        }
    }

    fn matches(&self, port: &PortAttributes) -> bool {
        self.is_hit(port) != self.negated
    }

    fn hits_key(&self, key: &str, value: &str) -> bool {
        !self.negated
            && self.scope.as_deref().map_or(true, |p| key.starts_with(p))
            && self.regex.is_match(value)
    }
}

/// Resolve an attribute-name prefix against a port's actual keys:
/// an exact key wins, else a unique key starting with the prefix.
fn resolve_value<'a>(port: &'a PortAttributes, prefix: &str) -> Option<&'a str> {
    if let Some(v) = port.get(prefix) {
        return Some(v);
    }
    let mut candidates = port.iter().filter(|(k, _)| k.starts_with(prefix));
    match (candidates.next(), candidates.next()) {
        (Some((_, v)), None) => Some(v),
        _ => None,
    }
}

/// One fragment of a literal value.
#[derive(Debug, PartialEq)]
enum Piece {
    Text(String),
    Star,
    Question,
}

fn parse_terms(expression: &str) -> Result<Vec<Term>, String> {
    let chars: Vec<char> = expression.chars().collect();
    let mut terms = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        if chars[i].is_whitespace() {
            i += 1;
            continue;
        }

        // A leading run of attribute-name characters may scope the term.
        let mut j = i;
        while j < chars.len() && (chars[j].is_ascii_alphabetic() || chars[j] == '_') {
            j += 1;
        }
        let scope: String = chars[i..j].iter().collect();
        let rest = &chars[j..];

        let term = if rest.starts_with(&['~', '/']) {
            i = j + 2;
            regex_term(&scope, false, &chars, &mut i)?
        } else if rest.starts_with(&['!', '~', '/']) {
            i = j + 3;
            regex_term(&scope, true, &chars, &mut i)?
        } else if !scope.is_empty() && rest.first() == Some(&'=') {
            i = j + 1;
            let pieces = lex_value(&chars, &mut i)?;
            literal_term(Some(&scope), false, &pieces)?
        } else if !scope.is_empty() && rest.starts_with(&['!', '=']) {
            i = j + 2;
            let pieces = lex_value(&chars, &mut i)?;
            literal_term(Some(&scope), true, &pieces)?
        } else {
            // Plain value, optionally negated. Re-lex from the term start;
            // the scope run we scanned is part of the value.
            let negated = chars[i] == '!';
            if negated {
                i += 1;
            }
            let pieces = lex_value(&chars, &mut i)?;
            literal_term(None, negated, &pieces)?
        };

        terms.push(term);
    }

    Ok(terms)
}

fn regex_term(
    scope: &str,
    negated: bool,
    chars: &[char],
    i: &mut usize,
) -> Result<Term, String> {
    let start = *i;
    loop {
        match chars.get(*i) {
            None => return Err("unterminated regex".into()),
            Some('\\') => *i += 2,
            Some('/') => break,
            Some(_) => *i += 1,
        }
    }
    let body: String = chars[start..(*i).min(chars.len())].iter().collect();
    *i += 1; // past the closing slash
    if chars.get(*i).is_some_and(|c| !c.is_whitespace()) {
        return Err(format!("unexpected characters after regex /{body}/"));
    }

    let regex = Regex::new(&body).map_err(|e| format!("bad regex /{body}/: {e}"))?;
    Ok(Term {
        scope: scoped(scope)?,
        negated,
        regex,
    })
}

fn literal_term(scope: Option<&str>, negated: bool, pieces: &[Piece]) -> Result<Term, String> {
    let whole_value = scope.is_some();

    // An integer literal also matches the other spellings of its value.
    let pattern = match plain_integer(pieces) {
        Some((text, value)) => {
            let alternates = format!(
                "({}|0*{}|(0x)?0*{:x}h?)",
                regex::escape(&text),
                value,
                value
            );
            if whole_value {
                format!("(?i)^{alternates}$")
            } else {
                format!(r"(?i)\b{alternates}\b")
            }
        }
        None => {
            let body: String = pieces
                .iter()
                .map(|piece| match piece {
                    Piece::Text(t) => regex::escape(t),
                    Piece::Star => ".*".to_string(),
                    Piece::Question => ".".to_string(),
                })
                .collect();

            if whole_value {
                format!("(?i)^{body}$")
            } else {
                // Word-boundary wrap, but only against word-like edges:
                // a literal starting with punctuation has no boundary to
                // anchor on.
                let first = match pieces.first() {
                    Some(Piece::Text(t)) => t.chars().next(),
                    _ => None,
                };
                let last = match pieces.last() {
                    Some(Piece::Text(t)) => t.chars().last(),
                    _ => None,
                };
                let prefix = if first.is_some_and(char::is_alphanumeric) {
                    r"\b"
                } else {
                    ""
                };
                let suffix = if last.is_some_and(char::is_alphanumeric) {
                    r"\b"
                } else {
                    ""
                };
                format!("(?i){prefix}{body}{suffix}")
            }
        }
    };

    let regex = Regex::new(&pattern).map_err(|e| format!("bad term: {e}"))?;
    Ok(Term {
        scope: match scope {
            None => None,
            Some(s) => scoped(s)?,
        },
        negated,
        regex,
    })
}

/// Reject prefixes which abbreviate more than one well-known attribute,
/// like `v` (vid? vid_pid?). An exact well-known name is always fine, and
/// unknown names are allowed through for provider-specific attributes.
fn scoped(scope: &str) -> Result<Option<String>, String> {
    if scope.is_empty() {
        return Ok(None);
    }
    let scope = scope.to_lowercase();
    let hits: Vec<&str> = WELL_KNOWN_KEYS
        .iter()
        .copied()
        .filter(|k| k.starts_with(&scope))
        .collect();
    if hits.len() > 1 && !hits.contains(&scope.as_str()) {
        return Err(format!(
            "ambiguous attribute prefix `{scope}` ({})",
            hits.join(", ")
        ));
    }
    Ok(Some(scope))
}

/// The literal's text and numeric value, if it is wildcard-free and reads
/// as a decimal or `0x` hex integer.
fn plain_integer(pieces: &[Piece]) -> Option<(String, u64)> {
    let text = match pieces {
        [Piece::Text(t)] => t.clone(),
        _ => return None,
    };

    let value = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()?
    } else if !text.is_empty() && text.chars().all(|c| c.is_ascii_digit()) {
        text.parse().ok()?
    } else {
        return None;
    };

    Some((text, value))
}

/// Lex a literal value: ends at unquoted whitespace, `"` toggles a quoted
/// run, backslash escapes one character, `*`/`?` are wildcards.
fn lex_value(chars: &[char], i: &mut usize) -> Result<Vec<Piece>, String> {
    let mut pieces = Vec::new();
    let mut text = String::new();
    let mut quoted = false;
    let mut consumed = false;

    while let Some(&c) = chars.get(*i) {
        if !quoted && c.is_whitespace() {
            break;
        }
        consumed = true;
        match c {
            '"' => {
                quoted = !quoted;
                *i += 1;
            }
            '\\' => {
                *i += 1;
                text.push(unescape(chars, i)?);
            }
            '*' => {
                if !text.is_empty() {
                    pieces.push(Piece::Text(std::mem::take(&mut text)));
                }
                pieces.push(Piece::Star);
                *i += 1;
            }
            '?' => {
                if !text.is_empty() {
                    pieces.push(Piece::Text(std::mem::take(&mut text)));
                }
                pieces.push(Piece::Question);
                *i += 1;
            }
            '=' | '~' | '!' if !quoted => {
                return Err(format!("unexpected `{c}` in term"));
            }
            _ => {
                text.push(c);
                *i += 1;
            }
        }
    }

    if quoted {
        return Err("unterminated quoted string".into());
    }
    if !consumed {
        return Err("empty term".into());
    }
    if !text.is_empty() || pieces.is_empty() {
        pieces.push(Piece::Text(text));
    }
    Ok(pieces)
}

fn unescape(chars: &[char], i: &mut usize) -> Result<char, String> {
    let c = *chars.get(*i).ok_or("dangling escape at end of expression")?;
    *i += 1;
    match c {
        'n' => Ok('\n'),
        't' => Ok('\t'),
        'r' => Ok('\r'),
        'x' => escaped_codepoint(chars, i, 2),
        'u' => escaped_codepoint(chars, i, 4),
        c if c.is_ascii_alphanumeric() => Err(format!("bad escape `\\{c}`")),
        c => Ok(c),
    }
}

fn escaped_codepoint(chars: &[char], i: &mut usize, digits: usize) -> Result<char, String> {
    let end = *i + digits;
    if end > chars.len() {
        return Err("truncated numeric escape".into());
    }
    let hex: String = chars[*i..end].iter().collect();
    *i = end;
    let code = u32::from_str_radix(&hex, 16).map_err(|_| format!("bad escape digits `{hex}`"))?;
    char::from_u32(code).ok_or(format!("escape `{hex}` is not a character"))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn port(attrs: &[(&str, &str)]) -> PortAttributes {
        PortAttributes::new("/dev/ttyTEST0", attrs.to_vec())
    }

    fn accepts(expression: &str, attrs: &[(&str, &str)]) -> bool {
        Matcher::new(expression).unwrap().matches(&port(attrs))
    }

    #[test]
    fn empty_expression_matches_anything() {
        let m = Matcher::new("").unwrap();
        assert!(m.is_empty());
        assert!(m.matches(&port(&[])));
    }

    #[test]
    fn bare_literal_is_case_insensitive_whole_word() {
        let attrs = [("manufacturer", "Adafruit Industries")];
        assert!(accepts("adafruit", &attrs));
        assert!(accepts("ADAFRUIT", &attrs));
        assert!(accepts("industries", &attrs));
        assert!(!accepts("dafru", &attrs)); // not a whole word
        assert!(!accepts("toast", &attrs));
    }

    #[test]
    fn all_terms_must_match() {
        let attrs = [("manufacturer", "Adafruit"), ("product", "Feather")];
        assert!(accepts("adafruit feather", &attrs));
        assert!(!accepts("adafruit toast", &attrs));
    }

    #[test]
    fn wildcards_expand() {
        let attrs = [("description", "wild-card-expr")];
        assert!(accepts("wild*expr", &attrs));
        assert!(accepts("wild?card?expr", &attrs));
        assert!(!accepts("wild?expr", &attrs));
        // Escaped wildcards are literal.
        assert!(!accepts(r"wild\*expr", &attrs));
        assert!(accepts(r"wild\*expr", &[("x", "wild*expr")]));
    }

    #[test]
    fn scoped_literal_is_anchored() {
        let attrs = [("manufacturer", "Adafruit Industries")];
        assert!(accepts("manufacturer=adafruit*", &attrs));
        assert!(!accepts("manufacturer=adafruit", &attrs)); // whole value
        assert!(accepts(r"manufacturer=Adafruit\ Industries", &attrs));
        assert!(accepts(r#"manufacturer="adafruit industries""#, &attrs));
    }

    #[test]
    fn scope_abbreviates_to_unique_prefix() {
        let attrs = [("serial_number", "DF625857"), ("manufacturer", "X")];
        assert!(accepts("ser=df625857", &attrs));
        assert!(accepts("serial_number=df625857", &attrs));
        // Missing attribute never matches.
        assert!(!accepts("product=df625857", &attrs));
    }

    #[test]
    fn ambiguous_prefix_is_a_compile_error() {
        let err = Matcher::new("v=0403").unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
        let reason = err.to_string();
        assert!(reason.contains("ambiguous"), "{reason}");

        // Exact names that also prefix longer ones are fine.
        assert!(Matcher::new("vid=0403").is_ok());
        assert!(Matcher::new("pid=6001").is_ok());
    }

    #[test]
    fn regex_terms_are_case_sensitive() {
        let attrs = [
            ("manufacturer", "Adafruit"),
            ("serial_number", "DF62585783553434"),
        ];
        assert!(accepts("Adafruit serial~/^DF625/", &attrs));
        assert!(!accepts("adafruit serial~/^df625/", &attrs));
        assert!(accepts("ADAFRUIT", &attrs));
    }

    #[test]
    fn unscoped_regex_searches_every_attribute() {
        let attrs = [("hwid", "USB VID:PID=239A:80F4")];
        assert!(accepts("~/239A:80F4/", &attrs));
        assert!(!accepts("~/239a:80f4/", &attrs));
    }

    #[test]
    fn scoped_regex_is_substring_unless_anchored() {
        let attrs = [("serial_number", "DF62585783553434")];
        assert!(accepts("serial~/8578/", &attrs));
        assert!(!accepts("serial~/^8578$/", &attrs));
        assert!(accepts("serial~/^DF.*34$/", &attrs));
    }

    #[test]
    fn hex_and_decimal_are_equivalent() {
        let attrs = [("vid", "9114")];
        assert!(accepts("0x239a", &attrs));
        assert!(accepts("9114", &attrs));
        assert!(!accepts("0x0001", &attrs));

        // And the other way around.
        let attrs = [("vid_pid", "0x403:0x6001")];
        assert!(accepts("1027", &attrs));

        // Scoped numbers are whole-value.
        let attrs = [("vid", "1027")];
        assert!(accepts("vid=0x403", &attrs));
        assert!(!accepts("pid=0x403", &attrs));
    }

    #[test]
    fn negated_terms_invert() {
        let ports = [
            port(&[("a", "axx"), ("b", "xxb"), ("c", "xmidx")]),
            port(&[("a", "axx"), ("b", "bxx"), ("c", "xmidx")]),
            port(&[("a", "axx"), ("b", "xxb"), ("c", "xmadx")]),
        ];
        let matcher = Matcher::new("c=*mid* a=a* b!=*b").unwrap();
        let matched: Vec<_> = ports.iter().filter(|p| matcher.matches(p)).collect();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].get("b"), Some("bxx"));

        // Negated regexes too.
        assert!(accepts("!~/xyzzy/", &[("a", "plugh")]));
        assert!(!accepts("!~/plugh/", &[("a", "plugh")]));
    }

    #[test]
    fn quoted_runs_protect_whitespace_and_structure() {
        let attrs = [("description", "don't = panic")];
        assert!(accepts(r#""don't = panic""#, &attrs));
        assert!(accepts(r#"desc="don't = panic""#, &attrs));
        assert!(accepts(r#"don"'t = "panic"#, &attrs));
    }

    #[test]
    fn escapes_decode() {
        assert!(accepts(r"a\x2fb", &[("x", "a/b")]));
        assert!(accepts(r"a=ABC", &[("a", "abc")]));
        assert!(accepts("tab=a\\tb", &[("tab", "a\tb")]));
    }

    #[test]
    fn parse_errors() {
        for bad in [
            "\"unterminated",
            "~/unterminated",
            "serial~/unterminated",
            r"bad\escape",
            r"trailing\",
            "~/bad(regex/",
            "!",
            "a=b=c",
            "mid~dle",
        ] {
            let err = Matcher::new(bad).unwrap_err();
            assert!(matches!(err, Error::Parse { .. }), "{bad} should not parse");
        }
    }

    #[test]
    fn matching_is_pure() {
        let p = port(&[("vid", "9114"), ("manufacturer", "Adafruit")]);
        let m = Matcher::new("adafruit 0x239a").unwrap();
        for _ in 0..3 {
            assert!(m.matches(&p));
        }
    }

    #[test]
    fn literal_terms_round_trip() {
        // A canonical attribute map built from an expression's literal
        // terms is accepted by the compiled expression.
        let m = Matcher::new("manufacturer=Adafruit feather vid=9114").unwrap();
        let p = port(&[
            ("manufacturer", "Adafruit"),
            ("product", "feather"),
            ("vid", "9114"),
        ]);
        assert!(m.matches(&p));
    }

    #[test]
    fn hits_name_the_matched_keys() {
        let p = port(&[
            ("manufacturer", "Adafruit"),
            ("product", "Feather"),
            ("vid", "9114"),
        ]);
        let m = Matcher::new("adafruit vid=0x239a").unwrap();
        let hits: Vec<String> = m.hits(&p).into_iter().collect();
        assert_eq!(hits, vec!["manufacturer".to_string(), "vid".to_string()]);
    }

    #[test]
    fn filter_keeps_input_order() {
        let ports = vec![
            PortAttributes::new("/dev/ttyACM0", [("manufacturer", "Adafruit")]),
            PortAttributes::new("/dev/ttyACM1", [("manufacturer", "FTDI")]),
            PortAttributes::new("/dev/ttyACM2", [("manufacturer", "Adafruit")]),
        ];
        let m = Matcher::new("adafruit").unwrap();
        let devices: Vec<_> = m.filter(&ports).iter().map(|p| p.device()).collect();
        assert_eq!(devices, vec!["/dev/ttyACM0", "/dev/ttyACM2"]);
    }
}
