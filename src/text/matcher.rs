//! Pattern templates with randomized placeholders
//!
//! A template such as `/news/%5fn/%8l.html` renders to a fresh random string
//! on every call, and compiles to a predicate that accepts (or rejects) every
//! string the template can render.
//!
//! Placeholders have the form `%[N[f]]X`:
//!
//! | token | rendered as |
//! |---|---|
//! | `%Nfn` `%Nfc` `%Nfu` `%Nfl` `%Nfs` | exactly N digits / letters / upper / lower / alphanumerics |
//! | `%Nn` `%Nc` `%Nu` `%Nl` `%Ns` | 1 to N characters of the same classes |
//! | `%Nfd` `%Nfh` | the number N in decimal / hex |
//! | `%Nd` `%Nh` | a random number below N in decimal / hex |
//! | `%d` `%h` | a random `u32` in decimal / hex |

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"%(\d+f?)?[dhcsuln]").expect("placeholder expression is valid"));

const DIGITS: &[u8] = b"0123456789";
const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const ALNUM: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// A template string containing placeholders
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Matcher(String);

/// Predicate compiled from a [`Matcher`]
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Matches nothing (empty template)
    Never,
    /// Matches everything except this exact string
    NotEqual(String),
    /// Anchored expression
    Regex(Regex),
}

/// One parsed placeholder occurrence
struct Token {
    start: usize,
    end: usize,
    kind: char,
    fixed: bool,
    /// Numeric argument; `None` when absent or unparsable
    value: Option<usize>,
}

impl Matcher {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    /// The template without any replacement
    pub fn raw(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn tokens(&self) -> Vec<Token> {
        TOKEN
            .captures_iter(&self.0)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let kind = self.0[whole.start()..whole.end()].chars().last()?;
                let (fixed, value) = match caps.get(1) {
                    Some(num) => {
                        let text = num.as_str();
                        let digits = text.trim_end_matches('f');
                        (text.ends_with('f'), digits.parse::<usize>().ok())
                    }
                    None => (false, None),
                };
                Some(Token {
                    start: whole.start(),
                    end: whole.end(),
                    kind,
                    fixed,
                    value,
                })
            })
            .collect()
    }

    /// Fill every placeholder with random content
    pub fn render(&self) -> String {
        let tokens = self.tokens();
        if tokens.is_empty() {
            return self.0.clone();
        }
        let mut out = String::with_capacity(self.0.len() * 2);
        let mut last = 0;
        for token in &tokens {
            out.push_str(&self.0[last..token.start]);
            out.push_str(&self.render_token(token));
            last = token.end;
        }
        out.push_str(&self.0[last..]);
        out
    }

    fn render_token(&self, token: &Token) -> String {
        let class = class_of(token.kind);
        match (token.kind, token.fixed, token.value) {
            ('n' | 'c' | 'u' | 'l' | 's', true, Some(v)) if v > 0 => random_string(class, v),
            ('d', true, Some(v)) => v.to_string(),
            ('h', true, Some(v)) => format!("{:x}", v),
            ('d', false, Some(v)) => below(v).to_string(),
            ('h', false, Some(v)) => format!("{:x}", below(v)),
            ('n' | 'c' | 'u' | 'l' | 's', false, Some(v)) if v > 0 => {
                random_string(class, rand::random_range(1..=v))
            }
            ('d', _, _) => rand::random::<u32>().to_string(),
            ('h', _, _) => format!("{:x}", rand::random::<u32>()),
            _ => self.0[token.start..token.end].to_string(),
        }
    }

    /// Predicate accepting every string [`Matcher::render`] can produce
    pub fn matches(&self) -> Pattern {
        self.compile(true)
    }

    /// Predicate rejecting every string [`Matcher::render`] can produce
    pub fn unmatches(&self) -> Pattern {
        self.compile(false)
    }

    /// Compile into an accepting (`want_match`) or rejecting predicate
    pub fn compile(&self, want_match: bool) -> Pattern {
        if self.0.is_empty() {
            return Pattern::Never;
        }
        let tokens = self.tokens();
        if tokens.is_empty() {
            if !want_match {
                return Pattern::NotEqual(self.0.clone());
            }
            return Regex::new(&format!("^({})$", regex::escape(&self.0)))
                .map(Pattern::Regex)
                .unwrap_or(Pattern::Never);
        }

        let negate = if want_match { "" } else { "^" };
        let mut expr = String::from("^(");
        let mut last = 0;
        for token in &tokens {
            expr.push_str(&regex::escape(&self.0[last..token.start]));
            let set = set_of(token.kind);
            let part = match (token.kind, token.fixed, token.value) {
                ('d' | 'h', _, _) => format!("([{}{}]+)", negate, set),
                ('n' | 'c' | 'u' | 'l' | 's', true, Some(v)) if v > 0 => {
                    format!("([{}{}]{{{}}})", negate, set, v)
                }
                ('n' | 'c' | 'u' | 'l' | 's', false, Some(v)) if v > 0 => {
                    format!("([{}{}]{{1,{}}})", negate, set, v)
                }
                _ => regex::escape(&self.0[token.start..token.end]),
            };
            expr.push_str(&part);
            last = token.end;
        }
        expr.push_str(&regex::escape(&self.0[last..]));
        expr.push_str(")$");

        Regex::new(&expr)
            .map(Pattern::Regex)
            .unwrap_or(Pattern::Never)
    }
}

impl From<&str> for Matcher {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Matcher {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Pattern {
    pub fn is_match(&self, value: &str) -> bool {
        match self {
            Pattern::Never => false,
            Pattern::NotEqual(s) => s != value,
            Pattern::Regex(r) => r.is_match(value),
        }
    }
}

fn class_of(kind: char) -> &'static [u8] {
    match kind {
        'n' => DIGITS,
        'c' => LETTERS,
        'u' => UPPER,
        'l' => LOWER,
        _ => ALNUM,
    }
}

fn set_of(kind: char) -> &'static str {
    match kind {
        'd' | 'n' => "0-9",
        'h' => "a-fA-F0-9",
        'c' => "a-zA-Z",
        'u' => "A-Z",
        'l' => "a-z",
        _ => "a-zA-Z0-9",
    }
}

fn below(bound: usize) -> usize {
    if bound == 0 {
        0
    } else {
        rand::random_range(0..bound)
    }
}

fn random_string(class: &[u8], len: usize) -> String {
    (0..len)
        .map(|_| class[rand::random_range(0..class.len())] as char)
        .collect()
}
