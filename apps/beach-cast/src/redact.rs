//! Privacy transforms applied to everything a terminal sends to viewers.
//!
//! Both functions are pure and total over any input, and both are idempotent.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

const MASK: char = '*';

/// Bare prompt markers a shell leaves behind once a command finishes.
const PROMPT_MARKERS: &[&str] = &["%", "$", "#", ">", "❯"];

struct Rule {
    name: &'static str,
    pattern: Regex,
    /// Capture group holding the secret; 0 masks the whole match.
    group: usize,
}

static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    [
        ("github-token", r"gh[pousr]_[A-Za-z0-9]{36,}", 0),
        ("github-fine-grained", r"github_pat_[A-Za-z0-9_]{22,}", 0),
        ("provider-key", r"sk-[A-Za-z0-9_\-]{20,}", 0),
        ("stripe-key", r"(?:sk|rk|pk)_(?:live|test)_[A-Za-z0-9]{16,}", 0),
        ("aws-access-key", r"(?:AKIA|ASIA)[0-9A-Z]{16}", 0),
        ("slack-token", r"xox[abposr]-[A-Za-z0-9\-]{10,}", 0),
        ("google-api-key", r"AIza[0-9A-Za-z_\-]{35}", 0),
        ("npm-token", r"npm_[A-Za-z0-9]{36,}", 0),
        (
            "jwt",
            r"eyJ[A-Za-z0-9_\-]{8,}\.[A-Za-z0-9_\-]{8,}\.[A-Za-z0-9_\-]{8,}",
            0,
        ),
        ("bearer", r"((?i:bearer)[ \t]+)([A-Za-z0-9\-._~+/]{20,}=*)", 2),
    ]
    .into_iter()
    .map(|(name, pattern, group)| Rule {
        name,
        pattern: Regex::new(pattern)
            .unwrap_or_else(|err| panic!("redaction rule {name} is invalid: {err}")),
        group,
    })
    .collect()
});

static CONTROL_SEQUENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .unwrap_or_else(|err| panic!("control sequence pattern is invalid: {err}"))
});

/// Masks every known credential shape with an equal-length run of `*`.
pub fn redact_secrets(text: &str) -> String {
    let mut current = Cow::Borrowed(text);
    for rule in RULES.iter() {
        if !rule.pattern.is_match(&current) {
            continue;
        }
        tracing::trace!(target: "beach_cast::redact", rule = rule.name, "masking credential");
        let replaced = rule
            .pattern
            .replace_all(&current, |caps: &Captures<'_>| mask_capture(caps, rule.group))
            .into_owned();
        current = Cow::Owned(replaced);
    }
    current.into_owned()
}

fn mask_capture(caps: &Captures<'_>, group: usize) -> String {
    let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
    let Some(secret) = caps.get(group) else {
        return whole.to_owned();
    };
    let start = secret.start() - caps.get(0).map(|m| m.start()).unwrap_or_default();
    let mut out = String::with_capacity(whole.len());
    out.push_str(&whole[..start]);
    out.extend(std::iter::repeat_n(MASK, secret.as_str().chars().count()));
    out.push_str(&whole[start + secret.as_str().len()..]);
    out
}

/// Drops trailing lines that hold nothing but a prompt marker.
///
/// Returns the input untouched when its last line is not a bare prompt.
pub fn strip_trailing_prompt_line(text: &str) -> Cow<'_, str> {
    let mut current = text;
    let mut stripped = false;
    loop {
        let body = strip_line_terminator(current);
        let (head, last) = match body.rfind('\n') {
            Some(idx) => (&body[..idx], &body[idx + 1..]),
            None => ("", body),
        };
        let visible = CONTROL_SEQUENCE.replace_all(last, "");
        if !PROMPT_MARKERS.contains(&visible.trim()) {
            break;
        }
        current = head.trim_end();
        stripped = true;
        if current.is_empty() {
            break;
        }
    }
    if stripped {
        Cow::Borrowed(current)
    } else {
        Cow::Borrowed(text)
    }
}

fn strip_line_terminator(text: &str) -> &str {
    text.strip_suffix("\r\n")
        .or_else(|| text.strip_suffix('\n'))
        .or_else(|| text.strip_suffix('\r'))
        .unwrap_or(text)
}
