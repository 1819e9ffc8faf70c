//! The filter tree evaluated against a trace point.
//!
//! Matchers are pure and thread-safe; `And`/`Or` short-circuit
//! left-to-right, `Not` inverts. Pattern matchers are case-sensitive;
//! literal and wildcard modes are anchored (full match), substring mode
//! matches anywhere.

use std::collections::HashMap;

use spoor_types::TracePointKind;

/// The fields a filter can look at, borrowed from the call site and the
/// process identity.
#[derive(Debug, Clone, Copy)]
pub struct PointFields<'a> {
    pub kind: TracePointKind,
    pub verbosity: u32,
    pub path: &'a str,
    pub function: &'a str,
    pub key: Option<&'a str>,
    pub process_name: &'a str,
}

/// Key enablement from the configuration's `<tracekeys>` block.
/// Keys not mentioned there are enabled by default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceKeys {
    states: HashMap<String, bool>,
}

impl TraceKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, enabled: bool) {
        self.states.insert(key.into(), enabled);
    }

    pub fn is_enabled(&self, key: &str) -> bool {
        self.states.get(key).copied().unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Exact(String),
    Contains(String),
    Wildcard(String),
}

impl Pattern {
    pub fn matches(&self, text: &str) -> bool {
        match self {
            Self::Exact(p) => p == text,
            Self::Contains(p) => text.contains(p.as_str()),
            Self::Wildcard(p) => wildcard_match(p, text),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Any,
    None,
    /// Matches when the point carries this key and the key is enabled.
    Group(String),
    ProcessName(Pattern),
    FunctionName(Pattern),
    Path(Pattern),
    VerbosityAtMost(u32),
    Kind(Vec<TracePointKind>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn matches(&self, point: &PointFields<'_>, keys: &TraceKeys) -> bool {
        match self {
            Self::Any => true,
            Self::None => false,
            Self::Group(name) => point.key == Some(name.as_str()) && keys.is_enabled(name),
            Self::ProcessName(pattern) => pattern.matches(point.process_name),
            Self::FunctionName(pattern) => pattern.matches(point.function),
            Self::Path(pattern) => pattern.matches(point.path),
            Self::VerbosityAtMost(max) => point.verbosity <= *max,
            Self::Kind(kinds) => kinds.contains(&point.kind),
            Self::And(children) => children.iter().all(|child| child.matches(point, keys)),
            Self::Or(children) => children.iter().any(|child| child.matches(point, keys)),
            Self::Not(child) => !child.matches(point, keys),
        }
    }
}

/// Anchored glob match: `*` is any run of characters, `?` any single
/// character. Iterative with star backtracking; no allocation beyond the
/// char buffers.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            // Give the last star one more character.
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point<'a>(path: &'a str, function: &'a str) -> PointFields<'a> {
        PointFields {
            kind: TracePointKind::Log,
            verbosity: 1,
            path,
            function,
            key: None,
            process_name: "hello_instrumented",
        }
    }

    #[test]
    fn wildcard_semantics() {
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("main.?pp", "main.cpp"));
        assert!(wildcard_match("src/*.rs", "src/lib.rs"));
        assert!(wildcard_match("*net*", "spoor::net::connect"));
        assert!(!wildcard_match("main.cpp", "main.cpp.bak"));
        assert!(!wildcard_match("?", ""));
        assert!(wildcard_match("a*b*c", "a-x-b-y-c"));
        assert!(!wildcard_match("a*b*c", "a-x-b-y"));
    }

    #[test]
    fn empty_pattern_matches_empty_field() {
        assert!(Pattern::Exact(String::new()).matches(""));
        assert!(Pattern::Wildcard(String::new()).matches(""));
        assert!(!Pattern::Exact(String::new()).matches("x"));
    }

    #[test]
    fn and_or_not_combine() {
        let keys = TraceKeys::new();
        let filter = Filter::And(vec![
            Filter::Path(Pattern::Exact("main.cpp".into())),
            Filter::Not(Box::new(Filter::Kind(vec![TracePointKind::Error]))),
        ]);
        assert!(filter.matches(&point("main.cpp", "int main()"), &keys));
        assert!(!filter.matches(&point("other.cpp", "int main()"), &keys));

        let either = Filter::Or(vec![
            Filter::Path(Pattern::Exact("a.rs".into())),
            Filter::Path(Pattern::Exact("b.rs".into())),
        ]);
        assert!(either.matches(&point("b.rs", "f"), &keys));
        assert!(!either.matches(&point("c.rs", "f"), &keys));
    }

    #[test]
    fn verbosity_filter_admits_at_most() {
        let keys = TraceKeys::new();
        let filter = Filter::VerbosityAtMost(2);
        let mut fields = point("main.cpp", "f");
        fields.verbosity = 2;
        assert!(filter.matches(&fields, &keys));
        fields.verbosity = 3;
        assert!(!filter.matches(&fields, &keys));
    }

    #[test]
    fn group_filter_consults_key_enablement() {
        let mut keys = TraceKeys::new();
        keys.set("rendering", false);

        let filter = Filter::Group("rendering".into());
        let mut fields = point("main.cpp", "f");
        fields.key = Some("rendering");
        assert!(!filter.matches(&fields, &keys), "disabled key must veto");

        keys.set("rendering", true);
        assert!(filter.matches(&fields, &keys));

        fields.key = None;
        assert!(!filter.matches(&fields, &keys), "key-less point never joins a group");
    }

    #[test]
    fn unlisted_keys_default_to_enabled() {
        let keys = TraceKeys::new();
        let filter = Filter::Group("io".into());
        let mut fields = point("main.cpp", "f");
        fields.key = Some("io");
        assert!(filter.matches(&fields, &keys));
    }
}
