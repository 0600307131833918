//! Label matcher evaluation.
//!
//! Matchers are compiled once per tree load. Regex patterns go through a
//! [`RegexCache`] so the same pattern string is compiled once and shared by
//! every route (and every later tree version) that uses it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use tracing::debug;

use crate::error::{Result, RoutingError};
use crate::schema::{MatchType, Matcher};
use crate::types::LabelSet;

/// Shared cache of compiled regex patterns, keyed by pattern string.
#[derive(Debug, Default, Clone)]
pub struct RegexCache {
    patterns: Arc<RwLock<HashMap<String, Arc<Regex>>>>,
}

impl RegexCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the compiled pattern, compiling it on first use.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::Config` if the pattern is not a valid regex.
    pub fn get_or_compile(&self, pattern: &str) -> Result<Arc<Regex>> {
        if let Some(regex) = self.patterns.read().get(pattern) {
            return Ok(Arc::clone(regex));
        }

        let regex = Regex::new(pattern)
            .map_err(|e| RoutingError::config(format!("invalid regex {pattern:?}: {e}")))?;
        let regex = Arc::new(regex);

        let mut patterns = self.patterns.write();
        let entry = patterns
            .entry(pattern.to_string())
            .or_insert_with(|| Arc::clone(&regex));
        debug!(pattern, "compiled matcher regex");
        Ok(Arc::clone(entry))
    }

    /// Number of distinct patterns compiled so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.read().len()
    }

    /// Returns true if nothing has been compiled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.read().is_empty()
    }
}

/// A validated matcher ready for evaluation.
#[derive(Debug, Clone)]
pub struct CompiledMatcher {
    label: String,
    match_type: MatchType,
    value: String,
    regex: Option<Arc<Regex>>,
}

impl CompiledMatcher {
    /// Compiles a wire matcher.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::Config` if the label name is empty or the regex
    /// pattern does not compile.
    pub fn compile(matcher: &Matcher, cache: &RegexCache) -> Result<Self> {
        if matcher.label.is_empty() {
            return Err(RoutingError::config(format!(
                "matcher {matcher} has an empty label name"
            )));
        }

        let regex = if matcher.match_type.is_regex() {
            Some(cache.get_or_compile(&matcher.value)?)
        } else {
            None
        };

        Ok(Self {
            label: matcher.label.clone(),
            match_type: matcher.match_type,
            value: matcher.value.clone(),
            regex,
        })
    }

    /// Label name this matcher tests.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Operator.
    #[must_use]
    pub const fn match_type(&self) -> MatchType {
        self.match_type
    }

    /// Literal value or regex pattern.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Tests the matcher against a label set. A missing label compares as `""`.
    #[must_use]
    pub fn matches(&self, labels: &LabelSet) -> bool {
        let actual = labels.get(&self.label).map_or("", String::as_str);
        match (self.match_type, &self.regex) {
            (MatchType::Equal, _) => actual == self.value,
            (MatchType::NotEqual, _) => actual != self.value,
            (MatchType::Regex, Some(re)) => re.is_match(actual),
            (MatchType::NotRegex, Some(re)) => !re.is_match(actual),
            // compile() always attaches a regex to the regex operators
            (MatchType::Regex | MatchType::NotRegex, None) => false,
        }
    }
}

/// Evaluates a conjunction of matchers. An empty list always matches.
#[must_use]
pub fn matches_all(matchers: &[CompiledMatcher], labels: &LabelSet) -> bool {
    matchers.iter().all(|m| m.matches(labels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::labels;
    use test_case::test_case;

    fn compile(matcher: &Matcher) -> CompiledMatcher {
        CompiledMatcher::compile(matcher, &RegexCache::new()).unwrap()
    }

    #[test_case(Matcher::eq("team", "db"), true ; "equal hit")]
    #[test_case(Matcher::eq("team", "web"), false ; "equal miss")]
    #[test_case(Matcher::ne("team", "web"), true ; "not equal hit")]
    #[test_case(Matcher::ne("team", "db"), false ; "not equal miss")]
    #[test_case(Matcher::re("team", "d"), true ; "regex is unanchored")]
    #[test_case(Matcher::re("team", "^d$"), false ; "regex honours anchors")]
    #[test_case(Matcher::re("team", "db|web"), true ; "regex alternation")]
    #[test_case(Matcher::not_re("team", "^web"), true ; "negated regex hit")]
    #[test_case(Matcher::not_re("team", "b"), false ; "negated regex miss")]
    fn evaluates_against_present_label(matcher: Matcher, expected: bool) {
        let set = labels([("team", "db"), ("severity", "critical")]);
        assert_eq!(compile(&matcher).matches(&set), expected);
    }

    #[test_case(Matcher::ne("team", "x"), true ; "not equal is true when absent")]
    #[test_case(Matcher::eq("team", ""), true ; "equal empty is true when absent")]
    #[test_case(Matcher::eq("team", "x"), false ; "equal value is false when absent")]
    #[test_case(Matcher::re("team", "^$"), true ; "regex empty matches absent")]
    #[test_case(Matcher::re("team", ".+"), false ; "regex non empty misses absent")]
    #[test_case(Matcher::not_re("team", ".+"), true ; "negated regex on absent")]
    fn missing_label_is_empty_string(matcher: Matcher, expected: bool) {
        let set = labels([("severity", "critical")]);
        assert_eq!(compile(&matcher).matches(&set), expected);
    }

    mod compile_tests {
        use super::*;

        #[test]
        fn invalid_regex_is_config_error() {
            let result = CompiledMatcher::compile(&Matcher::re("team", "(unclosed"), &RegexCache::new());
            match result {
                Err(RoutingError::Config { reason }) => assert!(reason.contains("invalid regex")),
                other => panic!("expected Config error, got {other:?}"),
            }
        }

        #[test]
        fn empty_label_is_config_error() {
            let result = CompiledMatcher::compile(&Matcher::eq("", "x"), &RegexCache::new());
            assert!(matches!(result, Err(RoutingError::Config { .. })));
        }

        #[test]
        fn equal_operator_does_not_touch_cache() {
            let cache = RegexCache::new();
            CompiledMatcher::compile(&Matcher::eq("a", "(not a regex"), &cache).unwrap();
            assert!(cache.is_empty());
        }
    }

    mod cache_tests {
        use super::*;

        #[test]
        fn same_pattern_is_compiled_once() {
            let cache = RegexCache::new();
            let a = CompiledMatcher::compile(&Matcher::re("a", "x.*"), &cache).unwrap();
            let b = CompiledMatcher::compile(&Matcher::not_re("b", "x.*"), &cache).unwrap();
            assert_eq!(cache.len(), 1);
            assert!(Arc::ptr_eq(
                a.regex.as_ref().unwrap(),
                b.regex.as_ref().unwrap()
            ));
        }

        #[test]
        fn distinct_patterns_are_cached_separately() {
            let cache = RegexCache::new();
            cache.get_or_compile("a").unwrap();
            cache.get_or_compile("b").unwrap();
            cache.get_or_compile("a").unwrap();
            assert_eq!(cache.len(), 2);
        }

        #[test]
        fn failed_pattern_is_not_cached() {
            let cache = RegexCache::new();
            assert!(cache.get_or_compile("[").is_err());
            assert!(cache.is_empty());
        }
    }

    #[test]
    fn conjunction() {
        let cache = RegexCache::new();
        let matchers = vec![
            CompiledMatcher::compile(&Matcher::eq("team", "db"), &cache).unwrap(),
            CompiledMatcher::compile(&Matcher::re("severity", "crit"), &cache).unwrap(),
        ];
        assert!(matches_all(&matchers, &labels([("team", "db"), ("severity", "critical")])));
        assert!(!matches_all(&matchers, &labels([("team", "db"), ("severity", "warning")])));
        assert!(matches_all(&[], &labels([])));
    }
}
