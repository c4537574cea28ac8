//! Property-based tests for configuration parsing.
//!
//! Uses proptest to verify invariants across random inputs:
//! - Boolean parsing accepts exactly the truthy spellings
//! - Property lines survive surrounding whitespace
//! - Comment lines never produce entries

// Property tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use dbkeeper::Properties;
use dbkeeper::config::parse_bool;
use proptest::prelude::*;

const TRUTHY: &[&str] = &["1", "true", "yes", "y", "on"];

proptest! {
    /// Property: truthy spellings are recognized regardless of case and padding.
    #[test]
    fn prop_truthy_values_parse_true(
        idx in 0..TRUTHY.len(),
        upper in any::<bool>(),
        pad in " {0,3}",
    ) {
        let word = if upper { TRUTHY[idx].to_uppercase() } else { TRUTHY[idx].to_string() };
        let input = format!("{pad}{word}{pad}");
        prop_assert!(parse_bool(Some(&input), false));
    }

    /// Property: anything outside the truthy set is false.
    #[test]
    fn prop_other_values_parse_false(s in "[a-z]{2,8}") {
        prop_assume!(!TRUTHY.contains(&s.as_str()));
        prop_assert!(!parse_bool(Some(&s), true));
    }

    /// Property: an absent value yields the default.
    #[test]
    fn prop_absent_value_uses_default(default in any::<bool>()) {
        prop_assert_eq!(parse_bool(None, default), default);
    }

    /// Property: keys and values are trimmed and split on the first '='.
    #[test]
    fn prop_line_is_split_and_trimmed(
        key in "[a-z][a-z0-9_.]{0,15}",
        value in "[a-zA-Z0-9=:/_.-]{0,20}",
        lpad in "[ \t]{0,3}",
        rpad in "[ \t]{0,3}",
    ) {
        let contents = format!("{lpad}{key}{rpad}={lpad}{value}{rpad}\n");
        let props = Properties::parse(&contents);
        prop_assert_eq!(props.len(), 1);
        prop_assert_eq!(props.get(&key), Some(value.trim()));
    }

    /// Property: commented lines contribute nothing.
    #[test]
    fn prop_comment_lines_ignored(body in "[a-z=. ]{0,30}", marker in prop::sample::select(vec!['#', ';'])) {
        let contents = format!("{marker}{body}\n\n");
        prop_assert!(Properties::parse(&contents).is_empty());
    }
}
