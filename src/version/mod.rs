//! Glob-style tag filter matching (spec §4.2).
//!
//! A filter is a literal string in which each `*` stands for a non-empty
//! run of decimal digits. The highest matching tag wins, compared as a
//! vector of the matched numeric groups (not lexicographically as strings).

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionMatchError {
    #[error("no tag matched filter {filter:?}")]
    NotFound { filter: String },
}

/// Builds an anchored regex from a `*`-wildcard filter, escaping every
/// other character and joining the literal segments with a capturing
/// digit group wherever a `*` appeared.
fn filter_to_regex(filter: &str) -> Regex {
    let parts: Vec<String> = filter.split('*').map(regex::escape).collect();
    let mut pattern = String::from("^");
    pattern.push_str(&parts.join("([0-9]+)"));
    pattern.push('$');
    Regex::new(&pattern).expect("constructed from escaped literals, always valid")
}

/// Returns the tag in `tags` whose captured numeric groups, compared as a
/// vector of integers left-to-right, are lexicographically greatest. Ties
/// (equal vectors) are broken by first occurrence.
pub fn highest<'a, I>(tags: I, filter: &str) -> Result<&'a str, VersionMatchError>
where
    I: IntoIterator<Item = &'a str>,
{
    let re = filter_to_regex(filter);

    let mut best: Option<(Vec<u64>, &'a str)> = None;
    for tag in tags {
        let Some(captures) = re.captures(tag) else {
            continue;
        };

        let mut numbers = Vec::with_capacity(captures.len().saturating_sub(1));
        let mut parse_ok = true;
        for group in captures.iter().skip(1) {
            match group.and_then(|m| m.as_str().parse::<u64>().ok()) {
                Some(n) => numbers.push(n),
                None => {
                    parse_ok = false;
                    break;
                }
            }
        }
        if !parse_ok {
            continue;
        }

        match &best {
            Some((best_numbers, _)) if *best_numbers >= numbers => {}
            _ => best = Some((numbers, tag)),
        }
    }

    best.map(|(_, tag)| tag).ok_or_else(|| VersionMatchError::NotFound {
        filter: filter.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_filter_requires_exact_match() {
        let tags = vec!["1.34", "1.34.0", "x1.34"];
        assert_eq!(highest(tags, "1.34"), Ok("1.34"));
    }

    #[test]
    fn single_wildcard_picks_highest_numeric() {
        let tags = vec!["1.34.0", "1.34.1", "1.34.10"];
        assert_eq!(highest(tags, "1.34.*"), Ok("1.34.10"));
    }

    #[test]
    fn multi_wildcard_compares_numeric_vectors_not_strings() {
        let tags = vec!["v1.0.11", "v1.0.2", "v1.0.9"];
        // Lexicographic string comparison would pick "v1.0.9"; numeric
        // vector comparison must pick "v1.0.11".
        assert_eq!(highest(tags, "v*.*.*"), Ok("v1.0.11"));
    }

    #[test]
    fn no_wildcard_ties_break_by_first_occurrence() {
        let tags = vec!["1.0", "1.0"];
        assert_eq!(highest(tags, "1.0"), Ok("1.0"));
    }

    #[test]
    fn skips_tags_that_do_not_match() {
        let tags = vec!["latest", "v1.2", ""];
        assert_eq!(highest(tags, "v*"), Ok("v1.2"));
    }

    #[test]
    fn not_found_when_nothing_matches() {
        let tags = vec!["latest", "edge"];
        assert_eq!(
            highest(tags, "v*"),
            Err(VersionMatchError::NotFound {
                filter: "v*".to_string()
            })
        );
    }

    #[test]
    fn empty_tag_list_is_not_found() {
        let tags: Vec<&str> = vec![];
        assert!(highest(tags, "*").is_err());
    }
}
