//! Dotted numeric version ordering.
//!
//! Release tags look like `v25.10.20.3`; built artifacts drop the leading
//! `v`. Components that fail to parse count as zero, and a shorter version
//! is padded with zeros before comparing.

use std::cmp::Ordering;

/// File name of the built artifact for a release tag.
pub fn binary_name(version: &str) -> &str {
    version.strip_prefix('v').unwrap_or(version)
}

fn components(version: &str) -> Vec<u64> {
    binary_name(version)
        .split('.')
        .map(|part| part.parse().unwrap_or(0))
        .collect()
}

/// Numeric component-wise comparison.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (a, b) = (components(a), components(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let left = a.get(i).copied().unwrap_or(0);
        let right = b.get(i).copied().unwrap_or(0);
        match left.cmp(&right) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Pick the highest version from a set of candidates. On ties the first
/// candidate seen wins.
pub fn newest_version<'a, I>(candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<&'a str> = None;
    for candidate in candidates {
        match best {
            Some(current) if compare_versions(candidate, current) != Ordering::Greater => {}
            _ => best = Some(candidate),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_leading_v() {
        assert_eq!(binary_name("v1.2.3"), "1.2.3");
        assert_eq!(binary_name("1.2.3"), "1.2.3");
    }

    #[test]
    fn numeric_not_lexical() {
        assert_eq!(compare_versions("1.10.0", "1.9.0"), Ordering::Greater);
        assert_eq!(compare_versions("v2", "1.99.99"), Ordering::Greater);
    }

    #[test]
    fn missing_components_are_zero() {
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.2", "1.2.1"), Ordering::Less);
    }

    #[test]
    fn garbage_components_are_zero() {
        assert_eq!(compare_versions("1.x.3", "1.0.3"), Ordering::Equal);
    }

    #[test]
    fn newest_picks_max() {
        let names = ["25.10.20.3", "25.9.30.1", "25.10.20.12", "25.10.2"];
        assert_eq!(newest_version(names), Some("25.10.20.12"));
    }

    #[test]
    fn newest_of_empty_is_none() {
        assert_eq!(newest_version(std::iter::empty()), None);
    }
}
