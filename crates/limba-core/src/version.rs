//! Version string comparison.
//!
//! One canonical rpm/deb-style segment comparison used by every component
//! that needs to order versions: the resolver, the foundations catalog and
//! the launcher's kernel check.

use std::cmp::Ordering;

/// Compare two version strings segment-wise.
///
/// The strings are walked as alternating runs of digits and letters, with
/// any other characters acting as separators. Numeric runs compare as
/// numbers (leading zeros ignored), alphabetic runs lexicographically, and
/// a numeric run always sorts above an alphabetic one. When one string runs
/// out of segments the longer one wins.
///
/// ```
/// use std::cmp::Ordering;
/// assert_eq!(limba_core::version::compare("1.2.3", "1.2.4"), Ordering::Less);
/// assert_eq!(limba_core::version::compare("1.10", "1.9"), Ordering::Greater);
/// assert_eq!(limba_core::version::compare("1.0", "1.0"), Ordering::Equal);
/// ```
#[must_use]
pub fn compare(a: &str, b: &str) -> Ordering {
    let mut left = a.as_bytes();
    let mut right = b.as_bytes();

    loop {
        left = skip_separators(left);
        right = skip_separators(right);

        if left.is_empty() || right.is_empty() {
            break;
        }

        let (l_seg, l_rest, l_numeric) = take_segment(left);
        let (r_seg, r_rest, r_numeric) = take_segment(right);

        // A numeric segment is always newer than an alphabetic one.
        if l_numeric != r_numeric {
            return if l_numeric { Ordering::Greater } else { Ordering::Less };
        }

        let ord = if l_numeric {
            compare_numeric(l_seg, r_seg)
        } else {
            l_seg.cmp(r_seg)
        };
        if ord != Ordering::Equal {
            return ord;
        }

        left = l_rest;
        right = r_rest;
    }

    match (left.is_empty(), right.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => Ordering::Equal,
    }
}

fn skip_separators(s: &[u8]) -> &[u8] {
    let start = s
        .iter()
        .position(|c| c.is_ascii_alphanumeric())
        .unwrap_or(s.len());
    &s[start..]
}

fn take_segment(s: &[u8]) -> (&[u8], &[u8], bool) {
    let numeric = s[0].is_ascii_digit();
    let end = s
        .iter()
        .position(|c| {
            if numeric {
                !c.is_ascii_digit()
            } else {
                !c.is_ascii_alphabetic()
            }
        })
        .unwrap_or(s.len());
    (&s[..end], &s[end..], numeric)
}

fn compare_numeric(a: &[u8], b: &[u8]) -> Ordering {
    let a = strip_leading_zeros(a);
    let b = strip_leading_zeros(b);
    // The longer run of digits is the larger number.
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn strip_leading_zeros(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|&c| c != b'0').unwrap_or(s.len());
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_ordering() {
        assert_eq!(compare("1.0", "1.0"), Ordering::Equal);
        assert_eq!(compare("1.0", "2.0"), Ordering::Less);
        assert_eq!(compare("2.0", "1.9.9"), Ordering::Greater);
    }

    #[test]
    fn test_numeric_not_lexicographic() {
        assert_eq!(compare("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare("1.002", "1.2"), Ordering::Equal);
    }

    #[test]
    fn test_missing_segments() {
        assert_eq!(compare("1.0", "1.0.1"), Ordering::Less);
        assert_eq!(compare("1.0.0", "1.0"), Ordering::Greater);
    }

    #[test]
    fn test_alpha_segments() {
        assert_eq!(compare("1.0alpha", "1.0beta"), Ordering::Less);
        // "1.0.1" has a numeric segment where "1.0alpha" has letters
        assert_eq!(compare("1.0.1", "1.0alpha"), Ordering::Greater);
    }

    #[test]
    fn test_separator_noise() {
        assert_eq!(compare("1_0-2", "1.0.2"), Ordering::Equal);
    }

    #[test]
    fn test_kernel_release_strings() {
        assert_eq!(compare("4.0", "3.19.8-generic"), Ordering::Greater);
        assert_eq!(compare("4.0", "4.4.0-116-generic"), Ordering::Less);
    }
}
