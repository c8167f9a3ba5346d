use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// `epoch:pkgver-pkgrel`, compared with the pacman version-compare algorithm
/// (epoch dominates, then `pkgver`, then `pkgrel`, segment by segment).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PkgVers {
    pub epoch: u64,
    pub pkgver: String,
    pub pkgrel: String,
}

impl PkgVers {
    pub fn new(epoch: u64, pkgver: impl Into<String>, pkgrel: impl Into<String>) -> Self {
        PkgVers {
            epoch,
            pkgver: pkgver.into(),
            pkgrel: pkgrel.into(),
        }
    }
}

impl fmt::Display for PkgVers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.epoch != 0 {
            write!(f, "{}:{}-{}", self.epoch, self.pkgver, self.pkgrel)
        } else {
            write!(f, "{}-{}", self.pkgver, self.pkgrel)
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("malformed package version string: {0:?}")]
pub struct ParsePkgVersError(String);

impl FromStr for PkgVers {
    type Err = ParsePkgVersError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (epoch, rest) = match s.split_once(':') {
            Some((epoch_str, rest)) => {
                let epoch = epoch_str
                    .parse::<u64>()
                    .map_err(|_| ParsePkgVersError(s.to_string()))?;
                (epoch, rest)
            }
            None => (0, s),
        };
        let (pkgver, pkgrel) = rest
            .rsplit_once('-')
            .ok_or_else(|| ParsePkgVersError(s.to_string()))?;
        if pkgver.is_empty() || pkgrel.is_empty() {
            return Err(ParsePkgVersError(s.to_string()));
        }
        Ok(PkgVers {
            epoch,
            pkgver: pkgver.to_string(),
            pkgrel: pkgrel.to_string(),
        })
    }
}

impl PartialEq for PkgVers {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for PkgVers {}

impl PartialOrd for PkgVers {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PkgVers {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| vercmp(&self.pkgver, &other.pkgver))
            .then_with(|| vercmp(&self.pkgrel, &other.pkgrel))
    }
}

/// Splits a version segment into alternating runs of digits and
/// non-digits, mirroring pacman's `parseEVR`/`rpmvercmp` segment walk.
fn split_segments(s: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let bytes = s.as_bytes();
    let mut start = 0;
    if bytes.is_empty() {
        return segments;
    }
    let mut is_digit = bytes[0].is_ascii_digit();
    for (i, b) in bytes.iter().enumerate().skip(1) {
        let d = b.is_ascii_digit();
        if d != is_digit {
            segments.push(&s[start..i]);
            start = i;
            is_digit = d;
        }
    }
    segments.push(&s[start..]);
    segments
}

/// Implements pacman's `alpm_pkg_vercmp` for two plain (epoch-less) version
/// strings: walk matched alphanumeric segments, numeric segments beat
/// alphabetic ones, a longer common run of leading zeros is ignored, and a
/// string with more segments wins over a prefix of itself.
pub fn vercmp(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    let segs_a = split_segments(a);
    let segs_b = split_segments(b);
    let len = segs_a.len().max(segs_b.len());

    for i in 0..len {
        let sa = segs_a.get(i).copied();
        let sb = segs_b.get(i).copied();
        match (sa, sb) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(sa), Some(sb)) => {
                let a_numeric = sa.as_bytes().first().is_some_and(u8::is_ascii_digit);
                let b_numeric = sb.as_bytes().first().is_some_and(u8::is_ascii_digit);
                match (a_numeric, b_numeric) {
                    (true, false) => return Ordering::Greater,
                    (false, true) => return Ordering::Less,
                    (true, true) => {
                        let na = sa.trim_start_matches('0');
                        let nb = sb.trim_start_matches('0');
                        let ord = na.len().cmp(&nb.len()).then_with(|| na.cmp(nb));
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    (false, false) => {
                        let ord = sa.cmp(sb);
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                }
            }
        }
    }
    Ordering::Equal
}

/// Computes the next `pkgrel` when an unchanged `pkgver` still needs a
/// rebuild: an integer pkgrel is incremented, a dotted-decimal pkgrel
/// (`"3.2"`) increments its leading segment, anything else resets to `"1"`.
pub fn next_pkgrel(pkgrel: &str) -> String {
    if let Ok(n) = pkgrel.parse::<u64>() {
        return (n + 1).to_string();
    }
    if let Some((head, _)) = pkgrel.split_once('.') {
        if let Ok(n) = head.parse::<u64>() {
            return (n + 1).to_string();
        }
    }
    "1".to_string()
}

/// Decides whether a rebuild with an unchanged `pkgver` should bump
/// `pkgrel`: only when the new `pkgrel` did not itself advance past the
/// old one under pacman's version-compare rule.
pub fn should_bump_pkgrel(old_pkgrel: &str, new_pkgrel: &str) -> bool {
    vercmp(new_pkgrel, old_pkgrel) != Ordering::Greater
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("1.0", "1.1", Ordering::Less)]
    #[case("1.1", "1.0", Ordering::Greater)]
    #[case("1.0", "1.0", Ordering::Equal)]
    #[case("1.0a", "1.0", Ordering::Less)]
    #[case("1.0a", "1.0b", Ordering::Less)]
    #[case("1.011", "1.012", Ordering::Less)]
    #[case("1.0", "1.0.0", Ordering::Less)]
    #[case("2", "10", Ordering::Less)]
    #[case("0001", "1", Ordering::Equal)]
    fn vercmp_cases(#[case] a: &str, #[case] b: &str, #[case] expected: Ordering) {
        assert_eq!(vercmp(a, b), expected);
    }

    #[test]
    fn epoch_dominates() {
        let a: PkgVers = "1:1.0-1".parse().unwrap();
        let b: PkgVers = "2.0-99".parse().unwrap();
        assert!(a > b);
    }

    #[test]
    fn parse_and_display_roundtrip() {
        let v: PkgVers = "1:1.2.3-4".parse().unwrap();
        assert_eq!(v.to_string(), "1:1.2.3-4");
        let v: PkgVers = "1.2.3-4".parse().unwrap();
        assert_eq!(v.to_string(), "1.2.3-4");
    }

    #[test]
    fn next_pkgrel_variants() {
        assert_eq!(next_pkgrel("1"), "2");
        assert_eq!(next_pkgrel("3.2"), "4");
        assert_eq!(next_pkgrel("foo"), "1");
    }

    #[test]
    fn pkgrel_bump_boundary() {
        assert!(should_bump_pkgrel("1", "1"));
        assert!(should_bump_pkgrel("2", "1"));
        assert!(!should_bump_pkgrel("1", "2"));
    }
}
