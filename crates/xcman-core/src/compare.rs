use std::cmp::Ordering;

use crate::packages::{self, is_not_installed};

/// How a package's version strings are broken into comparable components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseRule {
    /// `-` is treated as `.`, then the components are padded (or cut) to
    /// exactly `n` entries.
    PaddedDashDot(usize),
    /// The whole string is one component: its digits read as one number.
    SingleToken,
    /// Split on `.`; missing trailing components compare as zero.
    DefaultDotSplit,
}

impl ParseRule {
    #[must_use]
    pub fn for_package(package_id: &str) -> Self {
        match package_id {
            packages::XCTRACK => Self::PaddedDashDot(5),
            packages::XCGUIDE => Self::SingleToken,
            _ => Self::DefaultDotSplit,
        }
    }

    #[must_use]
    pub fn components(self, version: &str) -> Vec<u64> {
        let version = version.trim();
        match self {
            Self::PaddedDashDot(width) => {
                let mut parts: Vec<u64> =
                    version.replace('-', ".").split('.').map(component).collect();
                parts.resize(width, 0);
                parts
            }
            Self::SingleToken => vec![digits_value(version)],
            Self::DefaultDotSplit => version.split('.').map(component).collect(),
        }
    }

    /// Orders two versions under this rule. Absent components count as zero.
    #[must_use]
    pub fn compare(self, left: &str, right: &str) -> Ordering {
        let left = self.components(left);
        let right = self.components(right);
        let len = left.len().max(right.len());

        for i in 0..len {
            let l = left.get(i).copied().unwrap_or(0);
            let r = right.get(i).copied().unwrap_or(0);
            match l.cmp(&r) {
                Ordering::Equal => {}
                other => return other,
            }
        }
        Ordering::Equal
    }
}

fn component(token: &str) -> u64 {
    token.trim().parse().unwrap_or(0)
}

fn digits_value(token: &str) -> u64 {
    let digits: String = token.chars().filter(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

/// Whether `server` should replace `installed` for `package_id`.
///
/// Anything not installed is always upgradable. Equal versions are not.
#[must_use]
pub fn is_server_version_higher(installed: &str, server: &str, package_id: &str) -> bool {
    if is_not_installed(installed) {
        return true;
    }
    ParseRule::for_package(package_id).compare(server, installed) == Ordering::Greater
}

#[cfg(test)]
mod tests {
    use super::{ParseRule, is_server_version_higher};
    use crate::packages::{MANAGER, XCGUIDE, XCTRACK};

    const SAMPLES: [&str; 10] = [
        "0", "1", "2.1", "2.1.0", "0.9.11.5", "1.2-3", "10.0.0-beta", "abc", "1..2", "203",
    ];

    #[test]
    fn equal_versions_are_never_upgrades() {
        for package in [MANAGER, XCTRACK, XCGUIDE, "com.example.other"] {
            for version in SAMPLES {
                assert!(
                    !is_server_version_higher(version, version, package),
                    "{version} should not upgrade itself for {package}"
                );
            }
        }
    }

    #[test]
    fn default_rule_treats_missing_components_as_zero() {
        assert!(is_server_version_higher("2", "2.1", "other"));
        assert!(!is_server_version_higher("2.1", "2.1.0", "other"));
        assert!(!is_server_version_higher("2.1.0", "2.1", "other"));
        assert!(is_server_version_higher("1.9", "1.10", MANAGER));
        assert!(!is_server_version_higher("1.10", "1.9", MANAGER));
    }

    #[test]
    fn default_rule_does_not_split_on_dashes() {
        // "3-beta" is not numeric, so it collapses to 0.
        assert!(!is_server_version_higher("1.2.3", "1.2.3-beta", MANAGER));
        assert!(is_server_version_higher("1.2.3-beta", "1.2.3", MANAGER));
    }

    #[test]
    fn padded_rule_splits_dashes_and_pads_to_five() {
        assert!(is_server_version_higher("1.2-3", "1.2-4", XCTRACK));
        assert!(!is_server_version_higher("1.2.3.4.5", "1.2.3.4.5", XCTRACK));
        assert!(!is_server_version_higher("1.2-3", "1.2.3", XCTRACK));
        assert!(is_server_version_higher("0.9.11", "0.9.11.1", XCTRACK));
    }

    #[test]
    fn padded_rule_ignores_components_past_the_width() {
        assert_eq!(
            ParseRule::PaddedDashDot(5).components("1.2.3.4.5.6"),
            vec![1, 2, 3, 4, 5]
        );
        assert!(!is_server_version_higher("1.2.3.4.5", "1.2.3.4.5.9", XCTRACK));
    }

    #[test]
    fn single_token_rule_reads_all_digits_as_one_number() {
        assert_eq!(ParseRule::SingleToken.components("v2.05"), vec![205]);
        assert_eq!(ParseRule::SingleToken.components("beta"), vec![0]);
        assert!(is_server_version_higher("203", "204", XCGUIDE));
        assert!(!is_server_version_higher("204", "203", XCGUIDE));
    }

    #[test]
    fn non_numeric_components_count_as_zero() {
        assert_eq!(
            ParseRule::DefaultDotSplit.components("1.x.3"),
            vec![1, 0, 3]
        );
        assert!(is_server_version_higher("1.x.3", "1.1.3", "other"));
    }

    #[test]
    fn not_installed_is_always_upgradable() {
        for package in [MANAGER, XCTRACK, XCGUIDE, "other"] {
            assert!(is_server_version_higher("N/A", "0.0.1", package));
            assert!(is_server_version_higher("", "0", package));
        }
    }
}
