//! Safety gate: alignment collaborator plus a fixed dangerous-operation
//! deny-list.
//!
//! The deny-list is a coarse filter, not a guarantee. A false positive is
//! preferred to auto-executing something destructive, so the list is not
//! configurable per action.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Verdict returned by an alignment collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentReport {
    pub aligned: bool,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl AlignmentReport {
    pub fn aligned() -> Self {
        Self {
            aligned: true,
            score: None,
            reason: None,
        }
    }

    pub fn misaligned(reason: impl Into<String>) -> Self {
        Self {
            aligned: false,
            score: None,
            reason: Some(reason.into()),
        }
    }
}

/// Checks free text against the project's vision and mission.
#[async_trait]
pub trait AlignmentChecker: Send + Sync {
    async fn check_alignment(&self, text: &str) -> anyhow::Result<AlignmentReport>;
}

/// Named dangerous-operation patterns. Matching is case-insensitive.
const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    ("recursive force delete", r"\brm\s+-(?:[a-z]*r[a-z]*f|[a-z]*f[a-z]*r)[a-z]*\b"),
    ("drop table or database", r"\bdrop\s+(?:table|database|schema)\b"),
    ("truncate table", r"\btruncate\s+(?:table\s+)?\w+"),
    ("unqualified delete", r"\bdelete\s+from\s+\w+\s*(?:;|$)"),
    ("forced push", r"\bgit\s+push\b.*(?:--force\b|\s-f\b|--force-with-lease\b)"),
    ("hard reset", r"\bgit\s+reset\s+--hard\b"),
    ("history rewrite", r"\bgit\s+(?:filter-branch|filter-repo)\b"),
    ("filesystem format", r"\b(?:mkfs(?:\.\w+)?|format\s+[a-z]:)"),
    ("raw disk write", r"\bdd\s+if="),
    ("production data loss", r"\b(?:delete|wipe|purge|destroy)\b.*\bproduction\s+data\b"),
];

static COMPILED: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    DANGEROUS_PATTERNS
        .iter()
        .map(|(name, pattern)| {
            let re = Regex::new(&format!("(?im){}", pattern)).expect("valid regex");
            (*name, re)
        })
        .collect()
});

/// Name of the first dangerous pattern `text` matches, if any.
pub fn find_dangerous_pattern(text: &str) -> Option<&'static str> {
    COMPILED
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(name, _)| *name)
}

/// Names of every pattern in the deny-list.
pub fn dangerous_pattern_names() -> impl Iterator<Item = &'static str> {
    DANGEROUS_PATTERNS.iter().map(|(name, _)| *name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("rm -rf /var/lib/app", "recursive force delete")]
    #[test_case("RM -FR build", "recursive force delete")]
    #[test_case("DROP TABLE users;", "drop table or database")]
    #[test_case("truncate table audit_log", "truncate table")]
    #[test_case("DELETE FROM sessions;", "unqualified delete")]
    #[test_case("git push --force origin main", "forced push")]
    #[test_case("git push origin main -f", "forced push")]
    #[test_case("git reset --hard HEAD~3", "hard reset")]
    #[test_case("mkfs.ext4 /dev/sdb1", "filesystem format")]
    #[test_case("dd if=/dev/zero of=/dev/sda", "raw disk write")]
    #[test_case("wipe all production data", "production data loss")]
    fn test_dangerous_text_is_flagged(text: &str, expected: &str) {
        assert_eq!(find_dangerous_pattern(text), Some(expected));
    }

    #[test_case("rm -r target/debug")]
    #[test_case("git push origin main")]
    #[test_case("DELETE FROM sessions WHERE expired = 1;")]
    #[test_case("cargo fmt --all")]
    #[test_case("Refactor the table drop-down component")]
    fn test_benign_text_passes(text: &str) {
        assert_eq!(find_dangerous_pattern(text), None);
    }

    #[test]
    fn test_multiline_text_is_scanned() {
        let text = "Clean workspace\nremove stale files\nrm -rf ./tmp";
        assert!(find_dangerous_pattern(text).is_some());
    }

    #[test]
    fn test_all_patterns_compile() {
        assert_eq!(COMPILED.len(), dangerous_pattern_names().count());
    }
}
