//! Ordered include/exclude matching over VCS remote URLs.
//!
//! Rule text is one rule per line, `+:<pattern>` to include and `-:<pattern>`
//! to exclude. Rules are evaluated in declaration order and the first pattern
//! contained in the URL decides.

use std::fmt;

use serde::{Deserialize, Serialize};

const INCLUDE_PREFIX: &str = "+:";
const EXCLUDE_PREFIX: &str = "-:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Qualifier {
    Include,
    Exclude,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Included,
    Excluded,
    Undecided,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Included => f.pad("included"),
            Classification::Excluded => f.pad("excluded"),
            Classification::Undecided => f.pad("undecided"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcsFilterRule {
    pub qualifier: Qualifier,
    pub pattern: String,
}

impl VcsFilterRule {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (qualifier, pattern) = if let Some(rest) = line.strip_prefix(INCLUDE_PREFIX) {
            (Qualifier::Include, rest)
        } else if let Some(rest) = line.strip_prefix(EXCLUDE_PREFIX) {
            (Qualifier::Exclude, rest)
        } else {
            return None;
        };

        let pattern = pattern.trim();
        if pattern.is_empty() {
            return None;
        }
        Some(Self {
            qualifier,
            pattern: pattern.to_string(),
        })
    }

    fn matches(&self, url: &str) -> bool {
        url.contains(&self.pattern)
    }
}

/// Parsed filter. Serializes as its source text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct RepositoryFilter {
    source: String,
    rules: Vec<VcsFilterRule>,
}

impl RepositoryFilter {
    /// Parse newline-separated rules. Blank and malformed lines are skipped.
    pub fn parse(text: &str) -> Self {
        let rules = text.lines().filter_map(VcsFilterRule::parse).collect();
        Self {
            source: text.to_string(),
            rules,
        }
    }

    pub fn rules(&self) -> &[VcsFilterRule] {
        &self.rules
    }

    /// True when no rules were configured.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn classify(&self, url: &str) -> Classification {
        if self.rules.is_empty() {
            return Classification::Included;
        }
        self.rules
            .iter()
            .find(|rule| rule.matches(url))
            .map(|rule| match rule.qualifier {
                Qualifier::Include => Classification::Included,
                Qualifier::Exclude => Classification::Excluded,
            })
            .unwrap_or(Classification::Undecided)
    }

    /// Decide for a build with several remote URL candidates.
    ///
    /// A candidate without a URL enables injection. Otherwise the first
    /// candidate that is not undecided wins; if none decides, injection is
    /// off for the build.
    pub fn is_enabled_for_remotes(&self, remotes: &[Option<&str>]) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        for remote in remotes {
            let Some(url) = remote else {
                return true;
            };
            match self.classify(url) {
                Classification::Included => return true,
                Classification::Excluded => return false,
                Classification::Undecided => continue,
            }
        }
        false
    }
}

impl From<String> for RepositoryFilter {
    fn from(text: String) -> Self {
        Self::parse(&text)
    }
}

impl From<RepositoryFilter> for String {
    fn from(filter: RepositoryFilter) -> Self {
        filter.source
    }
}
