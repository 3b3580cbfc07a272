//! Merge/strip engine for space-delimited options strings.

use std::fmt;

use super::property::PropertyKey;

const DELIMITER: char = ' ';

/// Edits an options string, touching only tokens that mention one of its
/// owned keys.
///
/// Splitting is on a literal single space. Runs of spaces produce empty
/// tokens which are carried through unchanged, so foreign content keeps its
/// exact spacing.
#[derive(Debug, Clone)]
pub struct OptionsEditor {
    keys: Vec<PropertyKey>,
}

impl OptionsEditor {
    pub fn new(keys: &[PropertyKey]) -> Self {
        Self {
            keys: keys.to_vec(),
        }
    }

    pub fn keys(&self) -> &[PropertyKey] {
        &self.keys
    }

    /// Drop any owned tokens already present, then append `additions`.
    ///
    /// Re-merging the same additions therefore yields the same string.
    pub fn merge<T: fmt::Display>(&self, current: Option<&str>, additions: &[T]) -> String {
        let rendered = additions
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");

        match current.and_then(|c| self.filter(c, &[])) {
            Some(kept) if !rendered.is_empty() => format!("{kept}{DELIMITER}{rendered}"),
            Some(kept) => kept,
            None => rendered,
        }
    }

    /// Remove owned tokens, except those whose key is listed in `keep`.
    ///
    /// Returns `None` when `current` is empty, when any required key is
    /// missing (the string was not written by us), or when nothing remains.
    pub fn strip(&self, current: Option<&str>, keep: &[&str]) -> Option<String> {
        let current = current.filter(|c| !c.is_empty())?;
        if !self.is_managed(current) {
            return None;
        }
        self.filter(current, keep)
    }

    /// True when every required key occurs somewhere in `current`.
    pub fn is_managed(&self, current: &str) -> bool {
        !current.is_empty()
            && self
                .keys
                .iter()
                .filter(|k| k.required)
                .all(|k| current.contains(k.name))
    }

    fn filter(&self, current: &str, keep: &[&str]) -> Option<String> {
        let stripping: Vec<&str> = self
            .keys
            .iter()
            .map(|k| k.name)
            .filter(|name| !keep.contains(name))
            .collect();

        let kept = current
            .split(DELIMITER)
            .filter(|token| !stripping.iter().any(|name| token.contains(name)))
            .collect::<Vec<_>>()
            .join(" ");

        let kept = kept.trim();
        if kept.is_empty() {
            None
        } else {
            Some(kept.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::SystemProperty;

    fn editor() -> OptionsEditor {
        OptionsEditor::new(&[PropertyKey::required("a"), PropertyKey::optional("b")])
    }

    fn props() -> Vec<SystemProperty> {
        vec![SystemProperty::new("a", "1"), SystemProperty::new("b", "2")]
    }

    #[test]
    fn merge_into_absent() {
        assert_eq!(editor().merge(None, &props()), "-Da=1 -Db=2");
        assert_eq!(editor().merge(Some(""), &props()), "-Da=1 -Db=2");
    }

    #[test]
    fn merge_appends_after_foreign_tokens() {
        let merged = editor().merge(Some("-Xmx2g -Dforeign=x"), &props());
        assert_eq!(merged, "-Xmx2g -Dforeign=x -Da=1 -Db=2");
    }

    #[test]
    fn merge_replaces_previous_owned_tokens() {
        let once = editor().merge(Some("-Dforeign=x"), &props());
        let twice = editor().merge(Some(&once), &props());
        assert_eq!(once, twice);

        let updated = editor().merge(Some(&once), &[SystemProperty::new("a", "9")]);
        assert_eq!(updated, "-Dforeign=x -Da=9");
    }

    #[test]
    fn merge_keeps_double_spaces_in_foreign_content() {
        let merged = editor().merge(Some("-Xmx2g  -Dforeign=x"), &props());
        assert_eq!(merged, "-Xmx2g  -Dforeign=x -Da=1 -Db=2");
    }

    #[test]
    fn strip_removes_owned_tokens() {
        let stripped = editor().strip(Some("-Da=1 -Db=2 -Dforeign=x"), &[]);
        assert_eq!(stripped.as_deref(), Some("-Dforeign=x"));
    }

    #[test]
    fn strip_to_nothing_is_none() {
        assert_eq!(editor().strip(Some("-Da=1 -Db=2"), &[]), None);
    }

    #[test]
    fn strip_guard_requires_all_required_keys() {
        assert_eq!(editor().strip(Some("-Dforeign=x"), &[]), None);
        assert_eq!(editor().strip(Some("-Db=2 -Dforeign=x"), &[]), None);
        assert_eq!(editor().strip(None, &[]), None);
        assert_eq!(editor().strip(Some(""), &[]), None);
    }

    #[test]
    fn strip_honours_keep_list() {
        let stripped = editor().strip(Some("-Da=1 -Db=2 -Dforeign=x"), &["b"]);
        assert_eq!(stripped.as_deref(), Some("-Db=2 -Dforeign=x"));
    }

    #[test]
    fn strip_matches_by_substring() {
        // "a" occurs inside "-Dvalue=banana", so that foreign token is dropped too.
        let stripped = editor().strip(Some("-Da=1 -Dvalue=banana -Xss1m"), &[]);
        assert_eq!(stripped.as_deref(), Some("-Xss1m"));
    }

    #[test]
    fn merge_then_strip_restores_original() {
        let original = "-Xmx2g -Dforeign=x";
        let merged = editor().merge(Some(original), &props());
        assert_eq!(editor().strip(Some(&merged), &[]).as_deref(), Some(original));
    }

    #[test]
    fn is_managed() {
        assert!(editor().is_managed("-Da=1"));
        assert!(!editor().is_managed("-Db=2"));
        assert!(!editor().is_managed(""));
    }
}
