//! Name filters over test files, methods and directories.
//!
//! A filter is a list of entries taken verbatim from the configuration. Each
//! entry is classified once:
//!
//! | Entry | Kind | Matches |
//! |-------|------|---------|
//! | `tests/LoginCest.php:signIn` | test | that method (method name is case-insensitive) |
//! | `tests/LoginCest.php` | file | every unit of that file |
//! | `tests/admin` | path | every unit of a file below that directory |
//!
//! Filters select units for the serial/parallel before and after phases, and
//! for the "never rerun" list.

use std::collections::HashMap;

/// Classified list of name entries.
#[derive(Debug, Clone, Default)]
pub struct NameFilter {
    entries: Vec<String>,
    tests: HashMap<String, usize>,
    files: HashMap<String, usize>,
    paths: HashMap<String, usize>,
}

impl NameFilter {
    /// Builds a filter from configuration entries.
    ///
    /// ```
    /// use splitrun::filter::NameFilter;
    ///
    /// let filter = NameFilter::new(["tests/LoginCest.php:signIn", "tests/admin"]);
    /// assert!(filter.matches("tests/LoginCest.php", Some("SIGNIN")));
    /// assert!(filter.matches("tests/admin/users/ListCest.php", None));
    /// assert!(!filter.matches("tests/LoginCest.php", Some("signOut")));
    /// ```
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut filter = Self::default();
        for (position, entry) in entries.into_iter().map(Into::into).enumerate() {
            if let Some(key) = test_key(&entry) {
                filter.tests.entry(key).or_insert(position);
            } else if has_extension(&entry) {
                filter.files.entry(entry.clone()).or_insert(position);
            } else {
                let path = entry.trim_end_matches('/').to_string();
                filter.paths.entry(path).or_insert(position);
            }
            filter.entries.push(entry);
        }
        filter
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entries in configuration order.
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Position of the entry that selects a unit, if any.
    ///
    /// A test entry is preferred over a file entry, which is preferred over
    /// the closest enclosing path entry.
    pub fn position(&self, file: &str, method: Option<&str>) -> Option<usize> {
        if let Some(method) = method
            && let Some(&position) = self.tests.get(&format!("{file}:{}", method.to_lowercase()))
        {
            return Some(position);
        }

        if let Some(&position) = self.files.get(file) {
            return Some(position);
        }

        let (dir, _) = file.rsplit_once('/')?;
        subpaths(dir).find_map(|subpath| self.paths.get(subpath).copied())
    }

    /// The configuration entry that selects a unit, if any.
    pub fn get_match(&self, file: &str, method: Option<&str>) -> Option<&str> {
        self.position(file, method)
            .map(|position| self.entries[position].as_str())
    }

    pub fn matches(&self, file: &str, method: Option<&str>) -> bool {
        self.position(file, method).is_some()
    }

    /// Files named by test entries, in configuration order.
    pub fn test_files(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter_map(|entry| split_test(entry).map(|(file, _)| file))
    }
}

/// Splits a `file.ext:method` entry.
fn split_test(entry: &str) -> Option<(&str, &str)> {
    entry.match_indices(':').find_map(|(idx, _)| {
        let (file, method) = (&entry[..idx], &entry[idx + 1..]);
        (has_extension(file) && !method.is_empty()).then_some((file, method))
    })
}

/// Normalizes `file.ext:method` into a lookup key, lowercasing the method.
fn test_key(entry: &str) -> Option<String> {
    split_test(entry).map(|(file, method)| format!("{file}:{}", method.to_lowercase()))
}

fn has_extension(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    matches!(name.rsplit_once('.'), Some((stem, ext)) if !stem.is_empty() && !ext.is_empty())
}

/// `a/b/c`, `a/b`, `a`: the directory itself first, then its ancestors.
fn subpaths(dir: &str) -> impl Iterator<Item = &str> {
    let mut rest = Some(dir);
    std::iter::from_fn(move || {
        let current = rest?;
        rest = current.rsplit_once('/').map(|(parent, _)| parent);
        Some(current)
    })
}
