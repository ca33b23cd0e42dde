//! Putenv-style environment change records.

use guestctl_shared::errors::{GuestctlError, GuestctlResult};

/// Ordered set of environment changes: `Some(value)` sets a variable,
/// `None` unsets it. Later changes to the same name replace earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentChanges {
    /// Windows guests allow a leading `=` in variable names (`=C:` style
    /// per-drive directories).
    allow_equal_prefix: bool,
    changes: Vec<(String, Option<String>)>,
}

impl EnvironmentChanges {
    pub fn new(allow_equal_prefix: bool) -> Self {
        Self {
            allow_equal_prefix,
            changes: Vec::new(),
        }
    }

    fn validate_name(&self, name: &str) -> GuestctlResult<()> {
        let body = match name.strip_prefix('=') {
            Some(rest) if self.allow_equal_prefix => rest,
            _ => name,
        };
        if body.is_empty() || body.contains('=') || name.contains('\0') {
            return Err(GuestctlError::InvalidArgument(format!(
                "invalid environment variable name \"{}\"",
                name
            )));
        }
        Ok(())
    }

    fn record(&mut self, name: &str, value: Option<String>) {
        match self.changes.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value,
            None => self.changes.push((name.to_string(), value)),
        }
    }

    pub fn set(&mut self, name: &str, value: &str) -> GuestctlResult<()> {
        self.validate_name(name)?;
        if value.contains('\0') {
            return Err(GuestctlError::InvalidArgument(format!(
                "value of \"{}\" contains a NUL character",
                name
            )));
        }
        self.record(name, Some(value.to_string()));
        Ok(())
    }

    pub fn unset(&mut self, name: &str) -> GuestctlResult<()> {
        self.validate_name(name)?;
        self.record(name, None);
        Ok(())
    }

    /// Apply a putenv-style entry: `NAME=VALUE` sets, bare `NAME` unsets.
    pub fn apply_putenv(&mut self, entry: &str) -> GuestctlResult<()> {
        // A leading '=' belongs to the name.
        let search_from = usize::from(entry.starts_with('='));
        match entry[search_from..].find('=') {
            Some(pos) => {
                let split = search_from + pos;
                self.set(&entry[..split], &entry[split + 1..])
            }
            None => self.unset(entry),
        }
    }

    /// Lookup: `None` if never touched, `Some(None)` if unset.
    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.changes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_deref())
    }

    /// Apply every change of `other` on top of this record.
    pub fn merge(&mut self, other: &EnvironmentChanges) {
        for (name, value) in &other.changes {
            self.record(name, value.clone());
        }
    }

    pub fn clear(&mut self) {
        self.changes.clear();
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Wire form: `NAME=VALUE` for sets, `NAME` for unsets.
    pub fn to_putenv_list(&self) -> Vec<String> {
        self.changes
            .iter()
            .map(|(name, value)| match value {
                Some(v) => format!("{}={}", name, v),
                None => name.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_writer_wins() {
        let mut env = EnvironmentChanges::new(false);
        env.set("FOO", "1").unwrap();
        env.set("BAR", "x").unwrap();
        env.unset("FOO").unwrap();
        env.set("FOO", "2").unwrap();
        assert_eq!(env.get("FOO"), Some(Some("2")));
        assert_eq!(env.to_putenv_list(), vec!["FOO=2", "BAR=x"]);
    }

    #[test]
    fn test_putenv_parsing() {
        let mut env = EnvironmentChanges::new(false);
        env.apply_putenv("PATH=/bin:/usr/bin").unwrap();
        env.apply_putenv("EMPTY=").unwrap();
        env.apply_putenv("GONE").unwrap();
        assert_eq!(env.get("PATH"), Some(Some("/bin:/usr/bin")));
        assert_eq!(env.get("EMPTY"), Some(Some("")));
        assert_eq!(env.get("GONE"), Some(None));
        assert_eq!(env.get("NEVER"), None);
    }

    #[test]
    fn test_equal_prefix_only_on_windows() {
        let mut posix = EnvironmentChanges::new(false);
        assert!(posix.apply_putenv("=C:=C:\\Windows").is_err());

        let mut windows = EnvironmentChanges::new(true);
        windows.apply_putenv("=C:=C:\\Windows").unwrap();
        assert_eq!(windows.get("=C:"), Some(Some("C:\\Windows")));
    }

    #[test]
    fn test_invalid_names() {
        let mut env = EnvironmentChanges::new(true);
        assert!(env.set("", "x").is_err());
        assert!(env.set("A=B", "x").is_err());
        assert!(env.unset("=").is_err());
    }

    #[test]
    fn test_merge_overrides_base() {
        let mut base = EnvironmentChanges::new(false);
        base.set("A", "base").unwrap();
        base.set("B", "base").unwrap();
        let mut overrides = EnvironmentChanges::new(false);
        overrides.set("B", "mine").unwrap();
        overrides.unset("A").unwrap();
        base.merge(&overrides);
        assert_eq!(base.to_putenv_list(), vec!["A", "B=mine"]);
    }
}
