//! Path styles of host and guest.
//!
//! Paths crossing the host/guest boundary are plain strings; the guest may
//! use DOS separators while the host uses its native ones.

/// Separator convention of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathStyle {
    Dos,
    Unix,
}

impl PathStyle {
    /// Style of the host this code runs on.
    pub const fn native() -> Self {
        if cfg!(windows) {
            PathStyle::Dos
        } else {
            PathStyle::Unix
        }
    }

    pub const fn separator(&self) -> char {
        match self {
            PathStyle::Dos => '\\',
            PathStyle::Unix => '/',
        }
    }

    pub fn is_separator(&self, c: char) -> bool {
        match self {
            // DOS accepts both.
            PathStyle::Dos => c == '\\' || c == '/',
            PathStyle::Unix => c == '/',
        }
    }

    pub fn ends_with_separator(&self, path: &str) -> bool {
        path.chars().last().is_some_and(|c| self.is_separator(c))
    }

    /// Rewrite separators of `path` from `from` style to this style.
    pub fn translate(&self, path: &str, from: PathStyle) -> String {
        if from == *self {
            return path.to_string();
        }
        path.chars()
            .map(|c| if from.is_separator(c) { self.separator() } else { c })
            .collect()
    }

    /// Join `base` and `rel`, inserting a separator only when needed.
    pub fn join(&self, base: &str, rel: &str) -> String {
        if base.is_empty() {
            return rel.to_string();
        }
        if rel.is_empty() {
            return base.to_string();
        }
        let mut out = base.to_string();
        if !self.ends_with_separator(&out) {
            out.push(self.separator());
        }
        out.push_str(rel.trim_start_matches(|c| self.is_separator(c)));
        out
    }

    /// Last component of `path`, ignoring trailing separators.
    pub fn file_name<'a>(&self, path: &'a str) -> &'a str {
        let trimmed = path.trim_end_matches(|c| self.is_separator(c));
        match trimmed.rfind(|c| self.is_separator(c)) {
            Some(pos) => &trimmed[pos + 1..],
            None => trimmed,
        }
    }

    /// Append a separator unless `path` already ends with one.
    pub fn with_trailing_separator(&self, path: &str) -> String {
        if path.is_empty() || self.ends_with_separator(path) {
            path.to_string()
        } else {
            format!("{}{}", path, self.separator())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_dos_to_unix() {
        assert_eq!(
            PathStyle::Unix.translate("dir\\sub\\a.txt", PathStyle::Dos),
            "dir/sub/a.txt"
        );
        assert_eq!(
            PathStyle::Dos.translate("dir/sub/a.txt", PathStyle::Unix),
            "dir\\sub\\a.txt"
        );
        assert_eq!(PathStyle::Unix.translate("a\\b", PathStyle::Unix), "a\\b");
    }

    #[test]
    fn test_join() {
        assert_eq!(PathStyle::Unix.join("/tmp", "a"), "/tmp/a");
        assert_eq!(PathStyle::Unix.join("/tmp/", "a"), "/tmp/a");
        assert_eq!(PathStyle::Dos.join("C:\\Temp", "a.txt"), "C:\\Temp\\a.txt");
        assert_eq!(PathStyle::Unix.join("", "a"), "a");
    }

    #[test]
    fn test_file_name() {
        assert_eq!(PathStyle::Unix.file_name("/data/x.txt"), "x.txt");
        assert_eq!(PathStyle::Unix.file_name("/data/dir/"), "dir");
        assert_eq!(PathStyle::Dos.file_name("C:\\Temp\\a.txt"), "a.txt");
        assert_eq!(PathStyle::Unix.file_name("plain"), "plain");
    }

    #[test]
    fn test_trailing_separator() {
        assert!(PathStyle::Dos.ends_with_separator("C:\\Temp\\"));
        assert!(PathStyle::Dos.ends_with_separator("C:/Temp/"));
        assert!(!PathStyle::Unix.ends_with_separator("/tmp"));
        assert_eq!(PathStyle::Unix.with_trailing_separator("/tmp"), "/tmp/");
    }
}
