//! Guest path utilities
//!
//! Pure string transformations over Symbian-style paths, independent of the
//! host file system. Symbian paths are drive-rooted (`C:\data\file`) and use
//! backslash as the canonical separator; host paths may use either slash.
//!
//! Design:
//! - Both `/` and `\` are accepted as separators everywhere
//! - `symbian_mode` selects the canonical separator for produced paths
//! - Root decomposition follows `root_name` / `root_dir` / `root_path`,
//!   so `root_path(p) + relative_path(p)` reassembles `p`

/// True if `c` is a path separator (either convention).
pub fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

/// The canonical separator: `\` in Symbian mode (and on Windows hosts),
/// `/` otherwise.
pub fn separator(symbian_mode: bool) -> char {
    if symbian_mode || cfg!(windows) {
        '\\'
    } else {
        '/'
    }
}

/// Rewrite every alternate separator in `path` to the canonical one.
fn canonicalize(path: &str, symbian_mode: bool) -> String {
    let rsep = separator(symbian_mode);
    let dsep = if rsep == '\\' { '/' } else { '\\' };

    path.chars()
        .map(|c| if c == dsep { rsep } else { c })
        .collect()
}

/// The root name of `path`: a drive prefix (`X:`), a `//server` prefix for
/// UNC-like paths, or empty.
pub fn root_name(path: &str, symbian_mode: bool) -> &str {
    let bytes = path.as_bytes();

    if bytes.len() < 2 {
        return "";
    }

    if bytes[1] == b':' {
        return &path[..2];
    }

    if is_separator(bytes[0] as char) && bytes[0] == bytes[1] {
        if let Some(pos) = path[2..].find(separator(symbian_mode)) {
            return &path[..2 + pos];
        }
    }

    ""
}

/// The single separator immediately following `root_name`, or starting
/// `path` when there is no root name. Empty if absent.
pub fn root_dir(path: &str, symbian_mode: bool) -> &str {
    let bytes = path.as_bytes();

    if bytes.len() >= 2 && bytes[1] == b':' {
        if bytes.len() > 2 && is_separator(bytes[2] as char) {
            return &path[2..3];
        }
        return "";
    }

    if bytes.len() >= 2 && is_separator(bytes[0] as char) && bytes[0] == bytes[1] {
        if let Some(pos) = path[2..].find(separator(symbian_mode)) {
            return &path[2 + pos..3 + pos];
        }
        return "";
    }

    if !bytes.is_empty() && is_separator(bytes[0] as char) {
        return &path[..1];
    }

    ""
}

/// `root_name` and `root_dir` concatenated.
pub fn root_path(path: &str, symbian_mode: bool) -> String {
    let name = root_name(path, symbian_mode);
    let dir = root_dir(path, symbian_mode);

    let mut root = String::with_capacity(name.len() + dir.len());
    root.push_str(name);
    root.push_str(dir);
    root
}

/// `path` with its root path stripped.
pub fn relative_path(path: &str, symbian_mode: bool) -> &str {
    &path[root_path(path, symbian_mode).len()..]
}

pub fn has_root_name(path: &str, symbian_mode: bool) -> bool {
    !root_name(path, symbian_mode).is_empty()
}

pub fn has_root_dir(path: &str, symbian_mode: bool) -> bool {
    !root_dir(path, symbian_mode).is_empty()
}

pub fn has_root_path(path: &str, symbian_mode: bool) -> bool {
    !root_path(path, symbian_mode).is_empty()
}

/// Join two paths, collapsing separators at the boundary to exactly one and
/// rewriting every separator to the canonical form.
pub fn add_path(path1: &str, path2: &str, symbian_mode: bool) -> String {
    if path1.is_empty() {
        return canonicalize(path2, symbian_mode);
    }

    if path2.is_empty() {
        return canonicalize(path1, symbian_mode);
    }

    let end_sep = is_separator(path1.chars().next_back().unwrap_or('\0'));
    let first = path2.chars().next().unwrap_or('\0');
    let beg_sep = is_separator(first);

    let tail = if end_sep && beg_sep {
        // Collapse the run of leading separators on the right side.
        match path2.find(|c| c != first) {
            Some(pos) => &path2[pos..],
            None => return canonicalize(path1, symbian_mode),
        }
    } else if !end_sep && !beg_sep {
        return canonicalize(&format!("{}/{}", path1, path2), symbian_mode);
    } else {
        path2
    };

    canonicalize(&format!("{}{}", path1, tail), symbian_mode)
}

/// Make `path` absolute against `current_dir`.
///
/// A path with both a root name and a root directory is already absolute.
/// A fully relative path is appended to `current_dir`. A rooted path with
/// no drive (`\a\b`) keeps its shape but takes `current_dir`'s drive. A
/// drive-relative path (`D:x`) composes the drive with `current_dir`'s
/// directory part.
pub fn absolute_path(path: &str, current_dir: &str, symbian_mode: bool) -> String {
    let rooted = has_root_dir(path, symbian_mode);
    let named = has_root_name(path, symbian_mode);

    if rooted && named {
        return path.to_string();
    }

    if !rooted && !named {
        return add_path(current_dir, path, symbian_mode);
    }

    if rooted {
        return add_path(root_name(current_dir, symbian_mode), path, symbian_mode);
    }

    // Root name only: `D:x` against `C:\cwd\sub` becomes `D:\cwd\sub\x`.
    let mut composed = add_path(
        root_name(path, symbian_mode),
        root_dir(current_dir, symbian_mode),
        symbian_mode,
    );
    composed = add_path(&composed, relative_path(current_dir, symbian_mode), symbian_mode);
    add_path(&composed, relative_path(path, symbian_mode), symbian_mode)
}

/// True if `path` is already absolute against `current_dir`.
pub fn is_absolute(path: &str, current_dir: &str, symbian_mode: bool) -> bool {
    absolute_path(path, current_dir, symbian_mode) == path
}

/// True if `path` has a non-root component.
pub fn is_relative(path: &str, symbian_mode: bool) -> bool {
    !relative_path(path, symbian_mode).is_empty()
}

/// The last component of `path`, empty if `path` ends in a separator.
pub fn filename(path: &str) -> &str {
    match path.rfind(is_separator) {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_name_drive() {
        assert_eq!(root_name("C:\\data", true), "C:");
        assert_eq!(root_name("C:", true), "C:");
        assert_eq!(root_name("\\data", true), "");
    }

    #[test]
    fn test_root_name_short_path() {
        // Single-character paths must not be probed past their end.
        assert_eq!(root_name("x", true), "");
        assert_eq!(root_name("", true), "");
        assert_eq!(root_dir("", true), "");
    }

    #[test]
    fn test_root_name_unc() {
        assert_eq!(root_name("\\\\server\\share", true), "\\\\server");
        assert_eq!(root_name("\\\\server", true), "");
    }

    #[test]
    fn test_root_dir() {
        assert_eq!(root_dir("C:\\data", true), "\\");
        assert_eq!(root_dir("C:data", true), "");
        assert_eq!(root_dir("\\data", true), "\\");
        assert_eq!(root_dir("data", true), "");
    }

    #[test]
    fn test_root_path_reassembles() {
        for p in ["C:\\data\\file.txt", "\\abs\\path", "rel\\path"] {
            let root = root_path(p, true);
            let rel = relative_path(p, true);
            assert_eq!(add_path(&root, rel, true), *p, "path {}", p);
        }
    }

    #[test]
    fn test_add_path_inserts_separator() {
        assert_eq!(add_path("C:\\data", "file.txt", true), "C:\\data\\file.txt");
        assert_eq!(add_path("a", "b", false), "a/b");
    }

    #[test]
    fn test_add_path_collapses_separators() {
        assert_eq!(add_path("C:\\data\\", "\\\\file.txt", true), "C:\\data\\file.txt");
        assert_eq!(add_path("C:\\data\\", "\\\\\\", true), "C:\\data\\");
    }

    #[test]
    fn test_add_path_canonicalizes() {
        assert_eq!(add_path("C:/data", "sub/file", true), "C:\\data\\sub\\file");
        assert_eq!(add_path("C:\\data", "file", false), "C:/data/file");
    }

    #[test]
    fn test_absolute_path_relative() {
        assert_eq!(
            absolute_path("file.txt", "C:\\data", true),
            "C:\\data\\file.txt"
        );
    }

    #[test]
    fn test_absolute_path_rooted_no_drive() {
        assert_eq!(absolute_path("\\a\\b", "C:\\cwd", true), "C:\\a\\b");
    }

    #[test]
    fn test_absolute_path_drive_relative() {
        assert_eq!(absolute_path("D:x", "C:\\cwd\\sub", true), "D:\\cwd\\sub\\x");
    }

    #[test]
    fn test_absolute_path_idempotent() {
        let cwd = "C:\\cwd";
        for p in ["file.txt", "\\a\\b", "D:x", "C:\\already\\abs"] {
            let once = absolute_path(p, cwd, true);
            assert_eq!(absolute_path(&once, cwd, true), once, "path {}", p);
        }
    }

    #[test]
    fn test_is_absolute() {
        assert!(is_absolute("C:\\data", "C:\\cwd", true));
        assert!(!is_absolute("data", "C:\\cwd", true));
    }

    #[test]
    fn test_filename() {
        assert_eq!(filename("C:\\apps\\shell.exe"), "shell.exe");
        assert_eq!(filename("shell.exe"), "shell.exe");
        assert_eq!(filename("C:\\apps\\"), "");
    }
}
