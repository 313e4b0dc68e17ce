//! Lexical path helpers. No filesystem access happens here.

/// Split `path` into normalized absolute components, resolving it against
/// `cwd` when relative. `.` is dropped and `..` pops (stopping at the root).
pub(crate) fn components(cwd: &str, path: &str) -> Vec<String> {
    let mut parts: Vec<String> = Vec::new();
    let base = if path.starts_with('/') { "" } else { cwd };
    for part in base.split('/').chain(path.split('/')) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name.to_string()),
        }
    }
    parts
}

/// Render components back into an absolute path.
pub(crate) fn to_path(parts: &[String]) -> String {
    if parts.is_empty() {
        return "/".to_string();
    }
    let mut out = String::new();
    for part in parts {
        out.push('/');
        out.push_str(part);
    }
    out
}

/// Normalize `path` against `cwd` into an absolute path.
pub fn normalize(cwd: &str, path: &str) -> String {
    to_path(&components(cwd, path))
}

/// Join `rest` onto `base`. An absolute `rest` replaces `base`.
pub fn join(base: &str, rest: &str) -> String {
    normalize(base, rest)
}

/// Split an absolute path into `(parent, name)`. The root has an empty name.
pub fn split_parent(path: &str) -> (String, String) {
    let mut parts = components("/", path);
    match parts.pop() {
        Some(name) => (to_path(&parts), name),
        None => ("/".to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_relative() {
        assert_eq!(normalize("/shared/data", "in.txt"), "/shared/data/in.txt");
        assert_eq!(normalize("/shared/data", "../mnt/x"), "/shared/mnt/x");
        assert_eq!(normalize("/shared/data", "./a/./b"), "/shared/data/a/b");
    }

    #[test]
    fn test_normalize_absolute_ignores_cwd() {
        assert_eq!(normalize("/shared/data", "/tmp//x/"), "/tmp/x");
    }

    #[test]
    fn test_dotdot_stops_at_root() {
        assert_eq!(normalize("/", "../../a"), "/a");
        assert_eq!(normalize("/a", ".."), "/");
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(
            split_parent("/shared/data/in.txt"),
            ("/shared/data".to_string(), "in.txt".to_string())
        );
        assert_eq!(split_parent("/x"), ("/".to_string(), "x".to_string()));
        assert_eq!(split_parent("/"), ("/".to_string(), String::new()));
    }
}
