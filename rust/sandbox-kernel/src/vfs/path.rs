use crate::error::{KernelError, KernelResult};

/// Normalize an absolute path, resolving `.` and `..` and collapsing
/// repeated slashes. Paths escaping the root are rejected.
pub fn normalize(path: &str) -> KernelResult<String> {
    if !path.starts_with('/') {
        return Err(KernelError::invalid(format!("path must be absolute: {path}")));
    }
    if path.contains('\0') {
        return Err(KernelError::invalid("path contains NUL"));
    }

    let mut components: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                if components.pop().is_none() {
                    return Err(KernelError::invalid(format!("path escapes root: {path}")));
                }
            }
            other => components.push(other),
        }
    }

    if components.is_empty() {
        return Ok("/".into());
    }
    let mut out = String::with_capacity(path.len());
    for component in components {
        out.push('/');
        out.push_str(component);
    }
    Ok(out)
}

/// Resolve `path` against `cwd` when it is relative.
pub fn resolve(cwd: &str, path: &str) -> KernelResult<String> {
    if path.starts_with('/') {
        normalize(path)
    } else {
        normalize(&join(cwd, path))
    }
}

pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(pos) => Some(&path[..pos]),
        None => None,
    }
}

pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

pub fn join(base: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// True when `path` equals `base` or lies beneath it.
pub fn is_under(path: &str, base: &str) -> bool {
    if base == "/" {
        return path.starts_with('/');
    }
    path.starts_with(base) && (path.len() == base.len() || path.as_bytes()[base.len()] == b'/')
}

/// Re-root `path` (which lies under `from`) beneath `to`.
pub fn rebase(path: &str, from: &str, to: &str) -> String {
    if path == from {
        return to.to_string();
    }
    let suffix = if from == "/" {
        &path[1..]
    } else {
        &path[from.len() + 1..]
    };
    join(to, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_resolves_dots_and_slashes() {
        assert_eq!(normalize("/a//b/./c/..").unwrap(), "/a/b");
        assert_eq!(normalize("/").unwrap(), "/");
        assert_eq!(normalize("/..").unwrap_err().errno_name(), "EINVAL");
        assert!(normalize("relative").is_err());
    }

    #[test]
    fn resolve_uses_cwd_for_relative_paths() {
        assert_eq!(resolve("/home/user", "notes.txt").unwrap(), "/home/user/notes.txt");
        assert_eq!(resolve("/home/user", "../x").unwrap(), "/home/x");
        assert_eq!(resolve("/home/user", "/etc").unwrap(), "/etc");
    }

    #[test]
    fn parent_and_name_split_paths() {
        assert_eq!(parent("/a/b"), Some("/a"));
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(file_name("/a/b.txt"), "b.txt");
    }

    #[test]
    fn is_under_respects_component_boundaries() {
        assert!(is_under("/mnt/foo", "/mnt"));
        assert!(is_under("/mnt", "/mnt"));
        assert!(!is_under("/mntx", "/mnt"));
        assert!(is_under("/anything", "/"));
    }

    #[test]
    fn rebase_moves_subtree_paths() {
        assert_eq!(rebase("/a/b/c", "/a", "/z"), "/z/b/c");
        assert_eq!(rebase("/a", "/a", "/z"), "/z");
        assert_eq!(rebase("/foo.txt", "/", "/mnt"), "/mnt/foo.txt");
    }
}
