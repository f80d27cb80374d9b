use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A file path used to identify files throughout the streaming stack.
///
/// The path is normalized on creation: separators are unified to `/`, duplicate
/// separators and `.` components are removed and `..` components are resolved
/// lexically. Two paths compare equal when their case-folded forms are equal, so
/// `Assets/Foo.bin` and `assets\foo.bin` refer to the same file as far as caches
/// are concerned. The normalized path keeps its original casing for filesystem
/// access.
#[derive(Clone, Default)]
pub struct RequestPath {
    path: Arc<str>,
    key: Arc<str>,
}

impl RequestPath {
    pub fn new<P: AsRef<str>>(path: P) -> Self {
        let path = normalize(path.as_ref());
        let key = path.to_lowercase();

        Self {
            path: path.into(),
            key: key.into(),
        }
    }

    /// The normalized path with its original casing.
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// The case-folded form used for comparisons.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }

    pub fn to_path_buf(&self) -> PathBuf {
        PathBuf::from(&*self.path)
    }

    /// Returns true if this path lies inside `directory`. Both are compared in
    /// their case-folded forms.
    pub fn starts_with(&self, directory: &RequestPath) -> bool {
        if directory.key.is_empty() {
            return true;
        }
        match self.key.strip_prefix(&*directory.key) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || directory.key.ends_with('/'),
            None => false,
        }
    }
}

fn normalize(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let is_absolute = unified.starts_with('/');

    let mut components: Vec<&str> = Vec::new();
    for component in unified.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                // Leading `..` of a relative path cannot be resolved lexically.
                if matches!(components.last(), Some(last) if *last != "..") {
                    components.pop();
                } else if !is_absolute {
                    components.push("..");
                }
            }
            c => components.push(c),
        }
    }

    let joined = components.join("/");
    if is_absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

impl PartialEq for RequestPath {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for RequestPath {}

impl Hash for RequestPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Debug for RequestPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestPath({:?})", &*self.path)
    }
}

impl fmt::Display for RequestPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl From<&str> for RequestPath {
    fn from(path: &str) -> Self {
        RequestPath::new(path)
    }
}

impl From<String> for RequestPath {
    fn from(path: String) -> Self {
        RequestPath::new(path)
    }
}

impl From<&Path> for RequestPath {
    fn from(path: &Path) -> Self {
        RequestPath::new(path.to_string_lossy())
    }
}

impl From<PathBuf> for RequestPath {
    fn from(path: PathBuf) -> Self {
        RequestPath::from(path.as_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_separators_and_dots() {
        let cases = [
            // input | normalized
            ("foo.bin", "foo.bin"),
            ("./foo.bin", "foo.bin"),
            ("assets\\textures\\a.dds", "assets/textures/a.dds"),
            ("assets//textures/./a.dds", "assets/textures/a.dds"),
            ("assets/levels/../textures/a.dds", "assets/textures/a.dds"),
            ("/root/../foo.bin", "/foo.bin"),
            ("../shared/foo.bin", "../shared/foo.bin"),
        ];

        for (input, expected) in cases {
            assert_eq!(RequestPath::new(input).as_str(), expected, "input: {}", input);
        }
    }

    #[test]
    fn compares_case_folded() {
        let a = RequestPath::new("Assets/Foo.BIN");
        let b = RequestPath::new("assets\\foo.bin");

        assert_eq!(a, b);
        assert_eq!(a.as_str(), "Assets/Foo.BIN");
        assert_ne!(a, RequestPath::new("assets/foo.bin.bak"));
    }

    #[test]
    fn starts_with_directory() {
        let file = RequestPath::new("/data/Assets/foo.bin");

        assert!(file.starts_with(&RequestPath::new("/data")));
        assert!(file.starts_with(&RequestPath::new("/DATA/assets/")));
        assert!(!file.starts_with(&RequestPath::new("/dat")));
        assert!(file.starts_with(&RequestPath::default()));
    }
}
