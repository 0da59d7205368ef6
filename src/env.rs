use std::collections::HashMap;

use parking_lot::Mutex;

#[cfg(windows)]
pub const PATH_LIST_SEPARATOR: char = ';';
#[cfg(not(windows))]
pub const PATH_LIST_SEPARATOR: char = ':';

/// An ordered `KEY=VALUE` environment with a side index from key to
/// position. Entries keep first-insertion order, which is what child
/// processes and the build toolchain observe.
pub struct Env {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    keys: HashMap<String, usize>,
    data: Vec<String>,
}

impl Env {
    /// Create an environment from `KEY=VALUE` entries. Entries without
    /// an `=` are kept verbatim but not indexed.
    pub fn new<I, S>(data: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inner = Inner::default();
        for entry in data {
            let entry = entry.into();
            if let Some(eq) = entry.find('=') {
                let key = entry[..eq].to_string();
                let position = inner.data.len();
                inner.keys.entry(key).or_insert(position);
            }
            inner.data.push(entry);
        }
        Env {
            inner: Mutex::new(inner),
        }
    }

    /// Snapshot of the current process environment.
    pub fn from_os() -> Self {
        Self::new(std::env::vars().map(|(k, v)| format!("{k}={v}")))
    }

    /// Set the value of the variable named by `key`, joining multiple
    /// values with the OS path-list separator.
    pub fn set(&self, key: &str, values: &[&str]) {
        let value = values.join(&PATH_LIST_SEPARATOR.to_string());
        let mut inner = self.inner.lock();
        if let Some(&i) = inner.keys.get(key) {
            inner.data[i] = format!("{key}={value}");
        } else {
            let position = inner.data.len();
            inner.keys.insert(key.to_string(), position);
            inner.data.push(format!("{key}={value}"));
        }
    }

    /// Add to the values of the variable named by `key`. An existing
    /// entry is extended path-list style: `separator + joined`.
    pub fn add(&self, key: &str, values: &[&str]) {
        let value = values.join(&PATH_LIST_SEPARATOR.to_string());
        let mut inner = self.inner.lock();
        if let Some(&i) = inner.keys.get(key) {
            inner.data[i].push(PATH_LIST_SEPARATOR);
            inner.data[i].push_str(&value);
        } else {
            let position = inner.data.len();
            inner.keys.insert(key.to_string(), position);
            inner.data.push(format!("{key}={value}"));
        }
    }

    /// The value of the variable named by `key`, or empty when absent.
    pub fn get(&self, key: &str) -> String {
        let inner = self.inner.lock();
        match inner.keys.get(key) {
            Some(&i) => {
                let entry = &inner.data[i];
                match entry.find('=') {
                    Some(eq) => entry[eq + 1..].to_string(),
                    None => String::new(),
                }
            }
            None => String::new(),
        }
    }

    /// A snapshot of the entries, suitable for passing as a child
    /// environment.
    pub fn data(&self) -> Vec<String> {
        self.inner.lock().data.clone()
    }

    /// The entries parsed into `(key, value)` pairs for `Command::envs`.
    pub fn pairs(&self) -> Vec<(String, String)> {
        self.inner
            .lock()
            .data
            .iter()
            .filter_map(|entry| {
                entry
                    .find('=')
                    .map(|eq| (entry[..eq].to_string(), entry[eq + 1..].to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let env = Env::new(Vec::<String>::new());
        env.set("HOME", &["/home/dev"]);
        assert_eq!(env.get("HOME"), "/home/dev");

        env.set("HOME", &["/home/other"]);
        assert_eq!(env.get("HOME"), "/home/other");
        assert_eq!(env.data(), vec!["HOME=/home/other".to_string()]);
    }

    #[test]
    fn test_set_joins_values_with_separator() {
        let env = Env::new(Vec::<String>::new());
        env.set("GOPATH", &["/a", "/b"]);
        assert_eq!(
            env.get("GOPATH"),
            format!("/a{PATH_LIST_SEPARATOR}/b")
        );
    }

    #[test]
    fn test_add_extends_existing_entry() {
        let env = Env::new(vec!["PATH=/usr/bin"]);
        env.add("PATH", &["/usr/local/bin"]);
        assert_eq!(
            env.get("PATH"),
            format!("/usr/bin{PATH_LIST_SEPARATOR}/usr/local/bin")
        );
    }

    #[test]
    fn test_add_missing_key_behaves_like_set() {
        let env = Env::new(Vec::<String>::new());
        env.add("GOPATH", &["/workspace"]);
        assert_eq!(env.get("GOPATH"), "/workspace");
    }

    #[test]
    fn test_get_missing_key_is_empty() {
        let env = Env::new(vec!["A=1"]);
        assert_eq!(env.get("B"), "");
    }

    #[test]
    fn test_first_insertion_order_is_kept() {
        let env = Env::new(vec!["A=1", "B=2"]);
        env.set("C", &["3"]);
        env.set("A", &["one"]);
        assert_eq!(
            env.data(),
            vec!["A=one".to_string(), "B=2".to_string(), "C=3".to_string()]
        );
    }

    #[test]
    fn test_duplicate_keys_index_first_entry() {
        let env = Env::new(vec!["A=1", "A=2"]);
        assert_eq!(env.get("A"), "1");
        env.set("A", &["3"]);
        assert_eq!(env.data(), vec!["A=3".to_string(), "A=2".to_string()]);
    }

    #[test]
    fn test_pairs() {
        let env = Env::new(vec!["A=1", "B=x=y"]);
        assert_eq!(
            env.pairs(),
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "x=y".to_string())
            ]
        );
    }
}
