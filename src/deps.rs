use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::env::PATH_LIST_SEPARATOR;

/// Source file extensions that belong to a package. Test files and
/// `_`/`.`-prefixed files are excluded, matching what the toolchain
/// itself considers part of a build.
const SOURCE_EXTENSIONS: [&str; 5] = ["go", "c", "h", "s", "syso"];

/// Toolchain roots and workspace search paths used to resolve the
/// dependency closure of a build target.
#[derive(Clone, Debug)]
pub struct BuildContext {
    goroot: PathBuf,
    gopath: Vec<PathBuf>,
}

/// A queued package: resolved either by import path or by directory.
struct Pkg {
    name: Option<String>,
    dir: Option<PathBuf>,
}

struct Resolved {
    dir: PathBuf,
    in_goroot: bool,
    pkg_obj: Option<PathBuf>,
}

impl BuildContext {
    pub fn new(goroot: PathBuf, gopath: Vec<PathBuf>) -> Self {
        Self { goroot, gopath }
    }

    pub fn goroot(&self) -> &Path {
        &self.goroot
    }

    pub fn gopath(&self) -> &[PathBuf] {
        &self.gopath
    }

    /// The workspace paths joined for a `GOPATH` environment entry.
    pub fn gopath_list(&self) -> String {
        self.gopath
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(&PATH_LIST_SEPARATOR.to_string())
    }

    /// Directories that may contain package sources.
    pub fn src_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self.gopath.iter().map(|p| p.join("src")).collect();
        if !self.goroot.as_os_str().is_empty() {
            dirs.push(self.goroot.join("src"));
        }
        dirs
    }

    /// The toolchain binary to invoke when no builder is configured.
    pub fn go_binary(&self) -> String {
        if !self.goroot.as_os_str().is_empty() && self.goroot.exists() {
            self.goroot
                .join("bin")
                .join("go")
                .to_string_lossy()
                .into_owned()
        } else {
            "go".to_string()
        }
    }

    /// Every source, header, assembly and compiled-object file the
    /// target transitively depends on, excluding anything under the
    /// toolchain root. Pure and restartable; called before each build.
    pub fn compute_deps(&self, target: &Path) -> io::Result<Vec<PathBuf>> {
        let meta = fs::metadata(target)?;

        let mut queue: VecDeque<Pkg> = VecDeque::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut seen_dirs: HashSet<PathBuf> = HashSet::new();
        let mut files: Vec<PathBuf> = Vec::new();

        if meta.is_dir() {
            queue.push_back(Pkg {
                name: None,
                dir: Some(target.to_path_buf()),
            });
        } else {
            let info = parse_imports(target)?;
            let dir = target
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            let mut pkg = Pkg {
                name: None,
                dir: Some(dir),
            };
            if info.package != "main" {
                // A library file: resolve it by its package name so the
                // whole package is picked up.
                visited.insert(info.package.clone());
                pkg.name = Some(info.package);
            }
            queue.push_back(pkg);
        }

        while let Some(pkg) = queue.pop_front() {
            // Resolution errors are tolerated; the build will surface them.
            let Some(resolved) = self.resolve(&pkg) else {
                continue;
            };
            if resolved.in_goroot {
                continue;
            }
            if !seen_dirs.insert(resolved.dir.clone()) {
                continue;
            }

            if let Some(obj) = resolved.pkg_obj {
                files.push(obj);
            }

            let mut sources = package_sources(&resolved.dir);
            for source in &sources {
                if source.extension().map(|e| e == "go").unwrap_or(false) {
                    if let Ok(info) = parse_imports(source) {
                        for import in info.imports {
                            if visited.insert(import.clone()) {
                                queue.push_back(Pkg {
                                    name: Some(import),
                                    dir: None,
                                });
                            }
                        }
                    }
                }
            }
            files.append(&mut sources);
        }

        Ok(files)
    }

    fn resolve(&self, pkg: &Pkg) -> Option<Resolved> {
        if let Some(name) = &pkg.name {
            if !self.goroot.as_os_str().is_empty() {
                let goroot_dir = self.goroot.join("src").join(name);
                if goroot_dir.is_dir() {
                    return Some(Resolved {
                        dir: goroot_dir,
                        in_goroot: true,
                        pkg_obj: None,
                    });
                }
            }
            for root in &self.gopath {
                let dir = root.join("src").join(name);
                if dir.is_dir() {
                    let obj = root
                        .join("pkg")
                        .join(format!("{}_{}", goos(), goarch()))
                        .join(format!("{name}.a"));
                    return Some(Resolved {
                        dir,
                        in_goroot: false,
                        pkg_obj: obj.exists().then_some(obj),
                    });
                }
            }
        }
        if let Some(dir) = &pkg.dir {
            if dir.is_dir() {
                let in_goroot =
                    !self.goroot.as_os_str().is_empty() && dir.starts_with(&self.goroot);
                return Some(Resolved {
                    dir: dir.clone(),
                    in_goroot,
                    pkg_obj: None,
                });
            }
        }
        None
    }
}

/// The package clause and import paths of a single source file.
pub(crate) struct SourceInfo {
    pub package: String,
    pub imports: Vec<String>,
}

/// A lightweight import scan: comment-aware, import-block-aware, and
/// done as soon as the first top-level declaration is reached.
pub(crate) fn parse_imports(path: &Path) -> io::Result<SourceInfo> {
    let text = fs::read_to_string(path)?;
    let text = strip_comments(&text);

    let mut info = SourceInfo {
        package: String::new(),
        imports: Vec::new(),
    };
    let mut in_block = false;

    for line in text.lines() {
        let line = line.trim();
        if in_block {
            if line.starts_with(')') {
                in_block = false;
            } else if let Some(import) = quoted(line) {
                info.imports.push(import);
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("package ") {
            info.package = rest
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_string();
        } else if let Some(rest) = line.strip_prefix("import") {
            let rest = rest.trim_start();
            if rest.starts_with('(') {
                in_block = !rest.contains(')');
                if let Some(import) = quoted(rest) {
                    info.imports.push(import);
                }
            } else if let Some(import) = quoted(rest) {
                info.imports.push(import);
            }
        } else if line.starts_with("func")
            || line.starts_with("type ")
            || line.starts_with("var ")
            || line.starts_with("const ")
        {
            break;
        }
    }

    Ok(info)
}

/// The import path between the first pair of double quotes, skipping
/// any alias token before it.
fn quoted(line: &str) -> Option<String> {
    let start = line.find('"')?;
    let rest = &line[start + 1..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

/// Remove `//` and `/* */` comments while leaving string literals
/// intact.
fn strip_comments(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'/' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
            }
            quote @ (b'"' | b'`') => {
                out.push(bytes[i] as char);
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    if quote == b'"' && bytes[i] == b'\\' {
                        out.push(bytes[i] as char);
                        i += 1;
                        if i >= bytes.len() {
                            break;
                        }
                    }
                    out.push(bytes[i] as char);
                    i += 1;
                }
                if i < bytes.len() {
                    out.push(bytes[i] as char);
                    i += 1;
                }
            }
            b => {
                out.push(b as char);
                i += 1;
            }
        }
    }
    out
}

/// All files in `dir` with a source extension, excluding test files
/// and `_`/`.`-prefixed files, sorted for stable output.
fn package_sources(dir: &Path) -> Vec<PathBuf> {
    let mut sources = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return sources;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('_') || name.starts_with('.') || name.ends_with("_test.go") {
            continue;
        }
        let has_source_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| SOURCE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if has_source_ext {
            sources.push(path);
        }
    }
    sources.sort();
    sources
}

/// Directories above `path` that contain a child component named
/// `src`: candidate workspace roots when the target lies outside every
/// configured workspace.
pub fn import_roots(path: &Path) -> Vec<PathBuf> {
    let mut roots = Vec::new();
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir.file_name().map(|n| n == "src").unwrap_or(false) {
            if let Some(root) = dir.parent() {
                roots.push(root.to_path_buf());
            }
        }
        current = dir.parent();
    }
    roots
}

/// Make a path absolute against the current directory, resolving `.`
/// and `..` components lexically.
pub fn absolutize(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn goos() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

fn goarch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "386",
        "aarch64" => "arm64",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_parse_imports_single_and_block() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.go");
        write(
            &file,
            r#"// entry point
package main

import "fmt"

import (
    "strings"
    alias "app/util"
    _ "app/side"
)

func main() {
    fmt.Println(strings.ToUpper("x"))
}
"#,
        );
        let info = parse_imports(&file).unwrap();
        assert_eq!(info.package, "main");
        assert_eq!(info.imports, vec!["fmt", "strings", "app/util", "app/side"]);
    }

    #[test]
    fn test_parse_imports_ignores_comments_and_bodies() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("lib.go");
        write(
            &file,
            r#"package util

/* import "not/real" */
// import "also/not/real"
import "app/dep"

func Use() string { return "import \"nope\"" }
"#,
        );
        let info = parse_imports(&file).unwrap();
        assert_eq!(info.package, "util");
        assert_eq!(info.imports, vec!["app/dep"]);
    }

    #[test]
    fn test_compute_deps_walks_imports() {
        let dir = tempfile::tempdir().unwrap();
        let gopath = dir.path().join("workspace");
        let main_go = gopath.join("src/app/main.go");
        write(
            &main_go,
            "package main\n\nimport \"app/util\"\n\nfunc main() { util.Use() }\n",
        );
        write(
            &gopath.join("src/app/util/util.go"),
            "package util\n\nfunc Use() {}\n",
        );

        let context = BuildContext::new(PathBuf::new(), vec![gopath.clone()]);
        let deps = context.compute_deps(&main_go).unwrap();

        assert!(deps.contains(&main_go));
        assert!(deps.contains(&gopath.join("src/app/util/util.go")));
    }

    #[test]
    fn test_compute_deps_skips_goroot_packages() {
        let dir = tempfile::tempdir().unwrap();
        let goroot = dir.path().join("goroot");
        write(&goroot.join("src/fmt/print.go"), "package fmt\n");
        let gopath = dir.path().join("workspace");
        let main_go = gopath.join("src/app/main.go");
        write(
            &main_go,
            "package main\n\nimport \"fmt\"\n\nfunc main() { fmt.Println() }\n",
        );

        let context = BuildContext::new(goroot.clone(), vec![gopath]);
        let deps = context.compute_deps(&main_go).unwrap();

        assert!(deps.contains(&main_go));
        assert!(!deps.iter().any(|p| p.starts_with(&goroot)));
    }

    #[test]
    fn test_compute_deps_excludes_test_files() {
        let dir = tempfile::tempdir().unwrap();
        let gopath = dir.path().join("workspace");
        let main_go = gopath.join("src/app/main.go");
        write(&main_go, "package main\n\nfunc main() {}\n");
        write(
            &gopath.join("src/app/main_test.go"),
            "package main\n\nfunc TestMain() {}\n",
        );

        let context = BuildContext::new(PathBuf::new(), vec![gopath.clone()]);
        let deps = context.compute_deps(&main_go).unwrap();

        assert!(deps.contains(&main_go));
        assert!(!deps.contains(&gopath.join("src/app/main_test.go")));
    }

    #[test]
    fn test_compute_deps_missing_target_errors() {
        let context = BuildContext::new(PathBuf::new(), Vec::new());
        assert!(context
            .compute_deps(Path::new("/nonexistent/main.go"))
            .is_err());
    }

    #[test]
    fn test_import_roots() {
        let roots = import_roots(Path::new("/home/dev/work/src/app/main.go"));
        assert_eq!(roots, vec![PathBuf::from("/home/dev/work")]);

        assert!(import_roots(Path::new("/home/dev/app/main.go")).is_empty());
    }

    #[test]
    fn test_absolutize_cleans_components() {
        assert_eq!(
            absolutize(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
    }

    #[test]
    fn test_go_binary_defaults_without_goroot() {
        let context = BuildContext::new(PathBuf::new(), Vec::new());
        assert_eq!(context.go_binary(), "go");
    }
}
