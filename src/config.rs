use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;

use crate::env::Env;

/// Escape character suppressing a single following `$` in
/// configuration values.
pub const DEFAULT_ESCAPE: char = '`';

const DEFAULT_PROXY_PORT: u16 = 80;
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Top-level configuration: the proxy port, toolchain defaults and the
/// virtual host entries.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    #[serde(rename = "GOROOT")]
    pub goroot: String,
    #[serde(rename = "GOPATH")]
    pub gopath: Vec<String>,
    #[serde(rename = "startupTimeout")]
    pub startup_timeout: u64,
    #[serde(rename = "server")]
    pub servers: Vec<HostConfig>,
}

/// One virtual host: immutable after load.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HostConfig {
    pub default: bool,
    pub host: String,
    pub port: u16,
    pub bin: String,
    pub target: String,
    #[serde(rename = "workingDir")]
    pub working_dir: String,
    pub startup: Vec<String>,
    pub builder: Vec<String>,
    #[serde(rename = "GOROOT")]
    pub goroot: String,
    #[serde(rename = "GOPATH")]
    pub gopath: Vec<String>,
    #[serde(rename = "startupTimeout")]
    pub startup_timeout: u64,
    pub env: HashMap<String, String>,
    pub resources: ResourceConfig,
    pub assets: ResourceConfig,
}

/// A set of watched root paths with an optional ignore pattern.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ResourceConfig {
    pub ignore: String,
    pub paths: Vec<String>,
}

/// Load and validate a configuration file. Host entries inherit
/// GOROOT/GOPATH/startupTimeout from the top level, then have their
/// string values expanded against the entry's own flattened fields and
/// the process environment.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read configuration file: {}", path.display()))?;
    let mut root: Value = serde_json::from_str(&text)
        .with_context(|| format!("unable to parse configuration file: {}", path.display()))?;

    let top_goroot = root.get("GOROOT").cloned();
    let top_gopath = root.get("GOPATH").cloned();
    let top_timeout = root.get("startupTimeout").cloned();

    if let Some(servers) = root.get_mut("server").and_then(Value::as_array_mut) {
        for entry in servers.iter_mut() {
            {
                let obj = entry
                    .as_object_mut()
                    .context("invalid server entry: expected an object")?;
                if !obj.contains_key("GOROOT") {
                    if let Some(value) = &top_goroot {
                        obj.insert("GOROOT".to_string(), value.clone());
                    }
                }
                if !obj.contains_key("GOPATH") {
                    if let Some(value) = &top_gopath {
                        obj.insert("GOPATH".to_string(), value.clone());
                    }
                }
                if !obj.contains_key("startupTimeout") {
                    if let Some(value) = &top_timeout {
                        obj.insert("startupTimeout".to_string(), value.clone());
                    }
                }
            }
            let env = Env::from_os();
            flatten_value("", entry, &env);
            expand_strings(entry, &env, DEFAULT_ESCAPE)?;
        }
    }

    let mut config: Config =
        serde_json::from_value(root).context("invalid configuration")?;

    if config.port == 0 {
        config.port = DEFAULT_PROXY_PORT;
    }

    let mut seen = HashSet::new();
    for server in &mut config.servers {
        server.host = server.host.trim().to_string();
        if server.host.is_empty() {
            server.host = "localhost".to_string();
        }
        if server.startup_timeout == 0 {
            server.startup_timeout = if config.startup_timeout > 0 {
                config.startup_timeout
            } else {
                DEFAULT_STARTUP_TIMEOUT_SECS
            };
        }
        if server.target.trim().is_empty() {
            anyhow::bail!("server {:?}: missing target", server.host);
        }
        if !seen.insert(server.host.clone()) {
            anyhow::bail!("duplicate server name {:?}", server.host);
        }
    }

    Ok(config)
}

/// Register each field of a config entry as a variable, nesting
/// flattened with `_` between levels. Entry fields shadow the process
/// environment.
fn flatten_value(prefix: &str, value: &Value, env: &Env) {
    let Value::Object(map) = value else {
        return;
    };
    for (key, nested) in map {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}_{key}")
        };
        match nested {
            Value::Object(_) => flatten_value(&name, nested, env),
            Value::String(s) => env.set(&name, &[s.as_str()]),
            Value::Number(n) => env.set(&name, &[n.to_string().as_str()]),
            _ => {}
        }
    }
}

/// Expand every string value in place.
fn expand_strings(value: &mut Value, env: &Env, escape: char) -> anyhow::Result<()> {
    match value {
        Value::String(s) => {
            *s = expand(s, env, escape)?;
        }
        Value::Array(items) => {
            for item in items {
                expand_strings(item, env, escape)?;
            }
        }
        Value::Object(map) => {
            for (_, nested) in map.iter_mut() {
                expand_strings(nested, env, escape)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Replace `$NAME` and `${NAME}` references with values from `env`.
/// The escape character suppresses a single following `$`; before any
/// other character it is kept verbatim. Unknown variables expand to
/// empty, malformed references are errors.
pub(crate) fn expand(input: &str, env: &Env, escape: char) -> anyhow::Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == escape {
            match chars.peek() {
                Some('$') => {
                    out.push(chars.next().expect("peeked"));
                }
                Some(_) => {
                    out.push(ch);
                    out.push(chars.next().expect("peeked"));
                }
                None => out.push(ch),
            }
        } else if ch == '$' {
            let braced = chars.peek() == Some(&'{');
            if braced {
                chars.next();
            }
            let mut name = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_alphanumeric() || c == '_' {
                    name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            if name.is_empty() {
                anyhow::bail!("invalid variable reference in {input:?}");
            }
            if braced && chars.next() != Some('}') {
                anyhow::bail!("unterminated variable reference ${{{name} in {input:?}");
            }
            out.push_str(&env.get(&name));
        } else {
            out.push(ch);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load_json(json: &str) -> anyhow::Result<Config> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        load(file.path())
    }

    #[test]
    fn test_expand_plain_and_braced() {
        let env = Env::new(vec!["NAME=world"]);
        assert_eq!(expand("hello $NAME", &env, '`').unwrap(), "hello world");
        assert_eq!(expand("hello ${NAME}!", &env, '`').unwrap(), "hello world!");
    }

    #[test]
    fn test_expand_unknown_variable_is_empty() {
        let env = Env::new(Vec::<String>::new());
        assert_eq!(expand("x$MISSING.y", &env, '`').unwrap(), "x.y");
    }

    #[test]
    fn test_expand_escape_suppresses_dollar() {
        let env = Env::new(vec!["NAME=world"]);
        assert_eq!(expand("`$NAME", &env, '`').unwrap(), "$NAME");
        assert_eq!(expand("a`b", &env, '`').unwrap(), "a`b");
    }

    #[test]
    fn test_expand_malformed_references_error() {
        let env = Env::new(Vec::<String>::new());
        assert!(expand("bad $!", &env, '`').is_err());
        assert!(expand("bad ${NAME", &env, '`').is_err());
    }

    #[test]
    fn test_load_applies_defaults() {
        let config = load_json(
            r#"{
                "server": [
                    {"target": "/srv/app/main.go"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.port, 80);
        let server = &config.servers[0];
        assert_eq!(server.host, "localhost");
        assert_eq!(server.startup_timeout, 10);
        assert_eq!(server.port, 0);
    }

    #[test]
    fn test_load_inherits_toolchain_settings() {
        let config = load_json(
            r#"{
                "GOROOT": "/opt/go",
                "GOPATH": ["/srv/workspace"],
                "startupTimeout": 30,
                "server": [
                    {"host": "a.local", "target": "/srv/app/main.go"},
                    {"host": "b.local", "target": "/srv/app/main.go", "GOROOT": "/opt/go-tip", "startupTimeout": 5}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.servers[0].goroot, "/opt/go");
        assert_eq!(config.servers[0].gopath, vec!["/srv/workspace"]);
        assert_eq!(config.servers[0].startup_timeout, 30);
        assert_eq!(config.servers[1].goroot, "/opt/go-tip");
        assert_eq!(config.servers[1].startup_timeout, 5);
    }

    #[test]
    fn test_load_expands_entry_fields_and_process_env() {
        std::env::set_var("DEVGATE_TEST_ROOT", "/srv");
        let config = load_json(
            r#"{
                "server": [
                    {
                        "host": "app.local",
                        "target": "$DEVGATE_TEST_ROOT/app/main.go",
                        "workingDir": "${DEVGATE_TEST_ROOT}/app",
                        "env": {"APP_HOST": "$host"}
                    }
                ]
            }"#,
        )
        .unwrap();

        let server = &config.servers[0];
        assert_eq!(server.target, "/srv/app/main.go");
        assert_eq!(server.working_dir, "/srv/app");
        assert_eq!(server.env.get("APP_HOST"), Some(&"app.local".to_string()));
    }

    #[test]
    fn test_load_flattens_nested_fields_with_underscore() {
        let config = load_json(
            r#"{
                "server": [
                    {
                        "host": "app.local",
                        "target": "/srv/app/main.go",
                        "resources": {"ignore": "_build", "paths": []},
                        "startup": ["--skip", "$resources_ignore"]
                    }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.servers[0].startup[1], "_build");
    }

    #[test]
    fn test_load_escaped_dollar_in_pattern() {
        let config = load_json(
            r#"{
                "server": [
                    {
                        "host": "app.local",
                        "target": "/srv/app/main.go",
                        "resources": {"ignore": "\\.swp`$", "paths": ["/srv/app"]}
                    }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.servers[0].resources.ignore, "\\.swp$");
    }

    #[test]
    fn test_load_rejects_duplicate_hosts() {
        let result = load_json(
            r#"{
                "server": [
                    {"host": "app.local", "target": "/srv/a/main.go"},
                    {"host": "app.local", "target": "/srv/b/main.go"}
                ]
            }"#,
        );
        assert!(result.unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn test_load_rejects_missing_target() {
        let result = load_json(r#"{"server": [{"host": "app.local"}]}"#);
        assert!(result.unwrap_err().to_string().contains("target"));
    }

    #[test]
    fn test_load_rejects_invalid_json() {
        let result = load_json("{not json");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_empty_config() {
        let config = load_json("{}").unwrap();
        assert_eq!(config.port, 80);
        assert!(config.servers.is_empty());
    }
}
