use std::path::{Path, PathBuf};

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{self, HeaderValue};
use hyper::{Response, StatusCode};
use regex::Regex;

use crate::error::ServeError;
use crate::reload;

const CLOSE_BODY: &[u8] = b"</body>";
const CLOSE_HTML: &[u8] = b"</html>";

/// Insert `snippet` immediately before the closing `</body>` tag,
/// tolerating a trailing `</html>` and whitespace. Malformed bodies
/// get the snippet appended at the end instead of failing.
pub fn inject_html(data: &[u8], snippet: &[u8]) -> Vec<u8> {
    let mut end = trim_trailing_whitespace(data, data.len());
    if ends_with_tag(data, end, CLOSE_HTML) {
        end = trim_trailing_whitespace(data, end - CLOSE_HTML.len());
    }
    let offset = if ends_with_tag(data, end, CLOSE_BODY) {
        end - CLOSE_BODY.len()
    } else {
        data.len()
    };

    let mut out = Vec::with_capacity(data.len() + snippet.len());
    out.extend_from_slice(&data[..offset]);
    out.extend_from_slice(snippet);
    out.extend_from_slice(&data[offset..]);
    out
}

fn trim_trailing_whitespace(data: &[u8], mut end: usize) -> usize {
    while end > 0 && matches!(data[end - 1], b' ' | b'\n' | b'\t' | b'\r' | 0x0c) {
        end -= 1;
    }
    end
}

fn ends_with_tag(data: &[u8], end: usize, tag: &[u8]) -> bool {
    end >= tag.len() && data[end - tag.len()..end].eq_ignore_ascii_case(tag)
}

/// A segment of a rendered error message; segments that resolved to a
/// source location carry a link into the code viewer.
#[derive(Debug, Clone)]
pub struct Node {
    pub text: String,
    pub link: Option<String>,
    pub line: u64,
}

/// Split an error message into nodes, linking `file:line` references
/// that resolve under one of the source directories to the code
/// viewer at `viewer_authority` (a `host:port`).
pub fn parse_error_nodes(message: &str, src_dirs: &[PathBuf], viewer_authority: &str) -> Vec<Node> {
    let location = Regex::new(r"^\s*([^\s:]+):(\d+)").expect("valid location pattern");
    message
        .lines()
        .map(|line| {
            let mut node = Node {
                text: line.to_string(),
                link: None,
                line: 0,
            };
            if let Some(captures) = location.captures(line) {
                let file = &captures[1];
                let line_no: u64 = captures[2].parse().unwrap_or(0);
                if let Some(relative) = resolve_source(file, src_dirs) {
                    node.link = Some(format!(
                        "//{viewer_authority}/{}:{line_no}",
                        relative.display()
                    ));
                    node.line = line_no;
                }
            }
            node
        })
        .collect()
}

/// Resolve a file reference from toolchain output against the source
/// directories, returning the path relative to its directory.
fn resolve_source(file: &str, src_dirs: &[PathBuf]) -> Option<PathBuf> {
    let path = Path::new(file);
    if path.is_absolute() {
        for dir in src_dirs {
            if let Ok(relative) = path.strip_prefix(dir) {
                return Some(relative.to_path_buf());
            }
        }
        return None;
    }
    for dir in src_dirs {
        if dir.join(path).exists() {
            return Some(path.to_path_buf());
        }
    }
    None
}

const PAGE_STYLE: &str = "\
html, body {
    padding: 5px;
    margin: 0;
    font: 14px/1.4 'Courier', monospace;
    color: red;
    background-color: #fafafa;
}
code span { white-space: pre; }
a { color: #b00; }
";

/// Render a build/start/runtime error as an HTML page. The page embeds
/// the reload script so an open browser recovers on the next
/// successful start.
pub fn error_page(title: &str, nodes: &[Node], proxy_port: u16) -> String {
    let mut body = String::new();
    for node in nodes {
        let text = html_escape(&node.text);
        match &node.link {
            Some(link) => body.push_str(&format!(
                "<a href=\"{link}#L{}\">{text}</a>\n",
                node.line
            )),
            None => body.push_str(&format!("<span>{text}</span>\n")),
        }
    }
    format!(
        "<!DOCTYPE html>\n<html lang=\"en-US\" dir=\"ltr\">\n<head>\n<meta charset=\"UTF-8\">\n<title>{title}</title>\n<style type=\"text/css\">{PAGE_STYLE}</style>\n</head>\n<body>\n<h1 class=\"name\">{title}</h1>\n<code>\n{body}</code>\n{script}</body>\n</html>\n",
        title = html_escape(title),
        script = reload::reload_script(proxy_port),
    )
}

/// The HTTP response wrapping `error_page`.
pub fn error_response(
    err: &ServeError,
    nodes: &[Node],
    proxy_port: u16,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let page = error_page(err.title(), nodes, proxy_port);
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header("X-Content-Type-Options", HeaderValue::from_static("nosniff"))
        .body(Full::new(Bytes::from(page)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

/// A plain-text response for routing failures and viewer errors.
pub fn plain_response(
    status: StatusCode,
    message: String,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(message)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

const CODE_STYLE: &str = "\
html, body {
    padding: 0;
    margin: 0;
    font: 14px/1.4 'Courier', monospace;
    color: #333;
    background-color: #fafafa;
    white-space: nowrap;
}
ol { margin: 0; }
li { white-space: pre; }
li.error { background-color: #ffd5d5; }
";

/// Render a source file as escaped, line-numbered HTML with the error
/// line highlighted.
pub fn code_page(title: &str, source: &str, error_line: u64) -> String {
    let mut lines = String::new();
    for (i, line) in source.lines().enumerate() {
        let number = i as u64 + 1;
        let class = if number == error_line { " class=\"error\"" } else { "" };
        lines.push_str(&format!(
            "<li id=\"L{number}\"{class}>{}</li>\n",
            html_escape(line)
        ));
    }
    format!(
        "<!DOCTYPE html>\n<html lang=\"en-US\" dir=\"ltr\">\n<head>\n<meta charset=\"UTF-8\">\n<title>{title}</title>\n<style type=\"text/css\">{CODE_STYLE}</style>\n</head>\n<body>\n<ol>\n{lines}</ol>\n</body>\n</html>\n",
        title = html_escape(title),
    )
}

fn html_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inject_before_body_and_html() {
        let out = inject_html(b"<html><body>hi</body></html>", b"<s/>");
        assert_eq!(out, b"<html><body>hi<s/></body></html>");
    }

    #[test]
    fn test_inject_before_body_without_html() {
        let out = inject_html(b"<body>hi</body>", b"<s/>");
        assert_eq!(out, b"<body>hi<s/></body>");
    }

    #[test]
    fn test_inject_tolerates_trailing_whitespace_and_case() {
        let out = inject_html(b"<BODY>hi</BODY>  </HTML>\n\t", b"<s/>");
        assert_eq!(out, b"<BODY>hi<s/></BODY>  </HTML>\n\t");
    }

    #[test]
    fn test_inject_appends_when_malformed() {
        let out = inject_html(b"<p>no closing tags", b"<s/>");
        assert_eq!(out, b"<p>no closing tags<s/>");
    }

    #[test]
    fn test_inject_appends_when_only_html_closes() {
        let out = inject_html(b"<p>odd</html>", b"<s/>");
        assert_eq!(out, b"<p>odd</html><s/>");
    }

    #[test]
    fn test_inject_preserves_byte_count() {
        let data = b"<html><body>x</body></html>";
        let snippet = b"<script></script>";
        let out = inject_html(data, snippet);
        assert_eq!(out.len(), data.len() + snippet.len());
    }

    #[test]
    fn test_inject_empty_body() {
        let out = inject_html(b"", b"<s/>");
        assert_eq!(out, b"<s/>");
    }

    #[test]
    fn test_parse_error_nodes_links_resolvable_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("app")).unwrap();
        std::fs::write(dir.path().join("app/main.go"), "package main\n").unwrap();

        let nodes = parse_error_nodes(
            "app/main.go:3: undefined: foo\nsome context line",
            &[dir.path().to_path_buf()],
            "localhost:9000",
        );

        assert_eq!(nodes.len(), 2);
        assert_eq!(
            nodes[0].link.as_deref(),
            Some("//localhost:9000/app/main.go:3")
        );
        assert_eq!(nodes[0].line, 3);
        assert!(nodes[1].link.is_none());
    }

    #[test]
    fn test_parse_error_nodes_unresolvable_files_stay_plain() {
        let nodes = parse_error_nodes(
            "missing.go:1: boom",
            &[PathBuf::from("/nonexistent")],
            "localhost:9000",
        );
        assert!(nodes[0].link.is_none());
    }

    #[test]
    fn test_error_page_escapes_and_embeds_reload() {
        let nodes = vec![Node {
            text: "<oops>".to_string(),
            link: None,
            line: 0,
        }];
        let page = error_page("Build Error", &nodes, 8080);
        assert!(page.contains("&lt;oops&gt;"));
        assert!(page.contains("Build Error"));
        assert!(page.contains("WebSocket"));
    }

    #[test]
    fn test_code_page_highlights_error_line() {
        let page = code_page("Source: main.go", "a\nb\nc", 2);
        assert!(page.contains("<li id=\"L2\" class=\"error\">b</li>"));
        assert!(page.contains("<li id=\"L1\">a</li>"));
    }
}
