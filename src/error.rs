use std::fmt;

/// Errors surfaced to inbound requests through the readiness gate and
/// rendered by the proxy's error page.
#[derive(Debug, Clone)]
pub enum ServeError {
    /// Toolchain failure while rebuilding the target.
    Build(String),
    /// The child failed to spawn, the port was unresolvable, or the
    /// readiness probe timed out.
    Start(String),
    /// Upstream failure while forwarding a request.
    Runtime(String),
}

impl ServeError {
    pub fn title(&self) -> &'static str {
        match self {
            ServeError::Build(_) => "Build Error",
            ServeError::Start(_) => "Start Error",
            ServeError::Runtime(_) => "Error",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ServeError::Build(msg) | ServeError::Start(msg) | ServeError::Runtime(msg) => msg,
        }
    }
}

impl fmt::Display for ServeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.title(), self.message())
    }
}

impl std::error::Error for ServeError {}

impl From<crate::builder::BuildError> for ServeError {
    fn from(err: crate::builder::BuildError) -> Self {
        ServeError::Build(err.message().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_titles() {
        assert_eq!(ServeError::Build("x".into()).title(), "Build Error");
        assert_eq!(ServeError::Start("x".into()).title(), "Start Error");
        assert_eq!(ServeError::Runtime("x".into()).title(), "Error");
    }

    #[test]
    fn test_display_includes_message() {
        let err = ServeError::Build("main.go:3: undefined: foo".into());
        assert_eq!(err.to_string(), "Build Error: main.go:3: undefined: foo");
    }
}
