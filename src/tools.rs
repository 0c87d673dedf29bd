//! Runtime tool path resolution
//!
//! External binaries (git, helm, cosign, docker) are resolved through an
//! environment-variable override pattern: `{TOOL}_BIN` wins, PATH is the
//! fallback. Packaged installs export exact binary paths via these
//! variables; development machines just use PATH.

use std::env;

/// Get the path to an external tool
///
/// Checks for an environment variable `{TOOL}_BIN` (uppercase tool name +
/// "_BIN"). Falls back to the tool name itself, which relies on PATH.
pub fn get_tool_path(tool: &str) -> String {
    let env_var = format!("{}_BIN", tool.to_uppercase().replace('-', "_"));
    env::var(&env_var).unwrap_or_else(|_| tool.to_string())
}

/// Tool names used by airlift
pub mod tools {
    pub const GIT: &str = "git";
    pub const HELM: &str = "helm";
    pub const COSIGN: &str = "cosign";
    pub const DOCKER: &str = "docker";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_tool_path_from_env() {
        env::set_var("TEST_TOOL_BIN", "/custom/path/to/test-tool");
        assert_eq!(get_tool_path("test-tool"), "/custom/path/to/test-tool");
        env::remove_var("TEST_TOOL_BIN");
    }

    #[test]
    fn test_get_tool_path_fallback() {
        env::remove_var("MISSING_TOOL_BIN");
        assert_eq!(get_tool_path("missing-tool"), "missing-tool");
    }
}
