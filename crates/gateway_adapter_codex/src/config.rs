use std::path::{Path, PathBuf};

use gateway_core::{AdapterError, McpServerConfig, McpTransportConfig};
use toml::value::Table as TomlTable;
use toml::Value as TomlValue;

/// Default CODEX_HOME config file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// Resolves `$HOME/.codex/config.toml`.
pub fn default_config_path() -> PathBuf {
    let home = dirs_home();
    home.join(".codex").join(DEFAULT_CONFIG_FILE)
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Sanitizes an MCP server name to the `[A-Za-z0-9_-]` alphabet the Codex
/// config-file key requires.
pub fn sanitize_server_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// Rewrites an SSE URL ending in `/sse` to `/mcp`: Codex speaks streamable
/// HTTP, not SSE.
pub fn rewrite_sse_url(url: &str) -> String {
    url.strip_suffix("/sse")
        .map(|base| format!("{base}/mcp"))
        .unwrap_or_else(|| url.to_string())
}

fn server_toml_value(server: &McpServerConfig) -> TomlValue {
    let mut table = TomlTable::new();
    match &server.transport {
        McpTransportConfig::Stdio { command, args } => {
            table.insert("command".into(), TomlValue::String(command.clone()));
            table.insert(
                "args".into(),
                TomlValue::Array(args.iter().map(|a| TomlValue::String(a.clone())).collect()),
            );
        }
        McpTransportConfig::Sse { url } => {
            table.insert("url".into(), TomlValue::String(rewrite_sse_url(url)));
        }
        McpTransportConfig::Http { url } => {
            table.insert("url".into(), TomlValue::String(url.clone()));
        }
    }
    TomlValue::Table(table)
}

/// Merges `servers` into the `[mcp_servers]` section of the config file at
/// `path`, preserving every other top-level key untouched.
pub fn merge_mcp_config(path: &Path, servers: &[McpServerConfig]) -> Result<(), AdapterError> {
    if servers.is_empty() {
        return Ok(());
    }

    let mut root: TomlTable = if path.exists() {
        let text = std::fs::read_to_string(path)?;
        if text.trim().is_empty() {
            TomlTable::new()
        } else {
            text.parse::<TomlValue>()
                .ok()
                .and_then(|v| v.as_table().cloned())
                .unwrap_or_default()
        }
    } else {
        TomlTable::new()
    };

    let mut mcp_servers = match root.remove("mcp_servers") {
        Some(TomlValue::Table(existing)) => existing,
        _ => TomlTable::new(),
    };

    for server in servers {
        let key = sanitize_server_name(&server.name);
        mcp_servers.insert(key, server_toml_value(server));
    }

    root.insert("mcp_servers".into(), TomlValue::Table(mcp_servers));

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let serialized = toml::to_string_pretty(&TomlValue::Table(root))
        .map_err(|err| AdapterError::ProtocolError {
            context: "codex mcp config serialize",
            message: err.to_string(),
        })?;
    std::fs::write(path, serialized)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_disallowed_characters() {
        assert_eq!(sanitize_server_name("my server!"), "my_server_");
    }

    #[test]
    fn rewrites_sse_suffix_only() {
        assert_eq!(rewrite_sse_url("https://host/mcp/sse"), "https://host/mcp/mcp");
        assert_eq!(rewrite_sse_url("https://host/mcp"), "https://host/mcp");
    }

    #[test]
    fn merge_preserves_unrelated_keys_and_writes_servers() {
        let dir = std::env::temp_dir().join(format!("codex-cfg-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "model = \"gpt-5\"\n").unwrap();

        merge_mcp_config(
            &path,
            &[McpServerConfig {
                name: "file system".into(),
                transport: McpTransportConfig::Stdio {
                    command: "mcp-fs".into(),
                    args: vec![],
                },
            }],
        )
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("model = \"gpt-5\""));
        assert!(contents.contains("[mcp_servers.file_system]"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
