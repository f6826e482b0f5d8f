use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Codex's `approval_policy`. Default `UnlessTrusted`.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum ApprovalPolicy {
    #[default]
    UnlessTrusted,
    OnFailure,
    OnRequest,
    Never,
}

impl ApprovalPolicy {
    pub fn as_cli_str(&self) -> &'static str {
        match self {
            ApprovalPolicy::UnlessTrusted => "untrusted",
            ApprovalPolicy::OnFailure => "on-failure",
            ApprovalPolicy::OnRequest => "on-request",
            ApprovalPolicy::Never => "never",
        }
    }
}

/// Stream-json's hook-level permission configuration.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum PermissionPolicy {
    #[default]
    Autonomous,
    Supervised,
    Plan,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum McpTransportConfig {
    Stdio {
        command: String,
        args: Vec<String>,
    },
    Sse {
        url: String,
    },
    Http {
        url: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct McpServerConfig {
    pub name: String,
    pub transport: McpTransportConfig,
}

/// Amp's one-shot subprocess mode: initial vs. continue invocation args and
/// any extra environment it needs.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct OneShotConfig {
    pub initial_args: Vec<String>,
    pub continue_args_template: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Shared configuration consumed by every adapter crate's factory function.
/// Individual adapters ignore the fields that don't apply to their protocol
/// (e.g. `one_shot_config` is Amp-only).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    binary: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    approval_policy: ApprovalPolicy,
    permission_policy: PermissionPolicy,
    auto_approve: bool,
    mcp_servers: Vec<McpServerConfig>,
    agent_id: Option<String>,
    agent_name: Option<String>,
    one_shot_config: Option<OneShotConfig>,
    permission_timeout: Option<Duration>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            binary: None,
            work_dir: None,
            env: BTreeMap::new(),
            approval_policy: ApprovalPolicy::default(),
            permission_policy: PermissionPolicy::default(),
            auto_approve: false,
            mcp_servers: Vec::new(),
            agent_id: None,
            agent_name: None,
            one_shot_config: None,
            permission_timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl GatewayConfig {
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }

    pub fn binary(&self) -> Option<&PathBuf> {
        self.binary.as_ref()
    }

    pub fn work_dir(&self) -> Option<&PathBuf> {
        self.work_dir.as_ref()
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn approval_policy(&self) -> ApprovalPolicy {
        self.approval_policy
    }

    pub fn permission_policy(&self) -> PermissionPolicy {
        self.permission_policy
    }

    pub fn auto_approve(&self) -> bool {
        self.auto_approve
    }

    pub fn mcp_servers(&self) -> &[McpServerConfig] {
        &self.mcp_servers
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }

    pub fn agent_name(&self) -> Option<&str> {
        self.agent_name.as_deref()
    }

    pub fn one_shot_config(&self) -> Option<&OneShotConfig> {
        self.one_shot_config.as_ref()
    }

    pub fn permission_timeout(&self) -> Option<Duration> {
        self.permission_timeout
    }
}

#[derive(Debug, Clone, Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    pub fn binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.config.binary = Some(binary.into());
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.insert(key.into(), value.into());
        self
    }

    pub fn approval_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.config.approval_policy = policy;
        self
    }

    pub fn permission_policy(mut self, policy: PermissionPolicy) -> Self {
        self.config.permission_policy = policy;
        self
    }

    pub fn auto_approve(mut self, enabled: bool) -> Self {
        self.config.auto_approve = enabled;
        self
    }

    pub fn mcp_server(mut self, server: McpServerConfig) -> Self {
        self.config.mcp_servers.push(server);
        self
    }

    pub fn agent_id(mut self, id: impl Into<String>) -> Self {
        self.config.agent_id = Some(id.into());
        self
    }

    pub fn agent_name(mut self, name: impl Into<String>) -> Self {
        self.config.agent_name = Some(name.into());
        self
    }

    pub fn one_shot_config(mut self, config: OneShotConfig) -> Self {
        self.config.one_shot_config = Some(config);
        self
    }

    pub fn permission_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.permission_timeout = timeout;
        self
    }

    pub fn build(self) -> GatewayConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = GatewayConfig::default();
        assert_eq!(config.approval_policy(), ApprovalPolicy::UnlessTrusted);
        assert_eq!(config.permission_policy(), PermissionPolicy::Autonomous);
        assert!(!config.auto_approve());
        assert_eq!(config.permission_timeout(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn builder_accumulates_mcp_servers() {
        let config = GatewayConfig::builder()
            .mcp_server(McpServerConfig {
                name: "fs".into(),
                transport: McpTransportConfig::Stdio {
                    command: "mcp-fs".into(),
                    args: vec![],
                },
            })
            .mcp_server(McpServerConfig {
                name: "web".into(),
                transport: McpTransportConfig::Http {
                    url: "https://example.test/mcp".into(),
                },
            })
            .build();
        assert_eq!(config.mcp_servers().len(), 2);
    }

    #[test]
    fn approval_policy_cli_strings() {
        assert_eq!(ApprovalPolicy::UnlessTrusted.as_cli_str(), "untrusted");
        assert_eq!(ApprovalPolicy::OnFailure.as_cli_str(), "on-failure");
        assert_eq!(ApprovalPolicy::OnRequest.as_cli_str(), "on-request");
        assert_eq!(ApprovalPolicy::Never.as_cli_str(), "never");
    }
}
