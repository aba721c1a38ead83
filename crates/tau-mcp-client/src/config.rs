//! JSON configuration for MCP servers the client can connect to.

use std::{collections::BTreeSet, path::Path};

use anyhow::{bail, Context, Result};
use reqwest::Url;
use serde::Deserialize;

use crate::{
    error::McpClientError,
    transport::{
        McpTransport, SseTransport, SseTransportConfig, StdioTransport, StdioTransportConfig,
        StreamableHttpTransport, StreamableHttpTransportConfig,
    },
};

pub const MCP_CLIENT_CONFIG_SCHEMA_VERSION: u32 = 1;

fn default_server_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct McpClientConfigFile {
    pub schema_version: u32,
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct McpServerConfig {
    pub name: String,
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub transport: McpTransportConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum McpTransportConfig {
    Tagged(McpTaggedTransportConfig),
    /// A bare `command` with no `transport` tag is a stdio server.
    LegacyStdio(StdioTransportConfig),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "transport", rename_all = "kebab-case")]
pub enum McpTaggedTransportConfig {
    Stdio(StdioTransportConfig),
    Sse(SseTransportConfig),
    StreamableHttp(StreamableHttpTransportConfig),
}

impl McpServerConfig {
    pub fn build_transport(&self) -> Result<Box<dyn McpTransport>, McpClientError> {
        let transport: Box<dyn McpTransport> = match &self.transport {
            McpTransportConfig::LegacyStdio(config)
            | McpTransportConfig::Tagged(McpTaggedTransportConfig::Stdio(config)) => {
                Box::new(StdioTransport::new(config.clone()))
            }
            McpTransportConfig::Tagged(McpTaggedTransportConfig::Sse(config)) => {
                Box::new(SseTransport::new(config.clone())?)
            }
            McpTransportConfig::Tagged(McpTaggedTransportConfig::StreamableHttp(config)) => {
                Box::new(StreamableHttpTransport::new(config.clone())?)
            }
        };
        Ok(transport)
    }
}

/// Loads, validates and normalizes the enabled servers of a config file.
pub fn load_mcp_client_servers(path: &Path) -> Result<Vec<McpServerConfig>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read mcp client config {}", path.display()))?;
    let parsed = serde_json::from_str::<McpClientConfigFile>(&raw)
        .with_context(|| format!("failed to parse mcp client config {}", path.display()))?;
    if parsed.schema_version != MCP_CLIENT_CONFIG_SCHEMA_VERSION {
        bail!(
            "unsupported mcp client config schema_version {} in {} (expected {})",
            parsed.schema_version,
            path.display(),
            MCP_CLIENT_CONFIG_SCHEMA_VERSION
        );
    }

    let mut seen_names = BTreeSet::new();
    let mut servers = Vec::new();
    for mut server in parsed.servers {
        if !server.enabled {
            continue;
        }
        let name = normalize_mcp_client_server_name(&server.name)?;
        if !seen_names.insert(name.clone()) {
            bail!(
                "duplicate mcp client server '{}' in {}",
                name,
                path.display()
            );
        }
        match &server.transport {
            McpTransportConfig::LegacyStdio(transport)
            | McpTransportConfig::Tagged(McpTaggedTransportConfig::Stdio(transport)) => {
                validate_stdio_transport(&name, transport)?
            }
            McpTransportConfig::Tagged(McpTaggedTransportConfig::Sse(transport)) => {
                validate_sse_transport(&name, transport)?
            }
            McpTransportConfig::Tagged(McpTaggedTransportConfig::StreamableHttp(transport)) => {
                validate_streamable_http_transport(&name, transport)?
            }
        }
        server.name = name;
        servers.push(server);
    }
    Ok(servers)
}

pub fn normalize_mcp_client_server_name(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("mcp client server name must be non-empty");
    }
    let mut normalized = String::with_capacity(trimmed.len());
    for ch in trimmed.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_') {
            normalized.push(ch.to_ascii_lowercase());
        } else {
            bail!(
                "mcp client server name '{}' must contain only ASCII letters, digits, '-' or '_'",
                trimmed
            );
        }
    }
    Ok(normalized)
}

fn validate_stdio_transport(server_name: &str, transport: &StdioTransportConfig) -> Result<()> {
    if transport.command.trim().is_empty() {
        bail!(
            "mcp client server '{}' stdio transport requires a non-empty command",
            server_name
        );
    }
    if transport.shutdown_timeout_ms == 0 {
        bail!(
            "mcp client server '{}' stdio shutdown_timeout_ms must be greater than 0",
            server_name
        );
    }
    Ok(())
}

fn validate_http_url(server_name: &str, field: &str, raw: &str) -> Result<Url> {
    if raw.trim().is_empty() {
        bail!("mcp client server '{}' requires {}", server_name, field);
    }
    let url = Url::parse(raw.trim())
        .with_context(|| format!("mcp client server '{server_name}' has invalid {field} '{raw}'"))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!(
            "mcp client server '{}' {} must use http or https (got '{}')",
            server_name,
            field,
            url.scheme()
        );
    }
    Ok(url)
}

fn validate_sse_transport(server_name: &str, transport: &SseTransportConfig) -> Result<()> {
    let base = validate_http_url(server_name, "base_url", &transport.base_url)?;
    for (field, path) in [
        ("sse_path", Some(transport.sse_path.as_str())),
        ("message_path", Some(transport.message_path.as_str())),
        ("health_path", transport.health_path.as_deref()),
    ] {
        if let Some(path) = path {
            base.join(path).with_context(|| {
                format!("mcp client server '{server_name}' has invalid {field} '{path}'")
            })?;
        }
    }
    if transport
        .session_id
        .as_deref()
        .is_some_and(|id| id.trim().is_empty())
    {
        bail!(
            "mcp client server '{}' sse session_id must be non-empty when set",
            server_name
        );
    }
    if transport.timeout_ms == 0 || transport.ready_timeout_ms == 0 {
        bail!(
            "mcp client server '{}' sse timeouts must be greater than 0",
            server_name
        );
    }
    Ok(())
}

fn validate_streamable_http_transport(
    server_name: &str,
    transport: &StreamableHttpTransportConfig,
) -> Result<()> {
    validate_http_url(server_name, "endpoint", &transport.endpoint)?;
    if transport.session_header.trim().is_empty() {
        bail!(
            "mcp client server '{}' streamable-http session_header must be non-empty",
            server_name
        );
    }
    if transport.timeout_ms == 0 {
        bail!(
            "mcp client server '{}' streamable-http timeout must be greater than 0",
            server_name
        );
    }
    Ok(())
}
