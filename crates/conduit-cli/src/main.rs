//! Conduit CLI: inspect and call MCP servers from the terminal.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use conduit_mcp::{McpClient, McpConfig, McpManager, McpServerConfig, RequestContext};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "conduit", version, about = "Talk to Model Context Protocol servers")]
struct Cli {
    /// Server table to load
    #[arg(long, env = "CONDUIT_CONFIG", default_value = "mcp.toml")]
    config: PathBuf,

    /// Per-request timeout in milliseconds (overrides the server default)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Enable verbose/debug logging
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to every configured server and summarize them
    Servers,
    /// List a server's tools
    Tools { server: String },
    /// Call a tool
    Call {
        server: String,
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// List a server's resources
    Resources { server: String },
    /// Read a resource
    Read { server: String, uri: String },
    /// List a server's prompts
    Prompts { server: String },
    /// Render a prompt
    Prompt {
        server: String,
        name: String,
        /// Prompt arguments as KEY=VALUE
        #[arg(long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,
    },
    /// Round-trip a ping
    Ping { server: String },
}

impl Command {
    /// Target server, for commands that talk to exactly one.
    fn server(&self) -> Option<&str> {
        match self {
            Command::Servers => None,
            Command::Tools { server }
            | Command::Call { server, .. }
            | Command::Resources { server }
            | Command::Read { server, .. }
            | Command::Prompts { server }
            | Command::Prompt { server, .. }
            | Command::Ping { server } => Some(server),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(io::stderr)
        .init();

    let config = load_config(&cli.config)?;
    let mut ctx = RequestContext::new();
    if let Some(ms) = cli.timeout_ms {
        ctx = ctx.with_timeout(Duration::from_millis(ms));
    }

    let Some(server) = cli.command.server().map(str::to_string) else {
        return servers(&config, &ctx).await;
    };
    let client = connect(&config, &server, &ctx).await?;
    let result = run(&client, cli.command, &ctx).await;
    if let Err(e) = client.disconnect().await {
        tracing::warn!("Error disconnecting from '{server}': {e}");
    }
    result
}

fn load_config(path: &Path) -> Result<McpConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

async fn connect(config: &McpConfig, server: &str, ctx: &RequestContext) -> Result<McpClient> {
    let server_config: &McpServerConfig = config
        .servers
        .get(server)
        .with_context(|| format!("No server named '{server}' in config"))?;
    let client = McpClient::new(server, server_config.clone());
    client
        .connect(ctx)
        .await
        .with_context(|| format!("Failed to connect to '{server}'"))?;
    Ok(client)
}

async fn servers(config: &McpConfig, ctx: &RequestContext) -> Result<()> {
    let manager = McpManager::start(config, ctx).await;
    for client in manager.clients() {
        let info = client.server_info().unwrap_or_default();
        println!(
            "{}\t{} {}\t{} tools, {} resources, {} prompts",
            client.server_name(),
            info.name,
            info.version,
            client.cached_tools().len(),
            client.cached_resources().len(),
            client.cached_prompts().len()
        );
    }
    let failed = config.servers.len() - manager.client_count();
    manager.shutdown().await;
    if failed > 0 {
        bail!("{failed} server(s) failed to connect");
    }
    Ok(())
}

async fn run(client: &McpClient, command: Command, ctx: &RequestContext) -> Result<()> {
    let output = match command {
        Command::Servers => return Ok(()),
        Command::Tools { .. } => serde_json::to_value(client.list_tools(ctx).await?)?,
        Command::Call { tool, args, .. } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("--args must be a JSON object")?;
            let result = client.call_tool(ctx, &tool, arguments).await?;
            if result.is_error {
                eprintln!("Tool '{tool}' reported an error");
            }
            serde_json::to_value(result)?
        }
        Command::Resources { .. } => serde_json::to_value(client.list_resources(ctx).await?)?,
        Command::Read { uri, .. } => serde_json::to_value(client.read_resource(ctx, &uri).await?)?,
        Command::Prompts { .. } => serde_json::to_value(client.list_prompts(ctx).await?)?,
        Command::Prompt { name, args, .. } => {
            let arguments = parse_prompt_args(&args)?;
            serde_json::to_value(client.get_prompt(ctx, &name, &arguments).await?)?
        }
        Command::Ping { .. } => {
            client.ping(ctx).await?;
            serde_json::json!({ "pong": true })
        }
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn parse_prompt_args(args: &[String]) -> Result<HashMap<String, String>> {
    args.iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => Ok((key.to_string(), value.to_string())),
            None => bail!("Expected KEY=VALUE, got '{pair}'"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_args_parse() {
        let args = vec!["lang=rust".to_string(), "q=a=b".to_string()];
        let parsed = parse_prompt_args(&args).unwrap();
        assert_eq!(parsed["lang"], "rust");
        assert_eq!(parsed["q"], "a=b");
        assert!(parse_prompt_args(&["oops".to_string()]).is_err());
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from(["conduit", "ping", "fs"]).unwrap();
        assert!(!cli.verbose);
        assert!(matches!(cli.command, Command::Ping { ref server } if server == "fs"));
    }

    #[test]
    fn load_config_reports_missing_file() {
        let err = load_config(Path::new("/nonexistent/conduit/mcp.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }
}
