use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;
use ultrathink_mcp_client::{ClientConfig, ClientError, Priority, Session, SyncDirection};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Project scope passed to the server
    #[arg(long, env = "GOOSE_PROJECT")]
    project: Option<String>,

    /// Server name passed after `mcp`
    #[arg(long)]
    server: Option<String>,

    /// Executable that hosts the MCP server
    #[arg(long)]
    executable: Option<String>,

    /// Seconds to wait for each response
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the tools the server advertises
    Tools,
    /// Call a tool with JSON arguments
    Call {
        name: String,
        #[arg(long, default_value = "{}")]
        args: String,
        /// Check the arguments against the tool's input schema first
        #[arg(long)]
        validate: bool,
    },
    /// Store a memory
    Remember {
        content: String,
        #[arg(long, default_value = "medium")]
        priority: Priority,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Retrieve memories matching a query
    Retrieve {
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Add a sequential thought
    Sequence {
        thought: String,
        #[arg(long)]
        context: Option<String>,
    },
    /// Sync memories with the knowledge graph
    Sync {
        #[arg(long)]
        direction: Option<SyncDirection>,
    },
    /// Check that the server answers
    Ping,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match build_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("ultrathink-mcp-client: configuration error: {e}");
            std::process::exit(1);
        }
    };

    let mut session = Session::new(config);
    let outcome = match session.connect().await {
        Ok(()) => run(&session, cli.command).await,
        Err(e) => Err(e),
    };

    if let Err(e) = session.disconnect().await {
        tracing::warn!(error = %e, "disconnect failed");
    }

    match outcome {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("ultrathink-mcp-client: cannot print result: {e}");
                std::process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("ultrathink-mcp-client: {e}");
            std::process::exit(1);
        }
    }
}

fn build_config(cli: &Cli) -> Result<ClientConfig, String> {
    let mut config = ClientConfig::from_env()?;
    if let Some(project) = &cli.project {
        config = config.with_project(project.clone());
    }
    if let Some(server) = &cli.server {
        config.server_name = server.clone();
    }
    if let Some(executable) = &cli.executable {
        config = config.with_executable(executable.clone());
    }
    if let Some(secs) = cli.timeout_secs {
        config = config.with_request_timeout(Duration::from_secs(secs));
    }
    Ok(config)
}

async fn run(session: &Session, command: Command) -> Result<Value, ClientError> {
    match command {
        Command::Tools => {
            let tools = session.list_tools().await?;
            let listed: Vec<Value> = tools
                .into_iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                    })
                })
                .collect();
            Ok(Value::Array(listed))
        }
        Command::Call {
            name,
            args,
            validate,
        } => {
            let arguments: Value =
                serde_json::from_str(&args).map_err(|e| ClientError::InvalidArguments {
                    tool: name.clone(),
                    errors: vec![format!("--args is not valid JSON: {e}")],
                })?;
            if validate {
                let tools = session.list_tools().await?;
                match tools.iter().find(|t| t.name == name) {
                    Some(tool) => tool.validate_arguments(&arguments)?,
                    None => tracing::warn!(tool = %name, "tool not listed, skipping validation"),
                }
            }
            session.call_tool(&name, arguments).await
        }
        Command::Remember {
            content,
            priority,
            tags,
        } => session.remember(&content, priority, &tags).await,
        Command::Retrieve { query, limit } => {
            let memories = session.retrieve(&query, limit).await?;
            Ok(serde_json::to_value(memories)?)
        }
        Command::Sequence { thought, context } => {
            session.sequence(&thought, context.as_deref()).await
        }
        Command::Sync { direction } => session.sync_graph(direction).await,
        Command::Ping => {
            session.ping().await?;
            Ok(serde_json::json!({ "status": "ok" }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_must_be_positive() {
        let err = Cli::try_parse_from(["ultrathink-mcp-client", "--timeout-secs", "0", "ping"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);

        let cli = Cli::try_parse_from(["ultrathink-mcp-client", "--timeout-secs", "3", "ping"])
            .unwrap();
        assert_eq!(cli.timeout_secs, Some(3));
    }

    #[test]
    fn remember_parses_priority_and_tags() {
        let cli = Cli::try_parse_from([
            "ultrathink-mcp-client",
            "remember",
            "note",
            "--priority",
            "high",
            "--tag",
            "a",
            "--tag",
            "b",
        ])
        .unwrap();
        match cli.command {
            Command::Remember {
                content,
                priority,
                tags,
            } => {
                assert_eq!(content, "note");
                assert_eq!(priority, Priority::High);
                assert_eq!(tags, ["a", "b"]);
            }
            other => panic!("expected remember, got {other:?}"),
        }

        assert!(Cli::try_parse_from(["ultrathink-mcp-client", "remember", "x", "--priority", "urgent"]).is_err());
    }
}
