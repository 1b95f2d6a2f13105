use anyhow::{Context, Result};
use base64::prelude::*;
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "noetl")]
#[command(version, about = "NoETL command line client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// NoETL server URL (overrides NOETL_SERVER_URL)
    #[arg(long, global = true)]
    server_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start or stop the control-plane server process
    Server {
        #[command(subcommand)]
        command: ServerCommand,
    },
    /// Register a playbook in the catalog
    Register {
        /// Path to the playbook YAML file
        file: PathBuf,
        /// Resource type (default: Playbook)
        #[arg(long, default_value = "Playbook")]
        resource_type: String,
    },
    /// Execute a catalog playbook
    Execute {
        #[command(subcommand)]
        command: ExecuteCommand,
    },
    /// Inspect the catalog
    Catalog {
        #[command(subcommand)]
        command: CatalogCommand,
    },
}

#[derive(Subcommand)]
enum ServerCommand {
    /// Start the control-plane server as a background process
    Start {
        /// Also run schema bootstrap against the admin DSN after startup
        #[arg(long)]
        init_db: bool,
    },
    /// Stop a running control-plane server
    Stop {
        /// Skip the confirmation prompt and force-kill if needed
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum ExecuteCommand {
    /// Start a playbook execution by catalog path (or --catalog-id)
    Playbook {
        /// Catalog path of the playbook
        path: Option<String>,
        /// Catalog id (alternative to path)
        #[arg(long)]
        catalog_id: Option<i64>,
        /// Playbook version, or "latest"
        #[arg(long)]
        version: Option<String>,
        /// JSON file with execution parameters
        #[arg(long)]
        input: Option<PathBuf>,
        /// Emit raw JSON instead of a human summary
        #[arg(long)]
        json: bool,
    },
    /// Poll the status of a running execution
    Status {
        execution_id: String,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum CatalogCommand {
    /// List catalog entries
    List {
        /// Filter by resource type
        #[arg(long)]
        resource_type: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Register a playbook (alias of `noetl register`)
    Register { file: PathBuf },
    /// Start an execution for a catalog playbook (alias of `noetl execute playbook`)
    Execute {
        path: String,
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Serialize)]
struct CatalogRegisterRequest {
    content: String,
    resource_type: String,
}

fn server_url(cli_override: Option<&str>) -> String {
    cli_override
        .map(str::to_string)
        .or_else(|| std::env::var("NOETL_SERVER_URL").ok())
        .unwrap_or_else(|| "http://localhost:8082".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let base_url = server_url(cli.server_url.as_deref());
    let client = Client::new();

    match cli.command {
        Some(Commands::Server { command }) => match command {
            ServerCommand::Start { init_db } => start_server(init_db, &base_url).await?,
            ServerCommand::Stop { force } => stop_server(force).await?,
        },
        Some(Commands::Register { file, resource_type }) => {
            register_playbook(&client, &base_url, &file, &resource_type).await?
        }
        Some(Commands::Execute { command }) => match command {
            ExecuteCommand::Playbook {
                path,
                catalog_id,
                version,
                input,
                json,
            } => {
                if path.is_none() && catalog_id.is_none() {
                    anyhow::bail!("either a playbook path or --catalog-id must be given");
                }
                execute_playbook(&client, &base_url, path, catalog_id, version, input, json).await?
            }
            ExecuteCommand::Status { execution_id, json } => {
                get_status(&client, &base_url, &execution_id, json).await?
            }
        },
        Some(Commands::Catalog { command }) => match command {
            CatalogCommand::List { resource_type, json } => {
                list_catalog(&client, &base_url, resource_type.as_deref(), json).await?
            }
            CatalogCommand::Register { file } => {
                register_playbook(&client, &base_url, &file, "Playbook").await?
            }
            CatalogCommand::Execute { path, input, json } => {
                execute_playbook(&client, &base_url, Some(path), None, None, input, json).await?
            }
        },
        None => {
            println!("Usage: noetl <server|register|execute|catalog> ...");
            println!("Run `noetl --help` for details.");
        }
    }

    Ok(())
}

async fn register_playbook(
    client: &Client,
    base_url: &str,
    file: &PathBuf,
    resource_type: &str,
) -> Result<()> {
    let content =
        fs::read_to_string(file).with_context(|| format!("failed to read file: {}", file.display()))?;
    let request = CatalogRegisterRequest {
        content: BASE64_STANDARD.encode(&content),
        resource_type: resource_type.to_string(),
    };

    let response = client
        .post(format!("{base_url}/api/catalog/register"))
        .json(&request)
        .send()
        .await
        .context("failed to send register request")?;

    if response.status().is_success() {
        let body: serde_json::Value = response.json().await?;
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        anyhow::bail!("register failed: {status} - {text}");
    }
    Ok(())
}

async fn list_catalog(
    client: &Client,
    base_url: &str,
    resource_type: Option<&str>,
    json_only: bool,
) -> Result<()> {
    let body = serde_json::json!({ "resource_type": resource_type });
    let response = client
        .post(format!("{base_url}/api/catalog/list"))
        .json(&body)
        .send()
        .await
        .context("failed to send catalog list request")?;

    if response.status().is_success() {
        let result: serde_json::Value = response.json().await?;
        if json_only {
            println!("{}", serde_json::to_string(&result)?);
        } else {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    } else {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        anyhow::bail!("catalog list failed: {status} - {text}");
    }
    Ok(())
}

#[derive(Serialize)]
struct ExecuteRunRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    catalog_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    payload: serde_json::Value,
}

async fn execute_playbook(
    client: &Client,
    base_url: &str,
    path: Option<String>,
    catalog_id: Option<i64>,
    version: Option<String>,
    input: Option<PathBuf>,
    json_only: bool,
) -> Result<()> {
    let payload = if let Some(input_file) = input {
        let content = fs::read_to_string(&input_file)
            .with_context(|| format!("failed to read input file: {}", input_file.display()))?;
        serde_json::from_str(&content).context("failed to parse input JSON")?
    } else {
        serde_json::Value::Object(serde_json::Map::new())
    };

    let request = ExecuteRunRequest {
        path,
        catalog_id,
        version,
        payload,
    };

    let response = client
        .post(format!("{base_url}/api/executions/run"))
        .json(&request)
        .send()
        .await
        .context("failed to send execute request")?;

    if response.status().is_success() {
        let result: serde_json::Value = response.json().await?;
        if json_only {
            println!("{}", serde_json::to_string(&result)?);
        } else {
            println!("{}", serde_json::to_string_pretty(&result)?);
            if let Some(execution_id) = result.get("id").or_else(|| result.get("execution_id")) {
                println!("\nCheck status with: noetl execute status {}", execution_id);
            }
        }
    } else {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        anyhow::bail!("execute failed: {status} - {text}");
    }
    Ok(())
}

async fn get_status(client: &Client, base_url: &str, execution_id: &str, json_only: bool) -> Result<()> {
    let response = client
        .get(format!("{base_url}/api/executions/{execution_id}/status"))
        .send()
        .await
        .context("failed to send status request")?;

    if response.status().is_success() {
        let result: serde_json::Value = response.json().await?;
        if json_only {
            println!("{}", serde_json::to_string(&result)?);
            return Ok(());
        }

        let status = result.get("status").and_then(|v| v.as_str()).unwrap_or("UNKNOWN");
        let current_step = result.get("current_step").and_then(|v| v.as_str());
        let progress = result.get("progress");

        println!("Execution: {execution_id}");
        println!("Status:    {status}");
        if let Some(step) = current_step {
            println!("Current:   {step}");
        }
        if let Some(progress) = progress {
            println!(
                "Steps:     {}/{} completed, {} running, {} failed",
                progress.get("completed_steps").and_then(|v| v.as_i64()).unwrap_or(0),
                progress.get("total_steps").and_then(|v| v.as_i64()).unwrap_or(0),
                progress.get("running_steps").and_then(|v| v.as_i64()).unwrap_or(0),
                progress.get("failed_steps").and_then(|v| v.as_i64()).unwrap_or(0),
            );
        }
    } else {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        anyhow::bail!("status request failed: {status} - {text}");
    }
    Ok(())
}

fn pid_file_path() -> Result<PathBuf> {
    let dir = dirs::home_dir().context("could not determine home directory")?.join(".noetl");
    fs::create_dir_all(&dir)?;
    Ok(dir.join("noetl_server.pid"))
}

async fn start_server(init_db: bool, base_url: &str) -> Result<()> {
    use std::process::{Command, Stdio};

    let pid_file = pid_file_path()?;
    if pid_file.exists() {
        let pid_str = fs::read_to_string(&pid_file)?;
        if let Ok(pid) = pid_str.trim().parse::<i32>() {
            if process_exists(pid) {
                println!("Server already running with PID {pid} ({}).", pid_file.display());
                return Ok(());
            }
            fs::remove_file(&pid_file)?;
        }
    }

    let host = std::env::var("NOETL_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("NOETL_PORT").unwrap_or_else(|_| "8082".to_string());

    println!("Starting control-plane server at http://{host}:{port}...");

    let mut cmd = Command::new("noetl-control-plane");
    cmd.env("NOETL_HOST", &host)
        .env("NOETL_PORT", &port)
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let child = cmd
        .spawn()
        .context("failed to spawn noetl-control-plane. Is it installed on PATH?")?;
    let pid = child.id();
    fs::write(&pid_file, pid.to_string())?;
    println!("Server started with PID {pid} (PID file: {}).", pid_file.display());

    if init_db {
        tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
        let client = Client::new();
        match client.post(format!("{base_url}/api/db/init")).send().await {
            Ok(resp) if resp.status().is_success() => println!("Database schema initialized."),
            Ok(resp) => eprintln!("Warning: db init returned {}", resp.status()),
            Err(e) => eprintln!("Warning: could not reach server for db init: {e}"),
        }
    }
    Ok(())
}

async fn stop_server(force: bool) -> Result<()> {
    let pid_file = pid_file_path()?;
    if !pid_file.exists() {
        println!("No running server found (no PID file at {}).", pid_file.display());
        return Ok(());
    }

    let pid_str = fs::read_to_string(&pid_file)?;
    let pid: i32 = pid_str.trim().parse().context("invalid PID in file")?;

    if !process_exists(pid) {
        println!("Process {pid} not found; removing stale PID file.");
        fs::remove_file(&pid_file)?;
        return Ok(());
    }

    println!("Stopping server with PID {pid}...");
    send_signal(pid, nix::sys::signal::Signal::SIGTERM)?;

    for _ in 0..20 {
        if !process_exists(pid) {
            fs::remove_file(&pid_file)?;
            println!("Server stopped.");
            return Ok(());
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
    }

    if force {
        println!("Server didn't stop gracefully, force killing...");
        send_signal(pid, nix::sys::signal::Signal::SIGKILL)?;
    } else {
        println!("Server didn't stop gracefully within 10s. Re-run with --force to kill it.");
        return Ok(());
    }

    fs::remove_file(&pid_file)?;
    println!("Server stopped.");
    Ok(())
}

fn process_exists(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

fn send_signal(pid: i32, signal: nix::sys::signal::Signal) -> Result<()> {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal).context("failed to send signal")?;
    Ok(())
}
