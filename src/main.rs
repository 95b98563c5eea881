use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use overseer::config::EngineConfig;
use overseer::engine::Engine;
use overseer::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "overseer")]
#[command(version)]
#[command(about = "Coordination engine for worker sessions, service health, and promotions")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the engine in the foreground
    Server(ServerArgs),

    /// Launch the engine as a background daemon
    Start(ServerArgs),

    /// Stop a running daemon
    Stop {
        /// Path to the engine config file
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Stop and relaunch the daemon
    Restart(ServerArgs),

    /// Show engine status
    Status {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Run one probe cycle against every target and act on the results
    Check {
        /// Path to the engine config file
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Task management commands
    Task {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Session management commands
    Session {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: SessionCommands,
    },

    /// Trigger a promotion for an edge, bypassing the counters
    Promote {
        #[command(flatten)]
        client: ClientArgs,

        /// Edge name, e.g. "dev-qa"
        edge: String,
    },
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Path to the engine config file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Override the configured listen address
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Engine API address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8700")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum TaskCommands {
    /// Submit a new task
    Submit {
        /// What the claiming session should do
        description: String,

        /// Higher runs first
        #[arg(long, short = 'p', default_value = "0")]
        priority: i64,

        /// Capabilities a session must have (comma-separated)
        #[arg(long, value_delimiter = ',')]
        caps: Vec<String>,

        /// Project the task belongs to
        #[arg(long)]
        project: Option<String>,
    },
    /// Get status of a specific task
    Status {
        /// The task ID (UUID)
        task_id: String,
    },
    /// List tasks
    List {
        /// Only tasks in this status (pending, assigned, in_progress,
        /// completed, failed, dead_letter)
        #[arg(long)]
        status: Option<String>,
    },
}

#[derive(clap::Subcommand, Debug)]
enum SessionCommands {
    /// Register a worker session
    Register {
        name: String,

        /// Capabilities the session advertises (comma-separated)
        #[arg(long, value_delimiter = ',')]
        caps: Vec<String>,
    },
    /// Send a heartbeat for a session
    Heartbeat { name: String },
    /// List sessions
    List,
    /// Return a busy session to idle, requeueing its task
    Release { name: String },
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn load_config(path: &Option<PathBuf>) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(EngineConfig::from_file(path)?),
        None => Ok(EngineConfig::default()),
    }
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let mut config = load_config(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        targets = config.targets.len(),
        edges = config.edges.len(),
        "Starting overseer engine"
    );

    let shutdown = install_shutdown_handler();
    let engine = Engine::new(config);
    engine.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Daemon control
// =============================================================================

fn start_daemon(args: &ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args.config)?;
    if let Some(pid) = read_pid(&config.pid_file) {
        if process_alive(pid) {
            eprintln!("Already running (pid {pid})");
            std::process::exit(1);
        }
    }

    let exe = std::env::current_exe()?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("server");
    if let Some(path) = &args.config {
        cmd.arg("--config").arg(path);
    }
    if let Some(listen) = args.listen {
        cmd.arg("--listen").arg(listen.to_string());
    }
    let child = cmd
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;

    std::fs::write(&config.pid_file, child.id().to_string())?;
    println!("Started (pid {})", child.id());
    Ok(())
}

fn stop_daemon(config_path: &Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    let Some(pid) = read_pid(&config.pid_file) else {
        println!("Not running");
        return Ok(());
    };

    let status = std::process::Command::new("kill")
        .arg(pid.to_string())
        .status()?;
    if status.success() {
        println!("Stopped (pid {pid})");
    } else {
        println!("Process {pid} was already gone");
    }
    let _ = std::fs::remove_file(&config.pid_file);
    Ok(())
}

fn read_pid(path: &PathBuf) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

async fn run_check(config_path: &Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let config = load_config(config_path)?;
    if config.targets.is_empty() {
        println!("No targets configured.");
        return Ok(());
    }

    let engine = Engine::new(config);
    engine.load_state().await?;
    let all_healthy = engine.check_once().await;
    engine.persist().await?;
    if !all_healthy {
        std::process::exit(1);
    }
    Ok(())
}

// =============================================================================
// Client command handlers
// =============================================================================

async fn get_json(client: &reqwest::Client, url: &str) -> Result<Value, Box<dyn std::error::Error>> {
    let resp = client.get(url).send().await?;
    if !resp.status().is_success() {
        return Err(format!("{url} returned {}", resp.status()).into());
    }
    Ok(resp.json().await?)
}

async fn post_json(
    client: &reqwest::Client,
    url: &str,
    body: Option<Value>,
) -> Result<(reqwest::StatusCode, Value), Box<dyn std::error::Error>> {
    let mut req = client.post(url);
    if let Some(body) = body {
        req = req.json(&body);
    }
    let resp = req.send().await?;
    let status = resp.status();
    let value = resp.json().await.unwrap_or(Value::Null);
    Ok((status, value))
}

async fn handle_status(client_args: &ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    let client = reqwest::Client::new();
    let status = match get_json(&client, &format!("{}/api/status", client_args.addr)).await {
        Ok(status) => status,
        Err(_) => {
            println!("Engine is not reachable at {}", client_args.addr);
            std::process::exit(1);
        }
    };

    match client_args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        OutputFormat::Table => {
            println!("Tasks:");
            if let Some(tasks) = status.get("tasks").and_then(|t| t.as_object()) {
                if tasks.is_empty() {
                    println!("  none");
                }
                for (state, count) in tasks {
                    println!("  {:<12} {}", state, count);
                }
            }
            println!();
            println!("Sessions:");
            if let Some(sessions) = status.get("sessions").and_then(|s| s.as_array()) {
                if sessions.is_empty() {
                    println!("  none");
                }
                for s in sessions {
                    println!(
                        "  {:<20} {:<8} {}",
                        s.get("name").and_then(|v| v.as_str()).unwrap_or("-"),
                        s.get("status").and_then(|v| v.as_str()).unwrap_or("-"),
                        s.get("current_task").and_then(|v| v.as_str()).unwrap_or("-"),
                    );
                }
            }
            println!();
            println!("Targets:");
            if let Some(targets) = status.get("targets").and_then(|t| t.as_object()) {
                if targets.is_empty() {
                    println!("  none");
                }
                for (name, health) in targets {
                    println!("  {:<20} {}", name, health.as_str().unwrap_or("-"));
                }
            }
        }
    }

    let degraded = status
        .get("targets")
        .and_then(|t| t.as_object())
        .map(|targets| targets.values().any(|h| h.as_str() != Some("healthy")))
        .unwrap_or(false);
    if degraded {
        std::process::exit(1);
    }
    Ok(())
}

async fn handle_task_submit(
    client_args: &ClientArgs,
    description: String,
    priority: i64,
    caps: Vec<String>,
    project: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = reqwest::Client::new();
    let body = serde_json::json!({
        "description": description,
        "priority": priority,
        "required_caps": caps,
        "project": project,
    });
    let (status, resp) = post_json(
        &client,
        &format!("{}/api/tasks", client_args.addr),
        Some(body),
    )
    .await?;
    if !status.is_success() {
        eprintln!(
            "Error: {}",
            resp.get("error").and_then(|e| e.as_str()).unwrap_or("submit failed")
        );
        std::process::exit(1);
    }

    match client_args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&resp)?),
        OutputFormat::Table => {
            println!("Task submitted successfully!");
            println!(
                "Task ID: {}",
                resp.get("task_id").and_then(|v| v.as_str()).unwrap_or("-")
            );
        }
    }
    Ok(())
}

async fn handle_task_status(
    client_args: &ClientArgs,
    task_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = reqwest::Client::new();
    let task = get_json(&client, &format!("{}/api/tasks/{task_id}", client_args.addr)).await?;

    match client_args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&task)?),
        OutputFormat::Table => {
            let s = |key: &str| task.get(key).and_then(|v| v.as_str()).unwrap_or("-").to_string();
            println!("Task ID:     {}", s("id"));
            println!("Status:      {}", s("status"));
            println!("Priority:    {}", task.get("priority").and_then(|v| v.as_i64()).unwrap_or(0));
            println!(
                "Attempts:    {}/{}",
                task.get("attempts").and_then(|v| v.as_u64()).unwrap_or(0),
                task.get("max_retries").and_then(|v| v.as_u64()).map(|m| m + 1).unwrap_or(1),
            );
            if task.get("assigned_session").and_then(|v| v.as_str()).is_some() {
                println!("Session:     {}", s("assigned_session"));
            }
            println!("Description: {}", s("description"));
            if let Some(result) = task.get("result").and_then(|v| v.as_str()) {
                println!("Result:");
                for line in result.lines() {
                    println!("  {line}");
                }
            }
            if let Some(error) = task.get("error").and_then(|v| v.as_str()) {
                println!("Error:");
                for line in error.lines() {
                    println!("  {line}");
                }
            }
        }
    }
    Ok(())
}

async fn handle_task_list(
    client_args: &ClientArgs,
    status: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = reqwest::Client::new();
    let url = match &status {
        Some(status) => format!("{}/api/tasks?status={status}", client_args.addr),
        None => format!("{}/api/tasks", client_args.addr),
    };
    let tasks = get_json(&client, &url).await?;

    match client_args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&tasks)?),
        OutputFormat::Table => {
            let tasks = tasks.as_array().cloned().unwrap_or_default();
            if tasks.is_empty() {
                println!("No tasks found.");
                return Ok(());
            }
            println!(
                "{:<38} {:<12} {:<6} {:<16} DESCRIPTION",
                "TASK ID", "STATUS", "PRIO", "SESSION"
            );
            println!("{}", "-".repeat(96));
            for task in &tasks {
                let desc = task
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or("-");
                let desc_display = ellipsize(desc, 24);
                println!(
                    "{:<38} {:<12} {:<6} {:<16} {}",
                    task.get("id").and_then(|v| v.as_str()).unwrap_or("-"),
                    task.get("status").and_then(|v| v.as_str()).unwrap_or("-"),
                    task.get("priority").and_then(|v| v.as_i64()).unwrap_or(0),
                    task.get("assigned_session").and_then(|v| v.as_str()).unwrap_or("-"),
                    desc_display,
                );
            }
            println!();
            println!("{} tasks", tasks.len());
        }
    }
    Ok(())
}

/// Shorten text to `max` characters for table cells. Counts chars, not
/// bytes, so multibyte descriptions never split mid-character.
fn ellipsize(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let cut: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}

async fn handle_session_list(client_args: &ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    let client = reqwest::Client::new();
    let sessions = get_json(&client, &format!("{}/api/sessions", client_args.addr)).await?;

    match client_args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&sessions)?),
        OutputFormat::Table => {
            let sessions = sessions.as_array().cloned().unwrap_or_default();
            if sessions.is_empty() {
                println!("No sessions registered.");
                return Ok(());
            }
            println!("{:<20} {:<8} {:<38} CAPABILITIES", "NAME", "STATUS", "TASK");
            println!("{}", "-".repeat(90));
            for s in &sessions {
                let caps = s
                    .get("capabilities")
                    .and_then(|v| v.as_array())
                    .map(|a| {
                        a.iter()
                            .filter_map(|c| c.as_str())
                            .collect::<Vec<_>>()
                            .join(",")
                    })
                    .unwrap_or_default();
                println!(
                    "{:<20} {:<8} {:<38} {}",
                    s.get("name").and_then(|v| v.as_str()).unwrap_or("-"),
                    s.get("status").and_then(|v| v.as_str()).unwrap_or("-"),
                    s.get("current_task").and_then(|v| v.as_str()).unwrap_or("-"),
                    caps,
                );
            }
        }
    }
    Ok(())
}

async fn handle_promote(
    client_args: &ClientArgs,
    edge: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = reqwest::Client::new();
    let (status, event) = post_json(
        &client,
        &format!("{}/api/promotions/{edge}", client_args.addr),
        None,
    )
    .await?;
    if !status.is_success() {
        eprintln!(
            "Error: {}",
            event.get("error").and_then(|e| e.as_str()).unwrap_or("promotion failed")
        );
        std::process::exit(1);
    }

    match client_args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&event)?),
        OutputFormat::Table => {
            println!(
                "Promotion {}: {}",
                edge,
                event.get("status").and_then(|v| v.as_str()).unwrap_or("-")
            );
            if let Some(tag) = event.get("tag").and_then(|v| v.as_str()) {
                println!("Tag: {tag}");
            }
            if let Some(stages) = event.get("stages").and_then(|v| v.as_array()) {
                for stage in stages {
                    let passed = stage.get("passed").and_then(|v| v.as_bool()).unwrap_or(false);
                    println!(
                        "  {:<10} {}{}",
                        stage.get("stage").and_then(|v| v.as_str()).unwrap_or("-"),
                        if passed { "ok" } else { "FAILED" },
                        stage
                            .get("detail")
                            .and_then(|v| v.as_str())
                            .map(|d| format!("  ({d})"))
                            .unwrap_or_default(),
                    );
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Start(server_args) => {
            start_daemon(&server_args)?;
        }
        Commands::Stop { config } => {
            stop_daemon(&config)?;
        }
        Commands::Restart(server_args) => {
            stop_daemon(&server_args.config)?;
            start_daemon(&server_args)?;
        }
        Commands::Status { client } => {
            handle_status(&client).await?;
        }
        Commands::Check { config } => {
            run_check(&config).await?;
        }
        Commands::Task { client, command } => match command {
            TaskCommands::Submit {
                description,
                priority,
                caps,
                project,
            } => {
                handle_task_submit(&client, description, priority, caps, project).await?;
            }
            TaskCommands::Status { task_id } => {
                handle_task_status(&client, task_id).await?;
            }
            TaskCommands::List { status } => {
                handle_task_list(&client, status).await?;
            }
        },
        Commands::Session { client, command } => match command {
            SessionCommands::Register { name, caps } => {
                let http = reqwest::Client::new();
                let body = serde_json::json!({ "name": name, "capabilities": caps });
                let (status, _) =
                    post_json(&http, &format!("{}/api/sessions", client.addr), Some(body)).await?;
                if status.is_success() {
                    println!("Session {name} registered");
                } else {
                    eprintln!("Error: registration failed ({status})");
                    std::process::exit(1);
                }
            }
            SessionCommands::Heartbeat { name } => {
                let http = reqwest::Client::new();
                let (status, _) = post_json(
                    &http,
                    &format!("{}/api/sessions/{name}/heartbeat", client.addr),
                    None,
                )
                .await?;
                if !status.is_success() {
                    eprintln!("Error: heartbeat failed ({status})");
                    std::process::exit(1);
                }
            }
            SessionCommands::List => {
                handle_session_list(&client).await?;
            }
            SessionCommands::Release { name } => {
                let http = reqwest::Client::new();
                let (status, resp) = post_json(
                    &http,
                    &format!("{}/api/sessions/{name}/release", client.addr),
                    None,
                )
                .await?;
                if status.is_success() {
                    println!("Session {name} released");
                } else {
                    eprintln!(
                        "Error: {}",
                        resp.get("error").and_then(|e| e.as_str()).unwrap_or("release failed")
                    );
                    std::process::exit(1);
                }
            }
        },
        Commands::Promote { client, edge } => {
            handle_promote(&client, edge).await?;
        }
    }

    Ok(())
}
