use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use replex::cluster::local::LocalCluster;
use replex::cluster::mock::MockCluster;
use replex::config::{ImageConfig, MetricsConfig, SchedulerConfig};
use replex::server::with_combined_backend;
use replex::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "replex")]
#[command(version)]
#[command(about = "Scheduler for distributed replica-exchange sampling jobs")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the scheduler daemon
    Server(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Debug, Clone, ValueEnum)]
enum Driver {
    /// In-process dummy cluster (no real nodes; for demos and testing)
    Mock,
    /// Local child processes speaking the node contract
    Local,
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port for the REST API
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Cluster-wide cap on concurrently allocated nodes
    #[arg(long, default_value = "16")]
    max_nodes: u32,

    /// Cluster backend
    #[arg(long, value_enum, default_value = "mock")]
    driver: Driver,

    /// Node entrypoint command (local driver)
    #[arg(long, default_value = "re-node")]
    entrypoint: String,

    /// First loopback port handed to spawned nodes (local driver)
    #[arg(long, default_value = "42000")]
    node_base_port: u16,

    /// Default compute image for jobs that do not name one
    #[arg(long, default_value = "sampler:latest")]
    image: String,

    /// Image allowlist (comma-separated). Empty accepts any image.
    #[arg(long, default_value = "")]
    allowed_images: String,

    /// Graphite plaintext endpoint for job metrics (host:port)
    #[arg(long)]
    graphite: Option<String>,

    /// Bound on node-group readiness, in milliseconds
    #[arg(long, default_value = "120000")]
    provision_timeout_ms: u64,

    /// Heartbeat liveness bound, in milliseconds
    #[arg(long, default_value = "30000")]
    liveness_timeout_ms: u64,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Scheduler API address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
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
enum JobCommands {
    /// Submit a new sampling job
    Submit {
        /// Job name (also the metric namespace)
        #[arg(long)]
        name: String,

        /// Model reference the nodes load
        #[arg(long)]
        model: String,

        /// Number of replica-exchange ranks
        #[arg(long, default_value = "2")]
        replicas: u32,

        /// Compute image (defaults to the server's configured image)
        #[arg(long, default_value = "")]
        image: String,
    },
    /// Get the full record of a job
    Status {
        /// The job ID (UUID)
        job_id: String,
    },
    /// Stop a job (idempotent)
    Stop {
        /// The job ID (UUID)
        job_id: String,
    },
    /// List all jobs
    List,
}

// =============================================================================
// Wire types (mirror the REST API responses)
// =============================================================================

#[derive(Deserialize)]
struct SubmitJobResponse {
    id: String,
}

#[derive(Deserialize)]
struct JobActionResponse {
    id: String,
    status: String,
}

#[derive(Deserialize)]
struct JobSummary {
    id: String,
    name: String,
    status: String,
    created_at_ms: i64,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;

    let allowed_images: Vec<String> = args
        .allowed_images
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let mut config = SchedulerConfig::new(listen_addr, args.max_nodes)
        .with_image(ImageConfig {
            default_image: args.image,
            allowed_images,
            entrypoint: args.entrypoint.clone(),
        })
        .with_metrics(MetricsConfig {
            graphite_addr: args.graphite,
            ..Default::default()
        });
    config.provision_timeout_ms = args.provision_timeout_ms;
    config.liveness_timeout_ms = args.liveness_timeout_ms;

    tracing::info!(
        listen_addr = %config.listen_addr,
        max_nodes = config.max_cluster_nodes,
        driver = ?args.driver,
        "Starting replex scheduler"
    );

    let shutdown = install_shutdown_handler();
    let node_replace_budget = config.node_replace_budget;

    match args.driver {
        Driver::Mock => {
            let backend = Arc::new(MockCluster::new());
            with_combined_backend(config, backend).run(shutdown).await?;
        }
        Driver::Local => {
            let backend = Arc::new(LocalCluster::new(
                args.entrypoint,
                args.node_base_port,
                node_replace_budget,
            ));
            with_combined_backend(config, backend).run(shutdown).await?;
        }
    }

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn fail_on_error(response: reqwest::Response) -> reqwest::Response {
    if response.status().is_success() {
        return response;
    }
    let status = response.status();
    match response.json::<ErrorResponse>().await {
        Ok(err) => eprintln!("Error ({}): {}", err.error, err.message),
        Err(_) => eprintln!("Error: request failed with status {}", status),
    }
    std::process::exit(1);
}

async fn handle_job_submit(
    client: &reqwest::Client,
    addr: &str,
    name: String,
    model: String,
    replicas: u32,
    image: String,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let body = serde_json::json!({
        "name": name,
        "model_ref": model,
        "replica_count": replicas,
        "image": image,
    });

    let response = client.post(format!("{}/job", addr)).json(&body).send().await?;
    let response = fail_on_error(response).await;
    let resp: SubmitJobResponse = response.json().await?;

    match output {
        OutputFormat::Json => println!("{}", serde_json::json!({ "job_id": resp.id })),
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID: {}", resp.id);
        }
    }
    Ok(())
}

async fn handle_job_status(
    client: &reqwest::Client,
    addr: &str,
    job_id: String,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client.get(format!("{}/job/{}", addr, job_id)).send().await?;
    let response = fail_on_error(response).await;
    let detail: serde_json::Value = response.json().await?;

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&detail)?),
        OutputFormat::Table => {
            println!("Job ID:     {}", detail["id"].as_str().unwrap_or("-"));
            println!("Name:       {}", detail["name"].as_str().unwrap_or("-"));
            println!("Status:     {}", detail["status"].as_str().unwrap_or("-"));
            println!("Replicas:   {}", detail["replica_count"]);
            println!("Image:      {}", detail["image"].as_str().unwrap_or("-"));
            if let Some(group) = detail["node_group"].as_str() {
                println!("Node group: {}", group);
            }
            if let Some(reason) = detail["failure_reason"].as_str() {
                println!("Failure:    {}", reason);
            }
        }
    }
    Ok(())
}

async fn handle_job_stop(
    client: &reqwest::Client,
    addr: &str,
    job_id: String,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .post(format!("{}/job/{}/stop", addr, job_id))
        .send()
        .await?;
    let response = fail_on_error(response).await;
    let resp: JobActionResponse = response.json().await?;

    match output {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({ "job_id": resp.id, "status": resp.status })
            )
        }
        OutputFormat::Table => println!("Job {} is now {}", resp.id, resp.status),
    }
    Ok(())
}

async fn handle_job_list(
    client: &reqwest::Client,
    addr: &str,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client.get(format!("{}/jobs", addr)).send().await?;
    let response = fail_on_error(response).await;
    let jobs: Vec<JobSummary> = response.json().await?;

    match output {
        OutputFormat::Json => {
            let values: Vec<serde_json::Value> = jobs
                .iter()
                .map(|j| {
                    serde_json::json!({
                        "job_id": j.id,
                        "name": j.name,
                        "status": j.status,
                        "created_at_ms": j.created_at_ms,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&values)?);
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!("{:<38} {:<14} NAME", "JOB ID", "STATUS");
                println!("{}", "-".repeat(70));
                for job in &jobs {
                    println!("{:<38} {:<14} {}", job.id, job.status, job.name);
                }
                println!();
                println!("{} job(s)", jobs.len());
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Job { client, command } => {
            let http = reqwest::Client::new();
            let addr = client.addr.trim_end_matches('/').to_string();

            match command {
                JobCommands::Submit {
                    name,
                    model,
                    replicas,
                    image,
                } => {
                    handle_job_submit(&http, &addr, name, model, replicas, image, &client.output)
                        .await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&http, &addr, job_id, &client.output).await?;
                }
                JobCommands::Stop { job_id } => {
                    handle_job_stop(&http, &addr, job_id, &client.output).await?;
                }
                JobCommands::List => {
                    handle_job_list(&http, &addr, &client.output).await?;
                }
            }
        }
    }

    Ok(())
}
