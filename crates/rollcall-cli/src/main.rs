use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance session CLI")]
struct Cli {
    /// Base URL of the rollcalld daemon
    #[arg(long, env = "ROLLCALL_URL", default_value = "http://127.0.0.1:8461")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a session for an institution
    Create {
        /// Institution id
        #[arg(short, long)]
        institution: Uuid,
        /// Course label (e.g., "CS 101")
        #[arg(short, long)]
        course: String,
    },
    /// Start an existing session
    Start {
        /// Session id
        id: Uuid,
    },
    /// Submit one camera frame from an image file
    Frame {
        /// Session id
        id: Uuid,
        /// Path to a JPEG or PNG frame
        path: std::path::PathBuf,
    },
    /// End a session and finalize attendance
    End {
        /// Session id
        id: Uuid,
    },
    /// Print the attendance report for a session
    Report {
        /// Session id
        id: Uuid,
    },
    /// Check daemon health
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Create { institution, course } => {
            let body = post_json(
                &client,
                &format!("{base}/api/v1/sessions"),
                serde_json::json!({ "institution_id": institution, "course": course }),
            )
            .await?;
            println!("{}", body["session_id"].as_str().unwrap_or_default());
        }
        Commands::Start { id } => {
            let body = post_empty(&client, &format!("{base}/api/v1/sessions/{id}/start")).await?;
            println!(
                "started at {}",
                body["started_at"].as_str().unwrap_or_default()
            );
        }
        Commands::Frame { id, path } => {
            let image = std::fs::read(&path)
                .with_context(|| format!("reading frame {}", path.display()))?;
            let response = client
                .post(format!("{base}/api/v1/sessions/{id}/frames"))
                .body(image)
                .send()
                .await
                .context("sending frame")?;
            let body = check(response).await?;
            println!(
                "faces: {}  recognized: {}  unknown: {}",
                body["faces_detected"],
                body["recognized"]
                    .as_array()
                    .map(Vec::len)
                    .unwrap_or_default(),
                body["unknown_faces"]
            );
        }
        Commands::End { id } => {
            let body = post_empty(&client, &format!("{base}/api/v1/sessions/{id}/end")).await?;
            println!(
                "present: {}  late: {}  absent: {}",
                body["present"], body["late"], body["absent"]
            );
        }
        Commands::Report { id } => {
            let response = client
                .get(format!("{base}/api/v1/sessions/{id}/report"))
                .send()
                .await
                .context("fetching report")?;
            let body = check(response).await?;
            let records = body["records"].as_array().cloned().unwrap_or_default();
            if records.is_empty() {
                println!("no records");
            }
            for record in records {
                println!(
                    "{}  {:<8} confidence {:.2}  {}",
                    record["student_id"].as_str().unwrap_or_default(),
                    record["status"].as_str().unwrap_or_default(),
                    record["confidence"].as_f64().unwrap_or_default(),
                    record["full_name"].as_str().unwrap_or_default(),
                );
            }
        }
        Commands::Health => {
            let response = client
                .get(format!("{base}/healthz"))
                .send()
                .await
                .context("daemon unreachable")?;
            let body = check(response).await?;
            println!("rollcalld: {}", body["status"].as_str().unwrap_or("unknown"));
        }
    }

    Ok(())
}

async fn post_json(client: &reqwest::Client, url: &str, body: Value) -> Result<Value> {
    let response = client
        .post(url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("POST {url}"))?;
    check(response).await
}

async fn post_empty(client: &reqwest::Client, url: &str) -> Result<Value> {
    let response = client
        .post(url)
        .send()
        .await
        .with_context(|| format!("POST {url}"))?;
    check(response).await
}

/// Surface daemon error payloads instead of a bare status code.
async fn check(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        let message = body["error"].as_str().unwrap_or("unknown error");
        bail!("{status}: {message}");
    }
    Ok(body)
}
