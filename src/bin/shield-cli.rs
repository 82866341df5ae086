use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "shield-cli")]
#[command(about = "Management CLI for admin-shield", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080", env = "SHIELD_URL")]
    url: String,

    #[arg(short, long, env = "SHIELD_API_KEY")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show component counts
    Status,
    /// Show recent security events
    Events {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// List incidents, newest first
    Incidents {
        #[arg(long)]
        unresolved: bool,
    },
    /// Open an incident manually
    Open {
        identity: String,
        /// auto_block, rate_limit_abuse, anomalous_traffic, credential_compromise, brute_force, manual
        #[arg(long, default_value = "manual")]
        kind: String,
        /// Extra details as key=value (e.g. device_id=D1 user_id=u7)
        #[arg(long = "detail", value_parser = parse_detail)]
        details: Vec<(String, String)>,
    },
    /// Run remediation actions against an incident
    Respond {
        id: String,
        /// BLOCK_IP, BLOCK_DEVICE, INVALIDATE_SESSION, SNAPSHOT_LOGS, ALERT
        #[arg(required = true)]
        actions: Vec<String>,
    },
    /// Mark an incident resolved
    Resolve { id: String },
    /// Block an identity
    Block {
        identity: String,
        #[arg(long)]
        duration_secs: Option<u64>,
        #[arg(long, default_value = "manual")]
        reason: String,
    },
    /// Lift a block and clear the violation counter
    Unblock { identity: String },
    /// Show abuse state for an identity
    Device { identity: String },
    /// Clear abuse state for an identity
    ResetDevice { identity: String },
    /// Show remaining quota without consuming it
    Quota { identity: String },
    /// Refill both rate limit buckets
    ResetQuota { identity: String },
    /// End every session of a user
    Logout { user_id: String },
    /// Permanently revoke an access token
    Revoke { token: String },
    /// Ask for a decision without the guard endpoint
    Inspect {
        identity: String,
        #[arg(default_value = "")]
        message: String,
    },
}

fn parse_detail(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let (method, path, body) = match cli.command {
        Commands::Status => (Method::GET, "/admin/status".to_string(), None),
        Commands::Events { limit } => (Method::GET, format!("/admin/events?limit={}", limit), None),
        Commands::Incidents { unresolved } => (
            Method::GET,
            format!("/admin/incidents?unresolved={}", unresolved),
            None,
        ),
        Commands::Open {
            identity,
            kind,
            details,
        } => {
            let details: serde_json::Map<String, Value> =
                details.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
            (
                Method::POST,
                "/admin/incidents".to_string(),
                Some(json!({ "identity": identity, "kind": kind, "details": details })),
            )
        }
        Commands::Respond { id, actions } => (
            Method::POST,
            format!("/admin/incidents/{}/respond", id),
            Some(json!({ "actions": actions })),
        ),
        Commands::Resolve { id } => (Method::POST, format!("/admin/incidents/{}/resolve", id), None),
        Commands::Block {
            identity,
            duration_secs,
            reason,
        } => (
            Method::POST,
            "/admin/blocks".to_string(),
            Some(json!({ "identity": identity, "duration_secs": duration_secs, "reason": reason })),
        ),
        Commands::Unblock { identity } => (Method::DELETE, format!("/admin/blocks/{}", identity), None),
        Commands::Device { identity } => (Method::GET, format!("/admin/devices/{}", identity), None),
        Commands::ResetDevice { identity } => {
            (Method::POST, format!("/admin/devices/{}/reset", identity), None)
        }
        Commands::Quota { identity } => (Method::GET, format!("/admin/limits/{}", identity), None),
        Commands::ResetQuota { identity } => {
            (Method::POST, format!("/admin/limits/{}/reset", identity), None)
        }
        Commands::Logout { user_id } => (
            Method::DELETE,
            format!("/admin/users/{}/sessions", user_id),
            None,
        ),
        Commands::Revoke { token } => (
            Method::POST,
            "/admin/tokens/revoke".to_string(),
            Some(json!({ "token": token })),
        ),
        Commands::Inspect { identity, message } => (
            Method::POST,
            "/v1/inspect".to_string(),
            Some(json!({ "identity": identity, "message": message })),
        ),
    };

    let mut request = client
        .request(method, format!("{}{}", cli.url, path))
        .headers(headers);
    if let Some(body) = body {
        request = request.json(&body);
    }
    print_response(request.send().await?).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    let text = res.text().await?;
    if text.is_empty() {
        println!("{}", status);
        return Ok(());
    }
    let json: Value = serde_json::from_str(&text)?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
