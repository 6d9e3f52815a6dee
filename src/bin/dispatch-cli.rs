use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, RequestBuilder};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "dispatch-cli")]
#[command(about = "Management CLI for the dispatch engine", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, env = "DISPATCH_API_KEY", default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    /// Service pool to act on; the default pool when omitted
    #[arg(short, long, global = true)]
    service: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show engine status and pool counters
    Status,
    /// List service pools and their hosts
    Services,
    /// List backends with health and connection counts
    Backends,
    /// Register a backend
    Register {
        host: String,
        port: u16,
        #[arg(short, long, default_value_t = 1)]
        weight: u32,
    },
    /// Remove a backend by id
    Deregister { id: u64 },
    /// Stop routing new requests to a backend
    Drain { id: u64 },
    /// Return a drained backend to rotation
    Undrain { id: u64 },
    /// Show which backend a request key would go to
    Route { key: String },
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

    let scope: Vec<(&str, &str)> = cli
        .service
        .as_deref()
        .map(|name| vec![("service", name)])
        .unwrap_or_default();

    let call = |method: Method, path: &str| {
        client
            .request(method, format!("{}{}", cli.url, path))
            .headers(headers.clone())
            .query(&scope)
    };

    let request = match cli.command {
        Commands::Status => call(Method::GET, "/admin/status"),
        Commands::Services => call(Method::GET, "/admin/services"),
        Commands::Backends => call(Method::GET, "/admin/backends"),
        Commands::Register { host, port, weight } => call(Method::POST, "/admin/backends")
            .json(&json!({ "host": host, "port": port, "weight": weight })),
        Commands::Deregister { id } => call(Method::DELETE, &format!("/admin/backends/{}", id)),
        Commands::Drain { id } => call(Method::POST, &format!("/admin/backends/{}/drain", id)),
        Commands::Undrain { id } => call(Method::POST, &format!("/admin/backends/{}/undrain", id)),
        Commands::Route { key } => call(Method::GET, "/admin/route").query(&[("key", key)]),
    };

    send(request).await
}

async fn send(request: RequestBuilder) -> Result<(), Box<dyn std::error::Error>> {
    let res = request.send().await?;
    let status = res.status();
    let text = res.text().await?;

    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if !text.is_empty() {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    if text.is_empty() {
        println!("{}", status);
        return Ok(());
    }

    let json: Value = serde_json::from_str(&text)?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
