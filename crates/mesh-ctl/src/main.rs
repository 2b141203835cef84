//! mesh-ctl — command-line client for the mesh API gateway.

mod probe;

use anyhow::{Context, Result};

use mesh_core::config::MeshConfig;
use mesh_services::telemetry;

const DEFAULT_API: &str = "http://127.0.0.1:18881";
const DEFAULT_TYPE: &str = "Socket";
const DEFAULT_CLIENTS: usize = 1;

// ── HTTP helpers ──────────────────────────────────────────────────────────────

pub(crate) async fn fetch_connectors(api: &str, kind: &str) -> Result<Vec<String>> {
    let url = format!("{}/GetConnector?type={}", api.trim_end_matches('/'), kind);
    reqwest::get(&url)
        .await
        .with_context(|| format!("failed to reach API at {} (is meshd running?)", url))?
        .json::<Vec<String>>()
        .await
        .context("failed to parse response")
}

// ── Subcommand handlers ───────────────────────────────────────────────────────

async fn cmd_connectors(api: &str, kind: &str) -> Result<()> {
    let endpoints = fetch_connectors(api, kind).await?;
    if endpoints.is_empty() {
        println!("No {} connectors available.", kind);
        return Ok(());
    }
    println!("{} connectors ({}):", kind, endpoints.len());
    for endpoint in &endpoints {
        println!("  {}", endpoint);
    }
    Ok(())
}

fn print_usage() {
    println!("Usage: mesh-ctl [--api <url>] <command>");
    println!();
    println!("Commands:");
    println!("  connectors [--type Socket|WebSocket]     List connector endpoints");
    println!("  probe [--clients N] [--type T]           Run scripted sessions until Ctrl-C");
    println!("  help                                     Show this message");
    println!();
    println!("Default API: {}", DEFAULT_API);
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let config = MeshConfig::load().unwrap_or_default();
    telemetry::init(&config.logging).context("failed to install log subscriber")?;

    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut api = DEFAULT_API.to_string();
    let mut kind = DEFAULT_TYPE.to_string();
    let mut clients = DEFAULT_CLIENTS;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--api" => {
                i += 1;
                api = args.get(i).context("--api requires a value")?.clone();
            }
            "--type" => {
                i += 1;
                kind = args.get(i).context("--type requires a value")?.clone();
            }
            "--clients" => {
                i += 1;
                clients = args
                    .get(i)
                    .context("--clients requires a value")?
                    .parse()
                    .context("--clients must be a number")?;
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["connectors"] | [] => cmd_connectors(&api, &kind).await,
        ["probe"] => probe::run(&api, &kind, clients, &config).await,
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
