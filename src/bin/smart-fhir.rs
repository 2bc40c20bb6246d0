use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use smart_fhir_agent::observability::metrics::get_metrics;
use smart_fhir_agent::utils::config_loader;
use smart_fhir_agent::utils::logging;
use smart_fhir_agent::utils::logging::LogLevel;
use smart_fhir_agent::{AuthorizeOptions, FhirClient, PageSource, ResolveMode, TokenManager};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, env = "CONFIG", default_value = "smart-fhir.yaml")]
    config: String,
    #[arg(long, env = "LOG_LEVEL", value_enum)]
    log_level: Option<LogLevel>,
    /// print the Prometheus exposition to stderr before exiting
    #[arg(long)]
    metrics: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch the server's smart-configuration
    Discover,
    /// Print an access token (backend flow)
    Token {
        #[arg(long)]
        force: bool,
    },
    /// GET a resource or any path relative to the FHIR base
    Get { path: String },
    /// Walk the pages of a search result
    Search {
        path: String,
        #[arg(long)]
        limit: Option<usize>,
        /// print entry resources instead of whole pages
        #[arg(long)]
        items: bool,
    },
    /// Fetch a resource and resolve its references
    Resolve {
        path: String,
        #[arg(long, value_delimiter = ',', required = true)]
        refs: Vec<String>,
        /// report references without rewriting the resource
        #[arg(long)]
        flat: bool,
    },
    /// Build an authorization URL (PKCE + state)
    Authorize {
        #[arg(long)]
        launch: Option<String>,
    },
    /// Complete the authorization code flow from a redirect URL
    Exchange {
        #[arg(long)]
        callback: String,
        #[arg(long)]
        state: String,
        #[arg(long)]
        verifier: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // -------------------------------
    // 1. Load YAML config, init logging
    // -------------------------------

    let args = Args::parse();
    let agent_config = config_loader::run(&args.config).await?;
    logging::run(Some(&agent_config), args.log_level);

    // -------------------------------
    // 2. Build the token manager and FHIR client
    // -------------------------------

    let manager = Arc::new(TokenManager::new(agent_config.client, &agent_config.settings)?);
    let fhir = FhirClient::from_manager(manager.clone())?;
    info!("FHIR base {}", fhir.base_url());

    // -------------------------------
    // 3. Run the command
    // -------------------------------

    let outcome = run_command(args.command, &manager, &fhir).await;

    if args.metrics {
        eprintln!("{}", get_metrics().render());
    }
    outcome
}

async fn run_command(command: Command, manager: &Arc<TokenManager>, fhir: &FhirClient<TokenManager>) -> Result<()> {
    match command {
        Command::Discover => {
            let configuration = manager.discover().await?;
            print_json(&serde_json::to_value(configuration.as_ref())?)?;
        }
        Command::Token { force } => {
            let token = manager.get_access_token(force).await?;
            println!("{}", token);
        }
        Command::Get { path } => {
            let resource = fhir.request(http::Method::GET, &path, None).await?;
            print_json(&resource)?;
        }
        Command::Search { path, limit, items } => {
            let cancellation = CancellationToken::new();
            let on_signal = cancellation.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Ctrl-C received, stopping after the current page");
                    on_signal.cancel();
                }
            });

            let mut pages = fhir.pages(PageSource::Url(path)).with_cancellation(cancellation);
            if let Some(limit) = limit {
                pages = pages.with_limit(limit);
            }

            if items {
                let mut items = pages.items();
                while let Some(item) = items.next_item().await? {
                    println!("{}", serde_json::to_string(&item)?);
                }
            } else {
                while let Some(page) = pages.next_page().await? {
                    println!("{}", serde_json::to_string(&page)?);
                }
            }
        }
        Command::Resolve { path, refs, flat } => {
            let mut resource = fhir.request(http::Method::GET, &path, None).await?;
            let paths: Vec<&str> = refs.iter().map(String::as_str).collect();
            let mode = if flat { ResolveMode::Flat } else { ResolveMode::Graph };
            let cache = fhir.resolve_references(&mut resource, &paths, mode).await?;
            print_json(&json!({ "resource": resource, "references": cache.to_json() }))?;
        }
        Command::Authorize { launch } => {
            let request = manager
                .authorize(AuthorizeOptions {
                    launch,
                    ..AuthorizeOptions::default()
                })
                .await?;
            print_json(&serde_json::to_value(&request)?)?;
        }
        Command::Exchange {
            callback,
            state,
            verifier,
        } => {
            let session = manager.exchange(&callback, &state, &verifier).await?;
            print_json(&json!({
                "server_url": session.server_url.as_str(),
                "access_token": session.access_token,
                "token_type": session.token_type,
                "scope": session.scope,
                "refresh_token": session.refresh_token,
                "patient": session.patient,
                "encounter": session.encounter,
                "fhir_user": session.fhir_user(),
                "id_token_claims": session.id_token_claims,
            }))?;
        }
    }
    Ok(())
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
