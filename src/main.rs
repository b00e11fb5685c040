mod api;
mod classify;
mod config;
mod model;
mod output;
mod redact;
mod render;
mod truncate;

use anyhow::{Context, Result};
use api::{CloudClient, HttpTransport, RuntimeEndpoint};
use clap::{Parser, Subcommand};
use config::Config;
use log::{debug, info};
use model::ExportDocument;
use serde_json::json;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "openhands-export")]
#[command(about = "OpenHands Cloud conversation exporter - pages events, redacts secrets and renders markdown transcripts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export a conversation's details and full event history as JSON
    Export {
        #[arg(long)]
        conversation_id: String,
        /// Output file (stdout when omitted)
        #[arg(long)]
        out: Option<PathBuf>,
        /// API base URL (overrides OPENHANDS_APP_BASE and the config file)
        #[arg(long)]
        base_url: Option<String>,
        /// Events per page
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=100))]
        limit: Option<u32>,
        /// Pause between page fetches, in milliseconds
        #[arg(long)]
        sleep_ms: Option<u64>,
    },
    /// Render an export as a markdown transcript
    Render {
        /// Export JSON file (stdin when omitted)
        #[arg(long = "in")]
        input: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
        /// Characters kept from the start of long tool output
        #[arg(long)]
        head: Option<usize>,
        /// Characters kept from the end of long tool output
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Redact and shorten every string in a JSON document
    Truncate {
        #[arg(long = "in")]
        input: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        max_len: Option<usize>,
        #[arg(long)]
        head: Option<usize>,
        #[arg(long)]
        tail: Option<usize>,
    },
    /// List conversations visible to the API key
    List {
        /// Conversations per page
        #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u32).range(1..=100))]
        limit: u32,
        #[arg(long)]
        base_url: Option<String>,
    },
    /// Print a short summary of a conversation
    Summary {
        #[arg(long)]
        conversation_id: String,
        #[arg(long)]
        base_url: Option<String>,
    },
    /// Print a single page of events
    Events {
        #[arg(long)]
        conversation_id: String,
        #[arg(long, default_value_t = 0)]
        start_id: i64,
        #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u32).range(1..=100))]
        limit: u32,
        /// Newest first
        #[arg(long)]
        reverse: bool,
        #[arg(long)]
        base_url: Option<String>,
    },
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = Cli::parse();
    let config = Config::load().context("Failed to load config")?;

    match cli.command {
        Commands::Export {
            conversation_id,
            out,
            base_url,
            limit,
            sleep_ms,
        } => {
            export_conversation(&config, &conversation_id, out, base_url, limit, sleep_ms)?;
        }
        Commands::Render {
            input,
            out,
            head,
            tail,
        } => {
            render_export(&config, input, out, head, tail)?;
        }
        Commands::Truncate {
            input,
            out,
            max_len,
            head,
            tail,
        } => {
            truncate_document(&config, input, out, max_len, head, tail)?;
        }
        Commands::List { limit, base_url } => {
            list_conversations(&config, limit, base_url)?;
        }
        Commands::Summary {
            conversation_id,
            base_url,
        } => {
            print_summary(&config, &conversation_id, base_url)?;
        }
        Commands::Events {
            conversation_id,
            start_id,
            limit,
            reverse,
            base_url,
        } => {
            print_events(&config, &conversation_id, start_id, limit, reverse, base_url)?;
        }
    }

    Ok(())
}

fn connect(config: &Config, base_url: Option<String>) -> Result<CloudClient<HttpTransport>> {
    let api_key = config::api_key()?;
    let base_url = config.base_url(base_url.as_deref());
    debug!("Using API base {}", base_url);

    let transport = HttpTransport::new(&api_key, config.timeout())?;
    Ok(CloudClient::new(transport, &base_url))
}

fn export_conversation(
    config: &Config,
    conversation_id: &str,
    out: Option<PathBuf>,
    base_url: Option<String>,
    limit: Option<u32>,
    sleep_ms: Option<u64>,
) -> Result<()> {
    let mut client = connect(config, base_url)?;

    let details = client
        .get_conversation(conversation_id)
        .with_context(|| format!("Failed to fetch conversation {}", conversation_id))?;

    let runtime = RuntimeEndpoint::from_details(&details);
    if let Some(runtime) = &runtime {
        info!("Runtime endpoint available at {}", runtime.url);
    }
    client.set_runtime(runtime);

    let limit = limit.unwrap_or(config.export.page_limit);
    let mut pages = client.iterate_events(conversation_id, 0, limit, config.page_delay(sleep_ms));
    let events = pages
        .by_ref()
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to fetch events for {}", conversation_id))?;
    let pages_fetched = pages.pages_fetched();

    let doc = ExportDocument::new(client.base_url(), details, events);
    output::write_json(out.as_deref(), &doc)?;

    info!(
        "Exported {} events in {} page(s) from {}",
        doc.events.len(),
        pages_fetched,
        conversation_id
    );
    Ok(())
}

fn render_export(
    config: &Config,
    input: Option<PathBuf>,
    out: Option<PathBuf>,
    head: Option<usize>,
    tail: Option<usize>,
) -> Result<()> {
    let value = output::read_json_input(input.as_deref())?;
    let doc = ExportDocument::from_value(value)?;

    let markdown = render::render_markdown(&doc, &config.render_options(head, tail));
    output::write_text(out.as_deref(), &markdown)?;

    info!("Rendered {} events", doc.events.len());
    Ok(())
}

fn truncate_document(
    config: &Config,
    input: Option<PathBuf>,
    out: Option<PathBuf>,
    max_len: Option<usize>,
    head: Option<usize>,
    tail: Option<usize>,
) -> Result<()> {
    let value = output::read_json_input(input.as_deref())?;
    let opts = config.truncate_options(max_len, head, tail);

    output::write_json(out.as_deref(), &truncate::truncate_value(&value, &opts))
}

fn list_conversations(config: &Config, limit: u32, base_url: Option<String>) -> Result<()> {
    let client = connect(config, base_url)?;

    let conversations = client
        .list_conversations(limit)
        .context("Failed to list conversations")?;

    // Listings may carry session keys; mask them like `truncate` does
    let value = serde_json::to_value(&conversations).context("Failed to serialize conversations")?;
    let opts = config.truncate_options(None, None, None);
    output::write_json(None, &truncate::truncate_value(&value, &opts))
}

fn print_summary(config: &Config, conversation_id: &str, base_url: Option<String>) -> Result<()> {
    let mut client = connect(config, base_url)?;

    let summary = client
        .conversation_summary(conversation_id)
        .with_context(|| format!("Failed to summarise conversation {}", conversation_id))?;

    let value = serde_json::to_value(&summary).context("Failed to serialize summary")?;
    output::write_json(None, &redact::redact_value(&value))
}

fn print_events(
    config: &Config,
    conversation_id: &str,
    start_id: i64,
    limit: u32,
    reverse: bool,
    base_url: Option<String>,
) -> Result<()> {
    let mut client = connect(config, base_url)?;

    let details = client
        .get_conversation(conversation_id)
        .with_context(|| format!("Failed to fetch conversation {}", conversation_id))?;
    client.set_runtime(RuntimeEndpoint::from_details(&details));

    let page = client
        .fetch_events(conversation_id, start_id, limit, reverse)
        .with_context(|| format!("Failed to fetch events for {}", conversation_id))?;

    let value = json!({
        "events": page.events,
        "has_more": page.has_more,
    });
    output::write_json(None, &redact::redact_value(&value))
}
