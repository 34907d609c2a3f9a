use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use serde_json::json;
use stac_user::batch::{self, Batch};
use stac_user::search::{Filter, SearchParameters, SearchProvider, StacApiClient, EARTH_SEARCH_API};
use stac_user::selection::{self, Selection};
use stac_user::{s3, BatchOutcome, FetchConfig, FetchContext, FetchPlan, StacIo};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(version, about = "Search STAC APIs and download item assets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a starter selection file
    Template {
        #[arg(default_value = "./inputs/selection.toml")]
        output: PathBuf,
    },
    /// Search a STAC API and save the matching items
    Search(SearchArgs),
    /// Resolve a selection file into a fetch plan
    Plan {
        #[arg(short, long, default_value = "./inputs/selection.toml")]
        selection: PathBuf,
        #[arg(short, long, default_value = "./outputs/fetch_plan.json")]
        output: PathBuf,
    },
    /// Download the assets of a plan or a selection
    Fetch(FetchArgs),
}

#[derive(Args, Debug)]
struct SearchArgs {
    #[arg(long, default_value = EARTH_SEARCH_API)]
    api: String,
    #[arg(short, long, value_delimiter = ',')]
    collections: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    ids: Vec<String>,
    #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
    bbox: Option<Vec<f64>>,
    /// Single date, timestamp or `start/end` range
    #[arg(short, long)]
    datetime: Option<String>,
    /// CQL2 text filter
    #[arg(short, long)]
    filter: Option<String>,
    #[arg(long)]
    sortby: Option<String>,
    #[arg(long)]
    limit: Option<u64>,
    #[arg(long)]
    max_items: Option<usize>,
    #[arg(short, long, default_value = "./outputs/items.json")]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct FetchArgs {
    #[arg(short, long, conflicts_with = "selection")]
    plan: Option<PathBuf>,
    #[arg(short, long)]
    selection: Option<PathBuf>,
    /// Fetch settings, overriding those of the selection file
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(short, long, default_value = "./outputs/fetch_report.json")]
    report: PathBuf,
    /// AWS profile for s3:// hrefs; unsigned requests when omitted
    #[arg(long)]
    s3_profile: Option<String>,
    #[arg(long)]
    s3_region: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Template { output } => {
            let selection = Selection::from_template(&selection::sentinel2_template())?;
            if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            selection.write(&output)?;
            info!("Wrote selection template to {output:?}");
        }
        Command::Search(args) => search(args).await?,
        Command::Plan { selection, output } => {
            let selection = Selection::read(&selection)
                .with_context(|| format!("Could not read selection {selection:?}"))?;
            let client = StacApiClient::new(reqwest::Client::new(), &selection.api)?;
            let plan = selection.plan(&client).await?;
            plan.write(&output)?;
            info!(
                "Wrote plan with {} asset(s) to {output:?}",
                plan.descriptors().len()
            );
        }
        Command::Fetch(args) => fetch(args).await?,
    }
    Ok(())
}

async fn search(args: SearchArgs) -> Result<()> {
    let mut params = SearchParameters::new();
    if let Some(limit) = args.limit {
        params = params.limit(Some(limit));
    }
    if !args.collections.is_empty() {
        params = params.collections(args.collections);
    }
    if !args.ids.is_empty() {
        params = params.ids(args.ids);
    }
    if let Some(bbox) = args.bbox {
        params = params.bbox(&bbox)?;
    }
    if let Some(datetime) = args.datetime {
        params = params.datetime(&datetime)?;
    }
    if let Some(filter) = args.filter {
        params = params.filter(Filter::Text(filter));
    }
    if let Some(sortby) = args.sortby {
        params = params.sortby(&sortby)?;
    }

    let mut client = StacApiClient::new(reqwest::Client::new(), &args.api)?;
    if let Some(max_items) = args.max_items {
        client = client.with_max_items(max_items);
    }
    let items = client.search(&params).await?;
    info!("Search returned {} item(s)", items.len());

    let collection = json!({ "type": "FeatureCollection", "features": items });
    let output = args
        .output
        .to_str()
        .context("Output path is not valid UTF-8")?;
    StacIo::default().save_json(output, &collection).await
}

async fn fetch(args: FetchArgs) -> Result<()> {
    let (plan, mut config) = match (&args.plan, &args.selection) {
        (Some(path), _) => (FetchPlan::read(path)?, FetchConfig::default()),
        (None, Some(path)) => {
            let selection = Selection::read(path)
                .with_context(|| format!("Could not read selection {path:?}"))?;
            let client = StacApiClient::new(reqwest::Client::new(), &selection.api)?;
            (selection.plan(&client).await?, selection.fetch.clone())
        }
        (None, None) => bail!("Either --plan or --selection is required"),
    };
    if let Some(path) = &args.config {
        config = FetchConfig::read(path)?;
    }

    let mut ctx = FetchContext::new(config)?;
    if plan
        .descriptors()
        .iter()
        .any(|d| d.source_uri().starts_with("s3://"))
    {
        let client = match &args.s3_profile {
            Some(profile) => s3::client_from_profile(profile, args.s3_region.as_deref()).await,
            None => s3::anon_client(args.s3_region.as_deref()).await,
        };
        ctx = ctx.with_s3(client);
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, waiting for transfers in flight");
            on_interrupt.cancel();
        }
    });

    let batch = Batch::new(plan.descriptors().to_vec())?;
    let report = batch::spawn_batch_with_token(&ctx, batch, cancel)
        .wait()
        .await;
    report.write(&args.report)?;

    let outcome = report.outcome();
    info!("{outcome}");
    match outcome {
        BatchOutcome::AllSucceeded => Ok(()),
        _ => bail!("{outcome}, see {:?}", args.report),
    }
}
