use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::json;

use crate::config::{Settings, TeamConfig, TeamConfigSource, TeamRegistry};
use crate::models::{PeriodRecord, RepositoryRef, TeamMetrics};
use crate::pipeline::Pipeline;
use crate::runtime;
use crate::storage::{MetricsStore, SqliteStore};
use crate::util;

#[derive(Parser)]
#[command(author, version, about = "Team source-control activity metrics")]
pub struct Cli {
    #[arg(short, long, action = ArgAction::Count, help = "Increase verbosity (-v, -vv)")]
    verbose: u8,
    #[arg(long, global = true, help = "Data directory (defaults to ~/.repometrics)")]
    home: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    Team(TeamArgs),
    Teams(TeamsArgs),
    Discover(DiscoverArgs),
    Select(SelectArgs),
    Refresh(RefreshArgs),
    Show(ShowArgs),
}

#[derive(Args)]
pub struct TeamArgs {
    #[arg(long)]
    pub team: String,
    #[arg(long, help = "Org/user URL, bare owner name, or API listing URL")]
    pub root: Option<String>,
    #[arg(long, help = "Access token for the hosting API")]
    pub token: Option<String>,
}

#[derive(Args)]
pub struct TeamsArgs {
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct DiscoverArgs {
    #[arg(long)]
    pub team: String,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct SelectArgs {
    #[arg(long)]
    pub team: String,
    #[arg(long, help = "Select every discovered repository")]
    pub all: bool,
    #[arg(help = "Repositories as owner/name; none clears the selection")]
    pub repos: Vec<String>,
}

#[derive(Args)]
pub struct RefreshArgs {
    #[arg(long)]
    pub team: String,
    #[arg(long = "repo", help = "Refresh only these repositories (owner/name)")]
    pub repos: Vec<String>,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct ShowArgs {
    #[arg(long)]
    pub team: String,
    #[arg(long)]
    pub json: bool,
}

struct AppContext {
    registry: Arc<TeamRegistry>,
    store: Arc<SqliteStore>,
    pipeline: Pipeline,
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    runtime::init_tracing(cli.verbose)?;
    let ctx = open_context(cli.home.as_deref())?;
    match cli.command {
        Commands::Team(args) => handle_team(&ctx, args),
        Commands::Teams(args) => handle_teams(&ctx, args),
        Commands::Discover(args) => handle_discover(&ctx, args).await,
        Commands::Select(args) => handle_select(&ctx, args).await,
        Commands::Refresh(args) => handle_refresh(&ctx, args).await,
        Commands::Show(args) => handle_show(&ctx, args),
    }
}

fn open_context(home: Option<&Path>) -> Result<AppContext> {
    let root = util::data_root(home)?;
    let settings = Settings::load(&root)?;
    let registry = Arc::new(TeamRegistry::open(&root)?);
    let store = Arc::new(SqliteStore::open(&settings.database_path(&root))?);
    let pipeline = Pipeline::new(settings, registry.clone(), store.clone());
    Ok(AppContext {
        registry,
        store,
        pipeline,
    })
}

fn handle_team(ctx: &AppContext, args: TeamArgs) -> Result<()> {
    let TeamArgs { team, root, token } = args;
    let mut config = ctx
        .registry
        .team(&team)?
        .unwrap_or_else(|| TeamConfig::new(&team));
    if root.is_some() {
        config.root_reference = root;
    }
    if token.is_some() {
        config.access_token = token;
    }
    ctx.registry.upsert(config)?;
    println!("Saved team {team} to {}", ctx.registry.path().display());
    Ok(())
}

fn handle_teams(ctx: &AppContext, args: TeamsArgs) -> Result<()> {
    let teams = ctx.registry.list()?;
    if args.json {
        let payload: Vec<_> = teams
            .iter()
            .map(|t| {
                json!({
                    "team_id": t.team_id,
                    "root_reference": t.root_reference,
                    "has_token": t.access_token.is_some(),
                    "selected_repositories": t.selected_repositories,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else if teams.is_empty() {
        println!("No teams configured yet");
    } else {
        let stored = ctx.store.teams()?;
        println!("{:<20} {:<40} {:>6} {:>8}", "Team", "Root", "Repos", "Metrics");
        for team in teams {
            println!(
                "{:<20} {:<40} {:>6} {:>8}",
                team.team_id,
                team.root_reference.as_deref().unwrap_or("-"),
                team.selected_repositories.len(),
                if stored.contains(&team.team_id) { "yes" } else { "no" }
            );
        }
    }
    Ok(())
}

async fn handle_discover(ctx: &AppContext, args: DiscoverArgs) -> Result<()> {
    let repos = ctx.pipeline.discover(&args.team).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&repos)?);
    } else if repos.is_empty() {
        println!("No repositories found");
    } else {
        println!("{} repositories:", repos.len());
        for repo in repos {
            println!("  - {} ({})", repo.label(), repo.url.as_deref().unwrap_or("-"));
        }
    }
    Ok(())
}

async fn handle_select(ctx: &AppContext, args: SelectArgs) -> Result<()> {
    let SelectArgs { team, all, repos } = args;
    let selection = if all {
        ctx.pipeline.discover(&team).await?
    } else if repos.is_empty() {
        Vec::new()
    } else {
        let known = ctx.pipeline.discover(&team).await.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "discovery failed, saving names without URLs");
            Vec::new()
        });
        resolve_names(&known, &repos)
    };

    let saved = ctx.registry.set_selection(&team, selection)?;
    if saved.selected_repositories.is_empty() {
        ctx.store
            .clear(&team)
            .with_context(|| format!("failed to clear metrics for {team}"))?;
        println!("Cleared repository selection and metrics for {team}");
    } else {
        println!(
            "Selected {} repositories for {team}",
            saved.selected_repositories.len()
        );
    }
    Ok(())
}

async fn handle_refresh(ctx: &AppContext, args: RefreshArgs) -> Result<()> {
    let explicit = if args.repos.is_empty() {
        None
    } else {
        Some(resolve_explicit(ctx, &args.team, &args.repos).await?)
    };
    let outcome = ctx.pipeline.refresh(&args.team, explicit).await;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", outcome.message);
        print_metrics(&outcome.metrics);
    }
    if !outcome.success {
        bail!("refresh for {} did not complete: {}", args.team, outcome.message);
    }
    Ok(())
}

fn handle_show(ctx: &AppContext, args: ShowArgs) -> Result<()> {
    let metrics = ctx.pipeline.metrics(&args.team)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&metrics)?);
    } else if metrics.is_empty() {
        println!("No metrics stored for {}", args.team);
    } else {
        print_metrics(&metrics);
    }
    Ok(())
}

async fn resolve_explicit(
    ctx: &AppContext,
    team: &str,
    names: &[String],
) -> Result<Vec<RepositoryRef>> {
    let mut known = ctx
        .registry
        .team(team)?
        .map(|t| t.selected_repositories)
        .unwrap_or_default();
    if !without_clone_url(&resolve_names(&known, names)).is_empty() {
        match ctx.pipeline.discover(team).await {
            Ok(discovered) => known.extend(discovered),
            Err(err) => tracing::warn!(error = %err, "discovery failed, using saved selection"),
        }
    }
    let resolved = resolve_names(&known, names);
    for name in without_clone_url(&resolved) {
        tracing::warn!(repo = %name, "repository not found; line counting will skip it");
    }
    Ok(resolved)
}

fn without_clone_url(refs: &[RepositoryRef]) -> Vec<&str> {
    refs.iter()
        .filter(|r| r.url.is_none())
        .map(RepositoryRef::label)
        .collect()
}

fn resolve_names(known: &[RepositoryRef], names: &[String]) -> Vec<RepositoryRef> {
    names
        .iter()
        .map(|name| {
            known
                .iter()
                .find(|r| r.full_name.as_deref() == Some(name.as_str()))
                .cloned()
                .unwrap_or_else(|| RepositoryRef::from_full_name(name))
        })
        .collect()
}

fn print_metrics(metrics: &TeamMetrics) {
    if let Some(record) = &metrics.snapshot {
        if let Some(message) = record.message() {
            println!("Snapshot: {message}");
        }
        if let Some(snapshot) = record.last_known_good() {
            let api = &snapshot.api;
            println!(
                "Snapshot: {} bytes, ~{} lines (estimated), {} lines (counted)",
                api.total_bytes, api.estimated_lines, snapshot.cloned.total_lines
            );
            for (language, bytes) in &api.language_bytes {
                println!("  {:<20} {:>12} bytes", language, bytes);
            }
            for (ext, lines) in &snapshot.cloned.lines_by_extension {
                println!("  .{:<19} {:>12} lines", ext, lines);
            }
            for tag in &api.tags {
                println!("  tag {:<40} {}", tag.name, tag.date);
            }
        }
    }
    if metrics.windows.is_empty() {
        return;
    }
    println!("{:<10} {:>12} {:>11}  {}", "Window", "Lines added", "Committers", "Status");
    for (window, record) in &metrics.windows {
        let status = match record {
            PeriodRecord::Available { .. } => "ok".to_string(),
            PeriodRecord::Unavailable { message, .. } => message.clone(),
        };
        match record.last_known_good() {
            Some(data) => println!(
                "{:<10} {:>12} {:>11}  {}",
                window.key(),
                data.lines_added,
                data.unique_committers,
                status
            ),
            None => println!("{:<10} {:>12} {:>11}  {}", window.key(), "-", "-", status),
        }
    }
}
