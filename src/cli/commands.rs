//! CLI commands implementation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use console::style;

use crate::config::{load_settings, Settings};
use crate::content::BubbleContent;
use crate::markup::MarkupParser;
use crate::planner::{comment_histogram, Planner};
use crate::store::{HANDLES_TABLE, POSTS_TABLE};
use crate::surface::RawMarkup;
use crate::work_queue::JobTarget;

use super::helpers::{extractor, open_queue, open_store};

#[derive(Parser)]
#[command(name = "chatscrape")]
#[command(about = "Lease-based scrape workers for virtualized chat feeds")]
#[command(version)]
pub struct Cli {
    /// Config file (discovered automatically when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Run scrape jobs from the queue until it drains
    Work {
        /// Replay the jobs in TEST_JOBS instead of reading the queue
        #[arg(long)]
        test_mode: bool,
    },

    /// Queue a job
    Submit {
        /// Job type (scrape_id or scrape_comments)
        job_type: String,
        /// Channel (`@tag` or numeric id), or a JSON object for scrape_comments
        target: String,
    },

    /// Find channel posts whose comments should be scraped
    Plan {
        /// Minimum comment count (defaults to the configured value)
        #[arg(long)]
        min_comments: Option<u64>,
        /// Queue the chosen posts
        #[arg(long)]
        push: bool,
        /// Print how many posts have each comment count
        #[arg(long)]
        histogram: bool,
    },

    /// Parse a captured bubble and show what was extracted
    Inspect {
        /// File holding the bubble's outer markup
        file: PathBuf,
        /// Also summarize it as a channel post
        #[arg(long)]
        post: bool,
    },

    /// Show queue and store status
    Status,
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (settings, _config) = load_settings(cli.config.as_deref())
        .await
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Work { test_mode } => cmd_work(&settings, test_mode).await,
        Commands::Submit { job_type, target } => cmd_submit(&settings, &job_type, &target).await,
        Commands::Plan {
            min_comments,
            push,
            histogram,
        } => cmd_plan(&settings, min_comments, push, histogram).await,
        Commands::Inspect { file, post } => cmd_inspect(&settings, &file, post).await,
        Commands::Status => cmd_status(&settings).await,
    }
}

#[cfg(feature = "browser")]
async fn cmd_work(settings: &Settings, test_mode: bool) -> anyhow::Result<()> {
    use std::time::Duration;

    use crate::scrape::{ScrapeContext, Worker};
    use crate::surface::ChromiumSurface;

    use super::helpers::pressure_gauge;

    let queue = open_queue(settings)?;
    if test_mode && !queue.is_test_mode() {
        bail!("--test-mode needs jobs in TEST_JOBS");
    }
    if queue.is_test_mode() {
        println!("{} Test mode: replaying TEST_JOBS", style("!").yellow());
    }
    let store = open_store(settings)?;

    let surface = Arc::new(
        ChromiumSurface::connect(&settings.browser_url, Duration::from_secs(120))
            .await
            .with_context(|| format!("Failed to connect to {}", settings.browser_url))?,
    );
    tracing::info!("Browser is at {}", surface.current_url().await?);

    let worker = Worker::new(ScrapeContext::new(
        surface.clone(),
        store,
        pressure_gauge(settings),
        settings.scrape.clone(),
    ))
    .with_stop_flag(&settings.stop_flag_path);
    let result = worker.run_until_shutdown(&queue).await;
    drop(worker);

    if let Ok(surface) = Arc::try_unwrap(surface) {
        if let Err(e) = surface.close().await {
            tracing::warn!("Failed to close the browser session: {}", e);
        }
    }

    let summary = result?;
    println!(
        "{} {} jobs: {} completed, {} aborted, {} skipped, {} rejected",
        style("✓").green(),
        summary.total(),
        summary.completed,
        summary.aborted,
        summary.skipped,
        summary.rejected
    );
    Ok(())
}

#[cfg(not(feature = "browser"))]
async fn cmd_work(_settings: &Settings, _test_mode: bool) -> anyhow::Result<()> {
    bail!("Browser support not compiled. Rebuild with: cargo build --features browser")
}

async fn cmd_submit(settings: &Settings, job_type: &str, target: &str) -> anyhow::Result<()> {
    let target = if target.trim_start().starts_with('{') {
        serde_json::from_str::<JobTarget>(target).context("Invalid target object")?
    } else {
        JobTarget::Channel(target.to_string())
    };

    let queue = open_queue(settings)?;
    queue.submit(job_type, target.clone()).await?;
    println!("{} Queued {} for '{}'", style("✓").green(), job_type, target);
    Ok(())
}

async fn cmd_plan(
    settings: &Settings,
    min_comments: Option<u64>,
    push: bool,
    histogram: bool,
) -> anyhow::Result<()> {
    let mut planner_settings = settings.planner.clone();
    if let Some(min) = min_comments {
        planner_settings.min_comments = min;
    }
    let min = planner_settings.min_comments;

    let store = open_store(settings)?;
    let planner = Planner::new(store, planner_settings).with_extractor(extractor(settings));
    let candidates = planner.candidates().await?;

    if histogram {
        println!("{:>10} {:>8}", style("comments").bold(), style("posts").bold());
        for (count, posts) in comment_histogram(&candidates) {
            let count = count.map_or_else(|| "?".to_string(), |c| c.to_string());
            println!("{:>10} {:>8}", count, posts);
        }
    }

    let chosen = planner.select(candidates, Utc::now());
    println!(
        "\n{} posts with at least {} comments are due",
        style(chosen.len()).cyan(),
        min
    );
    for candidate in &chosen {
        println!(
            "  @{:<24} {:>12} {:>8}",
            candidate.tag,
            candidate.message_id,
            candidate.comment_count.unwrap_or_default()
        );
    }

    if push {
        let queue = open_queue(settings)?;
        let pushed = planner.push(&queue, &chosen).await?;
        println!("{} Queued {} jobs", style("✓").green(), pushed);
    } else if !chosen.is_empty() {
        println!("Run with --push to queue them.");
    }
    Ok(())
}

async fn cmd_inspect(settings: &Settings, file: &Path, post: bool) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let tree = MarkupParser::new().parse(&RawMarkup::from_bytes(bytes).to_text_lossy())?;
    println!("{}", tree);

    let extractor = extractor(settings);
    match extractor.extract(&tree)? {
        BubbleContent::Extracted {
            text,
            kind,
            is_reply,
            was_edited,
        } => {
            println!("{:<12} {}", "Kind:", kind.map_or("-", |k| k.as_str()));
            println!("{:<12} {}", "Reply:", is_reply);
            println!("{:<12} {}", "Edited:", was_edited);
            println!("{:<12} {}", "Text:", text);
        }
        BubbleContent::Filtered(reason) => {
            println!("{:<12} {}", "Filtered:", style(reason.as_str()).yellow());
        }
    }

    if post {
        let summary = extractor.summarize_post(&tree)?;
        println!("{:<12} {}", "Channel:", summary.numeric_id.as_deref().unwrap_or("-"));
        println!("{:<12} {}", "Message:", summary.message_id.as_deref().unwrap_or("-"));
        println!("{:<12} {}", "Replies:", summary.has_replies_element);
        println!(
            "{:<12} {}",
            "Comments:",
            summary
                .comment_count
                .map_or_else(|| "unknown".to_string(), |c| c.to_string())
        );
    }
    Ok(())
}

async fn cmd_status(settings: &Settings) -> anyhow::Result<()> {
    let queue = open_queue(settings)?;
    let store = open_store(settings)?;

    println!("\n{}", style("chatscrape status").bold());
    println!("{}", "-".repeat(40));
    println!("{:<20} {}", "Queue:", settings.queue_path.display());
    println!("{:<20} {}", "Queued jobs:", queue.backend().depth().await?);
    println!("{:<20} {}", "Store:", settings.store_path.display());
    println!("{:<20} {}", "Channels:", store.scan(HANDLES_TABLE).await?.len());
    println!("{:<20} {}", "Posts:", store.scan(POSTS_TABLE).await?.len());
    if let Some(jobs) = &settings.test_jobs {
        println!("{:<20} {}", "Test jobs:", jobs.len());
    }
    Ok(())
}
