use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{TimeZone, Utc};
use clap::Parser;
use futures::stream::{self, StreamExt};
use tracing::info;

use longterm::engine::clock::{Clock, SystemClock};
use longterm::prelude::{Goal, GoalInForm, LongTermData, Period};
use longterm::{load_core_config, BusyFlag, LongTermPage, MemoryStore, PageServices, QuarterClock};

#[derive(Parser)]
#[command(name = "longterm")]
#[command(about = "Quarterly long-term goals over an in-memory store", long_about = None)]
struct Cli {
    /// Signed-in user id
    #[arg(short, long, env = "LONGTERM_USER", default_value = "demo")]
    user: String,

    /// New goal texts, in their new order; repeat for each goal
    #[arg(short, long = "goal")]
    goals: Vec<String>,

    /// Print the composite as JSON
    #[arg(long)]
    json: bool,
}

fn seed(store: &MemoryStore, period: &Period, user: &str) {
    store.upsert_period(period.clone());
    let texts = [
        "Ship the quarterly roadmap",
        "Run a half marathon",
        "Read twelve books",
    ];
    for (index, text) in texts.iter().enumerate() {
        store.upsert_goal(
            Goal::builder(format!("{user}-goal-{}", index + 1))
                .owner(user)
                .period(period.id.clone())
                .text(*text)
                .order(index as u32 + 1)
                .completed(index == 0)
                .build(),
        );
    }
}

/// Replaces the leading rows' texts; every row is kept so orders stay dense.
fn retitle(rows: &mut [GoalInForm], texts: &[String]) {
    for (row, text) in rows.iter_mut().zip(texts) {
        row.text = text.clone();
    }
}

fn print_data(label: &str, data: &LongTermData, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(data)?);
        return Ok(());
    }

    let start = Utc
        .timestamp_millis_opt(data.period.start_time)
        .single()
        .map(|at| at.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| data.period.start_time.to_string());
    println!("{label} (quarter starting {start}):");
    for goal in &data.goals {
        let mark = if goal.completed { "x" } else { " " };
        println!("  [{mark}] {}. {}", goal.order, goal.text);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_core_config().context("loading configuration")?;
    longterm_core::logging::init_from_config(&config)?;

    let quarter = QuarterClock::new(config.zone);
    let period = quarter.period_at(SystemClock.now_millis())?;
    let store = Arc::new(MemoryStore::new());
    seed(&store, &period, &cli.user);

    let services = PageServices::new(store.clone(), store.clone(), &config);
    let page = LongTermPage::open(services, stream::iter([cli.user.clone()]).boxed());
    let data = page.current_data().await?;
    print_data("Long term goals", &data, cli.json)?;

    if !cli.goals.is_empty() {
        let mut rows = page.edit_form().await?;
        retitle(&mut rows, &cli.goals);

        let busy = BusyFlag::new();
        let outcome = page.save_goals(rows, &busy).await?;
        info!(success = outcome.is_success(), "save finished");

        let mut updates = page.subscribe();
        let changed = tokio::time::timeout(
            Duration::from_secs(1),
            updates.wait_for(|state| matches!(state, Some(Ok(view)) if *view != data)),
        )
        .await;
        if let Ok(Ok(state)) = changed {
            if let Some(Ok(view)) = &*state {
                print_data("Saved", view, cli.json)?;
            }
        }
    }

    page.close();
    Ok(())
}
