//! Re-applies newline-delimited billing events from stdin.
//!
//! Usage: `replay_billing_events [--prune] < events.ndjson`

use anyhow::{bail, Context};
use diary_entitlements::{
    config::Config,
    models::billing_event::BillingEvent,
    services::entitlements::ReconcileOutcome,
    state::{establish_connection, EntitlementState},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default)]
struct Summary {
    applied: usize,
    duplicate: usize,
    rejected: usize,
    malformed: usize,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let mut prune = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--prune" => prune = true,
            other => bail!("unknown argument: {other}"),
        }
    }

    let config = Config::from_env().context("loading configuration")?;
    let pool = establish_connection(&config)
        .await
        .context("connecting to the database")?;
    let state = EntitlementState::from_pool(pool, &config);

    let mut summary = Summary::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let event: BillingEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(err) => {
                warn!(line_no, %err, "skipping malformed line");
                summary.malformed += 1;
                continue;
            }
        };

        // A store failure stops the replay so it can be rerun from this line.
        let outcome = match state.reconciler.apply(&event).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(line_no, event_id = %event.event_id, ?err, "replay aborted");
                return Err(err).with_context(|| format!("applying event on line {line_no}"));
            }
        };

        match outcome {
            ReconcileOutcome::Applied { .. } => summary.applied += 1,
            ReconcileOutcome::Duplicate => summary.duplicate += 1,
            ReconcileOutcome::Rejected(_) => summary.rejected += 1,
        }
    }

    info!(
        applied = summary.applied,
        duplicate = summary.duplicate,
        rejected = summary.rejected,
        malformed = summary.malformed,
        "replay finished"
    );
    println!(
        "applied={} duplicate={} rejected={} malformed={}",
        summary.applied, summary.duplicate, summary.rejected, summary.malformed
    );

    if prune {
        let removed = state
            .reconciler
            .prune_event_log()
            .await
            .context("pruning billing event log")?;
        println!("pruned={removed}");
    }

    Ok(())
}
