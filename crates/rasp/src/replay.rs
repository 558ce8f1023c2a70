//! Replay a JSON-lines event file across worker threads.

use std::fs;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use futures::future::join_all;
use rasp_js_runtime::{spawn_worker, Engine, RequestContext, WorkerHandle};
use serde::{Deserialize, Serialize};

/// One line of an event file.
#[derive(Debug, Clone, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub context: Option<RequestContext>,
}

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct Summary {
    pub events: usize,
    pub blocked: usize,
    /// Events a worker could not answer.
    pub failed: usize,
    pub elapsed_ms: u128,
}

/// Parse an event file. Blank lines are skipped.
pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read events from {}", path.display()))?;
    parse_events(&text)
}

pub fn parse_events(text: &str) -> Result<Vec<Event>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("Invalid event on line {}", i + 1))
        })
        .collect()
}

/// Spread `events` round-robin over `workers` worker threads.
pub async fn replay(engine: &Engine, events: Vec<Event>, workers: usize) -> Result<Summary> {
    let workers = workers.max(1);
    let handles = (0..workers)
        .map(|i| spawn_worker(format!("rasp-replay-{}", i), engine))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to spawn replay workers")?;

    let mut shares: Vec<Vec<Event>> = vec![Vec::new(); workers];
    let total = events.len();
    for (i, event) in events.into_iter().enumerate() {
        shares[i % workers].push(event);
    }

    let start = Instant::now();
    let results = join_all(
        handles
            .iter()
            .zip(shares)
            .map(|(handle, share)| run_share(handle, share)),
    )
    .await;

    let mut summary = Summary {
        events: total,
        elapsed_ms: start.elapsed().as_millis(),
        ..Default::default()
    };
    for (blocked, failed) in results {
        summary.blocked += blocked;
        summary.failed += failed;
    }

    for handle in handles {
        handle.join().context("Replay worker failed")?;
    }
    Ok(summary)
}

async fn run_share(handle: &WorkerHandle, share: Vec<Event>) -> (usize, usize) {
    let mut blocked = 0;
    let mut failed = 0;
    for event in share {
        match handle.check(&event.event_type, event.params, event.context).await {
            Ok(true) => blocked += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!("[replay] {} on {}: {}", event.event_type, handle.name(), e);
                failed += 1;
            }
        }
    }
    (blocked, failed)
}
