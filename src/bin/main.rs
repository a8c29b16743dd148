//! Smallware Rendezvous load driver
//!
//! A command-line tool that runs producers and consumers against a
//! [`FifoQueue`] and checks that every request was answered by exactly one
//! consumer.
//!
//! # Usage
//!
//! ```bash
//! smallware-rendezvous --producers 8 --consumers 4 --requests 1000
//! ```
//!
//! # Options
//!
//! - `--producers` / `-p`: Number of producer tasks
//! - `--consumers` / `-c`: Number of consumer tasks
//! - `--requests` / `-n`: Requests submitted by each producer
//! - `--timeout-ms`: Producer timeout per request (default: wait forever)
//! - `--work-ms`: Simulated processing time per request
//! - `-v` or `--verbose`: Enable verbose logging

use anyhow::{bail, Context, Result};
use clap::Parser;
use smallware_rendezvous::{FifoQueue, MatcherConfig, RendezvousError, WaitOptions};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn, Level};

/// Smallware Rendezvous - exercise a request/response queue under load
#[derive(Parser, Debug)]
#[command(name = "smallware-rendezvous")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of producer tasks.
    #[arg(short, long, default_value_t = 4, env = "RENDEZVOUS_PRODUCERS")]
    producers: u64,

    /// Number of consumer tasks.
    #[arg(short, long, default_value_t = 4, env = "RENDEZVOUS_CONSUMERS")]
    consumers: u64,

    /// Requests submitted by each producer.
    #[arg(short = 'n', long, default_value_t = 1000)]
    requests: u64,

    /// Producer timeout per request, in milliseconds.
    ///
    /// Requests that time out are counted but not retried.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Simulated processing time per request, in milliseconds.
    #[arg(long, default_value_t = 0)]
    work_ms: u64,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

/// Per-producer tally.
#[derive(Debug, Default)]
struct ProducerStats {
    answered: u64,
    timed_out: u64,
}

/// Waits until every consumer task still running is parked in `dequeue`.
///
/// A consumer that already exited, e.g. with an error, never comes back to
/// wait and is not counted.
async fn wait_for_idle_consumers<T>(queue: &FifoQueue<u64, u64>, consumers: &[JoinHandle<T>]) {
    while queue.waiting_consumers() < consumers.iter().filter(|c| !c.is_finished()).count() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    if args.consumers == 0 && args.timeout_ms.is_none() {
        bail!("with no consumers every request would wait forever; pass --timeout-ms");
    }

    let queue: Arc<FifoQueue<u64, u64>> = Arc::new(FifoQueue::new(MatcherConfig::new("load")));
    let mut opts = WaitOptions::new();
    if let Some(ms) = args.timeout_ms {
        opts = opts.with_timeout(Duration::from_millis(ms));
    }

    info!(
        producers = args.producers,
        consumers = args.consumers,
        requests = args.requests,
        "Starting load"
    );
    let started = coarsetime::Instant::now();

    let mut consumers = Vec::new();
    for _ in 0..args.consumers {
        let queue = queue.clone();
        let work = Duration::from_millis(args.work_ms);
        consumers.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            loop {
                let item = match queue.dequeue().await {
                    Ok(item) => item,
                    Err(RendezvousError::Cancelled) => return Ok(seen),
                    Err(e) => return Err(e),
                };
                let id = *item.request()?;
                seen.push(id);
                if !work.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(work) => {},
                        // The producer gave up; don't bother finishing
                        _ = item.cancelled() => continue,
                    }
                }
                if let Err(e) = item.respond(id.wrapping_mul(3)) {
                    warn!(error = %e, "Late response dropped");
                }
            }
        }));
    }

    let mut producers = Vec::new();
    for p in 0..args.producers {
        let queue = queue.clone();
        let opts = opts.clone();
        let requests = args.requests;
        producers.push(tokio::spawn(async move {
            let mut stats = ProducerStats::default();
            for i in 0..requests {
                let id = p * requests + i;
                match queue.enqueue_with(id, opts.clone()).await {
                    Ok(answer) if answer == id.wrapping_mul(3) => stats.answered += 1,
                    Ok(answer) => {
                        return Err(anyhow::anyhow!("request {} got answer {}", id, answer))
                    }
                    Err(RendezvousError::Timeout) => stats.timed_out += 1,
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(stats)
        }));
    }

    let mut totals = ProducerStats::default();
    for producer in producers {
        let stats = producer.await.context("producer task panicked")??;
        totals.answered += stats.answered;
        totals.timed_out += stats.timed_out;
    }

    // Drain anything left and stop the consumers
    let leftover = queue.cancel_requests();
    wait_for_idle_consumers(&queue, &consumers).await;
    queue.dismiss_consumers();

    let mut delivered = HashSet::new();
    let mut deliveries = 0usize;
    for consumer in consumers {
        let seen = consumer.await.context("consumer task panicked")??;
        deliveries += seen.len();
        delivered.extend(seen);
    }
    if deliveries != delivered.len() {
        bail!(
            "{} requests were delivered more than once",
            deliveries - delivered.len()
        );
    }

    let elapsed = started.elapsed();
    info!(
        answered = totals.answered,
        timed_out = totals.timed_out,
        delivered = deliveries,
        leftover,
        elapsed_ms = elapsed.as_millis(),
        "Load completed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_idle_wait_ignores_exited_consumers() {
        let queue: Arc<FifoQueue<u64, u64>> = Arc::new(FifoQueue::default());
        let failed = tokio::spawn(async { Err::<(), _>(RendezvousError::NotInitialized) });
        let waiting = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await.map(|_| ()) })
        };
        while !failed.is_finished() {
            tokio::task::yield_now().await;
        }
        let consumers = vec![failed, waiting];

        let idle = wait_for_idle_consumers(&queue, &consumers);
        tokio::time::timeout(Duration::from_secs(5), idle)
            .await
            .expect("idle wait should not count the exited consumer");

        queue.dismiss_consumers();
        let mut results = Vec::new();
        for consumer in consumers {
            results.push(consumer.await.unwrap());
        }
        assert_eq!(
            results,
            vec![Err(RendezvousError::NotInitialized), Err(RendezvousError::Cancelled)]
        );
    }
}
