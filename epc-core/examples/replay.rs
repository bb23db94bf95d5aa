//! EPC Accounting Replay
//!
//! Drives an aggregator with a synthetic enclave workload:
//! - a few containers with EPC limits, one without
//! - tasks that create several enclaves each, then exit
//! - some exits whose CREATE was "lost" by the transport
//!
//! and prints the resulting container table and metrics.  Pass a file path
//! to also write the raw 40-byte records, suitable for `epcd --events`.

use epc_core::config::EPC_PAGE_SIZE;
use epc_core::source;
use epc_core::{init_logging, Aggregator, AggregatorConfig, EnclaveLifecycleEvent, RawEnclaveEvent};
use std::io::Write;
use tokio_util::sync::CancellationToken;

const CONTAINERS: u64 = 4;
const TASKS_PER_CONTAINER: u64 = 16;

fn workload() -> Vec<EnclaveLifecycleEvent> {
    let mut events = Vec::new();
    for container in 1..=CONTAINERS {
        for t in 0..TASKS_PER_CONTAINER {
            let task = container * 1000 + t;
            // Each task maps 1..=3 enclaves of 16..=48 pages.
            for e in 0..=(t % 3) {
                let pages = 16 * (1 + (t + e) % 3);
                events.push(
                    EnclaveLifecycleEvent::create(container, task, pages * EPC_PAGE_SIZE)
                        .with_handle(0x7f00_0000_0000 + e * 0x1000_0000),
                );
            }
            if t % 2 == 0 {
                events.push(EnclaveLifecycleEvent::delete(container, task));
            }
        }
        // Exit of a task whose CREATE never arrived.
        events.push(EnclaveLifecycleEvent::delete(container, container * 1000 + 999));
    }
    events
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let events = workload();
    if let Some(path) = std::env::args().nth(1) {
        let mut file = std::fs::File::create(&path)?;
        for event in &events {
            file.write_all(&RawEnclaveEvent::from(event).encode())?;
        }
        println!("Wrote {} records to {}", events.len(), path);
    }

    let aggregator = Aggregator::with_config(AggregatorConfig::default())?;
    // Container 4 runs unconstrained.
    for container in 1..CONTAINERS {
        aggregator.set_limit(container, 512 * EPC_PAGE_SIZE)?;
    }

    let (producer, mut source) = source::channel(events.len(), aggregator.metrics());
    for event in events {
        producer.emit(event);
    }
    drop(producer);

    let summary = aggregator.run(&mut source, CancellationToken::new()).await?;
    println!("Replay finished: {:?}", summary);
    println!();

    println!("{:>10} {:>12} {:>12} {:>8}", "CONTAINER", "BYTES", "LIMIT", "BLOCKED");
    for view in aggregator.list_containers()? {
        let limit = view
            .limit_bytes
            .map(|l| l.to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:>10} {:>12} {:>12} {:>8}",
            view.container_id, view.bytes, limit, view.blocked
        );
    }
    println!();
    println!("{}", aggregator.metrics().snapshot().summary());
    println!();
    println!("{}", serde_json::to_string_pretty(&aggregator.snapshot()?)?);

    Ok(())
}
