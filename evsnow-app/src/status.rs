//! Pretty-printed status output for the orchestrator's final report
//! (spec.md §1: "pretty-printed status output" is explicitly the CLI
//! front-end's job, not the core's). Plain `println!` formatting rather
//! than a table crate — this is a few lines printed once at shutdown, not
//! a surface worth a new dependency.

use evsnow_core::RunOutcome;

pub fn print_report(outcome: &RunOutcome) {
    println!();
    println!("evsnow run summary");
    println!("===================");

    for mapping in &outcome.mapping_states {
        let health = if mapping.healthy { "healthy" } else { "degraded" };
        println!(
            "  {:<24} {:<10} rows_ingested={} batches_ingested={} bytes_ingested={}",
            mapping.mapping_name,
            health,
            mapping.rows_ingested_total(),
            mapping.batches_ingested_total(),
            mapping.bytes_ingested_total(),
        );
        for partition in &mapping.partitions {
            println!(
                "      partition {:<6} status={:<12} last_committed_sequence={:<10} batches={:<8} lag={}",
                partition.partition_id,
                format!("{:?}", partition.status),
                partition
                    .last_committed_sequence
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                partition.batches_ingested_total,
                partition.lag.map(|l| l.to_string()).unwrap_or_else(|| "-".to_string()),
            );
        }
    }

    if outcome.forced_exit {
        println!();
        println!("shutdown was forced by a second signal; some in-flight batches were abandoned");
    }

    println!();
}
