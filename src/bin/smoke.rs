//! CellarDB Smoke Test Binary
//!
//! Drives the end-to-end scenario against a fresh data directory and
//! narrates each step through tracing. Exits non-zero on any mismatch.

use std::collections::BTreeMap;

use cellar::{Config, Result, Store, WalSyncStrategy};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

const TABLE: &str = "test_table";
const FAMILY: &str = "cf";

/// CellarDB smoke test
#[derive(Parser, Debug)]
#[command(name = "cellar-smoke")]
#[command(about = "Run the end-to-end CellarDB scenario")]
#[command(version)]
struct Args {
    /// Data directory (must not hold a test_table already)
    #[arg(short, long, default_value = "./cellar_smoke_data")]
    data_dir: String,

    /// Flush and compact between steps to exercise the segment path
    #[arg(long)]
    flush: bool,
}

type Snapshot = BTreeMap<String, BTreeMap<String, String>>;

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,cellar=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    info!("CellarDB smoke test v{}", cellar::VERSION);

    match run(&args) {
        Ok(()) => info!("Smoke test passed"),
        Err(e) => {
            error!("Smoke test failed: {}", e);
            std::process::exit(1);
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let config = Config::builder()
        .data_dir(&args.data_dir)
        .wal_sync_strategy(WalSyncStrategy::EveryWrite)
        .build();
    let store = Store::open(config)?;

    info!(table = TABLE, family = FAMILY, "Creating table");
    store.create_table(TABLE, &[FAMILY])?;

    let people = [
        ("row1", "Alice", "25", "Shanghai"),
        ("row2", "Bob", "30", "Beijing"),
        ("row3", "Charlie", "28", "Shenzhen"),
    ];
    for (row, name, age, city) in people {
        info!(row, name, age, city, "Inserting row");
        store.table(TABLE)?.put_row(
            row.as_bytes(),
            &[
                (FAMILY, b"name".as_slice(), name.as_bytes()),
                (FAMILY, b"age".as_slice(), age.as_bytes()),
                (FAMILY, b"city".as_slice(), city.as_bytes()),
            ],
        )?;
    }
    maybe_flush(args, &store)?;

    let rows = scan_all(&store)?;
    check(rows.len() == 3, "scan after insert returns 3 rows")?;
    check(
        rows.keys().map(String::as_str).collect::<Vec<_>>() == ["row1", "row2", "row3"],
        "rows come back in row-key order",
    )?;

    info!(row = "row1", "Updating age to 26");
    store.put(TABLE, b"row1", FAMILY, b"age", b"26")?;
    maybe_flush(args, &store)?;

    let rows = scan_all(&store)?;
    check(field(&rows, "row1", "age") == Some("26"), "row1 age updated")?;
    check(field(&rows, "row2", "age") == Some("30"), "row2 unchanged")?;
    check(field(&rows, "row3", "city") == Some("Shenzhen"), "row3 unchanged")?;

    for (row, ..) in people {
        let deleted = store.delete_row(TABLE, row.as_bytes())?;
        info!(row, columns = deleted, "Deleted row");
    }
    maybe_flush(args, &store)?;

    let rows = scan_all(&store)?;
    check(rows.is_empty(), "scan after delete is empty")?;

    info!(table = TABLE, "Deleting table");
    store.delete_table(TABLE)?;
    check(!store.table_exists(TABLE), "table no longer exists")?;

    store.close()
}

fn maybe_flush(args: &Args, store: &Store) -> Result<()> {
    if args.flush {
        let table = store.table(TABLE)?;
        table.flush()?;
        table.compact(true)?;
        info!(segments = table.segment_count(), "Flushed and compacted");
    }
    Ok(())
}

fn scan_all(store: &Store) -> Result<Snapshot> {
    let mut rows = Snapshot::new();
    for row in store.scan(TABLE, b"", b"")? {
        let row = row?;
        let columns = row
            .cells
            .iter()
            .map(|c| {
                (
                    String::from_utf8_lossy(&c.qualifier).into_owned(),
                    String::from_utf8_lossy(&c.value).into_owned(),
                )
            })
            .collect();
        rows.insert(String::from_utf8_lossy(&row.key).into_owned(), columns);
    }
    for (key, columns) in &rows {
        info!(row = %key, ?columns, "Scanned row");
    }
    Ok(rows)
}

fn field<'a>(rows: &'a Snapshot, row: &str, column: &str) -> Option<&'a str> {
    rows.get(row)?.get(column).map(String::as_str)
}

fn check(condition: bool, what: &str) -> Result<()> {
    if condition {
        info!(check = what, "ok");
        Ok(())
    } else {
        Err(cellar::CellarError::InvalidArgument(format!("check failed: {}", what)))
    }
}
