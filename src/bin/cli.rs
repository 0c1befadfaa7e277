//! CellarDB CLI
//!
//! Command-line interface for a local CellarDB data directory.

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

use cellar::{Config, Result, Scan, Store};

/// CellarDB CLI
#[derive(Parser, Debug)]
#[command(name = "cellar-cli")]
#[command(about = "CLI for the CellarDB column-family store")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./data")]
    data_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a table
    CreateTable {
        name: String,

        /// Column families (at least one)
        #[arg(required = true)]
        families: Vec<String>,
    },

    /// Delete a table and all of its data
    DeleteTable { name: String },

    /// List tables
    List,

    /// Show a table's families and state
    Describe { name: String },

    /// Write a cell
    Put {
        table: String,
        row: String,
        /// Column as family:qualifier
        column: String,
        value: String,
    },

    /// Read the newest value of a cell
    Get {
        table: String,
        row: String,
        /// Column as family:qualifier
        column: String,

        /// Show up to this many versions
        #[arg(long)]
        versions: Option<usize>,
    },

    /// Delete a cell
    Delete {
        table: String,
        row: String,
        /// Column as family:qualifier
        column: String,
    },

    /// Delete every column of a row
    DeleteRow { table: String, row: String },

    /// Scan a row range
    Scan {
        table: String,

        /// First row (inclusive)
        #[arg(long, default_value = "")]
        start: String,

        /// Last row (exclusive, empty for unbounded)
        #[arg(long, default_value = "")]
        stop: String,

        /// Restrict to these families
        #[arg(long)]
        family: Vec<String>,

        /// Maximum rows to print
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Flush the memtable to a segment
    Flush { table: String },

    /// Compact segments
    Compact {
        table: String,

        /// Merge every segment and purge expired tombstones
        #[arg(long)]
        major: bool,
    },
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        error!("{}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = Config::builder()
        .data_dir(&args.data_dir)
        .background_maintenance(false)
        .build();
    let store = Store::open(config)?;

    match args.command {
        Commands::CreateTable { name, families } => {
            let families: Vec<&str> = families.iter().map(String::as_str).collect();
            store.create_table(&name, &families)?;
            println!("OK");
        }
        Commands::DeleteTable { name } => {
            store.delete_table(&name)?;
            println!("OK");
        }
        Commands::List => {
            for table in store.list_tables() {
                println!("{}", table.name);
            }
        }
        Commands::Describe { name } => {
            let descriptor = store.describe_table(&name)?;
            let table = store.table(&name)?;
            println!("name:      {}", descriptor.name);
            println!("families:  {}", descriptor.families.join(", "));
            println!("enabled:   {}", descriptor.enabled);
            println!("state:     {:?}", table.state());
            println!("segments:  {}", table.segment_count());
            println!("memtable:  {} bytes", table.memtable_size());
        }
        Commands::Put {
            table,
            row,
            column,
            value,
        } => {
            let (family, qualifier) = split_column(&column)?;
            store.put(&table, row.as_bytes(), family, qualifier.as_bytes(), value.as_bytes())?;
            println!("OK");
        }
        Commands::Get {
            table,
            row,
            column,
            versions,
        } => {
            let (family, qualifier) = split_column(&column)?;
            let table = store.table(&table)?;
            match versions {
                Some(max) => {
                    for cell in table.get_versions(row.as_bytes(), family, qualifier.as_bytes(), max)? {
                        println!("{}\t{}", cell.timestamp, String::from_utf8_lossy(&cell.value));
                    }
                }
                None => match table.get(row.as_bytes(), family, qualifier.as_bytes())? {
                    Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                    None => println!("(nil)"),
                },
            }
        }
        Commands::Delete { table, row, column } => {
            let (family, qualifier) = split_column(&column)?;
            store.delete(&table, row.as_bytes(), family, qualifier.as_bytes())?;
            println!("OK");
        }
        Commands::DeleteRow { table, row } => {
            let deleted = store.delete_row(&table, row.as_bytes())?;
            println!("(deleted {} columns)", deleted);
        }
        Commands::Scan {
            table,
            start,
            stop,
            family,
            limit,
        } => {
            let mut scan = Scan::range(start.as_bytes(), stop.as_bytes());
            for f in family {
                scan = scan.add_family(f);
            }
            if let Some(limit) = limit {
                scan = scan.with_limit(limit);
            }
            let scanner = store.table(&table)?.scan(scan)?;
            for row in scanner {
                let row = row?;
                for cell in &row.cells {
                    println!(
                        "{}\t{}:{}\t{}\t{}",
                        String::from_utf8_lossy(&row.key),
                        cell.family,
                        String::from_utf8_lossy(&cell.qualifier),
                        cell.timestamp,
                        String::from_utf8_lossy(&cell.value)
                    );
                }
            }
        }
        Commands::Flush { table } => {
            store.table(&table)?.flush()?;
            println!("OK");
        }
        Commands::Compact { table, major } => match store.table(&table)?.compact(major)? {
            Some(outcome) => println!(
                "compacted {} segments into {} ({} -> {} entries)",
                outcome.inputs.len(),
                outcome.outputs.len(),
                outcome.entries_read,
                outcome.entries_written
            ),
            None => println!("nothing to compact"),
        },
    }

    store.close()
}

fn split_column(column: &str) -> Result<(&str, &str)> {
    column.split_once(':').ok_or_else(|| {
        cellar::CellarError::InvalidArgument(format!("column '{}' is not family:qualifier", column))
    })
}
