use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use sqlite_btree::{Btree, OpenOptions, Pgno};

#[derive(Parser)]
#[command(name = "sqlite-btree")]
#[command(author, version, about = "B-tree storage engine inspection tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display the database header and size information
    Info {
        /// Path to database file
        #[arg(value_name = "DATABASE")]
        database: PathBuf,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Verify the structural integrity of one or more trees
    Check {
        /// Path to database file
        #[arg(value_name = "DATABASE")]
        database: PathBuf,

        /// Root page(s) to verify - can be specified multiple times
        /// (defaults to the schema root, page 1)
        #[arg(short, long)]
        root: Option<Vec<Pgno>>,

        /// Stop after this many problems
        #[arg(long, default_value_t = 100)]
        max_errors: usize,
    },

    /// Print shape statistics for a tree
    Stats {
        /// Path to database file
        #[arg(value_name = "DATABASE")]
        database: PathBuf,

        /// Root page of the tree
        #[arg(short, long, default_value_t = 1)]
        root: Pgno,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn read_only() -> OpenOptions {
    OpenOptions {
        read_only: true,
        ..OpenOptions::default()
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Info { database, json } => {
            let mut db = Btree::open(&database, read_only())?;
            let header = db.header()?;

            if json {
                println!("{}", serde_json::to_string_pretty(&header)?);
            } else {
                println!("Database: {}", database.display());
                println!("Page size: {} bytes", header.page_size);
                println!("Reserved bytes per page: {}", header.reserved_bytes_per_page);
                println!("Pages: {}", db.page_count());
                println!("Change counter: {}", header.file_change_counter);
                println!("Auto-vacuum: {:?}", header.auto_vacuum);
                println!("Schema cookie: {}", header.schema_cookie);
                if header.first_freelist_page > 0 {
                    println!(
                        "Free pages: {} (first trunk: {})",
                        header.freelist_page_count, header.first_freelist_page
                    );
                }
            }
        }

        Commands::Check {
            database,
            root,
            max_errors,
        } => {
            let mut db = Btree::open(&database, read_only())?;
            let roots = root.unwrap_or_else(|| vec![1]);
            let report = db.integrity_check(&roots, max_errors)?;

            if report.ok() {
                println!("ok ({} pages checked)", report.pages_checked);
            } else {
                for error in &report.errors {
                    println!("{error}");
                }
                anyhow::bail!("{} problem(s) found", report.errors.len());
            }
        }

        Commands::Stats { database, root, json } => {
            let mut db = Btree::open(&database, read_only())?;
            let stats = db.tree_stats(root)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Tree rooted at page {root}:");
                println!("  Depth: {}", stats.depth);
                println!(
                    "  Pages: {} (interior: {}, leaf: {})",
                    stats.interior_pages + stats.leaf_pages,
                    stats.interior_pages,
                    stats.leaf_pages
                );
                println!("  Cells: {}", stats.cells);
                if stats.overflow_pages > 0 {
                    println!("  Overflow pages: {}", stats.overflow_pages);
                }
            }
        }
    }

    Ok(())
}
