//! boltkv CLI
//!
//! Command-line interface for inspecting and editing a boltkv file.
//! Bucket paths nest with `/`, e.g. `users/admins`.

use std::path::PathBuf;
use std::process::ExitCode;

use boltkv::{BoltError, Bucket, Db, Options, Result, Tx};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

/// boltkv CLI
#[derive(Parser, Debug)]
#[command(name = "boltkv")]
#[command(about = "Inspect and edit a boltkv database file")]
#[command(version)]
struct Args {
    /// Database file
    path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the value of a key
    Get {
        /// Bucket path, e.g. `users/admins`
        bucket: String,

        /// The key to read
        key: String,
    },

    /// Set a key, creating the bucket path as needed
    Put {
        /// Bucket path, e.g. `users/admins`
        bucket: String,

        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// Delete a key
    Delete {
        /// Bucket path, e.g. `users/admins`
        bucket: String,

        /// The key to delete
        key: String,
    },

    /// List buckets, top-level or under a bucket path
    Buckets {
        /// Parent bucket path
        bucket: Option<String>,
    },

    /// List the keys of a bucket
    Keys {
        /// Bucket path, e.g. `users/admins`
        bucket: String,
    },

    /// Print database statistics
    Stats,

    /// Verify page accounting
    Check,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,boltkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let read_only = !matches!(args.command, Commands::Put { .. } | Commands::Delete { .. });
    let options = Options::builder().read_only(read_only).build();
    let db = Db::open(&args.path, options)?;

    match args.command {
        Commands::Get { bucket, key } => db.view(|tx| {
            let bucket = open_path(tx, &bucket)?.ok_or(BoltError::BucketNotFound)?;
            match bucket.get(key.as_bytes())? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("(nil)"),
            }
            Ok(())
        }),

        Commands::Put { bucket, key, value } => db.update(|tx| {
            let mut bucket = create_path(tx, &bucket)?;
            bucket.put(key.as_bytes(), value.as_bytes())?;
            println!("OK");
            Ok(())
        }),

        Commands::Delete { bucket, key } => db.update(|tx| {
            let mut bucket = open_path(tx, &bucket)?.ok_or(BoltError::BucketNotFound)?;
            bucket.delete(key.as_bytes())?;
            println!("OK");
            Ok(())
        }),

        Commands::Buckets { bucket } => db.view(|tx| {
            let mut names = Vec::new();
            let mut collect = |key: &[u8], value: Option<&[u8]>| -> Result<()> {
                if value.is_none() {
                    names.push(String::from_utf8_lossy(key).into_owned());
                }
                Ok(())
            };
            match bucket {
                Some(path) => {
                    let mut parent = open_path(tx, &path)?.ok_or(BoltError::BucketNotFound)?;
                    parent.for_each(&mut collect)?;
                }
                None => {
                    let mut cursor = tx.cursor();
                    let mut entry = cursor.first()?;
                    while let Some((key, value)) = entry {
                        collect(&key, value.as_deref())?;
                        entry = cursor.next()?;
                    }
                }
            }
            for name in names {
                println!("{}", name);
            }
            Ok(())
        }),

        Commands::Keys { bucket } => db.view(|tx| {
            let mut bucket = open_path(tx, &bucket)?.ok_or(BoltError::BucketNotFound)?;
            bucket.for_each(|key, value| {
                match value {
                    Some(_) => println!("{}", String::from_utf8_lossy(key)),
                    None => println!("{}/", String::from_utf8_lossy(key)),
                }
                Ok(())
            })
        }),

        Commands::Stats => {
            db.view(|tx| {
                println!("page size:   {}", db.page_size());
                println!("txid:        {}", tx.id());
                println!("size:        {} bytes", tx.size());
                Ok(())
            })?;
            let stats = db.stats();
            println!("free pages:  {}", stats.free_page_n);
            println!("pending:     {}", stats.pending_page_n);
            println!("freelist:    {} bytes", stats.freelist_inuse);
            Ok(())
        }

        Commands::Check => db.view(|tx| {
            tx.check()?;
            println!("OK");
            Ok(())
        }),
    }
}

/// Open the bucket at a `/`-separated path
fn open_path<'tx>(tx: &'tx mut Tx, path: &str) -> Result<Option<Bucket<'tx>>> {
    let mut parts = path.split('/').filter(|part| !part.is_empty());
    let first = parts.next().ok_or(BoltError::BucketNameRequired)?;
    let Some(mut bucket) = tx.bucket(first.as_bytes())? else {
        return Ok(None);
    };
    for part in parts {
        match bucket.into_bucket(part.as_bytes())? {
            Some(child) => bucket = child,
            None => return Ok(None),
        }
    }
    Ok(Some(bucket))
}

/// Create every bucket along a `/`-separated path
fn create_path<'tx>(tx: &'tx mut Tx, path: &str) -> Result<Bucket<'tx>> {
    let mut parts = path.split('/').filter(|part| !part.is_empty());
    let first = parts.next().ok_or(BoltError::BucketNameRequired)?;
    let mut bucket = tx.create_bucket(first.as_bytes())?;
    for part in parts {
        bucket = bucket.into_created_bucket(part.as_bytes())?;
    }
    Ok(bucket)
}
