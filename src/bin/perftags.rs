//! perftags command loop.
//!
//! Reads one command per line from stdin. Each command takes its input
//! from the write or read input file and read commands put their result
//! in the read output file. Replies on stdout: `WRITE_OK!`, `READ_OK!`,
//! `BAD COMMAND!`, or `ERROR <code>!` when the store rejected the call,
//! in which case the message goes to the command's output file.
//!
//! Usage: perftags [write-input] [write-output] [read-input] [read-output] [db-dir]

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use perftags::{StoreError, TagStore};

struct Paths {
    write_input: PathBuf,
    write_output: PathBuf,
    read_input: PathBuf,
    read_output: PathBuf,
    db_dir: PathBuf,
}

impl Paths {
    fn from_args(args: &[String]) -> Self {
        let arg = |i: usize, default: &str| PathBuf::from(args.get(i).map(String::as_str).unwrap_or(default));
        Self {
            write_input: arg(1, "perf-write-input.txt"),
            write_output: arg(2, "perf-write-output.txt"),
            read_input: arg(3, "perf-read-input.txt"),
            read_output: arg(4, "perf-read-output.txt"),
            db_dir: arg(5, "tag-pairings"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Write,
    Read,
}

fn command_kind(command: &str) -> Option<Kind> {
    match command {
        "insert_taggables" | "delete_taggables" | "insert_tags" | "delete_tags"
        | "insert_tag_pairings" | "toggle_tag_pairings" | "delete_tag_pairings" | "flush_files"
        | "purge_unused_files" | "begin_transaction" | "end_transaction" | "exit" => Some(Kind::Write),
        "read_taggables_tags" | "read_taggables_specified_tags" | "read_tag_groups_taggable_counts"
        | "search" => Some(Kind::Read),
        _ => None,
    }
}

/// Run one command. Read commands return their output bytes.
fn execute(store: &mut TagStore, command: &str, input: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
    let output = match command {
        "insert_taggables" => store.insert_taggables(input).map(|_| None)?,
        "delete_taggables" => store.delete_taggables(input).map(|_| None)?,
        "insert_tags" => store.insert_tags(input).map(|_| None)?,
        "delete_tags" => store.delete_tags(input).map(|_| None)?,
        "insert_tag_pairings" => store.insert_pairings(input).map(|_| None)?,
        "toggle_tag_pairings" => store.toggle_pairings(input).map(|_| None)?,
        "delete_tag_pairings" => store.delete_pairings(input).map(|_| None)?,
        "flush_files" => store.flush_files().map(|_| None)?,
        "purge_unused_files" => store.purge_unused_files().map(|_| None)?,
        "begin_transaction" => store.begin_transaction().map(|_| None)?,
        "end_transaction" => store.end_transaction().map(|_| None)?,
        "exit" => store.close().map(|_| None)?,
        "read_taggables_tags" => Some(store.read_taggables_tags(input)?),
        "read_taggables_specified_tags" => Some(store.read_taggables_specified_tags(input)?),
        "read_tag_groups_taggable_counts" => Some(store.read_tag_groups_taggable_counts(input)?),
        "search" => Some(store.search(input)?),
        _ => None,
    };
    Ok(output)
}

fn read_input(path: &Path) -> io::Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

fn lock(store: &Mutex<TagStore>) -> MutexGuard<'_, TagStore> {
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("perftags {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    let paths = Paths::from_args(&args);

    let store = TagStore::open(&paths.db_dir)
        .with_context(|| format!("failed to open store {}", paths.db_dir.display()))?;
    let store = Arc::new(Mutex::new(store));

    let store_for_signal = Arc::clone(&store);
    let mut signals =
        signal_hook::iterator::Signals::new([signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM])
            .context("failed to register signal handlers")?;
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!("received signal {sig}, closing store");
            if let Err(e) = lock(&store_for_signal).close() {
                error!("close failed: {e}");
                std::process::exit(1);
            }
            std::process::exit(0);
        }
    });

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    for line in stdin.lock().lines() {
        let line = line.context("failed to read command")?;
        let command = line.trim();
        let Some(kind) = command_kind(command) else {
            writeln!(stdout, "BAD COMMAND!")?;
            stdout.flush()?;
            continue;
        };

        let (input_path, output_path) = match kind {
            Kind::Write => (&paths.write_input, &paths.write_output),
            Kind::Read => (&paths.read_input, &paths.read_output),
        };
        let input = read_input(input_path)
            .with_context(|| format!("failed to read input {}", input_path.display()))?;

        let result = execute(&mut lock(&store), command, &input);
        match result {
            Ok(output) => {
                if let Some(bytes) = output {
                    std::fs::write(output_path, bytes)
                        .with_context(|| format!("failed to write {}", output_path.display()))?;
                }
                let reply = match kind {
                    Kind::Write => "WRITE_OK!",
                    Kind::Read => "READ_OK!",
                };
                writeln!(stdout, "{reply}")?;
            }
            Err(e) if e.is_fatal() => {
                error!("{command}: {e}");
                let _ = std::fs::write(output_path, e.to_string());
                writeln!(stdout, "ERROR {}!", e.code())?;
                stdout.flush()?;
                // Leave the files as they are for recovery; no flush on the way out.
                std::process::exit(2);
            }
            Err(e) => {
                warn!("{command}: {e}");
                std::fs::write(output_path, e.to_string())
                    .with_context(|| format!("failed to write {}", output_path.display()))?;
                writeln!(stdout, "ERROR {}!", e.code())?;
            }
        }
        stdout.flush()?;

        if command == "exit" {
            return Ok(());
        }
    }

    // stdin closed without `exit`.
    lock(&store).close()?;
    Ok(())
}
