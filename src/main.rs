//! treemirror - interactive shell over a registry of live directory mirrors.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use treemirror::cli::{parse_line, Args, Command};
use treemirror::config::load_settings;
use treemirror::logger::{Logger, NoopLogger, TextLogger};
use treemirror::registry::{MirrorRegistry, RegistryError};
use treemirror::{log_event, logging};

fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = load_settings(args.config.as_deref())?;
    args.apply(&mut settings);
    logging::init_with_config(&settings.logging);

    // Choose the journal once; NoopLogger costs nothing on the hot path
    let logger: Arc<dyn Logger> = match settings.log_file {
        Some(ref p) => match TextLogger::new(p) {
            Ok(l) => Arc::new(l),
            Err(e) => {
                tracing::warn!("[main] journal disabled: {e:#}");
                Arc::new(NoopLogger)
            }
        },
        None => Arc::new(NoopLogger),
    };

    let registry = Arc::new(MirrorRegistry::new(settings, logger));

    let on_signal = registry.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Stopping mirrors (Ctrl-C)...");
        on_signal.shutdown();
        // 128 + SIGINT
        std::process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    log_event!("main", "ready");
    run_shell(&registry)?;
    registry.shutdown();
    Ok(())
}

fn run_shell(registry: &MirrorRegistry) -> Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!("> ");
        io::stdout().flush().ok();

        let Some(line) = lines.next() else {
            println!();
            return Ok(());
        };
        let line = line.context("Failed to read command")?;

        match parse_line(&line) {
            Ok(None) => {}
            Ok(Some(Command::Exit)) => return Ok(()),
            Ok(Some(command)) => execute(registry, command),
            Err(usage) => println!("{usage}"),
        }
    }
}

fn execute(registry: &MirrorRegistry, command: Command) {
    match command {
        Command::Add { source, targets } => {
            report("mirroring", &registry.add(&source, &targets));
        }
        Command::End { source, targets } => {
            report("stopped", &registry.end(&source, &targets));
        }
        Command::List => {
            let pairs = registry.list();
            if pairs.is_empty() {
                println!("No active mirrors");
            }
            for p in pairs {
                println!(
                    "{} -> {} [{}]",
                    p.source.display(),
                    p.target.display(),
                    p.state
                );
            }
        }
        Command::Restore { source, backup } => match registry.restore(&source, &backup) {
            Ok(stats) => println!(
                "Restored {}: {} deleted, {} copied ({:.2} MB), {} directories created",
                source.display(),
                stats.files_deleted + stats.dirs_deleted,
                stats.files_copied + stats.links_created,
                stats.bytes_copied as f64 / 1_048_576.0,
                stats.dirs_created
            ),
            Err(e) => println!("Restore failed: {e}"),
        },
        Command::Exit => {}
    }
}

fn report(verb: &str, results: &[(PathBuf, Result<(), RegistryError>)]) {
    for (target, result) in results {
        match result {
            Ok(()) => println!("{verb} {}", target.display()),
            Err(e) => println!("{}: {e}", target.display()),
        }
    }
}
