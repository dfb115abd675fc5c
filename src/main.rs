use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use docburst_lib::settings::{load_settings, Settings};
use docburst_lib::{config, BurstEngine, BurstError, JobOutcome, TestOptions};

#[derive(Parser, Debug)]
#[command(
    name = "docburst",
    version,
    about = "Split a report into one document per burst token and distribute each one."
)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Burst an input document.
    Burst {
        /// PDF, xlsx/xlsm, csv, tsv or txt document.
        file: PathBuf,

        /// JSON settings file; defaults apply when omitted.
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Process every token without transmitting anything.
        #[arg(long)]
        test_all: bool,

        /// Comma-separated tokens to process without transmitting.
        #[arg(long, value_name = "TOKENS", default_value = "")]
        test_tokens: String,

        /// Process this many random tokens without transmitting.
        #[arg(long, value_name = "N", default_value_t = 0)]
        random_tokens: usize,
    },
    /// Continue an interrupted job from its checkpoint file.
    Resume {
        #[arg(value_name = "CHECKPOINT")]
        progress: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    docburst_lib::init_tracing(cli.verbose);
    tracing::debug!(version = config::APP_VERSION, "Starting");

    let engine = BurstEngine::new(config::temp_dir());
    match run(&engine, cli.command) {
        Ok(outcome) => {
            println!(
                "{} tokens: {} extracted, {} distributed, {} skipped, {} quarantined",
                outcome.tokens.len(),
                outcome.counters.extracted,
                outcome.counters.distributed,
                outcome.counters.skipped,
                outcome.counters.quarantined
            );
            if let Some(stats) = outcome.stats_file {
                println!("stats: {}", stats.display());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("docburst: {e}");
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}

fn run(engine: &BurstEngine, command: Command) -> Result<JobOutcome, BurstError> {
    match command {
        Command::Burst {
            file,
            config,
            test_all,
            test_tokens,
            random_tokens,
        } => {
            let settings = match config {
                Some(path) => load_settings(&path)?,
                None => Settings::default(),
            };
            let options = TestOptions {
                test_all,
                test_tokens,
                random_tokens,
            };
            engine.burst(&file, settings, &options)
        }
        Command::Resume { progress } => engine.resume(&progress),
    }
}
