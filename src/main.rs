use clap::Parser;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use revloop::cli::{Cli, CliCommand, iteration_selection};
use revloop::config::Config;
use revloop::engine::{EngineSettings, ImprovementEngine, ImprovementRequest};
use revloop::error::Result;
use revloop::generation::HttpGenerationService;
use revloop::host::azure::AzureDevOpsHost;
use revloop::host::{NoHost, PrHost};
use revloop::prompts::PromptEngine;
use revloop::threads::FileThreadStore;

type Engine<H> = ImprovementEngine<HttpGenerationService, H, FileThreadStore>;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    info!("revloop starting");

    let config = match Config::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    info!(?config, "config loaded");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current step");
            let _ = shutdown_tx.send(true);
        }
    });

    let prompts = PromptEngine::new(config.prompts_dir.as_deref());
    let generation = HttpGenerationService::from_config(&config.generation, config.generation_timeout);
    let store = FileThreadStore::new(&config.state_dir);
    let settings = EngineSettings::from_config(&config);

    let result = match config.azure {
        Some(ref azure) => {
            let host = match AzureDevOpsHost::from_config(azure, config.host_timeout) {
                Ok(h) => h,
                Err(e) => {
                    eprintln!("error: {e}");
                    std::process::exit(1);
                }
            };
            let engine = ImprovementEngine::new(generation, host, store, prompts, settings)
                .with_shutdown(shutdown_rx);
            run(cli.command, &engine).await
        }
        None => {
            info!("no [azure] section configured, PR host calls will fail");
            let engine = ImprovementEngine::new(generation, NoHost, store, prompts, settings)
                .with_shutdown(shutdown_rx);
            run(cli.command, &engine).await
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run<H: PrHost + 'static>(command: CliCommand, engine: &Engine<H>) -> Result<()> {
    match command {
        CliCommand::Improve {
            pr,
            file,
            current,
            original,
        } => {
            let new_content = std::fs::read_to_string(&current)?;
            let original_content = match original {
                Some(path) => std::fs::read_to_string(path)?,
                None => String::new(),
            };
            let settings = engine.settings();
            let request = ImprovementRequest {
                pr_id: pr,
                file_path: file,
                original_content,
                new_content,
                max_iterations: settings.loop_settings.max_iterations,
                post_comments: settings.post_comments,
            };
            let state = engine.run_improvement(request).await;
            print_json(&state)
        }
        CliCommand::Review {
            pr,
            iterations,
            all,
            markdown,
        } => {
            let selection = iteration_selection(iterations, all);
            let iterations = engine.select_iterations(pr, &selection).await?;
            let report = engine.run_multi_iteration_review(pr, &iterations).await;
            if markdown {
                print!("{}", report.to_markdown());
                Ok(())
            } else {
                print_json(&report)
            }
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
