use anyhow::{Context, Result};
use clap::Parser;

mod cli;
mod commands;
mod config;
mod domain;
mod error;
mod infrastructure;
mod k8s;
mod services;
mod tools;
mod ui;

use cli::{Cli, Commands};
use config::DeployOptions;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging with LOGGING env var support
    // LOGGING=debug,info,warn,error or just LOGGING=debug
    let log_level = std::env::var("LOGGING")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .unwrap_or_else(|_| {
            if cli.verbose {
                "debug".to_string()
            } else {
                "info".to_string()
            }
        });

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    match cli.command {
        Commands::Deploy {
            source,
            components,
            set,
            confirm,
            key,
            shasum,
            insecure_skip_tls_verify,
            plain_http,
            timeout,
            retries,
            no_wait,
            cache,
        } => {
            let mut opts = DeployOptions::new(source);
            opts.components = components;
            opts.set_variables = DeployOptions::parse_set_pairs(&set)?;
            opts.confirm = confirm;
            opts.key = key;
            opts.shasum = shasum;
            opts.insecure_skip_tls_verify = insecure_skip_tls_verify;
            opts.plain_http = plain_http;
            opts.timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("invalid --timeout value: {timeout}"))?;
            opts.retries = retries.max(1);
            opts.no_wait = no_wait;
            opts.cache_dir = cache;
            if let Err(e) = commands::deploy::execute(opts).await {
                ui::print_error(&format!("{e:#}"));
                std::process::exit(1);
            }
        }
        Commands::Inspect {
            source,
            key,
            shasum,
            plain_http,
        } => {
            let mut opts = DeployOptions::new(source);
            opts.key = key;
            opts.shasum = shasum;
            opts.plain_http = plain_http;
            if let Err(e) = commands::inspect::execute(opts).await {
                ui::print_error(&format!("{e:#}"));
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
