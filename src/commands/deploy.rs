//! Deploy command
//!
//! The full pipeline: load and verify the archive, filter components,
//! resolve variables, confirm, execute components in order, persist the
//! deployed-package record and print the connection table.

use anyhow::{bail, Context, Result};
use std::io::IsTerminal;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{DeployOptions, HostFacts};
use crate::domain::state::DeployedPackage;
use crate::infrastructure::archive;
use crate::infrastructure::state::StateStore;
use crate::k8s;
use crate::services::executor::ComponentExecutor;
use crate::services::filter;
use crate::services::variables::VariableStore;
use crate::ui;

pub async fn execute(opts: DeployOptions) -> Result<()> {
    // Ctrl-C races the pipeline; dropping it tears down workers at their
    // next await point and the staging dir goes with the TempDir guard.
    tokio::select! {
        result = run(opts) => result,
        _ = tokio::signal::ctrl_c() => {
            ui::print_warning("deploy cancelled");
            bail!("deploy cancelled by signal")
        }
    }
}

async fn run(mut opts: DeployOptions) -> Result<()> {
    let host = HostFacts::detect();
    // CI mode: explicit flag, CI=true, or a non-TTY stdout (piped output)
    // all disable progress rendering and prompts.
    let non_interactive = opts.non_interactive
        || std::env::var("CI").map(|v| v == "true").unwrap_or(false)
        || !std::io::stdout().is_terminal();
    opts.non_interactive = non_interactive;

    ui::print_header("Airlift Deploy");

    // The staging dir owns every extracted and staged byte of this deploy
    // and is removed on all exit paths.
    let staging = tempfile::TempDir::with_prefix("airlift-deploy-")
        .context("Failed to create staging directory")?;

    let spinner = if non_interactive {
        indicatif::ProgressBar::hidden()
    } else {
        let pb = indicatif::ProgressBar::new_spinner();
        pb.set_style(
            indicatif::ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap(),
        );
        pb.set_message("Loading bundle archive...");
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        pb
    };
    let loaded = archive::load(&opts, staging.path()).await;
    spinner.finish_and_clear();
    let loaded = loaded?;
    loaded.bundle.validate(&host.arch)?;
    let bundle = loaded.bundle.clone();

    let client = match k8s::create_client().await {
        Ok(client) => Some(client),
        Err(e) => {
            warn!(error = %format!("{e:#}"), "cluster unreachable");
            None
        }
    };
    let cluster_facts = match &client {
        Some(client) => match k8s::cluster_facts(client).await {
            Ok(facts) => Some(facts),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "could not read cluster facts");
                None
            }
        },
        None => None,
    };

    let selected = filter::select_components(
        &bundle,
        &host,
        cluster_facts.as_ref(),
        opts.components.as_deref(),
    )?;

    let variables = Arc::new(VariableStore::new(&bundle, &opts.set_variables)?);
    variables.prompt_missing(&bundle.variables, non_interactive || opts.confirm)?;

    info!(
        bundle = %bundle.metadata.name,
        version = bundle.metadata.version.as_deref().unwrap_or("unversioned"),
        components = selected.len(),
        "ready to deploy"
    );
    ui::print_component_table(&selected);

    if !opts.confirm {
        if non_interactive {
            bail!("refusing to deploy without --confirm in non-interactive mode");
        }
        let proceed = dialoguer::Confirm::new()
            .with_prompt(format!("Deploy bundle {}?", bundle.metadata.name))
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;
        if !proceed {
            bail!("deploy declined");
        }
    }

    // Surface prior deploys of this bundle; per-release upgrade decisions
    // stay with the release engine, which sees what is actually live.
    if let Some(client) = &client {
        let store = StateStore::new(client.clone());
        match store.read_package(&bundle.metadata.name).await {
            Ok(Some(prior)) => info!(
                prior_version = prior.data.metadata.version.as_deref().unwrap_or("unversioned"),
                "bundle was deployed before; releases will upgrade"
            ),
            Ok(None) => {}
            Err(e) => warn!(error = %format!("{e:#}"), "could not read prior deploy state"),
        }
    }

    let yolo = bundle.metadata.yolo;
    let mut executor = ComponentExecutor::new(
        client.clone(),
        opts.clone(),
        host,
        staging.path().to_path_buf(),
        variables,
        yolo,
    );
    let deployed = executor.execute_all(&selected, &loaded).await?;

    // State is written only after every component succeeded.
    let mut namespaces: Vec<String> = deployed
        .iter()
        .flat_map(|d| d.installed_charts.iter().map(|c| c.namespace.clone()))
        .collect();
    namespaces.sort();
    namespaces.dedup();

    if let Some(client) = &client {
        let store = StateStore::new(client.clone());
        let package = DeployedPackage::new(bundle.clone(), deployed);
        store.write_package(&package).await?;

        match k8s::connection_rows(client, &namespaces).await {
            Ok(rows) => ui::print_connection_table(&rows),
            Err(e) => warn!(error = %format!("{e:#}"), "could not list services"),
        }
    }

    ui::print_success(&format!("Bundle {} deployed", bundle.metadata.name));
    Ok(())
}
