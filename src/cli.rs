//! CLI definitions for airlift
//!
//! This module contains all CLI argument parsing structures using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "airlift",
    version,
    about = "Air-gap deployment engine for self-contained application bundles",
    long_about = "Takes a sealed application bundle (images, repos, charts, manifests,\nfiles and hooks) and realizes it into a disconnected Kubernetes cluster."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Deploy a bundle into the target cluster
    Deploy {
        /// Bundle archive path or oci:// reference
        source: String,

        /// Comma-separated component and group selections
        #[arg(long)]
        components: Option<String>,

        /// Variable override, KEY=VAL (repeatable)
        #[arg(long = "set")]
        set: Vec<String>,

        /// Skip interactive confirmation
        #[arg(long)]
        confirm: bool,

        /// Public key for signature verification
        #[arg(long)]
        key: Option<PathBuf>,

        /// Expected archive sha256
        #[arg(long)]
        shasum: Option<String>,

        /// Skip TLS verification for registries
        #[arg(long)]
        insecure_skip_tls_verify: bool,

        /// Talk plain HTTP to registries
        #[arg(long)]
        plain_http: bool,

        /// Chart install/upgrade timeout (e.g. 15m, 300s)
        #[arg(long, default_value = "15m")]
        timeout: String,

        /// Install/upgrade/push retry count
        #[arg(long, default_value = "3")]
        retries: u32,

        /// Skip secondary readiness waits
        #[arg(long)]
        no_wait: bool,

        /// Image layer cache directory
        #[arg(long, env = "AIRLIFT_CACHE")]
        cache: Option<PathBuf>,
    },

    /// Verify a bundle archive and print its descriptor
    Inspect {
        /// Bundle archive path or oci:// reference
        source: String,

        /// Public key for signature verification
        #[arg(long)]
        key: Option<PathBuf>,

        /// Expected archive sha256
        #[arg(long)]
        shasum: Option<String>,

        /// Talk plain HTTP to registries
        #[arg(long)]
        plain_http: bool,
    },
}
