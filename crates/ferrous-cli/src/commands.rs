//! CLI command definitions.

use clap::{Args, Subcommand};
use ferrous_core::ids::RunId;
use ferrous_core::trigger::{EventKind, TriggerEvent};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Write a starter workflow file
    Init,

    /// Validate a workflow file
    Validate {
        /// Path to workflow file (defaults to the global --workflow)
        path: Option<PathBuf>,
    },

    /// Print the JSON schema of the workflow file
    Schema,

    /// Check whether an event would start a run, without running anything
    Check {
        #[command(flatten)]
        event: EventArgs,
    },

    /// Run the workflow for a single event
    Run {
        #[command(flatten)]
        event: EventArgs,
    },

    /// Read newline-delimited JSON events from stdin and coordinate runs
    Serve,

    /// List archived runs, newest first
    History {
        /// Only runs of this concurrency group
        #[arg(short, long)]
        group: Option<String>,

        /// Maximum number of runs to list
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Show an archived run with its phase output
    Show {
        /// Run ID
        run_id: RunId,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },
}

/// A trigger event described on the command line.
#[derive(Args, Debug, Clone)]
pub struct EventArgs {
    /// Event kind: push or pull_request
    #[arg(short, long, default_value = "push")]
    pub event: EventKind,

    /// Pushed ref, or the base branch of a pull request
    #[arg(long = "ref", default_value = "main")]
    pub git_ref: String,

    /// Changed path (repeatable)
    #[arg(short, long = "path")]
    pub paths: Vec<String>,

    /// Commit sha
    #[arg(long)]
    pub sha: Option<String>,

    /// Who caused the event
    #[arg(long)]
    pub actor: Option<String>,
}

impl EventArgs {
    pub fn into_event(self) -> TriggerEvent {
        let mut event = TriggerEvent::new(self.event, self.git_ref, self.paths);
        if let Some(sha) = self.sha {
            event = event.with_sha(sha);
        }
        if let Some(actor) = self.actor {
            event = event.with_actor(actor);
        }
        event
    }
}
