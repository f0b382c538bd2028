use clap::{Parser, Subcommand, ValueEnum};

use saturn_relay::catalog::BackupKind;

#[derive(Parser, Debug)]
#[command(
    name = "saturn-relay",
    about = "Supervised runner for Saturn and piHPSDR update scripts",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a catalog script, relaying its backup prompt to this terminal
    Run {
        /// Script file name or display name from the catalog
        script: String,

        /// Pass `--backup-dir <DIR>` to the script
        #[arg(long)]
        backup_dir: Option<String>,

        /// Skip the syntax check before running
        #[arg(long)]
        skip_check: bool,

        /// Flags forwarded to the script (after `--`)
        #[arg(last = true)]
        flags: Vec<String>,
    },

    /// Run an arbitrary command under supervision
    Exec {
        /// Answer every prompt with yes
        #[arg(long, conflicts_with = "no")]
        yes: bool,

        /// Answer every prompt with no
        #[arg(long)]
        no: bool,

        /// Overall time limit in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Time limit for answering a prompt, in seconds
        #[arg(long)]
        prompt_timeout: Option<u64>,

        /// Program and arguments (after `--`)
        #[arg(last = true, required = true)]
        argv: Vec<String>,
    },

    /// Serve the HTTP API and event stream
    Serve {
        /// Address to bind, overriding the config file
        #[arg(long)]
        bind: Option<String>,
    },

    /// List catalog scripts and validation warnings
    Scripts {
        /// Emit machine-readable JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// List backups in the home directory, newest first
    Backups {
        #[arg(value_enum)]
        kind: BackupArg,
    },

    /// Show resolved configuration
    Config {
        /// Emit machine-readable JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackupArg {
    Pihpsdr,
    Saturn,
}

impl From<BackupArg> for BackupKind {
    fn from(arg: BackupArg) -> Self {
        match arg {
            BackupArg::Pihpsdr => BackupKind::Pihpsdr,
            BackupArg::Saturn => BackupKind::Saturn,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
