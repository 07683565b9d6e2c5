use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rigging")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Stage, plan and commit changes to a declarative resource graph", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (defaults to ~/.config/rigging/config.toml)
    #[arg(short, long, global = true, env = "RIGGING_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create or update resources and connections from a blueprint file
    Define {
        /// TOML blueprint
        file: PathBuf,
    },

    /// Stage every resource changed since the last stage
    Stage,

    /// Print the execution graph for the staged changes
    Process,

    /// Revert a history item, staging the reversal
    Revert {
        /// Log item uid
        uid: String,
    },

    /// Undo staged changes on the live resources
    Discard {
        /// Log item uid
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        uid: Option<String>,

        /// Discard every staged item
        #[arg(long)]
        all: bool,
    },

    /// Commit every staged item without running it
    Commit,

    /// List committed and failed changes, newest first
    History {
        /// Number of items to show
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Show the diff of one log item
    Show {
        /// Log item uid
        uid: String,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_discard_needs_uid_or_all() {
        assert!(Cli::try_parse_from(["rigging", "discard"]).is_err());
        assert!(Cli::try_parse_from(["rigging", "discard", "abc", "--all"]).is_err());

        let cli = Cli::try_parse_from(["rigging", "discard", "--all"]).unwrap();
        assert!(matches!(cli.command, Command::Discard { uid: None, all: true }));
    }

    #[test]
    fn test_history_limit() {
        let cli = Cli::try_parse_from(["rigging", "-vv", "history", "-n", "5"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Command::History { limit: Some(5) }));
    }
}
