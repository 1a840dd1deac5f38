//! CLI argument definitions for Duet.

use clap::{Parser, Subcommand};

/// Version string with the commit and build time injected by build.rs.
pub const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("DUET_GIT_COMMIT"),
    " ",
    env!("DUET_BUILD_TIMESTAMP"),
    ")"
);

/// Duet - drive a project's steps to agreement between a producer and a reviewer.
///
/// Start with `duet init`, then `duet project create` and `duet task define`.
/// Use `duet next <project>` to find the next piece of work.
#[derive(Parser, Debug)]
#[command(name = "duet")]
#[command(author, version = VERSION, about = "A collaborative task-decomposition engine", long_about = None)]
pub struct Cli {
    /// Output in human-readable format instead of JSON
    #[arg(short = 'H', long = "human", global = true)]
    pub human_readable: bool,

    /// Run as if duet was started in <path> instead of the current directory.
    /// The path must exist. Can also be set via DUET_WORKSPACE.
    #[arg(short = 'C', long = "workspace", global = true, env = "DUET_WORKSPACE")]
    pub workspace: Option<std::path::PathBuf>,

    /// Emit logs as JSON lines on stderr (filter with DUET_LOG)
    #[arg(long = "log-json", global = true)]
    pub log_json: bool,

    /// Timeout for each generation call, in milliseconds
    #[arg(long = "timeout-ms", global = true)]
    pub timeout_ms: Option<u64>,

    /// Disable the audit log for this invocation
    #[arg(long = "no-audit-log", global = true)]
    pub no_audit_log: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the workspace database
    Init,

    /// Project management commands
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },

    /// Task management commands
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Step management commands
    Step {
        #[command(subcommand)]
        command: StepCommands,
    },

    /// Submit producer content for a step (moves it to review)
    Produce {
        /// Step ID
        step_id: String,

        /// Draft content (may start with "-", e.g. a markdown list)
        #[arg(allow_hyphen_values = true)]
        content: String,

        /// Why the draft looks the way it does
        #[arg(long, default_value = "")]
        reasoning: String,

        /// Aspect the producer concentrated on
        #[arg(long)]
        focus: Option<String>,
    },

    /// Submit a reviewer decision for a step
    ///
    /// Without --approve this is a revision request and needs --feedback.
    /// With --generate the reviewer agent decides instead.
    Review {
        /// Step ID
        step_id: String,

        /// Approve the current draft
        #[arg(long, conflicts_with = "generate")]
        approve: bool,

        /// Refined final content (on approval) or counter-proposal (on revision)
        #[arg(long, conflicts_with = "generate", allow_hyphen_values = true)]
        content: Option<String>,

        /// What the producer should change
        #[arg(long, conflicts_with = "generate", allow_hyphen_values = true)]
        feedback: Option<String>,

        /// Ask the reviewer agent for its decision
        #[arg(long)]
        generate: bool,
    },

    /// Have the producer agent draft (or revise) a step
    Draft {
        /// Step ID
        step_id: String,

        /// Aspect to concentrate on
        #[arg(long)]
        focus: Option<String>,
    },

    /// Run producer and reviewer rounds until the step is agreed or disputed
    Collaborate {
        /// Step ID
        step_id: String,

        /// Aspect to concentrate on
        #[arg(long)]
        focus: Option<String>,
    },

    /// Complexity analysis commands
    Complexity {
        #[command(subcommand)]
        command: ComplexityCommands,
    },

    /// Analyse and promote over-complex steps across a project
    Optimize {
        /// Project ID
        project_id: String,

        /// Maximum optimization passes
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Re-analyse steps that already have a reconciled decision
        #[arg(long)]
        force: bool,
    },

    /// Dispute commands
    Dispute {
        #[command(subcommand)]
        command: DisputeCommands,
    },

    /// Show the next actionable task or step of a project
    Next {
        /// Project ID
        project_id: String,
    },

    /// Walk the navigation chain from a task or step
    Chain {
        /// Start reference (task:<id> or step:<id>)
        start: String,

        /// forward, backward or both
        #[arg(short, long, default_value = "forward")]
        direction: String,

        /// Maximum items to follow in each direction
        #[arg(long, default_value = "20")]
        depth: usize,
    },

    /// Show the audit trail
    Log {
        /// Only records for this entity ID
        id: Option<String>,

        /// Show at most this many records (newest last)
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Project subcommands
#[derive(Subcommand, Debug)]
pub enum ProjectCommands {
    /// Create a new project
    Create {
        /// Project name
        name: String,

        /// Free-text description driving generation
        #[arg(short, long)]
        description: String,

        /// Complexity score above which steps are promoted (0.0-1.0)
        #[arg(long)]
        threshold: Option<f64>,

        /// Revision rounds before a step is disputed
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Let the reviewer agent propose the root tasks
        #[arg(long)]
        plan: bool,
    },

    /// Show a project with its root tasks
    Show {
        /// Project ID
        id: String,
    },

    /// List projects
    List,

    /// Change a project's threshold or revision budget
    Settings {
        /// Project ID
        id: String,

        /// New complexity threshold (0.0-1.0)
        #[arg(long)]
        threshold: Option<f64>,

        /// New revision budget
        #[arg(long)]
        max_iterations: Option<u32>,
    },

    /// Delete a project and everything in it
    Delete {
        /// Project ID
        id: String,
    },
}

/// Task subcommands
#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Define root tasks for a project
    Define {
        /// Project ID
        project_id: String,

        /// Task as "Title: objective" (repeatable)
        #[arg(short, long = "task", required = true)]
        tasks: Vec<String>,
    },

    /// Show a task with its steps and child tasks
    Show {
        /// Task ID
        id: String,
    },

    /// Re-parent a task
    Move {
        /// Task ID
        id: String,

        /// New parent task ID (omit to make it a root task)
        #[arg(long)]
        parent: Option<String>,
    },

    /// Delete a task and its subtree
    Delete {
        /// Task ID
        id: String,
    },
}

/// Step subcommands
#[derive(Subcommand, Debug)]
pub enum StepCommands {
    /// Create a pending step under a task
    Create {
        /// Task ID
        task_id: String,

        /// Step title
        title: String,

        /// Chain predecessor (task:<id> or step:<id>)
        #[arg(long)]
        prev: Option<String>,

        /// Chain successor (task:<id> or step:<id>)
        #[arg(long)]
        next: Option<String>,
    },

    /// Show a step with its revision history and complexity opinions
    Show {
        /// Step ID
        id: String,
    },

    /// Delete a step
    Delete {
        /// Step ID
        id: String,
    },

    /// Re-thread a task or step between new neighbours
    Link {
        /// Reference to move (task:<id> or step:<id>)
        node: String,

        /// New predecessor
        #[arg(long)]
        prev: Option<String>,

        /// New successor
        #[arg(long)]
        next: Option<String>,
    },

    /// Turn a step into a task with generated child steps
    Promote {
        /// Step ID
        id: String,
    },
}

/// Complexity subcommands
#[derive(Subcommand, Debug)]
pub enum ComplexityCommands {
    /// Record an agent's complexity opinion on a step
    Analyze {
        /// Step ID
        step_id: String,

        /// producer, reviewer or both
        #[arg(long, default_value = "both")]
        agent: String,
    },
}

/// Dispute subcommands
#[derive(Subcommand, Debug)]
pub enum DisputeCommands {
    /// List disputes (pending only unless --all)
    List {
        /// Only disputes of this project
        #[arg(long)]
        project: Option<String>,

        /// Include resolved disputes
        #[arg(long)]
        all: bool,
    },

    /// Show a dispute with its revision history
    Show {
        /// Dispute ID
        id: String,
    },

    /// Settle a dispute
    Resolve {
        /// Dispute ID
        id: String,

        /// use-producer, use-reviewer, custom or hybrid
        resolution: String,

        /// Resolved content (required for custom and hybrid)
        #[arg(long, allow_hyphen_values = true)]
        content: Option<String>,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show every setting with the layer it came from
    Show,

    /// Write a setting to the workspace config.kdl
    Set {
        /// Setting name (e.g. complexity-threshold)
        key: String,

        /// New value
        value: String,
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
    fn test_parse_review_revision() {
        let cli = Cli::try_parse_from([
            "duet", "review", "s1", "--feedback", "More detail", "-H",
        ])
        .unwrap();
        assert!(cli.human_readable);
        match cli.command {
            Commands::Review {
                step_id,
                approve,
                feedback,
                ..
            } => {
                assert_eq!(step_id, "s1");
                assert!(!approve);
                assert_eq!(feedback.as_deref(), Some("More detail"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_content_may_be_a_markdown_list() {
        let cli = Cli::try_parse_from([
            "duet", "produce", "s1", "- Tokenize\n- Charge", "--reasoning", "split",
        ])
        .unwrap();
        match cli.command {
            Commands::Produce {
                content, reasoning, ..
            } => {
                assert_eq!(content, "- Tokenize\n- Charge");
                assert_eq!(reasoning, "split");
            }
            other => panic!("unexpected command {:?}", other),
        }

        let cli = Cli::try_parse_from(["duet", "review", "s1", "--feedback", "- add refunds"]).unwrap();
        match cli.command {
            Commands::Review { feedback, .. } => {
                assert_eq!(feedback.as_deref(), Some("- add refunds"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_generate_conflicts_with_manual_review() {
        assert!(Cli::try_parse_from(["duet", "review", "s1", "--approve", "--generate"]).is_err());
    }

    #[test]
    fn test_task_define_needs_a_task() {
        assert!(Cli::try_parse_from(["duet", "task", "define", "p1"]).is_err());
        let cli = Cli::try_parse_from([
            "duet", "task", "define", "p1", "-t", "A: do a", "--task", "B: do b",
        ])
        .unwrap();
        match cli.command {
            Commands::Task {
                command: TaskCommands::Define { tasks, .. },
            } => assert_eq!(tasks.len(), 2),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
