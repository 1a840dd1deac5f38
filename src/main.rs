//! Duet CLI - a collaborative task-decomposition engine.

use clap::Parser;
use duet::audit_log::AuditLog;
use duet::cli::{
    Cli, Commands, ComplexityCommands, ConfigCommands, DisputeCommands, ProjectCommands,
    StepCommands, TaskCommands,
};
use duet::commands::{self, Output};
use duet::config::{resolve_config, ConfigOverrides, ResolvedConfig};
use duet::storage::get_storage_dir;
use std::env;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter.
const LOG_ENV: &str = "DUET_LOG";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let human = cli.human_readable;

    let workspace = resolve_workspace(cli.workspace.clone(), human);

    let mut overrides = ConfigOverrides::new();
    if let Some(ms) = cli.timeout_ms {
        overrides = overrides.with_generation_timeout_ms(ms);
    }
    if cli.no_audit_log {
        overrides = overrides.with_audit_log(false);
    }

    let (data_dir, config) = match get_storage_dir(&workspace)
        .and_then(|dir| resolve_config(&dir, &overrides).map(|config| (dir, config)))
    {
        Ok(resolved) => resolved,
        Err(e) => fail(&e, human),
    };
    let audit = config
        .audit_log_file()
        .map(|path| Arc::new(AuditLog::new(path)));

    // Serialize command for the audit log
    let (cmd_name, args_json) = serialize_command(&cli.command);
    let start = Instant::now();

    let result = run_command(cli.command, &data_dir, &config, audit.clone(), human).await;

    let duration = start.elapsed().as_millis() as u64;
    if let Some(audit) = &audit {
        let error = result.as_ref().err().map(|e| e.to_string());
        audit.log_command(&cmd_name, &args_json, result.is_ok(), error, duration);
    }

    if let Err(e) = result {
        fail(&e, human);
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}

fn fail(error: &duet::Error, human: bool) -> ! {
    if human {
        eprintln!("Error: {}", error);
    } else {
        let response = error.to_response();
        eprintln!(
            "{}",
            serde_json::to_string(&response).unwrap_or_else(|_| format!(r#"{{"message": "{}"}}"#, error))
        );
    }
    process::exit(1);
}

/// Resolve the workspace path: --workspace flag > DUET_WORKSPACE > current directory.
///
/// An explicit path must exist.
fn resolve_workspace(explicit_path: Option<PathBuf>, human: bool) -> PathBuf {
    match explicit_path {
        Some(path) => {
            if !path.exists() {
                fail(
                    &duet::Error::Validation(format!(
                        "Specified workspace does not exist: {}",
                        path.display()
                    )),
                    human,
                );
            }
            path
        }
        None => env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

async fn run_command(
    command: Commands,
    data_dir: &Path,
    config: &ResolvedConfig,
    audit: Option<Arc<AuditLog>>,
    human: bool,
) -> Result<(), duet::Error> {
    // Commands that do not need the database.
    match &command {
        Commands::Init => {
            output(&commands::init(data_dir)?, human);
            return Ok(());
        }
        Commands::Config { command } => {
            match command {
                ConfigCommands::Show => output(&commands::config_show(config), human),
                ConfigCommands::Set { key, value } => {
                    output(&commands::config_set(data_dir, key, value)?, human)
                }
            }
            return Ok(());
        }
        Commands::Log { id, limit } => {
            output(&commands::log(config, id.as_deref(), *limit)?, human);
            return Ok(());
        }
        _ => {}
    }

    let engine = commands::open_engine(data_dir, config, audit)?;

    match command {
        Commands::Init | Commands::Config { .. } | Commands::Log { .. } => {}

        Commands::Project { command } => match command {
            ProjectCommands::Create {
                name,
                description,
                threshold,
                max_iterations,
                plan,
            } => {
                let result = commands::project_create(
                    &engine,
                    &name,
                    &description,
                    threshold,
                    max_iterations,
                    plan,
                )
                .await?;
                output(&result, human);
            }
            ProjectCommands::Show { id } => {
                output(&commands::project_show(&engine, &id).await?, human);
            }
            ProjectCommands::List => {
                output(&commands::project_list(&engine).await?, human);
            }
            ProjectCommands::Settings {
                id,
                threshold,
                max_iterations,
            } => {
                let result =
                    commands::project_settings(&engine, &id, threshold, max_iterations).await?;
                output(&result, human);
            }
            ProjectCommands::Delete { id } => {
                output(&commands::project_delete(&engine, &id).await?, human);
            }
        },

        Commands::Task { command } => match command {
            TaskCommands::Define { project_id, tasks } => {
                output(&commands::task_define(&engine, &project_id, &tasks).await?, human);
            }
            TaskCommands::Show { id } => {
                output(&commands::task_show(&engine, &id).await?, human);
            }
            TaskCommands::Move { id, parent } => {
                output(&engine.move_task(&id, parent.as_deref()).await?, human);
            }
            TaskCommands::Delete { id } => {
                output(&commands::task_delete(&engine, &id).await?, human);
            }
        },

        Commands::Step { command } => match command {
            StepCommands::Create {
                task_id,
                title,
                prev,
                next,
            } => {
                let step = commands::step_create(
                    &engine,
                    &task_id,
                    &title,
                    prev.as_deref(),
                    next.as_deref(),
                )
                .await?;
                output(&step, human);
            }
            StepCommands::Show { id } => {
                output(&commands::step_show(&engine, &id).await?, human);
            }
            StepCommands::Delete { id } => {
                output(&commands::step_delete(&engine, &id).await?, human);
            }
            StepCommands::Link { node, prev, next } => {
                let item =
                    commands::step_link(&engine, &node, prev.as_deref(), next.as_deref()).await?;
                output(&item, human);
            }
            StepCommands::Promote { id } => {
                output(&engine.promote_step(&id, None).await?, human);
            }
        },

        Commands::Produce {
            step_id,
            content,
            reasoning,
            focus,
        } => {
            let step = engine
                .submit_producer_content(&step_id, &content, &reasoning, focus.as_deref())
                .await?;
            output(&step, human);
        }

        Commands::Review {
            step_id,
            approve,
            content,
            feedback,
            generate,
        } => {
            let step =
                commands::review(&engine, &step_id, approve, content, feedback, generate).await?;
            output(&step, human);
        }

        Commands::Draft { step_id, focus } => {
            let step = engine
                .generate_producer_draft(&step_id, focus.as_deref(), None)
                .await?;
            output(&step, human);
        }

        Commands::Collaborate { step_id, focus } => {
            let step = engine.collaborate(&step_id, focus.as_deref(), None).await?;
            output(&step, human);
        }

        Commands::Complexity { command } => match command {
            ComplexityCommands::Analyze { step_id, agent } => {
                output(
                    &commands::complexity_analyze(&engine, &step_id, &agent).await?,
                    human,
                );
            }
        },

        Commands::Optimize {
            project_id,
            max_iterations,
            force,
        } => {
            let result = engine
                .run_promotion_optimization(&project_id, max_iterations, force)
                .await?;
            output(&result, human);
        }

        Commands::Dispute { command } => match command {
            DisputeCommands::List { project, all } => {
                output(
                    &commands::dispute_list(&engine, project.as_deref(), all).await?,
                    human,
                );
            }
            DisputeCommands::Show { id } => {
                output(&engine.get_dispute(&id).await?, human);
            }
            DisputeCommands::Resolve {
                id,
                resolution,
                content,
            } => {
                let step =
                    commands::dispute_resolve(&engine, &id, &resolution, content.as_deref())
                        .await?;
                output(&step, human);
            }
        },

        Commands::Next { project_id } => {
            output(&engine.get_next_actionable_item(&project_id).await?, human);
        }

        Commands::Chain {
            start,
            direction,
            depth,
        } => {
            output(
                &commands::chain(&engine, &start, &direction, depth).await?,
                human,
            );
        }
    }

    Ok(())
}

fn output<T: Output>(result: &T, human: bool) {
    if human {
        println!("{}", result.to_human());
    } else {
        println!("{}", result.to_json());
    }
}

/// Command name and arguments as recorded in the audit log.
fn serialize_command(command: &Commands) -> (String, serde_json::Value) {
    use serde_json::json;

    match command {
        Commands::Init => ("init".to_string(), json!({})),

        Commands::Project { command } => match command {
            ProjectCommands::Create {
                name,
                description,
                threshold,
                max_iterations,
                plan,
            } => (
                "project create".to_string(),
                json!({
                    "name": name,
                    "description": description,
                    "threshold": threshold,
                    "max_iterations": max_iterations,
                    "plan": plan,
                }),
            ),
            ProjectCommands::Show { id } => ("project show".to_string(), json!({ "id": id })),
            ProjectCommands::List => ("project list".to_string(), json!({})),
            ProjectCommands::Settings {
                id,
                threshold,
                max_iterations,
            } => (
                "project settings".to_string(),
                json!({ "id": id, "threshold": threshold, "max_iterations": max_iterations }),
            ),
            ProjectCommands::Delete { id } => ("project delete".to_string(), json!({ "id": id })),
        },

        Commands::Task { command } => match command {
            TaskCommands::Define { project_id, tasks } => (
                "task define".to_string(),
                json!({ "project_id": project_id, "tasks": tasks }),
            ),
            TaskCommands::Show { id } => ("task show".to_string(), json!({ "id": id })),
            TaskCommands::Move { id, parent } => (
                "task move".to_string(),
                json!({ "id": id, "parent": parent }),
            ),
            TaskCommands::Delete { id } => ("task delete".to_string(), json!({ "id": id })),
        },

        Commands::Step { command } => match command {
            StepCommands::Create {
                task_id,
                title,
                prev,
                next,
            } => (
                "step create".to_string(),
                json!({ "task_id": task_id, "title": title, "prev": prev, "next": next }),
            ),
            StepCommands::Show { id } => ("step show".to_string(), json!({ "id": id })),
            StepCommands::Delete { id } => ("step delete".to_string(), json!({ "id": id })),
            StepCommands::Link { node, prev, next } => (
                "step link".to_string(),
                json!({ "node": node, "prev": prev, "next": next }),
            ),
            StepCommands::Promote { id } => ("step promote".to_string(), json!({ "id": id })),
        },

        Commands::Produce {
            step_id,
            content,
            reasoning,
            focus,
        } => (
            "produce".to_string(),
            json!({
                "step_id": step_id,
                "content": content,
                "reasoning": reasoning,
                "focus": focus,
            }),
        ),

        Commands::Review {
            step_id,
            approve,
            content,
            feedback,
            generate,
        } => (
            "review".to_string(),
            json!({
                "step_id": step_id,
                "approve": approve,
                "content": content,
                "feedback": feedback,
                "generate": generate,
            }),
        ),

        Commands::Draft { step_id, focus } => (
            "draft".to_string(),
            json!({ "step_id": step_id, "focus": focus }),
        ),

        Commands::Collaborate { step_id, focus } => (
            "collaborate".to_string(),
            json!({ "step_id": step_id, "focus": focus }),
        ),

        Commands::Complexity { command } => match command {
            ComplexityCommands::Analyze { step_id, agent } => (
                "complexity analyze".to_string(),
                json!({ "step_id": step_id, "agent": agent }),
            ),
        },

        Commands::Optimize {
            project_id,
            max_iterations,
            force,
        } => (
            "optimize".to_string(),
            json!({ "project_id": project_id, "max_iterations": max_iterations, "force": force }),
        ),

        Commands::Dispute { command } => match command {
            DisputeCommands::List { project, all } => (
                "dispute list".to_string(),
                json!({ "project": project, "all": all }),
            ),
            DisputeCommands::Show { id } => ("dispute show".to_string(), json!({ "id": id })),
            DisputeCommands::Resolve {
                id,
                resolution,
                content,
            } => (
                "dispute resolve".to_string(),
                json!({ "id": id, "resolution": resolution, "content": content }),
            ),
        },

        Commands::Next { project_id } => ("next".to_string(), json!({ "project_id": project_id })),

        Commands::Chain {
            start,
            direction,
            depth,
        } => (
            "chain".to_string(),
            json!({ "start": start, "direction": direction, "depth": depth }),
        ),

        Commands::Log { id, limit } => ("log".to_string(), json!({ "id": id, "limit": limit })),

        Commands::Config { command } => match command {
            ConfigCommands::Show => ("config show".to_string(), json!({})),
            ConfigCommands::Set { key, value } => (
                "config set".to_string(),
                json!({ "key": key, "value": value }),
            ),
        },
    }
}
