use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};

use crate::application::Application;
use crate::config::Config;
use crate::controller::VariableScope;
use crate::job::{Sink, StepDescriptor, StepNode};

#[derive(Parser)]
#[command(name = "sluice")]
#[command(about = "Sluice - run line-oriented ETL job scripts", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default search)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding local tables (overrides config file and env vars)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a job script
    Run {
        /// Script file
        script: PathBuf,

        /// Initial variable binding (repeatable)
        #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_var)]
        vars: Vec<(String, String)>,

        /// Endpoint name for the source org
        #[arg(long)]
        src: Option<String>,

        /// Endpoint name for the destination org
        #[arg(long)]
        dst: Option<String>,

        /// Accumulator variable for batch loops
        #[arg(long)]
        accumulator: Option<String>,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Parse a script and print its step tree without running it
    Check {
        /// Script file
        script: PathBuf,

        /// Print the tree as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config,
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing variable name in '{}'", raw));
    }
    Ok((name.to_string(), value.to_string()))
}

/// Run the CLI by parsing process arguments
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    run_cli_with_args(cli).await
}

/// Run the CLI with provided arguments
pub async fn run_cli_from_args(args: Vec<String>) -> Result<()> {
    let cli = Cli::parse_from(args);
    run_cli_with_args(cli).await
}

async fn run_cli_with_args(cli: Cli) -> Result<()> {
    crate::logging::init(&cli.log_level);

    let builder = Config::builder()
        .config_path(cli.config)
        .data_dir(cli.data_dir);

    match cli.command {
        Commands::Run {
            script,
            vars,
            src,
            dst,
            accumulator,
            json,
        } => {
            // Parse before touching config so script errors surface first
            let job = Application::load_job(&script)?;
            let config = builder
                .src(src)
                .dst(dst)
                .accumulator(accumulator)
                .build()
                .context("Failed to load configuration")?;
            let app = Application::new(config);

            let variables: VariableScope = vars.into_iter().collect();
            let mut controller = app.controller(job, variables)?;
            let result = controller.run().await;

            let report = controller.report();
            if json {
                println!("{}", serde_json::to_string_pretty(report)?);
            } else {
                print!("{}", report);
            }
            if let Err(err) = result {
                return Err(anyhow!(err).context(format!("Job {} failed", script.display())));
            }
        }

        Commands::Check { script, json } => {
            let job = Application::load_job(&script)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&job)?);
            } else {
                println!("Script: {}", job.digest);
                print!("{}", render_tree(&job.nodes));
                println!("✓ {} step(s) parsed", job.descriptors().iter().filter(|s| s.has_query()).count());
            }
        }

        Commands::Config => {
            let config = builder.build().context("Failed to load configuration")?;
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

/* ===================== Tree Rendering ===================== */

fn render_tree(nodes: &[StepNode]) -> String {
    let mut out = String::new();
    render_nodes(nodes, 0, &mut out);
    out
}

fn render_nodes(nodes: &[StepNode], depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    for node in nodes {
        match node {
            StepNode::Leaf(step) => {
                if step.has_query() {
                    out.push_str(&format!("{}{}\n", indent, describe_step(step)));
                }
            }
            StepNode::Loop(batch) => {
                out.push_str(&format!(
                    "{}loop {} over {} (line {})\n",
                    indent, batch.loop_id, batch.param, batch.driver.line
                ));
                out.push_str(&format!("{}  driver {}\n", indent, describe_step(&batch.driver)));
                render_nodes(&batch.body, depth + 1, out);
            }
        }
    }
}

fn describe_step(step: &StepDescriptor) -> String {
    let sinks: Vec<String> = step
        .sinks
        .iter()
        .map(|sink| match sink {
            Sink::LocalTable { name, cached: true } => format!("csv:{}:cache", name),
            Sink::LocalTable { name, cached: false } => format!("csv:{}", name),
            Sink::Variable { name } => format!("var:{}", name),
            Sink::RemoteObject {
                object,
                op,
                new_ids_table: Some(ids),
            } => format!("dst:{}:{}:{}", op.as_str(), object, ids),
            Sink::RemoteObject { object, op, .. } => format!("dst:{}:{}", op.as_str(), object),
        })
        .collect();
    let mut text = format!("line {}: {}", step.line, step.query);
    if !sinks.is_empty() {
        text.push_str(" => ");
        text.push_str(&sinks.join(" => "));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;

    #[test]
    fn test_parse_var() {
        assert_eq!(parse_var("a=1"), Ok(("a".to_string(), "1".to_string())));
        assert_eq!(parse_var("q=x=y"), Ok(("q".to_string(), "x=y".to_string())));
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=1").is_err());
    }

    #[test]
    fn test_run_arguments() {
        let cli = Cli::try_parse_from([
            "sluice",
            "--data-dir",
            "/tmp/data",
            "run",
            "job.sql",
            "--var",
            "min=3",
            "--var",
            "max=9",
            "--dst",
            "sandbox",
            "--json",
        ])
        .unwrap();

        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/data")));
        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Run {
                script,
                vars,
                src,
                dst,
                json,
                ..
            } => {
                assert_eq!(script, PathBuf::from("job.sql"));
                assert_eq!(vars.len(), 2);
                assert_eq!(vars[1], ("max".to_string(), "9".to_string()));
                assert_eq!(src, None);
                assert_eq!(dst.as_deref(), Some("sandbox"));
                assert!(json);
            }
            _ => panic!("Expected run command"),
        }
    }

    #[test]
    fn test_render_tree_nests_loops() {
        let job = Job::parse(
            "SELECT i FROM csv.ints; => batch_begin:i:L\n\
             SELECT {i} => var:batch_params\n\
             => batch_end:L\n\
             SELECT 1 => csv:done:cache => dst:insert:Task:task_ids",
        )
        .unwrap();

        assert_eq!(
            render_tree(&job.nodes),
            "loop L over i (line 1)\n  \
               driver line 1: SELECT i FROM ints;\n  \
               line 2: SELECT {i} => var:batch_params\n\
             line 4: SELECT 1 => csv:done:cache => dst:insert:Task:task_ids\n"
        );
    }
}
