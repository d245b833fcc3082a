//! scriptexec CLI
//!
//! Renders a script template and runs it locally or over SSH

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use eyre::{WrapErr, eyre};
use scriptexec_exec::{RunOutput, RunnerError};
use scriptexec_script::{Script, Shell};
use serde_json::{Map, Value};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "scriptexec")]
#[command(about = "Run script templates locally or over SSH", long_about = None)]
struct Cli {
    /// Config file (defaults to $SCRIPTEXEC_CONFIG or ./scriptexec.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a script and run it
    #[command(name = "run")]
    Run {
        /// Script template file
        script: PathBuf,
        /// Named connection from the config, or `local`
        #[arg(short, long, default_value = "local")]
        connection: String,
        /// Shell that executes the script (cmd, powershell, sh, bash, ...)
        #[arg(short, long, default_value = "sh")]
        shell: String,
        /// Template argument as KEY=VALUE
        #[arg(short, long = "arg", value_parser = parse_key_val)]
        args: Vec<(String, String)>,
        /// Template arguments as a JSON object, merged under --arg
        #[arg(long)]
        args_json: Option<String>,
    },
    /// Print the rendered script without running it
    #[command(name = "render")]
    Render {
        /// Script template file
        script: PathBuf,
        /// Template argument as KEY=VALUE
        #[arg(short, long = "arg", value_parser = parse_key_val)]
        args: Vec<(String, String)>,
        /// Template arguments as a JSON object, merged under --arg
        #[arg(long)]
        args_json: Option<String>,
    },
    /// Print the command line a shell is invoked with
    #[command(name = "command")]
    Command {
        /// Shell name
        shell: String,
    },
    /// List configured connections
    #[command(name = "connections")]
    Connections,
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, found {s:?}"))
}

fn build_arguments(args: Vec<(String, String)>, args_json: Option<&str>) -> Result<Value> {
    let mut map = match args_json {
        Some(json) => match serde_json::from_str(json).wrap_err("invalid --args-json")? {
            Value::Object(map) => map,
            other => return Err(eyre!("--args-json must be an object, found {other}")),
        },
        None => Map::new(),
    };
    for (key, value) in args {
        map.insert(key, Value::String(value));
    }
    Ok(Value::Object(map))
}

fn script_name(path: &std::path::Path) -> String {
    path.file_stem()
        .map_or_else(|| "script".to_string(), |s| s.to_string_lossy().into_owned())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    init_tracing(&config);
    match &config.source {
        Some(path) => debug!(path = %path.display(), "loaded config"),
        None => debug!("no config file found, using defaults"),
    }

    match cli.command {
        Commands::Run {
            script,
            connection,
            shell,
            args,
            args_json,
        } => {
            let connection = config.connection(&connection)?;
            let arguments = build_arguments(args, args_json.as_deref())?;
            let script = Script::from_file(script_name(&script), shell, &script)?;

            info!(connection = connection.kind(), script = %script.name(), "running script");

            let output = RunOutput::new()
                .with_stdout(Box::new(tokio::io::stdout()))
                .with_stderr(Box::new(tokio::io::stderr()));
            match scriptexec_exec::run(&connection, &script, &arguments, output).await {
                Ok(()) => {}
                Err(RunnerError::ExecutionFailed { exit_code, reason }) if exit_code > 0 => {
                    error!(exit_code, reason = %reason, "script failed");
                    std::process::exit(exit_code);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Render {
            script,
            args,
            args_json,
        } => {
            let arguments = build_arguments(args, args_json.as_deref())?;
            let script = Script::from_file(script_name(&script), "sh", &script)?;
            let rendered = script.render(&arguments)?;
            print!("{}", String::from_utf8_lossy(&rendered));
        }
        Commands::Command { shell } => {
            println!("{}", Shell::from(shell).command());
        }
        Commands::Connections => {
            println!("local\tlocal");
            for (name, connection) in &config.connections {
                match connection {
                    scriptexec_exec::Connection::Ssh(ssh) => {
                        println!("{name}\tssh\t{}@{}", ssh.user, ssh.address());
                    }
                    scriptexec_exec::Connection::Local(_) => println!("{name}\tlocal"),
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("Path=/tmp=x").unwrap(),
            ("Path".to_string(), "/tmp=x".to_string())
        );
        assert!(parse_key_val("Path").is_err());
    }

    #[test]
    fn test_build_arguments_merges() {
        let args = build_arguments(
            vec![("Path".to_string(), "/srv".to_string())],
            Some(r#"{"Path": "/tmp", "Depth": 2}"#),
        )
        .unwrap();
        assert_eq!(args, serde_json::json!({"Path": "/srv", "Depth": 2}));
    }

    #[test]
    fn test_build_arguments_rejects_non_object() {
        assert!(build_arguments(Vec::new(), Some("[1]")).is_err());
    }

    #[test]
    fn test_script_name() {
        assert_eq!(script_name(std::path::Path::new("/x/ls.ps1")), "ls");
    }
}
