use anyhow::{Context, Result};
use bench_core::{
    load_config_file, validate_mitigation, BenchConfig, BenchError, ConfigFile, LogLevel,
    VariantIdentity, INTERPRETERS, MITIGATIONS,
};
use bench_runner::{
    create_checker, create_exploit, is_run_fatal, list_exploits, ArchiveProvisioner,
    BenchRunner, BenchmarkResult, BuildArtifact, BuildPipeline, Exploit, Interpreter,
    LocalToolchain, Provisioner, CHECKERS,
};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_INTERPRETER: &str = "LuaJIT-4f8736";
const DEFAULT_EXPLOIT: &str = "bytecode_corsix";
const DEFAULT_CHECKER: &str = "arbitrary-write";

#[derive(Parser)]
#[command(name = "bench", version = "0.3.0", about = "Lua exploit-mitigation benchmark")]
struct Cli {
    /// Verbosity of the benchmark and of the tools it runs.
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevelArg>,
    /// Working directory; everything the benchmark creates goes here.
    #[arg(long, global = true)]
    workdir: Option<PathBuf>,
    /// Checkout holding `patches/`, `exploits/` and vendored interpreters.
    #[arg(long, global = true)]
    code_dir: Option<PathBuf>,
    /// YAML configuration file; flags override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Never download the toolchain or PUC-Lua sources.
    #[arg(long, global = true)]
    no_download: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevelArg {
    #[value(name = "debug")]
    Debug,
    #[value(name = "info")]
    Info,
    #[value(name = "none")]
    None,
}

impl From<LogLevelArg> for LogLevel {
    fn from(value: LogLevelArg) -> Self {
        match value {
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::None => LogLevel::None,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one trial, or a sweep when any `--all-*` flag is given.
    Run {
        #[arg(long, default_value = DEFAULT_INTERPRETER)]
        interpreter: String,
        #[arg(long, default_value = DEFAULT_EXPLOIT)]
        exploit: String,
        #[arg(long, default_value = DEFAULT_CHECKER)]
        exploit_checker: String,
        #[arg(long)]
        mitigation: Option<String>,
        #[arg(long)]
        all_interpreters: bool,
        #[arg(long)]
        all_exploits: bool,
        #[arg(long)]
        all_mitigations: bool,
        /// Rebuild the requested interpreters from pristine sources.
        #[arg(long)]
        clean: bool,
        #[arg(long)]
        json: bool,
    },
    /// Build one variant and print its executable.
    Build {
        #[arg(long, default_value = DEFAULT_INTERPRETER)]
        interpreter: String,
        #[arg(long = "mitigation")]
        mitigations: Vec<String>,
        #[arg(long)]
        clean: bool,
        #[arg(long)]
        json: bool,
    },
    List {
        #[arg(long)]
        json: bool,
    },
}

impl Commands {
    fn json(&self) -> bool {
        match self {
            Commands::Run { json, .. } | Commands::Build { json, .. } | Commands::List { json } => {
                *json
            }
        }
    }
}

struct CommandOutput {
    payload: Option<Value>,
    exit_code: i32,
}

impl CommandOutput {
    fn done() -> Self {
        Self {
            payload: None,
            exit_code: 0,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_mode = cli.command.json();
    match run_command(cli) {
        Ok(output) => {
            if let Some(payload) = &output.payload {
                emit_json(payload);
            }
            if output.exit_code != 0 {
                std::process::exit(output.exit_code);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(cli: Cli) -> Result<CommandOutput> {
    let config = Arc::new(load_config(&cli)?);
    init_tracing(config.log_level);

    match cli.command {
        Commands::Run {
            interpreter,
            exploit,
            exploit_checker,
            mitigation,
            all_interpreters,
            all_exploits,
            all_mitigations,
            clean,
            json,
        } => {
            let mut checker = create_checker(&config, &exploit_checker)?;
            if let Some(m) = &mitigation {
                validate_mitigation(m)?;
            }
            let runner = runner_for(config.clone());
            if !json {
                println!(
                    "Preparing environment (can take a long time)... You can see the compilation progress by re-running with `--log-level info`."
                );
            }

            if !all_interpreters && !all_exploits && !all_mitigations {
                let identity = VariantIdentity::parse(&interpreter)?;
                let mut exploit = create_exploit(&config, &exploit)?;
                let mut target = runner.pipeline().interpreter(&identity, clean)?;
                if let Some(m) = &mitigation {
                    let variant = target.canonical_name();
                    target = runner.pipeline().patched(&target, m)?.ok_or_else(|| {
                        BenchError::MitigationUnavailable {
                            variant,
                            mitigation: m.clone(),
                        }
                    })?;
                }
                let exploited = runner.run_single(&target, exploit.as_mut(), checker.as_mut())?;
                let payload = if json {
                    Some(json!({
                        "ok": true,
                        "command": "run",
                        "generated_at": Utc::now().to_rfc3339(),
                        "variant": target.canonical_name(),
                        "exploit": exploit.name(),
                        "exploited": exploited
                    }))
                } else {
                    println!("{} - {}: exploited={}", target, exploit.name(), exploited);
                    None
                };
                // The exit status carries the verdict.
                return Ok(CommandOutput {
                    payload,
                    exit_code: exploited as i32,
                });
            }

            let names: Vec<String> = if all_interpreters {
                INTERPRETERS.iter().map(|s| s.to_string()).collect()
            } else {
                vec![interpreter]
            };
            let interpreters = build_interpreters(&runner, &names, clean)?;

            let exploit_names = if all_exploits {
                list_exploits(&config)?
            } else {
                vec![exploit]
            };
            let mut exploits = exploit_names
                .iter()
                .map(|name| create_exploit(&config, name))
                .collect::<Result<Vec<Box<dyn Exploit>>>>()?;

            let mitigations: Vec<String> = if all_mitigations {
                MITIGATIONS.iter().map(|s| s.to_string()).collect()
            } else {
                mitigation.into_iter().collect()
            };

            if !json {
                print_list(
                    "Interpreters to test:",
                    interpreters.iter().map(|i| i.canonical_name()),
                );
                print_list("Exploits to test:", exploit_names.iter().cloned());
                print_list("Mitigations to test:", mitigations.iter().cloned());
            }
            let result =
                runner.run_matrix(&interpreters, &mut exploits, &mitigations, checker.as_mut())?;
            if json {
                let mut payload = result.to_json();
                payload["ok"] = json!(true);
                payload["command"] = json!("run");
                return Ok(CommandOutput {
                    payload: Some(payload),
                    exit_code: 0,
                });
            }
            print!("{}", render_table(&result, &exploit_names));
            Ok(CommandOutput::done())
        }
        Commands::Build {
            interpreter,
            mitigations,
            clean,
            json,
        } => {
            for m in &mitigations {
                validate_mitigation(m)?;
            }
            let identity = VariantIdentity::parse(&interpreter)?.with_mitigations(mitigations);
            let runner = runner_for(config.clone());
            let path = match runner.pipeline().build(&identity, clean)? {
                BuildArtifact::Built(path) => path,
                BuildArtifact::Failed => {
                    return Err(BenchError::MitigationUnavailable {
                        variant: identity.release(),
                        mitigation: identity.mitigations().join(", "),
                    }
                    .into())
                }
            };
            if json {
                return Ok(CommandOutput {
                    payload: Some(json!({
                        "ok": true,
                        "command": "build",
                        "variant": identity.canonical_name(),
                        "artifact": path.display().to_string()
                    })),
                    exit_code: 0,
                });
            }
            println!("variant: {}", identity);
            println!("artifact: {}", path.display());
            Ok(CommandOutput::done())
        }
        Commands::List { json } => {
            let exploits = list_exploits(&config)?;
            if json {
                return Ok(CommandOutput {
                    payload: Some(json!({
                        "ok": true,
                        "command": "list",
                        "interpreters": INTERPRETERS,
                        "mitigations": MITIGATIONS,
                        "exploits": exploits,
                        "exploit_checkers": CHECKERS
                    })),
                    exit_code: 0,
                });
            }
            print_list("interpreters:", INTERPRETERS.iter().map(|s| s.to_string()));
            print_list("mitigations:", MITIGATIONS.iter().map(|s| s.to_string()));
            print_list("exploits:", exploits.into_iter());
            print_list("exploit checkers:", CHECKERS.iter().map(|s| s.to_string()));
            Ok(CommandOutput::done())
        }
    }
}

fn load_config(cli: &Cli) -> Result<BenchConfig> {
    let file = match &cli.config {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };
    let flags = ConfigFile {
        code_dir: cli.code_dir.clone(),
        work_dir: cli.workdir.clone(),
        log_level: cli.log_level.map(Into::into),
        downloads: cli.no_download.then_some(false),
        ..ConfigFile::default()
    };
    let cwd = std::env::current_dir().context("resolve current directory")?;
    Ok(file.merge(flags).into_config(&cwd, &cwd))
}

fn init_tracing(level: LogLevel) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.filter_directive())),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn runner_for(config: Arc<BenchConfig>) -> BenchRunner {
    let provisioner: Arc<dyn Provisioner> = Arc::new(ArchiveProvisioner::new(config.clone()));
    let toolchain = LocalToolchain::new(config.clone()).with_provisioner(provisioner.clone());
    let pipeline = BuildPipeline::new(config, Arc::new(toolchain)).with_provisioner(provisioner);
    BenchRunner::new(pipeline)
}

/// Builds the base interpreters of a sweep. A build failure drops that
/// interpreter; configuration errors abort.
fn build_interpreters(
    runner: &BenchRunner,
    names: &[String],
    clean: bool,
) -> Result<Vec<Interpreter>> {
    let mut interpreters = Vec::with_capacity(names.len());
    for name in names {
        let identity = VariantIdentity::parse(name)?;
        match runner.pipeline().interpreter(&identity, clean) {
            Ok(interpreter) => interpreters.push(interpreter),
            Err(err) if !is_run_fatal(&err) => {
                warn!("{} failed to build, dropping: {:#}", name, err);
            }
            Err(err) => return Err(err),
        }
    }
    info!("{} of {} interpreters ready", interpreters.len(), names.len());
    Ok(interpreters)
}

fn print_list(title: &str, items: impl Iterator<Item = String>) {
    println!("{}", title);
    for item in items {
        println!("  {}", item);
    }
}

fn render_table(result: &BenchmarkResult, exploits: &[String]) -> String {
    let variant_width = result
        .variants()
        .iter()
        .map(|v| v.len())
        .chain(std::iter::once("variant".len()))
        .max()
        .unwrap_or(0);
    let cell_width = |exploit: &str| exploit.len().max("yes".len());
    let mut out = format!("{:<width$}", "variant", width = variant_width);
    for exploit in exploits {
        out.push_str(&format!("  {:<width$}", exploit, width = cell_width(exploit)));
    }
    out.push('\n');
    for row in result.rows() {
        out.push_str(&format!("{:<width$}", row.variant, width = variant_width));
        for exploit in exploits {
            let cell = match row.exploits.get(exploit) {
                Some(true) => "yes",
                Some(false) => "no",
                None => "-",
            };
            out.push_str(&format!("  {:<width$}", cell, width = cell_width(exploit)));
        }
        out.push('\n');
    }
    out
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message
        }
    })
}
