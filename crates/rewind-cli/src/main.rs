use anyhow::{Context, Result, anyhow, bail};
use clap::{ArgAction, Args, Parser as ClapParser, Subcommand};
use notify::{RecursiveMode, Watcher};
use rewind::compiler::compile_program;
use rewind::diagnostics::render;
use rewind::parser::{find_named_functions, parse_program};
use rewind::{Clock, Console, Runner, RunnerConfig, Settings, StopReason, UpdateOutcome};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;
use std::sync::mpsc::{self, TryRecvError};

#[derive(ClapParser)]
#[command(name = "rewind")]
#[command(about = "Live-coding Lisp runtime")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate inline code and print the result
    Eval {
        /// The code to evaluate
        code: String,
        /// Give up after this many steps
        #[arg(long, default_value = "1000000")]
        max_steps: u64,
    },
    /// Run a file to completion and print the result
    Run {
        /// Path to the source file
        file: PathBuf,
        /// Give up after this many steps
        #[arg(long, default_value = "1000000")]
        max_steps: u64,
        #[command(flatten)]
        tuning: Tuning,
    },
    /// Check that a file parses and compiles
    Check {
        /// Path to the source file
        file: PathBuf,
    },
    /// Run a file and hot-reload it on every save
    Watch {
        /// Path to the source file
        file: PathBuf,
        /// Steps to run between checks for edits
        #[arg(long, default_value = "1000")]
        budget: u64,
        #[command(flatten)]
        tuning: Tuning,
    },
}

/// Settings file plus per-run overrides.
#[derive(Args)]
struct Tuning {
    /// Runner settings (.toml or .json)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Capture a keyframe every N steps
    #[arg(long)]
    keyframe_interval: Option<u64>,
    /// Collect cyclic garbage every N steps
    #[arg(long)]
    gc_interval: Option<u64>,
    /// Skip per-function checkpoints
    #[arg(long)]
    no_checkpoints: bool,
}

impl Tuning {
    fn settings(&self) -> Result<Settings> {
        let mut settings = load_settings(self.config.as_deref())?;
        if let Some(interval) = self.keyframe_interval {
            settings.keyframe_interval = interval;
        }
        if let Some(interval) = self.gc_interval {
            settings.gc_interval = interval;
        }
        if self.no_checkpoints {
            settings.record_checkpoints = false;
        }
        log::debug!("settings: {settings:?}");
        Ok(settings)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let outcome = match cli.command {
        Commands::Eval { code, max_steps } => {
            run_source("<eval>", &code, Settings::default(), max_steps)
        }
        Commands::Run {
            file,
            max_steps,
            tuning,
        } => tuning.settings().and_then(|settings| {
            let source = read(&file)?;
            log::info!("running {}", file.display());
            run_source(&file.display().to_string(), &source, settings, max_steps)
        }),
        Commands::Check { file } => check(&file),
        Commands::Watch {
            file,
            budget,
            tuning,
        } => tuning
            .settings()
            .and_then(|settings| watch(&file, settings, budget)),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{}", format!("{error:#}").trim_end());
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn read(file: &Path) -> Result<String> {
    fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let Some(path) = path else {
        return Ok(Settings::default());
    };
    let text = read(path)?;
    let settings = match path.extension().and_then(|extension| extension.to_str()) {
        Some("json") => serde_json::from_str(&text)
            .with_context(|| format!("invalid settings in {}", path.display()))?,
        _ => toml::from_str(&text)
            .with_context(|| format!("invalid settings in {}", path.display()))?,
    };
    Ok(settings)
}

/// Runner with a wall clock and a console that prints as it goes.
fn runner(settings: Settings) -> Runner {
    let config = RunnerConfig::new(settings)
        .with_capability(Rc::new(Clock::new()))
        .with_capability(Rc::new(Console::echoing()));
    Runner::new(config)
}

fn diagnose(error: &rewind::Error, filename: &str, source: &str) -> anyhow::Error {
    anyhow!(render(error, filename, source))
}

fn run_source(filename: &str, source: &str, settings: Settings, max_steps: u64) -> Result<()> {
    let mut runner = runner(settings);
    runner
        .load(source)
        .map_err(|error| diagnose(&error, filename, source))?;

    let mut total = 0;
    while !runner.is_finished() {
        let report = runner
            .run_budget(max_steps - total, |_| {})
            .map_err(|error| diagnose(&error, filename, source))?;
        total += report.steps;
        match report.stop {
            StopReason::Finished => {}
            StopReason::RenderRequested => {
                log::debug!("render requested at step {}", runner.step_count());
            }
            StopReason::Faulted => {
                let error = runner
                    .fault()
                    .ok_or_else(|| anyhow!("program faulted without an error"))?;
                return Err(diagnose(error, filename, source));
            }
            StopReason::Exhausted => bail!("program did not finish within {max_steps} steps"),
        }
    }

    if let Some(value) = runner.result() {
        println!("{value}");
    }
    log::info!("{total} steps, {} scopes live", runner.live_scopes());
    Ok(())
}

fn check(file: &Path) -> Result<()> {
    let source = read(file)?;
    let filename = file.display().to_string();
    let ast = parse_program(&source).map_err(|error| diagnose(&error, &filename, &source))?;
    let definitions =
        find_named_functions(&ast).map_err(|error| diagnose(&error, &filename, &source))?;
    let code = compile_program(&ast).map_err(|error| diagnose(&error, &filename, &source))?;
    println!(
        "OK: {} instructions, {} named functions",
        code.len(),
        definitions.len()
    );
    Ok(())
}

fn describe(outcome: &UpdateOutcome) -> String {
    match outcome {
        UpdateOutcome::Unchanged => "no changes".to_string(),
        UpdateOutcome::Restarted => "restarted".to_string(),
        UpdateOutcome::Rewound { function, step } => {
            format!("`{function}` changed, rewound to step {step}")
        }
        UpdateOutcome::Patched { functions } => {
            let names: Vec<&str> = functions.iter().map(|name| &**name).collect();
            format!("patched {}", names.join(", "))
        }
    }
}

fn watch(file: &Path, settings: Settings, budget: u64) -> Result<()> {
    let filename = file.display().to_string();
    let (sender, events) = mpsc::channel::<notify::Result<notify::Event>>();
    let mut watcher = notify::recommended_watcher(sender).context("starting file watcher")?;
    watcher
        .watch(file, RecursiveMode::NonRecursive)
        .with_context(|| format!("watching {filename}"))?;

    let mut runner = runner(settings);
    let mut current = read(file)?;
    if let Err(error) = runner.load(&current) {
        eprint!("{}", render(&error, &filename, &current));
    }
    eprintln!("watching {filename}");

    loop {
        let running = runner.source().is_some() && !runner.is_finished() && runner.fault().is_none();
        if running {
            let report = runner
                .run_budget(budget, |error| eprint!("{}", render(error, &filename, &current)))
                .map_err(|error| diagnose(&error, &filename, &current))?;
            if report.stop == StopReason::Finished {
                if let Some(value) = runner.result() {
                    println!("{value}");
                }
            }
        }

        let event = if running {
            match events.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) => continue,
                Err(TryRecvError::Disconnected) => break,
            }
        } else {
            match events.recv() {
                Ok(event) => event,
                Err(_) => break,
            }
        };
        let event = event.context("file watcher failed")?;
        if !(event.kind.is_modify() || event.kind.is_create()) {
            continue;
        }
        // Editors that save by renaming briefly leave no file behind.
        let edited = match fs::read_to_string(file) {
            Ok(edited) => edited,
            Err(error) => {
                log::debug!("skipping unreadable edit: {error}");
                continue;
            }
        };
        match runner.update(&edited) {
            Ok(outcome) => {
                if outcome != UpdateOutcome::Unchanged {
                    eprintln!("reloaded: {}", describe(&outcome));
                }
                current = edited;
            }
            Err(error) => eprint!("{}", render(&error, &filename, &edited)),
        }
    }
    Ok(())
}
