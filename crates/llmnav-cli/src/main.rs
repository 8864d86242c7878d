//! `llmnav` – run one model-driven navigation session from the terminal.
//!
//! ```text
//! llmnav [--config <path>] [--max-iterations <n>] <prompt...>
//! ```
//!
//! 1. Loads `./llmnav.toml` (or `--config`) and applies `LLMNAV_*` overrides.
//! 2. Builds the simulated robot, the OpenAI-compatible model client, the
//!    event bus, the session recorder and the controller.
//! 3. Runs a single session for the prompt and prints how it ended.
//! 4. Ctrl-C publishes `ABORT` on the bus; the session stops at the next
//!    iteration boundary, or at once while waiting for the model, and the
//!    trace is still written.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use serde_json::json;
use tracing::{info, warn};

use llmnav_hal::SimRobot;
use llmnav_middleware::EventBus;
use llmnav_recorder::{SessionRecorder, TraceStore};
use llmnav_runtime::{
    ChatGateway, Disposition, LlmRobotController, OpenAiClient, SessionOutcome, init_tracing,
    prompt,
};
use llmnav_types::{Event, EventType};

const USAGE: &str = "usage: llmnav [--config <path>] [--max-iterations <n>] <prompt...>";

/// Parsed command line.
#[derive(Debug, Default, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    max_iterations: Option<usize>,
    prompt: String,
    help: bool,
}

impl Args {
    fn parse(args: impl IntoIterator<Item = String>) -> Result<Self, String> {
        let mut parsed = Args::default();
        let mut words = Vec::new();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-h" | "--help" => parsed.help = true,
                "-c" | "--config" => {
                    let path = args.next().ok_or("--config needs a path")?;
                    parsed.config = Some(PathBuf::from(path));
                }
                "-n" | "--max-iterations" => {
                    let value = args.next().ok_or("--max-iterations needs a number")?;
                    let n = value
                        .parse::<usize>()
                        .map_err(|_| format!("invalid --max-iterations value: {value}"))?;
                    parsed.max_iterations = Some(n);
                }
                flag if flag.starts_with('-') && flag.len() > 1 => {
                    return Err(format!("unknown option: {flag}"));
                }
                _ => words.push(arg),
            }
        }
        parsed.prompt = words.join(" ");
        if parsed.prompt.trim().is_empty() && !parsed.help {
            return Err("missing prompt".to_string());
        }
        Ok(parsed)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _guard = init_tracing("llmnav");

    let args = match Args::parse(std::env::args().skip(1)) {
        Ok(args) if args.help => {
            println!("{USAGE}");
            return ExitCode::SUCCESS;
        }
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}: {e}\n{USAGE}", "error".red().bold());
            return ExitCode::from(2);
        }
    };

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{}: {e}", "error".red().bold());
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the goal was reached.
async fn run(args: Args) -> Result<bool, String> {
    let cfg = config::load(args.config.as_deref())?;
    let max_iterations = args.max_iterations.unwrap_or(cfg.max_iterations);
    info!(config = ?cfg, max_iterations, "configuration loaded");

    let robot = Arc::new(SimRobot::new(cfg.sim_config()));
    let mut client = OpenAiClient::new(&cfg.base_url, &cfg.model).with_temperature(cfg.temperature);
    if !cfg.api_key.is_empty() {
        client = client.with_api_key(&cfg.api_key);
    }
    let chat = ChatGateway::new(Arc::new(client), cfg.gateway_config()?)
        .with_system_instruction(prompt::DEFAULT_SYSTEM_INSTRUCTION);

    let bus = EventBus::new();
    let store = cfg
        .trace_dir
        .as_ref()
        .map(TraceStore::open)
        .transpose()
        .map_err(|e| format!("cannot open trace directory: {e}"))?;
    let recorder = SessionRecorder::attach(&bus, store.clone(), Some(robot.clone()));
    let controller = LlmRobotController::new(robot, chat, bus.clone(), cfg.controller_config()?);

    // ── Ctrl-C → ABORT ───────────────────────────────────────────────────
    let abort_bus = bus.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\n{}", "Ctrl-C received, aborting session ...".yellow().bold());
        abort_bus.publish(Event::new(
            "llmnav-cli",
            EventType::Abort,
            json!({ "reason": "operator interrupt" }),
        ));
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; Ctrl-C will kill the process");
    }

    println!(
        "  {} {} {}",
        "llmnav".bold(),
        cfg.model.cyan(),
        format!("(max {max_iterations} iterations)").dimmed()
    );

    let report = match controller.ask(&args.prompt, max_iterations).await {
        SessionOutcome::Finished(report) => report,
        SessionOutcome::Busy => return Err("controller is busy".to_string()),
    };

    let elapsed = report.finished_at - report.started_at;
    match &report.disposition {
        Disposition::Completed => println!(
            "  {} goal reached after {} iteration(s) in {:.1}s",
            "✓".green().bold(),
            report.iterations,
            elapsed.num_milliseconds() as f64 / 1000.0
        ),
        other => println!(
            "  {} session ended after {} iteration(s): {}",
            "✗".red().bold(),
            report.iterations,
            other.abort_reason(report.iterations).unwrap_or_default()
        ),
    }
    if let (Some(store), Some(trace)) = (&store, recorder.last_finished()) {
        println!("  trace: {}", store.path_for(&trace.id).display());
    }

    Ok(report.is_completed())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args, String> {
        Args::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn prompt_words_are_joined() {
        let args = parse(&["go", "to", "the", "red", "box"]).unwrap();
        assert_eq!(args.prompt, "go to the red box");
        assert_eq!(args.config, None);
    }

    #[test]
    fn options_before_prompt() {
        let args = parse(&["--config", "arena.toml", "-n", "5", "find", "the door"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("arena.toml")));
        assert_eq!(args.max_iterations, Some(5));
        assert_eq!(args.prompt, "find the door");
    }

    #[test]
    fn bad_arguments_are_rejected() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["--config"]).is_err());
        assert!(parse(&["-n", "lots", "go"]).is_err());
        assert!(parse(&["--fast", "go"]).is_err());
    }

    #[test]
    fn help_needs_no_prompt() {
        assert!(parse(&["--help"]).unwrap().help);
    }
}
