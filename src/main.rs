// klippy_nozzle_fan/src/main.rs
// Replays a timed script of host events and G-code against a simulated
// printer carrying a [nozzle_cleaning_fan] section.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{debug, info, warn};

use klippy_nozzle_fan::configfile::Configfile;
use klippy_nozzle_fan::core_traits::PrintKObject;
use klippy_nozzle_fan::extras::fan::LoggingPwmPin;
use klippy_nozzle_fan::extras::nozzle_cleaning_fan::PrinterNozzleFan;
use klippy_nozzle_fan::extras::probe_clean_listener::HostEvent;
use klippy_nozzle_fan::printer::Printer;
use klippy_nozzle_fan::reactor::SimReactor;

/// Nozzle cleaning fan simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file
    #[arg()]
    config_file: String,

    /// read script lines from file instead of stdin
    #[arg(short, long)]
    script: Option<String>,

    /// write log to file instead of stderr
    #[arg(short, long)]
    logfile: Option<String>,

    /// enable debug messages
    #[arg(short, long)]
    verbose: bool,

    /// seconds to keep the clock running after the last script line
    #[arg(long, default_value_t = 5.0)]
    drain: f64,
}

#[derive(Debug, Clone, PartialEq)]
enum Action {
    Event(HostEvent),
    GCode(String),
}

#[derive(Debug, Clone, PartialEq)]
struct ScriptLine {
    time: f64,
    action: Action,
}

/// Parses `@<time> event <name>` and `@<time> <gcode>` lines. Blank lines
/// and `#` comments are skipped.
fn parse_script(content: &str) -> Result<Vec<ScriptLine>> {
    let mut lines = Vec::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let lineno = idx + 1;
        let rest = line
            .strip_prefix('@')
            .with_context(|| format!("line {}: expected '@<time>', got '{}'", lineno, line))?;
        let (time_str, body) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        let time: f64 = time_str
            .parse()
            .with_context(|| format!("line {}: invalid time '{}'", lineno, time_str))?;
        if !time.is_finite() || time < 0.0 {
            bail!("line {}: time must be a non-negative number", lineno);
        }
        let body = body.trim();
        let action = match body.split_once(char::is_whitespace) {
            Some((word, name)) if word.eq_ignore_ascii_case("event") => {
                let event = HostEvent::from_name(name)
                    .with_context(|| format!("line {}: unknown event '{}'", lineno, name.trim()))?;
                Action::Event(event)
            }
            _ if body.is_empty() => bail!("line {}: nothing to do at @{}", lineno, time_str),
            _ => Action::GCode(body.to_string()),
        };
        lines.push(ScriptLine { time, action });
    }
    // Stable, so lines sharing a time keep their file order
    lines.sort_by(|a, b| a.time.total_cmp(&b.time));
    Ok(lines)
}

fn read_script(path: Option<&str>) -> Result<String> {
    match path {
        Some(path) => {
            std::fs::read_to_string(path).with_context(|| format!("Can't read script {}", path))
        }
        None => {
            let mut content = String::new();
            std::io::stdin().read_to_string(&mut content).context("Can't read script from stdin")?;
            Ok(content)
        }
    }
}

fn print_console(printer: &Printer, time: f64) {
    for msg in printer.take_console_messages() {
        println!("{:.3}: // {}", time, msg);
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if args.verbose {
        builder.filter(None, log::LevelFilter::Debug);
    } else {
        builder.filter(None, log::LevelFilter::Info);
    }
    if let Some(ref logfile) = args.logfile {
        let file = std::fs::File::create(logfile)
            .with_context(|| format!("Can't create logfile {}", logfile))?;
        let target = Box::new(file);
        builder.target(env_logger::Target::Pipe(target));
    }
    builder.init();

    info!("Starting nozzle fan simulator");

    let config = Configfile::read_file(Path::new(&args.config_file))
        .with_context(|| format!("Unable to load config {}", args.config_file))?;
    info!("Loaded config {}", config.filename().unwrap_or(&args.config_file));
    let script = parse_script(&read_script(args.script.as_deref())?)?;

    let reactor = Arc::new(SimReactor::new());
    let printer = Printer::new(reactor.clone());
    let pin = LoggingPwmPin::new("nozzle_fan");
    let resolved = pin.clone();
    let fan = PrinterNozzleFan::load_config(&printer, &config, move |name| {
        info!("Resolved pin '{}' to simulated PWM output", name);
        Box::new(resolved)
    })?;
    for (name, help) in printer.command_help() {
        debug!("Registered command {}: {}", name, help);
    }

    for line in &script {
        reactor.advance_to(line.time);
        match &line.action {
            Action::Event(event) => {
                if printer.send_event(event.name()) == 0 {
                    warn!("No handler for event '{}'", event.name());
                }
            }
            Action::GCode(gcode) => match printer.run_script_line(gcode) {
                Ok(responses) => {
                    for response in responses {
                        println!("{:.3}: {}", line.time, response);
                    }
                }
                Err(e) => println!("{:.3}: !! {}", line.time, e),
            },
        }
        print_console(&printer, line.time);
    }

    let end_time = script.last().map_or(0.0, |line| line.time) + args.drain.max(0.0);
    reactor.advance_to(end_time);
    print_console(&printer, end_time);

    let status = fan.lock().get_status(end_time);
    println!("{}", serde_json::to_string_pretty(&status)?);
    info!("{} pin write(s); final output {:?}", pin.writes().len(), pin.last_value());
    Ok(())
}
