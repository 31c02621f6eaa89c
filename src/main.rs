use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use itertools::Itertools;
use tracing::{error, info};

use okserial::{cli::Cli, logging, Error, Matcher, PortAttributes, ScanProvider, Scanner};

/// Attributes leading the one-line listing, in display order.
const LINE_KEYS: &[&str] = &["device", "subsystem", "vid_pid", "description", "serial_number"];

fn main() -> ExitCode {
    color_eyre::install().ok();
    let cli = Cli::parse();
    logging::init(cli.log_level.as_deref());

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{error}");
            ExitCode::from(exit_code(&error))
        }
    }
}

fn exit_code(error: &Error) -> u8 {
    match error {
        Error::NoMatch { .. } => 1,
        Error::AmbiguousMatch { .. } => 2,
        Error::Parse { .. } => 3,
        _ => 4,
    }
}

fn run(cli: &Cli) -> Result<(), Error> {
    let expression = cli.expression.as_deref().unwrap_or("");
    let matcher = Matcher::new(expression)?;
    let scanner = Scanner::from_env();

    if matcher.is_empty() {
        info!("finding serial ports");
    } else {
        info!(%matcher, "finding serial ports");
    }

    let deadline = Instant::now() + Duration::from_secs_f64(cli.wait.max(0.0));
    let found: Vec<PortAttributes> = loop {
        let snapshot = scanner.scan()?;
        let matched: Vec<PortAttributes> =
            matcher.filter(&snapshot).into_iter().cloned().collect();
        if !matched.is_empty() || Instant::now() >= deadline {
            break matched;
        }
        std::thread::sleep(Duration::from_millis(200));
    };

    if found.is_empty() {
        return Err(Error::NoMatch {
            expression: expression.to_string(),
        });
    }
    if cli.one && found.len() > 1 {
        return Err(Error::AmbiguousMatch {
            expression: expression.to_string(),
            candidates: found.iter().map(|p| p.device().to_string()).collect(),
        });
    }

    info!(found = found.len(), "matching serial ports");
    for port in &found {
        if cli.name {
            println!("{}", port.device());
        } else if cli.verbose {
            println!("{}", format_detail(port, &matcher));
        } else {
            println!("{}", format_line(port, &matcher));
        }
    }
    Ok(())
}

/// One line per port: the interesting attributes, then whatever else the
/// expression matched, with matched values marked.
fn format_line(port: &PortAttributes, matcher: &Matcher) -> String {
    let hits = matcher.hits(port);
    let mut words: Vec<String> = Vec::new();

    for key in LINE_KEYS {
        if let Some(value) = port.get(key) {
            words.push(decorate(value, hits.contains(*key)));
        }
    }
    for (key, value) in port.iter() {
        if hits.contains(key) && key != "name" && !LINE_KEYS.contains(&key) {
            words.push(format!("{key}={}", decorate(value, true)));
        }
    }

    words.iter().join(" ")
}

fn format_detail(port: &PortAttributes, matcher: &Matcher) -> String {
    let hits = matcher.hits(port);
    let mut out = format!("Port: {}", port.device());
    for (key, value) in port.iter() {
        let marker = if hits.contains(key) { "*" } else { " " };
        out.push_str(&format!("\n {marker} {key}={value:?}"));
    }
    out.push('\n');
    out
}

fn decorate(value: &str, hit: bool) -> String {
    let quoted = if value.chars().any(char::is_whitespace) {
        format!("{value:?}")
    } else {
        value.to_string()
    };
    if hit {
        format!("{quoted}*")
    } else {
        quoted
    }
}
