use clap::Parser;

/// The command line interface for the `okserial` tool.
#[derive(Debug, Parser)]
#[command(author, version, about = "Find serial ports by attribute")]
pub struct Cli {
    /// Port match expression, e.g. `vid_pid=0403:* serial~/^A7/`.
    /// Omit it to list every port.
    pub expression: Option<String>,

    /// Print the full attribute dump for each matching port.
    #[arg(short, long)]
    pub verbose: bool,

    /// Print device names only.
    #[arg(short, long, conflicts_with = "verbose")]
    pub name: bool,

    /// Fail unless exactly one port matches.
    #[arg(short = '1', long)]
    pub one: bool,

    /// Keep rescanning this many seconds for a match to appear.
    #[arg(short, long, default_value_t = 0.0, value_name = "SECONDS")]
    pub wait: f64,

    /// Log verbosity (overrides $OK_LOGGING_LEVEL).
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,
}
