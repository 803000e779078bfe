use clap::{Parser, Subcommand, ValueEnum};

use ternd_trace::init::TraceConfig;

use crate::agent::AgentCmd;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cmd {
    #[arg(
        short,
        long,
        global = true,
        required = false,
        default_value = "info",
        help = "Log level(trace, debug, info, warn, error)"
    )]
    pub level: String,

    #[arg(
        value_enum,
        short = 'd',
        long,
        global = true,
        required = false,
        default_value = "plain",
        help = "Log display format"
    )]
    pub format: Format,

    #[arg(short = 'o', long = "log-file", help = "Log output file path")]
    pub log_file: Option<String>,

    #[clap(subcommand)]
    pub sub: SubCmd,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum Format {
    Plain,
    Json,
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Format::Plain => write!(f, "plain"),
            Format::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum SubCmd {
    Agent(AgentCmd),
    Version,
}

pub fn run() {
    let command = Cmd::parse();

    let format = command.format;
    let level = command.level;
    let log_file = command.log_file;

    match command.sub {
        SubCmd::Version => println!("dev"),
        SubCmd::Agent(a) => {
            let trace_conf = TraceConfig {
                level,
                format: format.to_string(),
                file: log_file,
            };
            let mut config = match a.file {
                None => ternd_kubernetes::agent::config::Config::default(),
                Some(file) => ternd_kubernetes::agent::config::Config::load(&file).unwrap(),
            };

            if let Some(http_port) = a.http_port {
                config.http_port = http_port;
            }
            if let Some(state_file) = a.state_file {
                config.state_file = state_file;
            }
            if let Some(lock_file) = a.lock_file {
                config.lock_file = lock_file;
            }

            ternd_kubernetes::agent::server::start(config, trace_conf);
        }
    }
}
