use clap::Parser;

#[derive(Debug, Clone, Parser)]
pub struct AgentCmd {
    #[arg(short = 'f', long, help = "Config file path for Agent daemon")]
    pub file: Option<String>,

    #[arg(long = "http-port", help = "Port for the node-local HTTP API")]
    pub http_port: Option<u32>,

    #[arg(long = "state-file", help = "Path to the persisted IP state file")]
    pub state_file: Option<String>,

    #[arg(long = "lock-file", help = "Path to the state lock file")]
    pub lock_file: Option<String>,
}
