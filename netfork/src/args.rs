use clap::Parser;
use netfork_common::transport::SERVICE_PORT;

/// Example client: forks the calling process onto a netfork server.
#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// Host the netfork server runs on.
    #[arg(long, default_value = "localhost")]
    pub server: String,

    /// Port the netfork server listens on.
    #[arg(long, default_value_t = SERVICE_PORT)]
    pub port: u16,
}
