use clap::Parser;
use netfork_common::transport::SERVICE_PORT;

/// Reconstruction server: accepts one forked process image and runs it.
#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// Port to listen on; 0 picks an ephemeral port.
    #[arg(long, default_value_t = SERVICE_PORT)]
    pub port: u16,
}
