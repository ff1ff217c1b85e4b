use std::{mem, process};

use clap::Parser;
use netfork::{fork, Args, ForkReturn};
use netfork_common::{
    tracing::{error, info},
    transport::Connection,
};

fn main() {
    netfork_common::tracing::init();
    let args = Args::parse();

    let mut server = match Connection::connect((args.server.as_str(), args.port)) {
        Ok(con) => con,
        Err(e) => {
            error!(
                "unable to connect to server at {}:{}: {e:#}",
                args.server, args.port
            );
            process::exit(1);
        }
    };

    match fork(&mut server, None) {
        ForkReturn::Parent => {
            info!("netfork succeeded");
            if let Err(e) = server.finish() {
                error!("failed to flush stream to server: {e:#}");
                process::exit(1);
            }
            println!("parent");
        }
        ForkReturn::Child => {
            // The socket only ever existed in the parent process; closing the
            // copied descriptor here would poke a handle this process does
            // not own.
            mem::forget(server);
            println!("child");
        }
        ForkReturn::Error => {
            error!("netfork failed");
            process::exit(1);
        }
    }
}
