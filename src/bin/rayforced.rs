//! Rayforce server daemon: one reactor thread, optional listening port.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use rayforce::ipc::reactor::Reactor;
use rayforce::{pool, verbs};

#[derive(Parser)]
#[command(name = "rayforced", about = "Rayforce analytic engine")]
struct Args {
    /// Port for the IPC listener; without it the instance is in-process
    /// only.
    #[arg(short, long)]
    port: Option<u16>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    // Warm the worker pool before the first query lands.
    let _ = pool::global();
    verbs::install();

    let mut reactor = match Reactor::new(args.port) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("rayforced: {}", e);
            std::process::exit(1);
        }
    };
    std::process::exit(reactor.run() as i32);
}
