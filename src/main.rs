use dep2vec_trainer::Pipeline;

use log::{error, info};
use std::env;
use std::process;
use std::time::Instant;

// usage: dep2vec_trainer <params.json>
// verbosity follows RUST_LOG, `info` when unset

fn main() {

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("entering program...");
    let timer = Instant::now();
    let args: Vec<String> = env::args().collect();

    if let Err(e) = Pipeline::run(&args) {
        error!("{}", e);
        process::exit(1);
    }

    info!("done, took {} seconds ...", timer.elapsed().as_secs());
}
