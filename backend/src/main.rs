use std::sync::{Arc, Mutex};

use actix_web::web::Data;
use anyhow::{bail, Result};
use env_logger::Env;
use log::info;

mod api;
mod auth;
mod clock;
mod config;
mod db;
mod error;
mod ingest;
mod schema;
mod service;
mod session;
mod stats;
mod utils;

const USAGE: &str = "usage: turbidity-backend [serve | add-device <device_id> <api_token>]";

#[actix_web::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = config::Config::from_env()?;
    let db = db::Db::connect(&config.database_url, config.busy_timeout_ms)?;
    let db = Arc::new(Mutex::new(db));

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] | ["serve"] => {
            let state = Data::new(api::AppState {
                service: Arc::new(service::Service::new(
                    db.clone(),
                    Arc::new(clock::SystemClock),
                )),
                devices: Arc::new(auth::SqlDeviceDirectory::new(db)),
            });

            info!("listening on {}:{}", config.bind_addr, config.port);
            api::new_http_server(state, &config).await?;
        }
        ["add-device", device_id, api_token] => {
            let mut db = db
                .lock()
                .map_err(|_| anyhow::anyhow!("database lock poisoned"))?;
            auth::register_device(db.conn(), device_id, api_token)?;
        }
        _ => bail!(USAGE),
    }

    Ok(())
}
