use std::{net::TcpListener, path::PathBuf, sync::Arc, thread};

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use tissdb_server::QueryService;
use tissdb_sinew::server::serve_connection;
use tissdb_storage::DatabaseManager;

/// TissDB server: accepts Sinew connections and executes TissQL.
#[derive(Parser, Debug)]
#[command(name = "tissdb-server", version)]
struct Args {
    /// Directory holding the databases.
    #[arg(long, default_value = "./tissdb-data")]
    data_dir: PathBuf,

    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:9876")]
    listen: String,

    /// Database served to incoming connections; created if missing.
    #[arg(long, default_value = "default")]
    database: String,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let manager = DatabaseManager::open(&args.data_dir)
        .with_context(|| format!("open data dir {}", args.data_dir.display()))?;
    if !manager.database_exists(&args.database) {
        manager.create_database(&args.database)?;
    }
    let db = manager.database(&args.database)?;

    let listener = TcpListener::bind(&args.listen)
        .with_context(|| format!("bind {}", args.listen))?;
    info!(
        "tissdb-server listening on {} (database `{}`, data in {})",
        args.listen,
        args.database,
        args.data_dir.display()
    );

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                error!("accept failed: {err}");
                continue;
            }
        };
        let db = Arc::clone(&db);
        thread::spawn(move || {
            let mut service = QueryService::new(db);
            if let Err(err) = serve_connection(stream, &mut service) {
                error!("connection error: {err}");
            }
        });
    }
    Ok(())
}
