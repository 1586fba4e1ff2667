use std::env;
use std::io;
use std::process::ExitCode;

use ledger_eng::csv::{read_accounts, read_transfers, write_accounts};
use ledger_eng::{Engine, EngineConfig};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let [accounts_path, transfers_path] = args.as_slice() else {
        eprintln!("usage: ledger-eng <accounts.csv> <transfers.csv>");
        return ExitCode::from(2);
    };

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let engine = Engine::with_config(config);

    let accounts = match read_accounts(accounts_path) {
        Ok(rows) => rows,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    for result in accounts {
        match result {
            Ok(row) => {
                if let Err(e) = engine.create_account(row.id, row.owner_name, row.balance) {
                    warn!("{e}");
                }
            }
            Err(e) => warn!("{e}"),
        }
    }

    let transfers = match read_transfers(transfers_path.clone()) {
        Ok(rows) => rows,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let (request_sender, request_receiver) = tokio::sync::mpsc::channel(16);

    tokio::spawn(async move {
        for result in transfers {
            match result {
                Ok(request) => {
                    // receiver gone means the engine stopped
                    if request_sender.send(request).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    let summary = engine.run(ReceiverStream::new(request_receiver)).await;
    info!(
        completed = summary.completed,
        rejected = summary.rejected,
        failed = summary.failed,
        "run finished"
    );

    let written = engine
        .accounts()
        .map_err(|e| e.to_string())
        .and_then(|accounts| write_accounts(&accounts, io::stdout().lock()).map_err(|e| e.to_string()));
    match written {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
