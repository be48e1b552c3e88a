//! Standalone initializer: make sure the voting contract is deployed on the
//! configured ledger and print its address.
//!
//! Reads the same `Rocket.toml`/`ROCKET_*` configuration as the server, so a
//! contract deployed here is the one the server adopts.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Arg, ArgAction, ArgMatches, Command};
use rocket::figment::{providers::Serialized, Figment};

use chainvote_backend::config::{Config, DbConfig};
use chainvote_backend::error::Error;
use chainvote_backend::model::ContractDeployment;
use chainvote_backend::registry::{ContractDeploymentStore, FileDeploymentStore};
use chainvote_backend::store::mongodb::MongoDeploymentStore;

const PROGRAM_NAME: &str = "deploy-contract";

const ABOUT_TEXT: &str = "Deploy the election ledger contract, or confirm the recorded one is live.

EXIT CODES:
     0: The contract is live; its address is printed.
     1: Error, described on stderr.";

const RPC_URL: &str = "RPC_URL";
const ARTIFACT: &str = "ARTIFACT";
const RECORD: &str = "RECORD";

/// Construct the CLI configuration.
fn cli() -> Command {
    // Make the build dirty when the toml changes.
    include_str!("../Cargo.toml");

    clap::command!(PROGRAM_NAME)
        .about(ABOUT_TEXT)
        .arg(
            Arg::new(RPC_URL)
                .long("rpc-url")
                .help("JSON-RPC endpoint of the ledger node")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new(ARTIFACT)
                .long("artifact")
                .help("Compiled contract artifact; repeat to search several, in order")
                .value_parser(clap::value_parser!(PathBuf))
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new(RECORD)
                .long("record")
                .help("File holding the deployment record, instead of the database")
                .value_parser(clap::value_parser!(PathBuf))
                .action(ArgAction::Set),
        )
}

/// The server's configuration, with command line overrides applied.
fn figment(args: &ArgMatches) -> Figment {
    // The HMAC secret is irrelevant here but required by `Config`.
    let mut figment = Figment::from(Serialized::default("hmac_secret", ""))
        .merge(rocket::Config::figment());
    if let Some(url) = args.get_one::<String>(RPC_URL) {
        figment = figment.merge(("rpc_url", url));
    }
    if let Some(paths) = args.get_many::<PathBuf>(ARTIFACT) {
        figment = figment.merge(("artifact_paths", paths.collect::<Vec<_>>()));
    }
    if let Some(path) = args.get_one::<PathBuf>(RECORD) {
        figment = figment.merge(("deployment_path", path));
    }
    figment
}

async fn deploy(figment: Figment) -> Result<ContractDeployment, String> {
    let config: Config = figment.extract().map_err(|e| e.to_string())?;
    let store: Arc<dyn ContractDeploymentStore> = match config.deployment_path() {
        Some(path) => Arc::new(FileDeploymentStore::new(path)),
        None => {
            let db_config: DbConfig = figment.extract().map_err(|e| e.to_string())?;
            let (_client, db) = db_config.connect().await.map_err(|e| e.to_string())?;
            Arc::new(MongoDeploymentStore::new(&db))
        }
    };
    let ledger = config.ledger().map_err(|e| e.to_string())?;
    let registry = config.registry(Arc::new(ledger), store);
    registry
        .ensure_deployed()
        .await
        .map_err(|e: Error| e.to_string())
}

fn run(args: &ArgMatches) -> u8 {
    let runtime = match rocket::tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {e}");
            return 1;
        }
    };
    match runtime.block_on(deploy(figment(args))) {
        Ok(deployment) => {
            println!("{}", deployment.address);
            0
        }
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}

fn main() {
    let args = cli().get_matches();
    let exit_code = run(&args);
    std::process::exit(exit_code.into())
}
