use std::fmt::Debug;
use std::fmt::Display;

use optin::configuration::get_configuration;
use optin::expiry::init_expiry_worker;
use optin::startup::Application;
use optin::telemetry::get_subscriber;
use optin::telemetry::init_subscriber;
use tokio::task::JoinError;

fn report_exit(
    name: &str,
    outcome: Result<Result<(), impl Debug + Display>, JoinError>,
) {
    match outcome {
        Ok(Ok(())) => {
            tracing::info!("{name} exited gracefully")
        }

        Ok(Err(e)) => {
            tracing::error!(
                error.cause_chain=?e,
                error.message=%e,
                "{name} failed (inner)"
            )
        }

        Err(e) => {
            tracing::error!(
                error.cause_chain=?e,
                error.message=%e,
                "{name} failed (outer)"
            )
        }
    }
}

/// Initialise telemetry, load config, and start the server alongside the
/// pending-expiry worker.
#[tokio::main] // requires tokio features: macros, rt-multi-thread
async fn main() -> Result<(), anyhow::Error> {
    let subscriber = get_subscriber("optin", "info", std::io::stdout);
    init_subscriber(subscriber);

    let cfg = get_configuration().expect("could not read configuration");

    let server = Application::build(cfg.clone()).await?.run_until_stopped();
    let expiry_worker = init_expiry_worker(cfg);

    // if `spawn` is not called, both branches run on the same thread; a
    // blocked branch would stall the other
    let server_thread = tokio::spawn(server);
    let expiry_worker_thread = tokio::spawn(expiry_worker);

    // returns when the **first** branch completes, cancelling the rest
    tokio::select! {
        o = server_thread => { report_exit("API", o) },
        o = expiry_worker_thread => { report_exit("Background expiry worker", o) },
    }

    Ok(())
}
