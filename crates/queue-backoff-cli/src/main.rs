use queue_backoff_cli::run_cli;
use tracing::error;

#[tokio::main]
async fn main() {
    // Run CLI and exit with a code matching the error type
    if let Err(e) = run_cli().await {
        error!("CLI error: {}", e);
        eprintln!("queue-backoff: {}", e);
        std::process::exit(e.exit_code());
    }
}
