use anyhow::Result;
use kci::utils::error::{format_error, KciError};
use kci::{cli, run_command};

#[tokio::main]
async fn main() {
    // Try to determine verbose mode early for better error formatting
    // Default to false for early errors (before config is parsed)
    let verbose = std::env::args().any(|arg| arg == "-v" || arg == "--verbose");

    let args = cli::args::parse();
    kci::init_logging(args.verbose);

    let code = tokio::select! {
        result = run_main(args) => match result {
            Ok(code) => {
                if code != 0 { 1 } else { 0 }
            }
            Err(e) => {
                display_error(&e, verbose);
                1
            }
        },
        _ = tokio::signal::ctrl_c() => {
            // In-flight subprocesses die with their kill-on-drop handles.
            eprintln!("\nExited at user request.");
            1
        }
    };
    std::process::exit(code);
}

async fn run_main(args: cli::args::Args) -> Result<i32> {
    run_command(args).await
}

/// Display an error with contextual formatting.
///
/// Tries to downcast to `KciError` for rich formatting, falls back to
/// anyhow's error chain display for other errors.
fn display_error(error: &anyhow::Error, verbose: bool) {
    if let Some(kci_error) = error.downcast_ref::<KciError>() {
        eprintln!("{}", format_error(kci_error, verbose));
    } else {
        // Fall back to formatted anyhow display
        eprintln!("\n\u{26a0} Error: {}", error);

        let causes: Vec<_> = error.chain().skip(1).collect();
        if !causes.is_empty() {
            eprintln!("\nCaused by:");
            for (i, cause) in causes.iter().enumerate() {
                let prefix = if i == causes.len() - 1 {
                    "\u{2514}\u{2500}"
                } else {
                    "\u{251c}\u{2500}"
                };
                eprintln!("{} {}", prefix, cause);
            }
        }
    }
}
