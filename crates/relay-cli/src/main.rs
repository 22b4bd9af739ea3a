mod cli;

use relay_core::core::interrupt;
use relay_core::core::lifecycle::InitError;

/// Exit status when the agent server has no provider or model configured.
const EXIT_NO_PROVIDER: i32 = 2;

fn main() {
    if let Err(e) = cli::run() {
        if e.downcast_ref::<interrupt::InterruptedError>().is_some() {
            std::process::exit(interrupt::EXIT_INTERRUPTED);
        }
        if matches!(
            e.downcast_ref::<InitError>(),
            Some(InitError::NoProviderOrModel)
        ) {
            eprintln!("{e}");
            eprintln!(
                "Configure GOOSE_PROVIDER and GOOSE_MODEL on the agent server, then run `relay chat` again."
            );
            std::process::exit(EXIT_NO_PROVIDER);
        }
        eprintln!("{e:#}"); // pretty anyhow chain
        std::process::exit(1);
    }
}
