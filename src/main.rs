use env_logger::{Builder, Env};
use log::{debug, error};

use zrotate::cli::EXIT_LOCKED;
use zrotate::lock::LockError;
use zrotate::metrics::metrics_snapshot;

fn init_logger() {
    // RUST_LOG overrides the level, default is info.
    // Example: RUST_LOG=debug zrotate -b -s
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();

    let code = match zrotate::cli::run() {
        Ok(code) => code,
        Err(e) => match e.downcast_ref::<LockError>() {
            Some(LockError::Contended(path)) => {
                error!("another instance is running (lock {})", path.display());
                EXIT_LOCKED
            }
            _ => {
                error!("{:?}", e);
                1
            }
        },
    };
    debug!("{}", metrics_snapshot());
    std::process::exit(code);
}
