pub mod bootstrap;
pub mod capture;
pub mod config;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod resample;
pub mod session;
pub mod stream;
pub mod vad;

pub use error::{PipelineError, PipelineResult};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("voicewire=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
