pub mod config;
pub mod controllers;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod seed;

use tracing_subscriber::{
    EnvFilter, filter::Directive, layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub use registry::{ControllerRegistry, RegistryError};
pub use runtime::{ControllerRuntime, RuntimeSettings};

pub fn init_tracing(default_env: &str) {
    let default_directive = default_env
        .parse::<Directive>()
        .or_else(|_| "info".parse::<Directive>());
    let mut filter = EnvFilter::builder()
        .with_env_var("RUST_LOG")
        .from_env_lossy();
    if let Ok(directive) = default_directive {
        filter = filter.add_directive(directive);
    }

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .try_init();
}
