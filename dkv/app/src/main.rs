// Copyright 2022-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use tracing_subscriber::EnvFilter;

pub use dkv_app_options as options;
pub use dkv_app_settings as settings;

mod cmd;

#[tokio::main]
async fn main() {
    let opts = options::parse();

    // Log events to stdout.
    if let Some(level) = opts.tracing_level() {
        init_tracing(level);
    }

    if let Err(e) = cmd::exec(&opts).await {
        tracing::error!("failed to execute {:?}: {e:?}", opts);
        std::process::exit(1);
    }
}

fn init_tracing(level: tracing::Level) {
    // RUST_LOG takes precedence over --log-level when set.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
