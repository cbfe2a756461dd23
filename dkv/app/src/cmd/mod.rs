// Copyright 2022-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! CLI command implementations.

use anyhow::Context;
use async_trait::async_trait;

use crate::options::{Commands, Options};
use crate::settings::Settings;

pub mod run;

#[async_trait]
pub trait Cmd {
    async fn exec(&self, settings: Settings) -> anyhow::Result<()>;
}

/// Execute the command specified in the options.
pub async fn exec(opts: &Options) -> anyhow::Result<()> {
    match &opts.command {
        Commands::Run(args) => {
            let settings = Settings::new().context("error loading settings")?;
            args.exec(settings).await
        }
    }
}
