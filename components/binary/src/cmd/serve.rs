// Copyright 2024 stitch
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;

use clap::{ArgAction, Args};
use snafu::{ResultExt, Whatever};
use stitch_common::STITCH;
use stitch_server::ServerConfig;
use stitch_utils::{
    env,
    logger::{LoggingOptions, DEFAULT_LOG_LEVEL},
    readable_size::ReadableSize,
};
use tracing::info;

use crate::build_info;

const SERVER_OPTIONS_HEADER: &str = "Server options";
const STORAGE_OPTIONS_HEADER: &str = "Storage options";
const LOGGING_OPTIONS_HEADER: &str = "Logging options";

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Run the upload service.
Settings are taken from the defaults, the config file, the STITCH_UPLOAD_DIR
and STITCH_LISTEN environment variables (a .env file works too) and finally
the flags below, later sources win.

Examples:

# Serve uploads below /data/uploads
stitch serve --upload-dir /data/uploads --listen 0.0.0.0:7400
")]
pub struct ServeArgs {
    #[arg(
    long,
    help = "Read settings from a TOML file",
    value_name = "FILE",
    )]
    pub config: Option<PathBuf>,

    #[arg(
    long,
    help = "Address to listen on",
    help_heading = SERVER_OPTIONS_HEADER,
    value_name = "ADDR",
    )]
    pub listen: Option<String>,

    #[arg(
    long,
    help = "Number of HTTP worker threads",
    help_heading = SERVER_OPTIONS_HEADER,
    )]
    pub workers: Option<usize>,

    #[arg(
    long,
    help = "Largest chunk a single upload may carry, e.g. 64MiB",
    help_heading = SERVER_OPTIONS_HEADER,
    value_name = "SIZE",
    )]
    pub max_chunk_size: Option<ReadableSize>,

    #[arg(
    long,
    help = "Directory holding staged chunks and merged files",
    help_heading = STORAGE_OPTIONS_HEADER,
    value_name = "DIRECTORY",
    )]
    pub upload_dir: Option<PathBuf>,

    #[arg(
    long,
    help = "How many chunks of one merge are copied at the same time",
    help_heading = STORAGE_OPTIONS_HEADER,
    )]
    pub max_concurrent_copies: Option<usize>,

    #[arg(
    long,
    help = "Seconds a single chunk copy may take, 0 disables the limit",
    help_heading = STORAGE_OPTIONS_HEADER,
    value_name = "SECONDS",
    )]
    pub copy_timeout: Option<u64>,

    #[clap(
    long,
    help = "Write log files to a directory [default: stdout only]",
    help_heading = LOGGING_OPTIONS_HEADER,
    value_name = "DIRECTORY",
    )]
    pub log_directory: Option<PathBuf>,

    #[clap(
    short,
    long,
    help = "Log level",
    help_heading = LOGGING_OPTIONS_HEADER,
    value_name = "LEVEL",
    default_value = DEFAULT_LOG_LEVEL,
    )]
    pub level: String,

    #[clap(
    long,
    help = "Append logs to stdout",
    help_heading = LOGGING_OPTIONS_HEADER,
    action = ArgAction::Set,
    default_value_t = true,
    )]
    pub append_stdout: bool,

    #[clap(
    long,
    help = "Disable all logging",
    help_heading = LOGGING_OPTIONS_HEADER,
    conflicts_with_all(["log_directory", "level"])
    )]
    pub no_log: bool,
}

impl ServeArgs {
    fn load_logging_opts(&self) -> Option<LoggingOptions> {
        if self.no_log {
            return None;
        }
        Some(LoggingOptions {
            dir:           self.log_directory.clone(),
            level:         self.level.clone(),
            append_stdout: self.append_stdout,
        })
    }

    fn server_config(&self) -> Result<ServerConfig, Whatever> {
        let mut config = match &self.config {
            Some(path) => {
                let content = std::fs::read_to_string(path).with_whatever_context(|e| {
                    format!("failed to read config file {}: {e}", path.display())
                })?;
                toml::from_str(&content).with_whatever_context(|e| {
                    format!("failed to parse config file {}: {e}", path.display())
                })?
            }
            None => ServerConfig::default(),
        };

        if let Some(dir) = env::var_parsed::<PathBuf>("UPLOAD_DIR")? {
            config.storage.with_upload_dir(dir);
        }
        if let Some(listen) = env::var("LISTEN")? {
            config.listen = listen;
        }

        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(size) = self.max_chunk_size {
            config.max_chunk_size = size;
        }
        if let Some(dir) = &self.upload_dir {
            config.storage.with_upload_dir(dir);
        }
        if let Some(copies) = self.max_concurrent_copies {
            config.storage.max_concurrent_copies = copies;
        }
        if let Some(secs) = self.copy_timeout {
            config.storage.copy_timeout_secs = secs;
        }
        Ok(config)
    }

    pub fn run(self) -> Result<(), Whatever> {
        let config = self.server_config()?;
        let _guards = match self.load_logging_opts() {
            Some(opts) => stitch_utils::logger::init_global_logging(STITCH, &opts)?,
            None => vec![],
        };
        log_versions();
        info!("starting with {:?}", config);

        actix_web::rt::System::new()
            .block_on(stitch_server::serve(config))
            .with_whatever_context(|e| format!("upload service failed: {e}"))
    }
}

fn log_versions() {
    info!(
        "PKG_VERSION: {}, FULL_VERSION: {}, TARGET: {}, PROFILE: {}, RUSTC: {}",
        build_info::PKG_VERSION,
        build_info::FULL_VERSION,
        build_info::TARGET,
        build_info::PROFILE,
        build_info::RUSTC_VERSION,
    );
    for argument in std::env::args() {
        info!("argument: {}", argument);
    }
}
