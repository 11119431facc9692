use clap::Parser;
use std::path::PathBuf;

use crate::config::AppConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Address to listen on (overrides server.listen_addr)
    #[arg(long)]
    pub listen: Option<String>,

    /// Directory holding the model artifacts (overrides models.dir)
    #[arg(long)]
    pub models_dir: Option<PathBuf>,

    /// Write the effective configuration back to --config and continue
    #[arg(long, default_value_t = false)]
    pub write_config: bool,
}

impl Args {
    /// Command-line flags win over the config file.
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(listen) = &self.listen {
            config.server.listen_addr = listen.clone();
        }
        if let Some(dir) = &self.models_dir {
            config.models.dir = dir.clone();
        }
    }
}
