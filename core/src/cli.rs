//! # Command Line Interface
//!
//! Arguments of the `batcher` binary. `Clap` is used for easy generation of
//! help messages and handling arguments.

use crate::utils;
use batcher_config::BatcherConfig;
use batcher_errors::BatcherError;
use clap::Parser;
use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::exit;

/// Bitcoin payment batcher with RBF and CPFP fee management.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// TOML formatted configuration file.
    pub config_file: Option<PathBuf>,
    /// Verbosity level, ranging from 0 (none) to 5 (highest)
    #[arg(short, long, default_value_t = 3)]
    pub verbose: u8,
}

/// Parse all the command line arguments.
fn parse() -> Result<Args, BatcherError> {
    parse_from(env::args())
}

/// Parse given iterator. This is good for isolated environments, like tests.
fn parse_from<I, T>(itr: I) -> Result<Args, BatcherError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Args::try_parse_from(itr).map_err(|e| BatcherError::ConfigError(e.to_string()))
}

/// True if `READ_CONFIG_FROM_ENV` asks for environment only configuration.
fn config_from_env_requested() -> bool {
    env::var("READ_CONFIG_FROM_ENV")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Picks the configuration source for `args`.
///
/// With `READ_CONFIG_FROM_ENV` set, only the environment is read. Otherwise
/// the configuration file wins and a complete environment is the fallback.
fn get_configuration(args: &Args) -> Result<BatcherConfig, BatcherError> {
    if config_from_env_requested() {
        tracing::info!("READ_CONFIG_FROM_ENV is set, reading configuration from environment...");
        return BatcherConfig::from_env();
    }

    if let Some(config_file) = &args.config_file {
        return BatcherConfig::try_parse_file(config_file.clone());
    }

    match BatcherConfig::from_env() {
        Ok(config) => {
            tracing::info!("No configuration file given, all the environment variables are set.");
            Ok(config)
        }
        Err(BatcherError::EnvVarNotSet(_, name)) => Err(BatcherError::ConfigError(format!(
            "Neither a configuration file is provided nor {name} is set"
        ))),
        Err(e) => Err(e),
    }
}

/// Gets configuration from CLI, for binaries. If there are any errors, prints
/// error and exits the program.
///
/// Steps:
///
/// 1. Get CLI arguments
/// 2. Initialize logger
/// 3. Get configuration, either from environment variables or configuration
///    file
pub fn get_configuration_from_cli() -> (BatcherConfig, Args) {
    let args = match parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            exit(1);
        }
    };

    if let Err(e) = utils::initialize_logger(utils::level_from_verbosity(args.verbose)) {
        eprintln!("{e}");
        exit(1);
    }

    match get_configuration(&args) {
        Ok(config) => (config, args),
        Err(e) => {
            tracing::error!("Can't read configuration: {e}");
            exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{get_configuration, parse_from};
    use batcher_errors::BatcherError;
    use std::io::Write;

    /// With help message flag, we should see the help message.
    #[test]
    fn help_message() {
        match parse_from(vec!["batcher", "--help"]) {
            Ok(_) => panic!("expected configuration error"),
            Err(BatcherError::ConfigError(e)) => println!("{e}"),
            e => panic!("unexpected error {e:#?}"),
        }
    }

    #[test]
    fn arguments() {
        let args = parse_from(vec!["batcher", "batcher.toml", "-v", "5"]).unwrap();
        assert_eq!(args.config_file.unwrap().to_str(), Some("batcher.toml"));
        assert_eq!(args.verbose, 5);

        let args = parse_from(vec!["batcher"]).unwrap();
        assert!(args.config_file.is_none());
        assert_eq!(args.verbose, 3);
    }

    #[test]
    fn configuration_file_is_read() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
network = "regtest"
indexer_url = "http://127.0.0.1:3002"
secret_key = "0101010101010101010101010101010101010101010101010101010101010101"

[batcher]
strategy = "cpfp"
"#
        )
        .unwrap();

        let args = parse_from(vec![
            "batcher".to_string(),
            file.path().display().to_string(),
        ])
        .unwrap();
        let config = get_configuration(&args).unwrap();
        assert_eq!(config.batcher.strategy, batcher_config::Strategy::Cpfp);
    }
}
