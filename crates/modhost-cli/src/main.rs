//! The modhost plugin host.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use modhost_core::config::env_vars;
use modhost_core::{
    HostAbi, HostBootstrap, HostConfig, PluginLoader, PluginManager, PluginRuntime,
};
use tracing::info;

/// modhost - Load and run native plugins.
#[derive(Parser, Debug)]
#[command(name = "modhost")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform (default: run).
    #[command(subcommand)]
    command: Option<Command>,

    /// Additional plugin search path. Repeatable.
    #[arg(long = "pluginpath", value_name = "PATH", global = true)]
    plugin_paths: Vec<PathBuf>,

    /// Settings database holding the plugin cache.
    #[arg(long = "settingspath", value_name = "FILE", global = true)]
    settings_path: Option<PathBuf>,

    /// Do not load the named plugin. Repeatable.
    #[arg(long = "noload", value_name = "PLUGIN", global = true)]
    no_load: Vec<String>,

    /// Configuration file (TOML).
    #[arg(long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Argument passed to every plugin's initialize. Repeatable.
    #[arg(long = "plugin-arg", value_name = "ARG", global = true, allow_hyphen_values = true)]
    plugin_arguments: Vec<String>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Start the host and run until interrupted.
    Run,
    /// Plugin diagnostics.
    Plugin {
        #[command(subcommand)]
        plugin_cmd: PluginCommand,
    },
}

/// Plugin subcommands.
#[derive(Subcommand, Debug)]
enum PluginCommand {
    /// Check a plugin file against this host.
    Validate {
        /// Path to the plugin file.
        #[arg(required = true)]
        path: PathBuf,
        /// Also map the library and create the plugin instance.
        #[arg(long)]
        load: bool,
    },
    /// List plugins found in the search paths.
    List {
        /// Plugin directory to scan instead of the search paths.
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
}

/// Options that keep their historical single-dash spelling.
const SINGLE_DASH_OPTIONS: &[&str] = &[
    "pluginpath",
    "settingspath",
    "noload",
    "config",
    "help",
    "version",
];

/// Options whose value is passed on verbatim.
const VERBATIM_VALUE_OPTIONS: &[&str] = &["--plugin-arg"];

/// Rewrite `-pluginpath` and friends to the double-dash form clap expects.
///
/// Values of `--plugin-arg` and everything after `--` are left alone.
fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    let mut out = Vec::new();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let Some(text) = arg.to_str() else {
            out.push(arg);
            continue;
        };
        if text == "--" {
            out.push(arg);
            out.extend(args.by_ref());
            break;
        }
        if VERBATIM_VALUE_OPTIONS.contains(&text) {
            out.push(arg);
            out.extend(args.next());
            continue;
        }
        let normalized = match text.strip_prefix('-') {
            Some(name) if !name.starts_with('-') => {
                let option = name.split('=').next().unwrap_or(name);
                SINGLE_DASH_OPTIONS
                    .contains(&option)
                    .then(|| OsString::from(format!("-{text}")))
            }
            _ => None,
        };
        out.push(normalized.unwrap_or(arg));
    }
    out
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse_from(normalize_args(std::env::args_os()));

    init_logging(args.verbose);

    let config = build_config(&args)?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run_host(config).await,
        Command::Plugin { plugin_cmd } => run_plugin_cmd(&config, plugin_cmd, args.verbose),
    }
}

fn init_logging(verbose: bool) {
    // Check if JSON logging is requested (for production/container environments)
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "modhost=debug" } else { "modhost=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Configuration file, then environment, then command line.
fn build_config(args: &Args) -> Result<HostConfig> {
    let mut config =
        HostConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    for path in &args.plugin_paths {
        if !config.plugin_paths.contains(path) {
            config.plugin_paths.push(path.clone());
        }
    }
    if let Some(path) = &args.settings_path {
        config.settings_path = Some(path.clone());
    }
    config.disabled_plugins.extend(args.no_load.iter().cloned());
    config
        .plugin_arguments
        .extend(args.plugin_arguments.iter().cloned());
    Ok(config)
}

async fn run_host(config: HostConfig) -> Result<()> {
    let mut host = match HostBootstrap::new(config).start() {
        Ok(host) => host,
        Err(e) => {
            eprint!("{}", e.diagnostic());
            std::process::exit(e.exit_code());
        }
    };

    for spec in host.manager().plugins() {
        match spec.error_string() {
            Some(error) => info!(plugin = %spec.name(), error, "Plugin not running"),
            None => info!(plugin = %spec.name(), version = %spec.version(), state = ?spec.state(), "Plugin"),
        }
    }
    info!("Host running, press Ctrl+C to quit");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("Shutting down");
    host.shutdown();
    Ok(())
}

fn run_plugin_cmd(config: &HostConfig, cmd: PluginCommand, verbose: bool) -> Result<()> {
    match cmd {
        PluginCommand::Validate { path, load } => validate_plugin(config, &path, load, verbose),
        PluginCommand::List { dir } => list_plugins(config, dir),
    }
}

/// A runtime for diagnostics: no persistent cache, so every file is rescanned.
fn diagnostic_runtime(config: &HostConfig) -> Arc<PluginRuntime> {
    PluginRuntime::builder()
        .policy(config.compatibility_policy())
        .build()
}

struct PluginDetails {
    name: String,
    version: String,
    dependencies: Vec<String>,
}

fn validate_plugin(config: &HostConfig, path: &Path, load: bool, verbose: bool) -> Result<()> {
    let runtime = diagnostic_runtime(config);
    let host = runtime.verifier().checker().host().clone();
    let mut loader = PluginLoader::new(runtime.clone());

    let result = loader
        .set_file_name(path)
        .and_then(|()| loader.query_descriptor())
        .and_then(|descriptor| {
            if !load {
                return Ok((descriptor, None));
            }
            let instance = loader.instance()?;
            let details = instance.with(|plugin| PluginDetails {
                name: plugin.name().to_string(),
                version: plugin.version().to_string(),
                dependencies: plugin
                    .dependencies()
                    .iter()
                    .map(|d| format!("{} {} ({:?})", d.name, d.version, d.kind))
                    .collect(),
            });
            Ok((descriptor, details))
        });

    match result {
        Ok((descriptor, details)) => {
            println!("Plugin Validation: PASSED");
            println!();
            println!("File:            {}", loader.file_name().unwrap_or(path).display());
            if let Some(record) = &descriptor.record {
                println!("Runtime version: {}", record.version);
                println!("Debug build:     {}", record.debug);
                println!("Build key:       {}", record.build_key);
            }
            if let Some(details) = details {
                println!("Name:            {}", details.name);
                println!("Version:         {}", details.version);
                if details.dependencies.is_empty() {
                    println!("Dependencies:    none");
                } else {
                    println!("Dependencies:");
                    for dependency in &details.dependencies {
                        println!("  {dependency}");
                    }
                }
            }
            if verbose {
                print_host(&host);
                if let Some(stamp) = &descriptor.last_modified {
                    println!("Last modified:   {stamp}");
                }
            }

            if load {
                loader.unload()?;
            }
            runtime.shutdown();
            Ok(())
        }
        Err(e) => {
            println!("Plugin Validation: FAILED");
            println!();
            println!("Error: {e}");
            println!();
            println!("Make sure:");
            println!("  1. The file exists and is a native shared library");
            println!("  2. It was built against modhost-sdk {}", host.version);
            println!("  3. Its build key is \"{}\"", host.build_key);
            if verbose {
                print_host(&host);
            }

            runtime.shutdown();
            std::process::exit(1);
        }
    }
}

fn print_host(host: &HostAbi) {
    println!("\n--- Host ---\n");
    println!("Runtime version: {}", host.version);
    println!("Debug build:     {}", host.debug);
    println!("Build key:       {}", host.build_key);
}

fn list_plugins(config: &HostConfig, dir: Option<PathBuf>) -> Result<()> {
    let paths = match dir {
        Some(dir) => vec![dir],
        None => config.search_paths(),
    };

    let mut manager = PluginManager::new(diagnostic_runtime(config));
    manager.set_plugin_paths(paths.clone());
    manager.discover();

    println!("Discovered Plugins");
    println!("==================");
    for path in &paths {
        println!("Searched: {}", path.display());
    }
    println!();

    if manager.plugins().is_empty() {
        println!("No plugins found.");
        return Ok(());
    }
    for spec in manager.plugins() {
        let status = match spec.error_string() {
            Some(error) => format!("rejected: {error}"),
            None => "ok".to_string(),
        };
        println!("{:<20} {}", spec.name(), spec.location().display());
        println!("{:<20} {status}", "");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalized(args: &[&str]) -> Vec<String> {
        normalize_args(args.iter().map(OsString::from))
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect()
    }

    #[test]
    fn test_single_dash_options_are_normalized() {
        assert_eq!(
            normalized(&["modhost", "-pluginpath", "/p", "-noload", "Welcome", "-help"]),
            vec!["modhost", "--pluginpath", "/p", "--noload", "Welcome", "--help"]
        );
        assert_eq!(normalized(&["-settingspath=/s.redb"]), vec!["--settingspath=/s.redb"]);
    }

    #[test]
    fn test_other_arguments_are_untouched() {
        assert_eq!(
            normalized(&["-v", "--config", "c.toml", "-x", "plugin", "--plugin-arg", "-safe"]),
            vec!["-v", "--config", "c.toml", "-x", "plugin", "--plugin-arg", "-safe"]
        );
    }

    #[test]
    fn test_plugin_argument_values_are_verbatim() {
        assert_eq!(
            normalized(&["modhost", "--plugin-arg", "-config", "-noload", "Welcome"]),
            vec!["modhost", "--plugin-arg", "-config", "--noload", "Welcome"]
        );
        assert_eq!(
            normalized(&["modhost", "--plugin-arg=-help", "--", "-config"]),
            vec!["modhost", "--plugin-arg=-help", "--", "-config"]
        );

        let args = Args::parse_from(normalize_args(
            ["modhost", "--plugin-arg", "-config", "--plugin-arg", "-settings-scope"].map(OsString::from),
        ));
        assert_eq!(args.plugin_arguments, vec!["-config", "-settings-scope"]);
        assert!(args.config.is_none());
    }

    #[test]
    fn test_command_line_overrides_configuration() {
        let args = Args::parse_from(normalize_args(
            [
                "modhost",
                "-pluginpath",
                "/opt/plugins",
                "-pluginpath",
                "/opt/plugins",
                "-settingspath",
                "/tmp/settings.redb",
                "-noload",
                "Welcome",
                "--plugin-arg",
                "-safe-mode",
            ]
            .map(OsString::from),
        ));
        assert!(args.command.is_none());

        let config = build_config(&args).unwrap();
        assert!(config.plugin_paths.ends_with(&[PathBuf::from("/opt/plugins")]));
        assert_eq!(
            config
                .plugin_paths
                .iter()
                .filter(|p| p.as_path() == Path::new("/opt/plugins"))
                .count(),
            1
        );
        assert_eq!(config.settings_path, Some(PathBuf::from("/tmp/settings.redb")));
        assert!(config.disabled_plugins.contains(&"Welcome".to_string()));
        assert!(config.plugin_arguments.contains(&"-safe-mode".to_string()));
    }

    #[test]
    fn test_plugin_subcommands_parse() {
        let args = Args::parse_from(["modhost", "plugin", "validate", "libcore.so", "--load"]);
        match args.command {
            Some(Command::Plugin {
                plugin_cmd: PluginCommand::Validate { path, load },
            }) => {
                assert_eq!(path, PathBuf::from("libcore.so"));
                assert!(load);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
