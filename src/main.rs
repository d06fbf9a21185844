//! plugchain - Host audio plugins in a chain and stream the result

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use plugchain::audio::{
    list_input_devices, list_output_devices, ClapLoader, CpalOutput, DeviceId, OutputTransport,
    PluginInstance, SourceSpec, StreamEngine, StreamState, TransportFactory,
};
use plugchain::config::AppConfig;

#[derive(Parser)]
#[command(name = "plugchain")]
#[command(about = "Chain audio plugins over a file or live input and play the result")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: platform config directory)
    #[arg(short, long, global = true, env = "PLUGCHAIN_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List available audio devices
    Devices {
        #[command(subcommand)]
        action: DevicesAction,
    },

    /// Load a plugin and print its parameters
    Inspect {
        /// Plugin module path
        plugin: PathBuf,
    },

    /// Play a file or live input through a plugin chain
    Play {
        /// Audio file (wav, mp3, flac, ogg)
        #[arg(required_unless_present = "live", conflicts_with = "live")]
        file: Option<PathBuf>,

        /// Process live input instead of a file
        #[arg(long)]
        live: bool,

        /// Plugin to append to the chain (repeatable, in order)
        #[arg(short, long = "plugin")]
        plugins: Vec<PathBuf>,

        /// Chain sample rate in Hz
        #[arg(long)]
        sample_rate: Option<u32>,

        /// Frames per plugin block
        #[arg(long)]
        block_size: Option<usize>,

        /// Input device name (use 'devices list' to see available devices)
        #[arg(long)]
        input_device: Option<String>,

        /// Output device name (use 'devices list' to see available devices)
        #[arg(long)]
        output_device: Option<String>,
    },
}

#[derive(Subcommand)]
enum DevicesAction {
    /// List all devices
    List,
}

/// Commands accepted on stdin while playing
#[derive(Debug, Clone, PartialEq)]
enum ControlCommand {
    Pause,
    Resume,
    Stop,
    List,
    Add(PathBuf),
    Remove(usize),
    Move(usize, usize),
    Params(usize),
    Set(usize, usize, f32),
    Bypass(usize),
    Enable(usize),
    Help,
}

const CONTROL_HELP: &str = "\
Commands:
  pause | resume | stop
  list                      show the chain
  add <path>                append a plugin
  remove <i>                remove plugin i
  move <from> <to>          reorder the chain
  params <i>                show parameters of plugin i
  set <i> <param> <value>   set a normalized parameter (0..1)
  bypass <i> | enable <i>   toggle a plugin
  help";

fn parse_command(line: &str) -> Result<ControlCommand, String> {
    let mut words = line.split_whitespace();
    let command = words.next().ok_or("empty command")?;
    let args: Vec<&str> = words.collect();

    let index = |i: usize| -> Result<usize, String> {
        args.get(i)
            .ok_or_else(|| format!("'{}' needs more arguments", command))?
            .parse::<usize>()
            .map_err(|e| format!("invalid index: {}", e))
    };

    match command {
        "pause" => Ok(ControlCommand::Pause),
        "resume" => Ok(ControlCommand::Resume),
        "stop" | "quit" | "exit" => Ok(ControlCommand::Stop),
        "list" => Ok(ControlCommand::List),
        "add" => {
            if args.is_empty() {
                return Err("'add' needs a plugin path".to_string());
            }
            Ok(ControlCommand::Add(PathBuf::from(args.join(" "))))
        }
        "remove" => Ok(ControlCommand::Remove(index(0)?)),
        "move" => Ok(ControlCommand::Move(index(0)?, index(1)?)),
        "params" => Ok(ControlCommand::Params(index(0)?)),
        "set" => {
            let value = args
                .get(2)
                .ok_or("'set' needs <i> <param> <value>")?
                .parse::<f32>()
                .map_err(|e| format!("invalid value: {}", e))?;
            Ok(ControlCommand::Set(index(0)?, index(1)?, value))
        }
        "bypass" => Ok(ControlCommand::Bypass(index(0)?)),
        "enable" => Ok(ControlCommand::Enable(index(0)?)),
        "help" | "?" => Ok(ControlCommand::Help),
        other => Err(format!("unknown command '{}', try 'help'", other)),
    }
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

fn list_devices() {
    println!("Input devices:");
    for device in list_input_devices() {
        let default_marker = if device.is_default { " (default)" } else { "" };
        println!("  - {}{}", device.name, default_marker);
    }

    println!("\nOutput devices:");
    for device in list_output_devices() {
        let default_marker = if device.is_default { " (default)" } else { "" };
        println!("  - {}{}", device.name, default_marker);
    }
}

fn print_parameters(plugin: &PluginInstance) -> Result<()> {
    let info = plugin.info();
    println!(
        "{} by {} ({}), inputs: {}, outputs: {}, editor: {}",
        info.name,
        info.vendor,
        info.version,
        info.num_inputs,
        info.num_outputs,
        if info.has_editor { "yes" } else { "no" }
    );
    for (index, param) in plugin.get_parameters()? {
        println!(
            "  [{:>3}] {:<24} {:>6.3}  {} {}",
            index, param.name, param.value, param.display, param.label
        );
    }
    Ok(())
}

fn print_chain(engine: &StreamEngine) {
    let plugins = engine.plugins();
    if plugins.is_empty() {
        println!("Chain is empty (passthrough)");
        return;
    }
    for (i, plugin) in plugins.iter().enumerate() {
        println!(
            "  {}: {} [{} -> {}]{}",
            i,
            plugin.name(),
            plugin.input_count(),
            plugin.output_count(),
            if plugin.is_enabled() { "" } else { " (bypassed)" }
        );
    }
}

fn run_inspect(config: &AppConfig, plugin: PathBuf) -> Result<()> {
    let instance = PluginInstance::load(
        Arc::new(ClapLoader::new()),
        &plugin,
        config.audio.block_size,
        config.audio.sample_rate as f32,
    )
    .with_context(|| format!("Failed to load {}", plugin.display()))?;
    print_parameters(&instance)?;
    instance.dispose();
    Ok(())
}

/// Apply one stdin command. Returns false when playback should end.
fn handle_command(engine: &StreamEngine, command: ControlCommand) -> Result<bool> {
    let plugin = |i: usize| {
        engine
            .plugins()
            .get(i)
            .cloned()
            .with_context(|| format!("No plugin at position {}", i))
    };

    match command {
        ControlCommand::Pause => engine.pause()?,
        ControlCommand::Resume => engine.resume()?,
        ControlCommand::Stop => return Ok(false),
        ControlCommand::List => print_chain(engine),
        ControlCommand::Add(path) => {
            let instance = engine.add_plugin(path)?;
            println!("Added {}", instance.name());
        }
        ControlCommand::Remove(i) => engine.remove_plugin(i)?,
        ControlCommand::Move(from, to) => {
            if !engine.move_plugin(from, to)? {
                println!("Nothing to move: index out of range");
            }
        }
        ControlCommand::Params(i) => print_parameters(plugin(i)?.as_ref())?,
        ControlCommand::Set(i, param, value) => {
            let instance = plugin(i)?;
            instance.set_parameter(param, value)?;
            if let Some(param) = instance.cached_parameter(param) {
                println!("{} = {} {}", param.name, param.display, param.label);
            }
        }
        ControlCommand::Bypass(i) => plugin(i)?.set_enabled(false),
        ControlCommand::Enable(i) => plugin(i)?.set_enabled(true),
        ControlCommand::Help => println!("{}", CONTROL_HELP),
    }
    Ok(true)
}

#[allow(clippy::too_many_arguments)]
async fn run_play(
    mut config: AppConfig,
    file: Option<PathBuf>,
    live: bool,
    plugins: Vec<PathBuf>,
    sample_rate: Option<u32>,
    block_size: Option<usize>,
    input_device: Option<String>,
    output_device: Option<String>,
) -> Result<()> {
    if let Some(rate) = sample_rate {
        config.audio.sample_rate = rate;
    }
    if let Some(size) = block_size {
        config.audio.block_size = size;
    }
    if input_device.is_some() {
        config.devices.input_device = input_device;
    }
    if output_device.is_some() {
        config.devices.output_device = output_device;
    }
    config.validate()?;

    let engine_config = config.engine_config();
    info!("Engine config: {:?}", engine_config);
    let mut engine = StreamEngine::new(Arc::new(ClapLoader::new()), engine_config.clone())?;

    for path in &plugins {
        engine
            .add_plugin(path)
            .with_context(|| format!("Failed to add {}", path.display()))?;
    }

    let source = match (file, live) {
        (Some(path), false) => SourceSpec::File(path),
        (None, true) => SourceSpec::Device(config.devices.input_device.clone().map(DeviceId)),
        _ => bail!("Specify either a file or --live"),
    };

    let output_id = config.devices.output_device.clone().map(DeviceId);
    let output_buffer = engine_config.output_buffer;
    let transport: TransportFactory = Box::new(move |channels, rate| {
        let output = CpalOutput::open(output_id.as_ref(), channels, rate, output_buffer)?;
        Ok(Box::new(output) as Box<dyn OutputTransport>)
    });

    engine.play(source, transport)?;
    print_chain(&engine);
    println!("{}", CONTROL_HELP);

    let stdin = tokio::io::stdin();
    let mut stdin_reader = BufReader::new(stdin).lines();
    let mut stdin_open = true;
    let mut ticker = tokio::time::interval(Duration::from_millis(200));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            _ = ticker.tick() => {
                if engine.is_finished() || engine.state() == StreamState::Stopped {
                    break;
                }
            }
            line_result = stdin_reader.next_line(), if stdin_open => {
                match line_result {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match parse_command(line) {
                            Ok(command) => match handle_command(&engine, command) {
                                Ok(true) => {}
                                Ok(false) => break,
                                Err(e) => println!("Error: {:#}", e),
                            },
                            Err(e) => println!("{}", e),
                        }
                    }
                    Ok(None) => {
                        // Keep playing until the source ends or Ctrl+C
                        info!("stdin closed");
                        stdin_open = false;
                    }
                    Err(e) => {
                        warn!("stdin error: {}", e);
                    }
                }
            }
        }
    }

    engine.shutdown()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose)?;

    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Devices { action } => match action {
            DevicesAction::List => list_devices(),
        },
        Commands::Inspect { plugin } => run_inspect(&config, plugin)?,
        Commands::Play {
            file,
            live,
            plugins,
            sample_rate,
            block_size,
            input_device,
            output_device,
        } => {
            run_play(
                config,
                file,
                live,
                plugins,
                sample_rate,
                block_size,
                input_device,
                output_device,
            )
            .await?;
        }
    }

    Ok(())
}
