use std::{
    error::Error,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::Receiver,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use scriptvisor::{
    Supervisor, SupervisorEvent,
    cli::{Cli, Commands, parse_args},
    config::{load_config, resolve_config_path},
    output::matches_filter,
};

/// Upper bound on how long shutdown waits for stopped scripts to exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    match args.command {
        Commands::List { config, json } => list_scripts(config.as_deref(), json)?,
        Commands::Run {
            config,
            start_all,
            no_autostart,
            scripts,
            exit_when_idle,
            filter,
            json,
        } => {
            let options = RunOptions {
                start_all,
                no_autostart,
                scripts,
                exit_when_idle,
                filter,
                json,
            };
            run_foreground(config.as_deref(), options)?;
        }
    }

    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}

fn list_scripts(config_path: Option<&str>, json: bool) -> Result<(), Box<dyn Error>> {
    let config = load_config(config_path)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&config.scripts)?);
        return Ok(());
    }

    if config.scripts.is_empty() {
        println!(
            "No scripts configured in {}",
            resolve_config_path(config_path).display()
        );
        return Ok(());
    }

    println!("{:<24} {:<9} {:<6} PATH", "NAME", "AUTOSTART", "PORT");
    for script in &config.scripts {
        let port = script
            .port
            .map(|port| port.to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<24} {:<9} {:<6} {}",
            script.name,
            if script.autostart { "yes" } else { "no" },
            port,
            script.path
        );
    }
    Ok(())
}

struct RunOptions {
    start_all: bool,
    no_autostart: bool,
    scripts: Vec<String>,
    exit_when_idle: bool,
    filter: Option<String>,
    json: bool,
}

fn run_foreground(config_path: Option<&str>, options: RunOptions) -> Result<(), Box<dyn Error>> {
    let config = load_config(config_path)?;
    let (mut supervisor, events) = Supervisor::new(config)?;
    let printer = spawn_printer(events, options.filter.clone(), options.json);

    let shutdown = Arc::new(AtomicBool::new(false));
    register_signal_handler(Arc::clone(&shutdown))?;

    for name in &options.scripts {
        if let Err(err) = supervisor.start(name) {
            error!("Failed to start '{name}': {err}");
        }
    }

    if options.start_all {
        supervisor.start_all()?;
    } else if !options.no_autostart {
        supervisor.autostart()?;
    }

    supervisor.run(&shutdown, options.exit_when_idle);

    if shutdown.load(Ordering::SeqCst) {
        info!("Shutting down; stopping all scripts");
        supervisor.cancel_pending();
        supervisor.stop_all();
        if !supervisor.wait_until_stopped(SHUTDOWN_GRACE) {
            warn!("Some scripts were still running after {SHUTDOWN_GRACE:?}");
        }
    }

    drop(supervisor);
    if printer.join().is_err() {
        error!("Event printer panicked");
    }
    Ok(())
}

fn spawn_printer(
    events: Receiver<SupervisorEvent>,
    filter: Option<String>,
    json: bool,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for event in events {
            if json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(err) => warn!("Failed to encode event: {err}"),
                }
                continue;
            }

            match event {
                SupervisorEvent::OutputLine { name, text } => {
                    if let Some(term) = filter.as_deref()
                        && !matches_filter(&text, term)
                    {
                        continue;
                    }
                    println!("[{name}] {}", text.trim_end_matches(['\r', '\n']));
                }
                SupervisorEvent::StatusChanged { name, status, pid } => match pid {
                    Some(pid) => println!("* {name}: {status} (PID {pid})"),
                    None => println!("* {name}: {status}"),
                },
                SupervisorEvent::CpuSample { .. }
                | SupervisorEvent::TotalCpu { .. }
                | SupervisorEvent::Notice { .. } => {}
            }
        }
    })
}

fn register_signal_handler(shutdown: Arc<AtomicBool>) -> Result<(), Box<dyn Error>> {
    ctrlc::set_handler(move || {
        if shutdown.swap(true, Ordering::SeqCst) {
            // Second interrupt: give up on a graceful stop.
            std::process::exit(130);
        }
    })?;

    Ok(())
}
