use anyhow::Context;
use clap::Parser;
use flowstate_autonomic::FlowSystem;
use flowstate_core::{nonzero_period, FlowstateConfig, LoggingConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML config (missing file means defaults)
    #[arg(short, long, default_value = "flowstate.toml", env = "FLOWSTATE_CONFIG")]
    config: PathBuf,

    /// Stop after this many seconds (0 = run until Ctrl-C)
    #[arg(short, long, default_value_t = 0)]
    duration_secs: u64,

    /// Print every aggregated snapshot as a JSON line on stdout
    #[arg(long)]
    json: bool,

    /// Initial context tag (repeatable)
    #[arg(long = "context")]
    context: Vec<String>,

    /// Enter flow at start with this trigger
    #[arg(long)]
    flow: Option<String>,
}

fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&logging.filter))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if logging.json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let config = FlowstateConfig::load_or_default(&args.config);
    init_logging(&config.logging)?;
    info!("Initializing Flowstate (config: {})...", args.config.display());

    let validate_every = nonzero_period(config.schedule.validate());
    let system = FlowSystem::new(config);

    if !args.context.is_empty() {
        system.set_context(args.context.iter().cloned());
    }
    if let Some(trigger) = &args.flow {
        system.enter_flow(trigger);
    }

    let _printer = args.json.then(|| {
        system.observe_state(|snapshot| match serde_json::to_string(snapshot) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("Failed to serialize snapshot: {}", e),
        })
    });

    system.start();
    info!("Flowstate online. Press Ctrl-C to stop.");

    let deadline = async {
        if args.duration_secs == 0 {
            std::future::pending::<()>().await
        } else {
            tokio::time::sleep(Duration::from_secs(args.duration_secs)).await
        }
    };
    tokio::pin!(deadline);

    let mut validate = tokio::time::interval(validate_every);
    validate.tick().await;

    loop {
        tokio::select! {
            _ = &mut deadline => {
                info!("Run time elapsed");
                break;
            }
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Interrupted");
                break;
            }
            _ = validate.tick() => {
                let report = system.validate_system_state();
                if report.is_valid {
                    tracing::debug!("System healthy: {}", report.insights.join("; "));
                } else {
                    warn!("System validation failed: {}", report.insights.join("; "));
                }
            }
        }
    }

    if let Some(energy) = system.energy() {
        info!(
            "Final energy {:.2}/{:.2}, mode {}, {} patterns",
            energy.current,
            energy.max,
            system.flow_record().kind,
            system.patterns().len()
        );
    }
    system.dispose();
    Ok(())
}
