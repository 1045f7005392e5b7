use std::time::Duration;
use taskgroup::cli::{Args, ExecutionMode, RunConfig, run_simulation};
use taskgroup::config::{AppConfig, ConfigDiscovery};
use taskgroup::logging::init_tracing;
use tokio::runtime::Handle;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    match mode {
        ExecutionMode::Run(run) => run_mode(run).await,
        ExecutionMode::ShowConfig {
            config_override,
            init,
        } => {
            if init {
                let path = ConfigDiscovery::create_default_user_config()?;
                println!("User configuration: {:?}", path);
                println!();
            }
            let config = load_config(config_override.as_deref())?;
            ConfigDiscovery::show_discovery_info();
            println!();
            println!("Effective configuration:");
            println!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(config_override: Option<&std::path::Path>) -> anyhow::Result<AppConfig> {
    Ok(match config_override {
        Some(path) => AppConfig::from_toml_file(path)?,
        None => ConfigDiscovery::discover_config()?,
    })
}

async fn run_mode(run: RunConfig) -> anyhow::Result<()> {
    let mut config = load_config(run.config_override.as_deref())?;
    run.apply(&mut config);
    config.validate()?;

    init_tracing(&config.logging.filter);
    info!("Starting taskgroup {}", env!("CARGO_PKG_VERSION"));

    let runtime = Handle::current();
    let cancel_after = run.cancel_after_ms.map(Duration::from_millis);
    let summary =
        tokio::task::spawn_blocking(move || run_simulation(&config, runtime, cancel_after))
            .await??;

    if run.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", summary.render_text());
    }
    Ok(())
}
