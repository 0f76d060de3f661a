use energy_bridge::prelude::*;

use std::sync::Arc;
use std::time::Duration;

// The filter lets everything through; the level comes from log::set_max_level
// so the config file can change it once loaded.
fn init_logging() {
    let result = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace"))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();

    if let Err(e) = result {
        eprintln!("logger already initialised: {}", e);
    }
    if std::env::var_os("RUST_LOG").is_none() {
        log::set_max_level(log::LevelFilter::Info);
    }
}

fn apply_loglevel(level: &str) {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    match level.parse::<log::LevelFilter>() {
        Ok(filter) => log::set_max_level(filter),
        Err(_) => warn!("unknown loglevel {}, keeping info", level),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::new();
    init_logging();

    let config = match Config::new(options.config_file.clone()) {
        Ok(config) => config,
        Err(err) => {
            error!("Failed to load {}: {:?}", options.config_file, err);
            std::process::exit(255);
        }
    };
    apply_loglevel(options.loglevel(&config.loglevel));
    let config = Arc::new(ConfigWrapper::from_config(config));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        let _ = tx.send(());
    });

    if let Some(runtime) = options.runtime {
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(runtime)).await;
            info!("runtime of {}s reached", runtime);
            let _ = tx.send(());
        });
    }

    energy_bridge::app(shutdown_rx, config).await
}
