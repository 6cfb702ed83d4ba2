use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use warden_broker::broker::Broker;
use warden_broker::config::{BrokerConfig, LogFormat};
use warden_broker::server;
use warden_broker::timezone::GogTimeZoneProvider;
use warden_gog::{RunnerFactory, RunnerProvider};
use warden_policy::PolicySet;

#[tokio::main]
async fn main() {
    let config = match BrokerConfig::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    let policies = match PolicySet::load(&config.policy_path) {
        Ok(set) => Arc::new(set),
        Err(err) => {
            eprintln!("STARTUP_ERROR ERR_POLICY {}", err);
            std::process::exit(1);
        }
    };

    let provider = Arc::new(RunnerFactory {
        path: config.gog_path.clone(),
        default_account: config.gog_account.clone(),
        timeout: config.gog_timeout,
    });

    for (account, policy) in policies.accounts() {
        let runner = provider.runner_for(account);
        policy.set_time_zone_provider(Arc::new(GogTimeZoneProvider::new(runner)));
    }

    let broker = Arc::new(Broker::new(
        Arc::clone(&policies),
        provider,
        config.gog_account.clone(),
        config.verbose,
    ));

    if let Err(err) = server::serve(&config.socket_path, broker).await {
        eprintln!("STARTUP_ERROR {}", err);
        std::process::exit(1);
    }
}
