//! PTC Gateway server.
//!
//! Runs in one of two modes, picked by `cion_mode` in config.json:
//! auth mode serves `/api/v1/login-code` + `/api/v1/activate`, cion mode
//! serves `/api/v1/cion` backed by the token replenishment loop.

use std::sync::Arc;

use tracing::{error, info, warn};

use ptc_gateway::auth::{CookieBroker, LoginFlow};
use ptc_gateway::browser::{BrowserDriver, CdpBrowser, CdpBrowserConfig};
use ptc_gateway::challenge::{AuthChallenge, JoinChallenge};
use ptc_gateway::join::JoinService;
use ptc_gateway::proxy::{ProxyDispenser, ProxyDistributor};
use ptc_gateway::signal::{ExtensionBridge, SignalChannel};
use ptc_gateway::tasks::TaskSupervisor;
use ptc_gateway::{web, AppConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = ptc_gateway::init_logging();

    let config = AppConfig::load();
    info!(
        "Starting PTC Gateway in {} mode",
        if config.cion_mode { "cion" } else { "auth" }
    );
    if let Some(dir) = ptc_gateway::log_dir() {
        info!("Log files saved to: {}", dir.display());
    }

    let supervisor = Arc::new(TaskSupervisor::new());

    let bridge = Arc::new(ExtensionBridge::new(config.bridge_port));
    {
        let bridge = bridge.clone();
        supervisor.spawn("extension-bridge", async move {
            if let Err(e) = bridge.serve().await {
                error!("Extension bridge failed: {}", e);
            }
        });
    }

    let driver_config = CdpBrowserConfig {
        chrome_path: config.chrome_path.clone(),
        headless: config.headless,
        extension_dirs: vec![
            config.proxy_extension.clone(),
            config.targetfp_extension.clone(),
        ],
        ..Default::default()
    };
    let signal: Arc<dyn SignalChannel> = bridge.clone();
    let driver: Arc<dyn BrowserDriver> =
        Arc::new(CdpBrowser::new(driver_config, signal.clone()));

    let dispenser = match ProxyDispenser::from_file(&config.proxies_list_path) {
        Ok(dispenser) => Arc::new(dispenser),
        Err(e) => {
            warn!(
                "Failed to load proxy list from {}: {}",
                config.proxies_list_path, e
            );
            Arc::new(ProxyDispenser::new(vec![]))
        }
    };
    let distributor = Arc::new(ProxyDistributor::new());

    let app = if config.cion_mode {
        let challenge = JoinChallenge::new(driver, signal);
        let service = Arc::new(JoinService::new(challenge, dispenser, distributor));
        {
            let service = service.clone();
            supervisor.spawn("token-replenisher", async move {
                service.replenish_loop().await;
            });
        }
        web::build_router(web::cion_router(service))
    } else {
        let challenge = Arc::new(AuthChallenge::new(driver, signal));
        let broker = Arc::new(CookieBroker::new(challenge, dispenser, distributor));
        let flow = Arc::new(LoginFlow::new(broker));
        web::build_router(web::auth_router(flow))
    };

    web::start_server(app, &config.host, config.port).await?;

    supervisor.shutdown().await;
    info!("PTC Gateway stopped");
    Ok(())
}
