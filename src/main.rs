use anyhow::Result;
use dota_notifier::config::{FileConfig, Settings, CONFIG_PATH};
use dota_notifier::pass::{Notifier, PassOptions};
use dota_notifier::rate_limit::Limiters;
use dota_notifier::state::{FileStore, GistStore, StateStore, STATE_FILE_NAME};
use dota_notifier::stratz::StratzClient;
use dota_notifier::webhook::{HttpTransport, WebhookClient, WebhookOptions};
use dotenvy::dotenv;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn state_store(settings: &Settings) -> Result<Arc<dyn StateStore>> {
    match (&settings.gist_id, &settings.gist_token) {
        (Some(id), Some(token)) => Ok(Arc::new(GistStore::new(id.clone(), token.clone())?)),
        _ => {
            warn!("GIST_ID/GIST_TOKEN not set - keeping state in local {}", STATE_FILE_NAME);
            Ok(Arc::new(FileStore::new(STATE_FILE_NAME)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv_result = dotenv();
    init_tracing();
    match dotenv_result {
        Ok(path) => info!("Loaded environment from {:?}", path),
        Err(e) => warn!("No .env file loaded ({}) - relying on environment", e),
    }

    let settings = Settings::from_env()?;
    let file = FileConfig::load(CONFIG_PATH)?;
    info!("Tracking {} players", file.players.len());

    let limiters = Arc::new(Limiters::default());
    let feed = Arc::new(StratzClient::new(
        settings.stratz_token.clone(),
        limiters.clone(),
    )?);
    let webhook = WebhookClient::new(
        Arc::new(HttpTransport::new()?),
        limiters,
        WebhookOptions {
            debug_override: settings.debug_override(),
            dump_payloads: settings.debug_level.dumps_payloads(),
            ..WebhookOptions::default()
        },
    );

    let options = PassOptions {
        post_destination: settings.post_destination(&file),
        default_expiry: settings.pending_expiry,
        force_fallback: settings.force_fallback,
        ..PassOptions::default()
    };
    let notifier = Notifier::new(feed, webhook, state_store(&settings)?, file.players, options);
    let report = notifier.run_pass().await;
    if let Some(abort) = report.abort {
        info!("Exiting after early stop ({}); next run will resume", abort);
    }
    Ok(())
}
