//! Reelbot Core
//!
//! Bot runtime: access checks, conversation flow and catalog requests

pub mod commands;
pub mod dispatch;
pub mod error;
pub mod flow;
pub mod messages;
pub mod session;

pub use dispatch::Dispatcher;
pub use error::BotError;
pub use flow::{Bot, Reply};
pub use session::{Session, SessionState};

use anyhow::{Context, Result};
use reelbot_acl::AclStore;
use reelbot_catalog::{Catalog, RadarrClient};
use reelbot_config::Config;
use reelbot_ipc::EventBus;
use reelbot_session::SessionCache;
use reelbot_telegram::TelegramAdapter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

pub struct BotRuntime {
    config: Config,
    bot: Arc<Bot>,
    event_bus: EventBus,
}

impl BotRuntime {
    pub fn new(config: Config) -> Result<Self> {
        let acl = AclStore::open(
            config.acl_path(),
            &config.auth.password,
            config.auth.owner_id,
        )?;
        let radarr = RadarrClient::new(&config.radarr).context("Failed to build Radarr client")?;
        info!(base_url = %radarr.base_url(), "Radarr client ready");
        let catalog: Arc<dyn Catalog> = Arc::new(radarr);
        let sessions = SessionCache::new(Duration::from_secs(config.session.ttl_secs));
        let bot = Bot::new(
            Arc::new(acl),
            sessions,
            catalog,
            config.telegram.bot_name.clone(),
        );

        Ok(Self {
            config,
            bot: Arc::new(bot),
            event_bus: EventBus::new(),
        })
    }

    /// Runs until the event bus closes or a fatal error occurs.
    pub async fn run(&self) -> Result<()> {
        info!("Reelbot runtime starting...");

        self.start_telegram_adapter()?;
        let sweeper = self
            .bot
            .sessions()
            .spawn_sweeper(Duration::from_secs(self.config.session.sweep_interval_secs));

        let result = self.process_inbound().await;
        sweeper.abort();
        result
    }

    fn start_telegram_adapter(&self) -> Result<()> {
        let data_dir = self.config.data_dir();
        let adapter = TelegramAdapter::new(&self.config.telegram, data_dir.clone())?
            .with_event_bus(self.event_bus.clone());
        let adapter_for_outbound = TelegramAdapter::new(&self.config.telegram, data_dir)?;
        let outbound_rx = self.event_bus.outbound_subscribe();

        tokio::spawn(async move {
            adapter_for_outbound.run_outbound_handler(outbound_rx).await;
        });
        tokio::spawn(async move {
            if let Err(e) = adapter.poll().await {
                error!("Telegram adapter failed: {}", e);
            }
        });
        Ok(())
    }

    async fn process_inbound(&self) -> Result<()> {
        let mut inbound_rx = self.event_bus.subscribe();
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<BotError>(1);
        let mut dispatcher = Dispatcher::new(
            Arc::clone(&self.bot),
            self.event_bus.outbound_sender(),
            fatal_tx,
            Duration::from_secs(self.config.session.ttl_secs),
        );

        loop {
            tokio::select! {
                result = inbound_rx.recv() => match result {
                    Ok(envelope) => dispatcher.dispatch(envelope),
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Event bus closed, stopping message processor");
                        return Ok(());
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event bus lagged by {} messages", n);
                    }
                },
                Some(err) = fatal_rx.recv() => {
                    error!("Stopping after fatal error: {}", err);
                    // give the outbound handler a moment to deliver the last reply
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    return Err(anyhow::Error::new(err));
                }
            }
        }
    }
}
