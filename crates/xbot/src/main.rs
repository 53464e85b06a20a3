use std::sync::Arc;

use tokio::sync::mpsc;

use xbot_core::{config::Config, domain::Credential, orchestrator::Orchestrator, Error};
use xbot_telegram::{
    admin::run_admin_loop, commands::CommandHandler, pipeline::TeloxidePipeline, reply_bot,
    TelegramClientFactory,
};

#[tokio::main]
async fn main() -> Result<(), Error> {
    xbot_core::logging::init("xbot")?;

    let cfg = Config::load()?;
    let primary = Credential::parse(&cfg.telegram_bot_token)
        .map_err(|e| Error::Config(format!("TELEGRAM_BOT_TOKEN: {e}")))?;

    let http = xbot_telegram::http_client(cfg.poll_timeout)?;
    let factory = Arc::new(TelegramClientFactory::new(http));

    let (admin_tx, admin_rx) = mpsc::channel(16);
    let handler = Arc::new(CommandHandler::new(
        primary.id(),
        cfg.admin_users.clone(),
        admin_tx,
    ));
    let pipeline = Arc::new(TeloxidePipeline::new(handler));

    let orchestrator = Arc::new(Orchestrator::new(&cfg, factory.clone(), pipeline)?);
    tracing::info!(
        mode = ?orchestrator.mode(),
        startup_minions = cfg.minion_tokens.len(),
        admins = cfg.admin_users.len(),
        "xbot starting"
    );

    let admin_bot = reply_bot(orchestrator.primary())
        .ok_or_else(|| Error::Config("primary bot is not backed by teloxide".to_string()))?;
    tokio::spawn(run_admin_loop(orchestrator.clone(), admin_bot, admin_rx));

    let on_signal = orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for ctrl-c");
            return;
        }
        tracing::info!("shutdown requested");
        on_signal.shutdown();
    });

    orchestrator.start().await?;
    tracing::info!("xbot stopped");
    Ok(())
}
