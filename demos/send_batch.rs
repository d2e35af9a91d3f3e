//! Batch Dispatch Example
//!
//! This example demonstrates how to:
//! - Load relay settings from `MAIL_RELAY_*` environment variables
//! - Run the in-process retry worker next to the mailer
//! - Dispatch a small batch and inspect the report

use std::sync::Arc;
use std::time::Duration;

use integrations_mail_dispatch::{
    ChannelScheduler, DispatchConfig, DispatchError, LogLevel, LoggingConfig, Mailer,
    OutboundMessage, RetryWorker,
};

#[tokio::main]
async fn main() -> Result<(), DispatchError> {
    LoggingConfig::new()
        .with_level(LogLevel::Debug)
        .init()
        .map_err(|e| DispatchError::configuration(e.to_string()))?;

    // MAIL_RELAY_HOST is required; port, credentials, TLS and retry
    // settings are optional.
    let config = DispatchConfig::from_env()?;
    println!("Relay: {}", config.address());

    let (scheduler, queue) = ChannelScheduler::channel();
    let mailer = Mailer::new(config, Arc::new(scheduler))?;
    let worker = tokio::spawn(
        RetryWorker::new(queue, mailer.clone()).run_until(tokio::time::sleep(Duration::from_secs(600))),
    );

    let mut messages = Vec::new();
    for recipient in ["alice@example.com", "bob@example.com"] {
        messages.push(
            OutboundMessage::builder()
                .from("noreply@example.com")?
                .to(recipient)?
                .subject("Weekly report")
                .text("The weekly report is ready.")
                .build()?,
        );
    }

    let report = mailer.send_messages(messages).await;
    println!("Delivered:   {}", report.delivered.len());
    println!("Scheduled:   {}", report.scheduled_count());
    println!("Exhausted:   {}", report.exhausted.len());
    println!("Rejected:    {}", report.rejected.len());

    for group in &report.scheduled {
        println!("  retry in {:?}: {} message(s)", group.delay, group.attempts.len());
    }

    println!("Running retries for ten minutes...");
    let _ = worker.await;

    println!("{:#?}", mailer.metrics().snapshot());
    Ok(())
}
