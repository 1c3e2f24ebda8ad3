//! Run a dispatcher against a live beanstalkd until Ctrl-C.
//!
//! Pair with `cargo run --example producer`.

use std::sync::Arc;

use serde_json::json;
use tubeq::*;

const CONFIG: &str = r#"
plot = [5, 15, 60]
debug = true
reserve_timeout_secs = 2
poison_tube = "dead-letters"

[tubes.mail]
consumer = "mailer"
desc = "Outgoing mail"

[tubes.reports]
consumer = "reporter"
desc = "Nightly report generation"
plot = [60, 300]
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = ServiceConfig::parse(CONFIG, Some("toml"))?;
    config.apply_env_overrides()?;
    config.validate()?;
    init_tracing(&config.logging)?;

    let catalog = HandlerCatalog::new()
        .register(
            "mailer",
            handler_fn(|payload: Payload| async move {
                tracing::info!(to = ?payload.get("to"), "sending mail");
                Ok::<_, anyhow::Error>(HandlerOutcome::success())
            }),
        )
        .register(
            "reporter",
            json_handler_fn(|payload: Payload| async move {
                let response = match payload.get("name").and_then(|n| n.as_str()) {
                    Some(name) => {
                        tracing::info!(%name, "building report");
                        json!({ "code": 1 })
                    }
                    None => json!({ "code": 0, "message": "report name missing" }),
                };
                Ok::<_, anyhow::Error>(response)
            }),
        );
    let registry = Arc::new(TubeRegistry::from_config(&config, &catalog)?);
    let broker = Arc::new(BeanstalkConnection::connect(&config.host, config.port).await?);

    let bus = Arc::new(InProcEventBus::default());
    let mut events = bus.subscribe_jobs();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::debug!(job_id = %event.job_id(), payload = ?event.payload, "job event");
        }
    });

    let dispatcher = Arc::new(
        ConsumerDispatcherBuilder::from_config(&config)?
            .with_broker(broker.clone())
            .with_registry(registry.clone())
            .with_worker_config(WorkerConfig::from_config(&config))
            .with_events(bus)
            .build()?,
    );
    dispatcher.start().await?;

    let admin = AdminFacade::from_config(broker, registry, &config);
    for tube in admin.stats_tubes().await? {
        tracing::info!(
            tube = %tube.stats.name,
            desc = %tube.desc,
            ready = tube.stats.current_jobs_ready,
            "watching"
        );
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    dispatcher.shutdown().await?;
    Ok(())
}
