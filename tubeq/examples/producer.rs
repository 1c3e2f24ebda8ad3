//! Enqueue a handful of jobs on a running beanstalkd.
//!
//! ```sh
//! beanstalkd -l 127.0.0.1 -p 11300 &
//! cargo run --example producer
//! ```
//!
//! `TUBEQ_HOST` / `TUBEQ_PORT` override the address.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tubeq::*;

const CONFIG: &str = r#"
plot = [5, 15, 60]
debug = true

[tubes.mail]
consumer = "mailer"
desc = "Outgoing mail"

[tubes.reports]
consumer = "reporter"
desc = "Nightly report generation"
plot = [60, 300]
"#;

#[derive(Serialize)]
struct Report<'a> {
    name: &'a str,
    day: &'a str,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = ServiceConfig::parse(CONFIG, Some("toml"))?;
    config.apply_env_overrides()?;
    config.validate()?;
    init_tracing(&config.logging)?;

    let broker = Arc::new(BeanstalkConnection::connect(&config.host, config.port).await?);
    let registry = Arc::new(TubeRegistry::unbound(&config)?);
    let producer = Producer::from_config(broker, registry, &config);

    let mail = producer
        .push_default("mail", &json!({ "to": "ops@example.com", "subject": "hello" }))
        .await?;
    tracing::info!(job_id = %mail, "queued mail");

    let report = producer
        .push(
            "REPORTS",
            &Report { name: "sales", day: "2024-05-01" },
            PushOptions::default().with_delay(30).with_priority(JobPriority(10)),
        )
        .await?;
    tracing::info!(job_id = %report, "queued delayed report");

    match producer.push_default("unknown", &json!({ "x": 1 })).await {
        Err(QueueError::UnknownTube(tube)) => tracing::warn!(%tube, "rejected before reaching the broker"),
        other => tracing::error!(?other, "expected an unknown-tube rejection"),
    }

    Ok(())
}
