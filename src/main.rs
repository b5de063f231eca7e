use rocketmq_easy::scheduler::Scheduler;
use rocketmq_easy::{
    ConsumeResult, ConsumerClient, HostLookup, LoopbackBackend, MqConfig, Producer, SystemLookup,
    TrustDnsLookup,
};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

const TOPIC: &str = "TestTopic";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DemoMessage {
    name: String,
    sequence_no: i64,
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    // Load config first to get log level
    let config = MqConfig::from_env().await?;
    let log_level = config.get_tracing_level()?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env()
                         .add_directive(format!("rocketmq_easy={}", log_level.as_str().to_lowercase()).parse()?)
                         .add_directive(format!("rocketmq_easy_demo={}", log_level.as_str().to_lowercase()).parse()?))
        .init();

    info!(name_server = %config.name_server, group = %config.group_name, "starting rocketmq-easy demo");

    // MQ_DNS=trust-dns resolves the name server through trust-dns instead of getaddrinfo
    if std::env::var("MQ_DNS").as_deref() == Ok("trust-dns") {
        let lookup = TrustDnsLookup::from_system_conf().map_err(|e| anyhow::anyhow!(e))?;
        run(&config, &lookup).await
    } else {
        run(&config, &SystemLookup).await
    }
}

async fn run<L: HostLookup>(config: &MqConfig, lookup: &L) -> anyhow::Result<()> {
    let backend = LoopbackBackend::new();

    let consumer = ConsumerClient::with_lookup(config, &backend, lookup).await?;
    consumer.start_consume(TOPIC, |msg| {
        let decoded: DemoMessage = serde_json::from_slice(&msg.body)?;
        info!(msg_id = %msg.msg_id, name = %decoded.name, sequence_no = decoded.sequence_no, "message received");
        Ok(ConsumeResult::Success)
    })?;

    let producer = Producer::with_lookup(config, &backend, lookup).await?;

    let scheduler = Scheduler::new(env_u64("DEMO_INTERVAL_MS", 1000))?;
    let ticks = env_u64("DEMO_MESSAGES", 10);

    let producer_ref = &producer;
    let publishing = scheduler.run(ticks, move |tick| {
        let producer = producer_ref;
        async move {
            let message = DemoMessage {
                name: "demo".to_string(),
                sequence_no: tick as i64,
            };
            producer.send_message(TOPIC, serde_json::to_vec(&message)?).await?;
            Ok(())
        }
    });

    tokio::select! {
        result = publishing => {
            if let Err(e) = &result {
                error!("publishing stopped: {:#}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
        }
    }

    producer.close()?;
    consumer.close()?;
    Ok(())
}
