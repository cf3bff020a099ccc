//! bus-demo: wires a configured bus and runs one command, query and event through it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use courier_bus::{
    handler_fn, BusConfig, CircuitBreakerHandler, CircuitBreakerPolicy, MessageBus, RetryPolicy,
    RetryableHandler,
};
use courier_core::{Command, Event, Message, Query, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bus-demo", version, about = "Dispatches sample messages through a courier bus", long_about = None)]
struct Args {
    /// Per-dispatch deadline in milliseconds (0 disables)
    #[arg(long, env = "COURIER_DISPATCH_TIMEOUT_MS", default_value_t = 5_000)]
    dispatch_timeout_ms: u64,

    /// Maximum dispatches in flight (0 means unlimited)
    #[arg(long, env = "COURIER_MAX_CONCURRENT", default_value_t = 0)]
    max_concurrent: u32,

    /// Extra attempts after a failed handler call
    #[arg(long, env = "COURIER_RETRIES", default_value_t = 3)]
    retries: u32,

    /// Delay between retry attempts in milliseconds
    #[arg(long, env = "COURIER_RETRY_INTERVAL_MS", default_value_t = 100)]
    retry_interval_ms: u64,

    /// Consecutive failures that open the circuit
    #[arg(long, env = "COURIER_FAILURE_THRESHOLD", default_value_t = 5)]
    failure_threshold: u32,

    /// Milliseconds an open circuit waits before a trial call
    #[arg(long, env = "COURIER_COOLDOWN_MS", default_value_t = 30_000)]
    cooldown_ms: u64,

    /// Emit logs as JSON
    #[arg(long, env = "COURIER_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn bus_config(&self) -> BusConfig {
        BusConfig {
            dispatch_timeout: (self.dispatch_timeout_ms > 0)
                .then(|| Duration::from_millis(self.dispatch_timeout_ms)),
            max_concurrent_dispatches: (self.max_concurrent > 0).then_some(self.max_concurrent),
            trace_dispatches: true,
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, Duration::from_millis(self.retry_interval_ms))
    }

    fn breaker_policy(&self) -> CircuitBreakerPolicy {
        CircuitBreakerPolicy {
            failure_threshold: self.failure_threshold,
            cooldown_period: Duration::from_millis(self.cooldown_ms),
            reset_timeout: None,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);
    info!(?args, "starting bus demo");

    let bus = Arc::new(MessageBus::with_config(&args.bus_config()));

    let greeting = handler_fn(|cmd: Command| async move {
        let name = cmd.payload().get("name").and_then(Value::as_str).unwrap_or("world");
        info!(name, "hello");
        Ok(())
    });
    bus.register_command_handler(
        "greet",
        RetryableHandler::new(
            CircuitBreakerHandler::new(greeting, args.breaker_policy()),
            args.retry_policy(),
        ),
    );
    bus.register_query_handler(
        "clock.now",
        handler_fn(|q: Query| async move {
            let millis = i64::try_from(q.timestamp()).unwrap_or(i64::MAX);
            Ok(Some(Value::Int(millis)))
        }),
    );
    bus.register_event_handler(
        "greeted",
        handler_fn(|event: Event| async move {
            info!(correlation_id = event.correlation_id(), "greeting observed");
            Ok(())
        }),
    );

    let command = Message::builder("greet")
        .payload("name", "courier")
        .build()
        .context("building greet command")?;
    bus.send_command(&Command::new(command.clone()))
        .await
        .context("greet command failed")?;

    let now = bus
        .send_query(&Query::new(Message::builder("clock.now").build()?))
        .await
        .context("clock query failed")?;
    info!(?now, "clock answered");

    let event = Message::builder("greeted").caused_by(&command).build()?;
    bus.publish_event(&Event::new(event))
        .await
        .context("publishing greeted failed")?;

    info!(?bus, "bus demo finished");
    Ok(())
}
