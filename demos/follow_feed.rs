//! Follow one or more live analysis feeds.
//!
//! Demonstrates:
//! - Creating a ConnectionPool
//! - Subscribing to a single feed with a filter and throttle
//! - Aggregating several feeds into one keyed stream
//! - Watching connection and aggregate state
//!
//! Usage:
//!   cargo run --example follow_feed -- --url http://localhost:8000/api --ward 12
//!   cargo run --example follow_feed -- --ward 4 --ward 12 --kind analysis
//!   cargo run --example follow_feed -- --throttle-ms 500 --debug

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use intel_feed::{
    AggregateStream, ConnectionPool, Message, MessageFilter, PoolConfig, Result, StreamConfig,
    StreamConsumer, StreamDescriptor, StreamIdentity,
};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Constants
// ============================================================================

const DEFAULT_URL: &str = "http://localhost:8000/api";

// ============================================================================
// Args
// ============================================================================

#[derive(Debug, Clone)]
struct Args {
    url: String,
    wards: Vec<String>,
    kinds: Vec<String>,
    throttle: Duration,
    debug: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = Self {
            url: DEFAULT_URL.to_string(),
            wards: Vec::new(),
            kinds: Vec::new(),
            throttle: Duration::ZERO,
            debug: false,
        };

        let mut iter = std::env::args().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--url" => args.url = iter.next().unwrap_or(args.url),
                "--ward" => args.wards.extend(iter.next()),
                "--kind" => args.kinds.extend(iter.next()),
                "--throttle-ms" => {
                    let ms = iter.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                    args.throttle = Duration::from_millis(ms);
                }
                "--debug" => args.debug = true,
                other => eprintln!("Ignoring unknown argument: {other}"),
            }
        }

        if args.wards.is_empty() {
            args.wards.push("1".to_string());
        }
        args
    }

    fn stream_config(&self) -> StreamConfig {
        self.kinds
            .iter()
            .fold(StreamConfig::new().with_throttle(self.throttle), |config, kind| {
                config.with_filter(MessageFilter::kind(kind.as_str()))
            })
    }
}

fn init_logging(debug: bool) {
    let filter = if debug { "intel_feed=debug" } else { "intel_feed=info" };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    if let Err(e) = run(args).await {
        eprintln!("\n[ERROR] {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    println!("=== Follow Feed ===\n");

    let pool = ConnectionPool::new(PoolConfig::new())?;
    let base = StreamIdentity::new(&args.url)?;

    if let [ward] = args.wards.as_slice() {
        follow_one(&pool, base.with_param("ward", ward.as_str()), args.stream_config()).await?;
    } else {
        let descriptors = args.wards.iter().map(|ward| {
            StreamDescriptor::new(format!("ward-{ward}"), base.clone().with_param("ward", ward.as_str()))
                .with_config(args.stream_config())
        });
        follow_many(&pool, descriptors.collect()).await?;
    }

    pool.shutdown();
    println!("\nDone.");
    Ok(())
}

// ============================================================================
// Single Feed
// ============================================================================

async fn follow_one(
    pool: &std::sync::Arc<ConnectionPool>,
    identity: StreamIdentity,
    config: StreamConfig,
) -> Result<()> {
    println!("[Subscribe] {identity}");
    let mut consumer = StreamConsumer::subscribe(pool, identity, config)?;
    let mut state = consumer.watch_state();

    println!("Press Ctrl+C to exit...\n");
    loop {
        tokio::select! {
            delivery = consumer.recv() => match delivery {
                Some(delivery) => {
                    for message in delivery.messages() {
                        print_message(None, message);
                    }
                }
                None => {
                    println!("[State] feed stopped ({})", consumer.state());
                    if consumer.state().is_error() && consumer.retry()? {
                        println!("[Retry] re-subscribed");
                        continue;
                    }
                    break;
                }
            },
            Ok(()) = state.changed() => {
                println!("[State] {}", *state.borrow_and_update());
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    consumer.unsubscribe();
    Ok(())
}

// ============================================================================
// Aggregate
// ============================================================================

async fn follow_many(
    pool: &std::sync::Arc<ConnectionPool>,
    descriptors: Vec<StreamDescriptor>,
) -> Result<()> {
    for descriptor in &descriptors {
        println!("[Subscribe] {} → {}", descriptor.key, descriptor.identity);
    }
    let mut aggregate = AggregateStream::compose(pool, descriptors)?;
    let mut state = aggregate.watch_state();

    println!("Press Ctrl+C to exit...\n");
    loop {
        tokio::select! {
            keyed = aggregate.recv() => match keyed {
                Some(keyed) => print_message(Some(&keyed.key), &keyed.message),
                None => {
                    println!("[State] all feeds stopped");
                    break;
                }
            },
            Ok(()) = state.changed() => {
                let current = *state.borrow_and_update();
                println!("[State] aggregate {current}");
                for (key, member) in aggregate.states() {
                    println!("        {key}: {member}");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    aggregate.shutdown();
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn print_message(key: Option<&str>, message: &Message) {
    let prefix = key.map(|k| format!("[{k}] ")).unwrap_or_default();
    let time = message.timestamp().format("%H:%M:%S%.3f");

    match message.content() {
        Some(content) => println!("{prefix}{time} {}: {content}", message.kind()),
        None => println!("{prefix}{time} {}: {}", message.kind(), message.payload()),
    }
}
