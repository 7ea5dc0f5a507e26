use clap::Parser;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use task_engine::{handler_fn, Engine, EngineOptions, HandlerMap, Task};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "task-engine")]
#[command(about = "In-process task engine demo", long_about = None)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Total concurrency budget split across groups
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Number of tasks to submit per demo handler
    #[arg(short, long, default_value = "10")]
    tasks: usize,

    /// Seconds to run before shutting down (waits for Ctrl-C when omitted)
    #[arg(long)]
    run_for: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Load configuration
    let mut options = if let Some(config_path) = &args.config {
        EngineOptions::from_file(config_path)?
    } else {
        EngineOptions::default()
    };

    // Override with CLI args
    if let Some(concurrency) = args.concurrency {
        options.max_concurrent = concurrency;
    }

    let engine = Engine::new(options);
    tracing::info!("Resolved options: {:?}", engine.options());

    engine.start_with_handlers(demo_handlers());

    let now = chrono::Utc::now();
    for i in 0..args.tasks {
        engine.enqueue(Task::new("echo", format!("hello #{}", i))?);
        engine.enqueue(
            Task::builder("sleep", (100 * (i as u64 % 5)).to_string())
                .group(2)
                .build()?,
        );
        engine.enqueue(
            Task::builder("flaky", format!("flaky #{}", i))
                .group(3)
                .max_retry(3)
                .retry_delay(|n| Duration::from_millis(200 * u64::from(n)))
                .run_at(now + chrono::Duration::milliseconds(50 * i as i64))
                .build()?,
        );
    }

    match args.run_for {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Received shutdown signal");
        }
    }

    engine.stop_and_wait().await;
    println!("{}", serde_json::to_string_pretty(&engine.stats())?);

    Ok(())
}

fn demo_handlers() -> HandlerMap {
    let mut handlers = HandlerMap::new();

    handlers.insert(
        "echo".to_string(),
        Arc::new(handler_fn(|task: Task| async move {
            tracing::info!("echo {}: {}", task.id, String::from_utf8_lossy(&task.data));
            Ok(())
        })),
    );

    handlers.insert(
        "sleep".to_string(),
        Arc::new(handler_fn(|task: Task| async move {
            let millis: u64 = String::from_utf8_lossy(&task.data).parse()?;
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(())
        })),
    );

    // Fails the first two attempts of every task
    let failures = Arc::new(AtomicU32::new(0));
    handlers.insert(
        "flaky".to_string(),
        Arc::new(handler_fn(move |task: Task| {
            let failures = failures.clone();
            async move {
                if task.retried < 2 {
                    failures.fetch_add(1, Ordering::Relaxed);
                    anyhow::bail!("simulated failure on attempt {}", task.retried + 1);
                }
                tracing::info!(
                    "flaky {} succeeded after {} simulated failures overall",
                    task.id,
                    failures.load(Ordering::Relaxed)
                );
                Ok(())
            }
        })),
    );

    handlers
}
