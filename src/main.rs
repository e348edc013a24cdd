use std::sync::Arc;

use gale::config::Config;
use gale::executor::llm::LlmExecutor;
use gale::executor::shell::ShellExecutor;
use gale::executor::ExecutorRegistry;
use gale::gate::LlmGate;
use gale::metrics::SysinfoMetrics;
use gale::model::{RunnerIdentity, TaskKind};
use gale::ollama::OllamaSupervisor;
use gale::runner::Runner;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env file if present (silently ignored if missing)
    dotenvy::dotenv().ok();

    tracing::info!("gale starting");

    let config = Config::from_env()?;
    let identity = RunnerIdentity::new(config.device_id.clone(), config.wallet_address.clone());

    let mut executors = ExecutorRegistry::new();
    executors.register(
        TaskKind::Shell,
        Arc::new(ShellExecutor::new(config.executor.clone())),
    );

    let ollama = if config.ollama.enabled {
        let supervisor = Arc::new(OllamaSupervisor::new(config.ollama.clone()));
        let gate = Arc::new(LlmGate::new(&config.gate));
        executors.register(
            TaskKind::LlmPrompt,
            Arc::new(LlmExecutor::new(gate, supervisor.client(), &config.gate)),
        );
        Some(supervisor)
    } else {
        None
    };

    let shutdown_timeout = config.shutdown_timeout;
    let runner = Runner::new(
        config,
        identity,
        executors,
        Arc::new(SysinfoMetrics::new()),
        ollama,
    );

    runner.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    runner.stop(shutdown_timeout).await?;

    tracing::info!("gale shutting down");
    Ok(())
}
