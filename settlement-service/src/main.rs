use service_core::observability::init_tracing;
use settlement_service::{config::Config, Application};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    init_tracing(
        &config.service_name,
        &config.common.log_level,
        config.common.otlp_endpoint.as_deref(),
    );

    let application = Application::build(config).await?;
    application.run_until_stopped().await?;

    Ok(())
}
