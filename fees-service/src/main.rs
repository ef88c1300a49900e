use fees_service::config::Config;
use fees_service::startup::Application;
use service_core::observability::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.service_name, &config.log_level);

    let app = Application::build(config).await?;
    tracing::info!(port = app.port(), "fees-service starting");
    app.run_until_stopped().await?;

    Ok(())
}
