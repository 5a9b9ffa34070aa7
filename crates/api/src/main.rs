use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_observability::init();

    let bind = std::env::var("COURIER_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let services = courier_api::app::services::build_services().await?;
    let app = courier_api::app::build_app(services);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
