use crate::{
    config::Config,
    input::OpenCvBackend,
    models::{ModelError, ModelRegistry},
    processor::FrameProcessor,
    server::HttpServer,
};
use std::sync::Arc;
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> anyhow::Result<()> {
    let registry = Arc::new(ModelRegistry::new(config.model.clone()));

    // Model load failures are fatal.
    let processor = tokio::task::spawn_blocking({
        let registry = registry.clone();
        move || -> Result<FrameProcessor, ModelError> {
            let models = registry.models()?;
            Ok(FrameProcessor::new(
                models.segmenter(),
                Arc::new(models.captioner()),
            ))
        }
    })
    .await
    .map_err(|e| ModelError::Join(e.to_string()))
    .and_then(|loaded| loaded);

    let processor = match processor {
        Ok(processor) => Arc::new(processor),
        Err(e) => {
            tracing::error!("Failed to initialize models: {}", e);
            return Err(e.into());
        }
    };

    let camera = Arc::new(OpenCvBackend::new(config.camera.backend));
    tracing::info!("Camera backend: {:?}", config.camera.backend);

    let server = HttpServer::new(processor, camera, &config).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    server_handle.await??;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
