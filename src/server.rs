use crate::{
    config::Config, input::CaptureBackend, processor::FrameProcessor, routes::api_routes,
    telemetry::Metrics,
};
use axum::Router;
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::sync::Arc;
use tokio::{
    net::TcpListener,
    sync::{broadcast::Receiver, Mutex},
    task::JoinHandle,
};

#[derive(Clone)]
pub struct SharedState {
    pub processor: Arc<FrameProcessor>,
    pub camera: Arc<dyn CaptureBackend>,
    /// Held for the whole pipeline so only one request is processed at a time.
    pub in_flight: Arc<Mutex<()>>,
    pub metrics: Arc<Metrics>,
}

impl SharedState {
    pub fn new(
        processor: Arc<FrameProcessor>,
        camera: Arc<dyn CaptureBackend>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            processor,
            camera,
            in_flight: Arc::new(Mutex::new(())),
            metrics,
        }
    }
}

pub fn build_router(state: SharedState) -> Router {
    let metrics_layer = HttpMetricsLayerBuilder::new().build();

    Router::new()
        .merge(api_routes())
        .with_state(state)
        .layer(metrics_layer)
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(
        processor: Arc<FrameProcessor>,
        camera: Arc<dyn CaptureBackend>,
        config: &Config,
    ) -> anyhow::Result<Self> {
        let addr = config.server.get_address();

        let metrics = Arc::new(Metrics::new()?);
        let router = build_router(SharedState::new(processor, camera, metrics));

        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(
        self,
        shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on http://{}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn({
            let mut shutdown_rx = shutdown_rx.resubscribe();
            async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        shutdown_rx.recv().await.ok();
                    })
                    .await?;
                tracing::info!("HTTP server stopped");
                Ok(())
            }
        });

        Ok(server_handle)
    }
}
