use std::sync::Arc;

use async_trait::async_trait;
use pingora::prelude::*;
use pingora::server::configuration::Opt;
use pingora::server::RunArgs;
use pingora::server::Server as PingoraServer;
use pingora::services::background::{BackgroundService, GenBackgroundService};
use tokio::sync::watch;

use ratelimit::{
    FallbackLimiter, HealthProber, LimitsRefresher, Metrics, Options, StatsScanner,
    WeightsRefresher,
};

use crate::configuration::GatewayConfig;
use crate::proxy::RateLimitGateway;

struct WeightsService(Arc<WeightsRefresher>);

#[async_trait]
impl BackgroundService for WeightsService {
    async fn start(&self, shutdown: watch::Receiver<bool>) {
        self.0.run(shutdown).await;
    }
}

struct LimitsService(Arc<LimitsRefresher>);

#[async_trait]
impl BackgroundService for LimitsService {
    async fn start(&self, shutdown: watch::Receiver<bool>) {
        self.0.run(shutdown).await;
    }
}

struct HealthService(Arc<HealthProber>);

#[async_trait]
impl BackgroundService for HealthService {
    async fn start(&self, shutdown: watch::Receiver<bool>) {
        self.0.run(shutdown).await;
    }
}

struct StatsService(Arc<StatsScanner>);

#[async_trait]
impl BackgroundService for StatsService {
    async fn start(&self, shutdown: watch::Receiver<bool>) {
        self.0.run(shutdown).await;
    }
}

struct ReaperService(Arc<FallbackLimiter>);

#[async_trait]
impl BackgroundService for ReaperService {
    async fn start(&self, shutdown: watch::Receiver<bool>) {
        self.0.run_reaper(shutdown).await;
    }
}

pub struct Server {
    server: PingoraServer,
}

impl Server {
    pub fn new(opt: Option<Opt>) -> Result<Self> {
        let server = PingoraServer::new(opt)?;
        Ok(Server { server })
    }

    /// Wire the rate limiting engine, its background workers and the proxy
    /// service into the server. Returns the metrics registry.
    pub fn bootstrap(&mut self, config: GatewayConfig) -> Result<Arc<Metrics>> {
        self.server.bootstrap();

        config.validate().map_err(|e| {
            Error::explain(
                ErrorType::InternalError,
                format!("invalid gateway config: {e}"),
            )
        })?;

        let (limiter, workers) = ratelimit::init(Options {
            shared_store_addr: config.shared_store_addr.clone(),
            database_path: config.database_path.clone(),
            routes: config.routes.clone(),
        })
        .map_err(|e| {
            Error::explain(
                ErrorType::InternalError,
                format!("failed to initialise rate limiter: {e}"),
            )
        })?;
        let metrics = limiter.metrics();

        let mut proxy_service = http_proxy_service(
            &self.server.configuration,
            RateLimitGateway::new(Arc::clone(&limiter), &config),
        );
        proxy_service.add_tcp(&config.listen_addr);

        self.server.add_service(GenBackgroundService::new(
            "weights refresher".to_string(),
            Arc::new(WeightsService(workers.weights)),
        ));
        self.server.add_service(GenBackgroundService::new(
            "limits refresher".to_string(),
            Arc::new(LimitsService(workers.limits)),
        ));
        self.server.add_service(GenBackgroundService::new(
            "health prober".to_string(),
            Arc::new(HealthService(workers.health)),
        ));
        self.server.add_service(GenBackgroundService::new(
            "stats scanner".to_string(),
            Arc::new(StatsService(workers.stats)),
        ));
        self.server.add_service(GenBackgroundService::new(
            "fallback reaper".to_string(),
            Arc::new(ReaperService(workers.fallback)),
        ));
        self.server.add_service(proxy_service);

        Ok(metrics)
    }

    pub fn run_forever(self) {
        self.server.run_forever();
    }

    pub fn run(self, args: RunArgs) {
        self.server.run(args);
    }
}
