use std::sync::Arc;

use async_trait::async_trait;
use pingora::http::{RequestHeader, ResponseHeader};
use pingora::prelude::*;

use ratelimit::{
    Metrics, RateLimitOutcome, RateLimiter, FALLBACK_RATE_LIMIT_SECOND, HEADER_RATE_LIMIT_LIMIT,
    HEADER_RATE_LIMIT_LIMIT_HOUR, HEADER_RATE_LIMIT_LIMIT_MONTH, HEADER_RATE_LIMIT_LIMIT_SECOND,
    HEADER_RATE_LIMIT_REMAINING, HEADER_RATE_LIMIT_RESET, HEADER_RETRY_AFTER,
};

use crate::configuration::GatewayConfig;

/// The metering middleware: charges every selected request before proxying
/// it upstream, annotates the response, and reconciles counters afterwards.
pub struct RateLimitGateway {
    limiter: Arc<RateLimiter>,
    metrics: Arc<Metrics>,
    upstream_addr: String,
    upstream_tls: bool,
    upstream_sni: String,
    metered_prefix: String,
}

/// Per-request state carried between the proxy phases.
pub struct RequestCtx {
    metered: bool,
    caller_key: Option<String>,
    outcome: Option<RateLimitOutcome>,
}

impl RateLimitGateway {
    pub fn new(limiter: Arc<RateLimiter>, config: &GatewayConfig) -> Self {
        let metrics = limiter.metrics();
        Self {
            limiter,
            metrics,
            upstream_addr: config.upstream.addr.clone(),
            upstream_tls: config.upstream.tls,
            upstream_sni: config.upstream.sni.clone(),
            metered_prefix: config.metered_prefix.clone(),
        }
    }

    fn is_metered(&self, req: &RequestHeader) -> bool {
        req.uri.path().starts_with(&self.metered_prefix)
    }

    /// Quota headers present on every metered response; the per-window
    /// limits appear only for enforced windows.
    fn annotate(header: &mut ResponseHeader, outcome: &RateLimitOutcome) -> Result<()> {
        header.insert_header(HEADER_RATE_LIMIT_LIMIT, outcome.limit.to_string())?;
        header.insert_header(HEADER_RATE_LIMIT_REMAINING, outcome.remaining.to_string())?;
        header.insert_header(HEADER_RATE_LIMIT_RESET, outcome.reset.to_string())?;
        if outcome.rate_limit.second > 0 {
            header.insert_header(
                HEADER_RATE_LIMIT_LIMIT_SECOND,
                outcome.rate_limit.second.to_string(),
            )?;
        }
        if outcome.rate_limit.hour > 0 {
            header.insert_header(
                HEADER_RATE_LIMIT_LIMIT_HOUR,
                outcome.rate_limit.hour.to_string(),
            )?;
        }
        if outcome.rate_limit.month > 0 {
            header.insert_header(
                HEADER_RATE_LIMIT_LIMIT_MONTH,
                outcome.rate_limit.month.to_string(),
            )?;
        }
        Ok(())
    }

    /// Refund counters off the request path; failures are logged, never
    /// surfaced.
    fn spawn_reconcile(&self, outcome: RateLimitOutcome, status: u16) {
        let limiter = Arc::clone(&self.limiter);
        tokio::spawn(async move {
            if let Err(err) = limiter.reconcile(&outcome, status).await {
                log::error!("error reconciling counters: {err}");
            }
        });
    }
}

#[async_trait]
impl ProxyHttp for RateLimitGateway {
    type CTX = RequestCtx;

    fn new_ctx(&self) -> Self::CTX {
        RequestCtx {
            metered: false,
            caller_key: None,
            outcome: None,
        }
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool>
    where
        Self::CTX: Send + Sync,
    {
        if !self.is_metered(session.req_header()) {
            return Ok(false);
        }
        ctx.metered = true;

        // Hold traffic until the reference tables have loaded once.
        self.limiter.wait_ready().await;

        let peer = session
            .client_addr()
            .and_then(|addr| addr.as_inet())
            .map(|addr| addr.ip());

        if !self.limiter.is_healthy() {
            let req = session.req_header();
            let (key, _ip) = self.limiter.caller_key(&req.headers, &req.uri, peer);
            ctx.caller_key = Some(key.clone());
            if !self.limiter.fallback_check(&key) {
                let mut header = ResponseHeader::build(429, None)?;
                header.insert_header(
                    HEADER_RATE_LIMIT_LIMIT,
                    FALLBACK_RATE_LIMIT_SECOND.to_string(),
                )?;
                header.insert_header(HEADER_RATE_LIMIT_RESET, "1")?;
                session.set_keepalive(None);
                session
                    .write_response_header(Box::new(header), true)
                    .await?;
                return Ok(true);
            }
            // Degraded admission: no counters, no stats, no headers.
            return Ok(false);
        }

        let req = session.req_header();
        match self.limiter.check(&req.headers, &req.uri, peer).await {
            Ok(outcome) => {
                ctx.caller_key = Some(outcome.key.clone());
                if outcome.rejected {
                    let mut header = ResponseHeader::build(429, None)?;
                    Self::annotate(&mut header, &outcome)?;
                    header.insert_header(HEADER_RETRY_AFTER, outcome.reset.to_string())?;
                    session.set_keepalive(None);
                    session
                        .write_response_header(Box::new(header), true)
                        .await?;
                    ctx.outcome = Some(outcome);
                    return Ok(true);
                }
                ctx.outcome = Some(outcome);
                Ok(false)
            }
            Err(err) => {
                // Infrastructure faults never turn into HTTP errors; serve
                // the request un-metered.
                log::error!("error rate limiting request, serving unmetered: {err}");
                Ok(false)
            }
        }
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        Ok(Box::new(HttpPeer::new(
            self.upstream_addr.as_str(),
            self.upstream_tls,
            self.upstream_sni.clone(),
        )))
    }

    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()>
    where
        Self::CTX: Send + Sync,
    {
        if let Some(outcome) = &ctx.outcome {
            if !outcome.rejected {
                Self::annotate(upstream_response, outcome)?;
            }
        }
        Ok(())
    }

    async fn logging(&self, session: &mut Session, _e: Option<&Error>, ctx: &mut Self::CTX)
    where
        Self::CTX: Send + Sync,
    {
        if !ctx.metered {
            return;
        }
        let status = session
            .response_written()
            .map_or(0, |resp| resp.status.as_u16());

        if let Some(key) = &ctx.caller_key {
            self.metrics.record_status(key, status);
        }

        if let Some(outcome) = ctx.outcome.take() {
            if status != 200 {
                self.spawn_reconcile(outcome, status);
            }
        }
    }
}
