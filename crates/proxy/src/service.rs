use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use ipnet::IpNet;
use pingora_core::prelude::*;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{ProxyHttp, Session};
use ratewarden_common::ServerConfig;
use ratewarden_engine::{Decision, RateLimitService};
use tracing::{debug, info};

use crate::adapter;
use crate::context::RequestContext;

/// Gates every request through the rate-limit engine and forwards the
/// admitted ones to a single upstream.
pub struct RatewardenProxy {
    engine: Arc<RateLimitService>,
    upstream: String,
    upstream_tls: bool,
    sni: String,
    trusted_proxies: Vec<IpNet>,
}

impl RatewardenProxy {
    pub fn new(engine: Arc<RateLimitService>, server: &ServerConfig) -> anyhow::Result<Self> {
        let sni = server
            .upstream
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&server.upstream)
            .to_string();

        Ok(Self {
            engine,
            upstream: server.upstream.clone(),
            upstream_tls: server.upstream_tls,
            sni,
            trusted_proxies: server.trusted_proxy_nets()?,
        })
    }

    async fn reject(&self, session: &mut Session, decision: &Decision) -> Result<()> {
        let status =
            StatusCode::from_u16(decision.status).unwrap_or(StatusCode::TOO_MANY_REQUESTS);
        let body = Bytes::from(decision.denial_body().to_string());

        let mut resp = ResponseHeader::build(status, Some(decision.quota_headers().len() + 2))?;
        for (name, value) in decision.quota_headers() {
            resp.insert_header(name, value)?;
        }
        resp.insert_header("content-type", "application/json")?;
        resp.insert_header("content-length", body.len().to_string())?;

        session.set_keepalive(None);
        session.write_response_header(Box::new(resp), false).await?;
        session.write_response_body(Some(body), true).await?;
        Ok(())
    }
}

#[async_trait]
impl ProxyHttp for RatewardenProxy {
    type CTX = RequestContext;

    fn new_ctx(&self) -> Self::CTX {
        RequestContext::new()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let peer = session
            .client_addr()
            .and_then(|a| a.as_inet())
            .map(|a| a.to_string());

        let header = session.req_header();
        ctx.method = header.method.as_str().to_string();
        ctx.uri = header
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();

        let request = adapter::build_context(
            header.method.as_str(),
            header.uri.path(),
            &header.headers,
            peer.as_deref(),
            &self.trusted_proxies,
        );
        ctx.client_ip = request.ip.clone();

        let decision = self.engine.check(&request).await;
        let denied = !decision.allowed();
        if denied {
            info!(
                client_ip = %ctx.client_ip,
                uri = %ctx.uri,
                decision = decision.kind.as_str(),
                rule = decision.rule.as_deref().unwrap_or("-"),
                status = decision.status,
                "request denied"
            );
            ctx.response_status = decision.status;
            self.reject(session, &decision).await?;
        }
        ctx.decision = Some(decision);

        Ok(denied)
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        debug!(upstream = %self.upstream, "forwarding to upstream");
        let peer = HttpPeer::new(self.upstream.as_str(), self.upstream_tls, self.sni.clone());
        Ok(Box::new(peer))
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        if !ctx.client_ip.is_empty() {
            upstream_request.insert_header("x-real-ip", ctx.client_ip.as_str())?;
        }
        if let Some(rule) = ctx.decision.as_ref().and_then(|d| d.rule.as_deref()) {
            upstream_request.insert_header("x-ratelimit-rule", rule)?;
        }
        Ok(())
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
        ctx.response_status = upstream_response.status.as_u16();

        if let Some(decision) = &ctx.decision {
            for (name, value) in decision.quota_headers() {
                upstream_response.insert_header(name, value)?;
            }
        }
        Ok(())
    }

    async fn logging(
        &self,
        _session: &mut Session,
        _error: Option<&pingora_core::Error>,
        ctx: &mut Self::CTX,
    ) {
        let duration = ctx.request_start.elapsed();
        let decision = ctx.decision.as_ref();

        info!(
            client_ip = %ctx.client_ip,
            method = %ctx.method,
            uri = %ctx.uri,
            status = ctx.response_status,
            duration_ms = duration.as_millis() as u64,
            decision = decision.map(|d| d.kind.as_str()).unwrap_or("none"),
            rule = decision.and_then(|d| d.rule.as_deref()).unwrap_or("-"),
            "request completed"
        );
    }
}
