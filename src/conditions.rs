//! Predicates gating handler invocation
//!
//! A handler registered with several conditions runs only when all of them
//! match. Request conditions also gate response handlers through
//! [`RequestMatched`], evaluated against the request recorded in the context.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use http::{header, Response, StatusCode};
use ipnetwork::IpNetwork;
use regex::Regex;

use crate::body::Body;
use crate::ctx::{ProxyCtx, RequestInfo};
use crate::mitm::strip_port;

pub trait ReqCondition: Send + Sync {
    fn matches_request(&self, req: &RequestInfo, ctx: &ProxyCtx) -> bool;
}

pub trait RespCondition: Send + Sync {
    fn matches_response(&self, resp: Option<&Response<Body>>, ctx: &ProxyCtx) -> bool;
}

/// Shared request condition
pub type ReqCond = Arc<dyn ReqCondition>;

/// Shared response condition
pub type RespCond = Arc<dyn RespCondition>;

// ============================================================================
// Request conditions
// ============================================================================

/// Request `host[:port]` is one of the given values (case-insensitive)
pub struct ReqHostIs(HashSet<String>);

impl ReqHostIs {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            hosts
                .into_iter()
                .map(|h| h.as_ref().to_ascii_lowercase())
                .collect(),
        )
    }
}

impl ReqCondition for ReqHostIs {
    fn matches_request(&self, req: &RequestInfo, _ctx: &ProxyCtx) -> bool {
        self.0.contains(&req.host().to_ascii_lowercase())
    }
}

/// Request host, port ignored, equals the given name
pub struct DstHostIs(String);

impl DstHostIs {
    pub fn new(host: impl AsRef<str>) -> Self {
        Self(host.as_ref().to_ascii_lowercase())
    }
}

impl ReqCondition for DstHostIs {
    fn matches_request(&self, req: &RequestInfo, _ctx: &ProxyCtx) -> bool {
        strip_port(req.host()).eq_ignore_ascii_case(&self.0)
    }
}

/// Request `host[:port]` matches any of the expressions
pub struct ReqHostMatches(Vec<Regex>);

impl ReqHostMatches {
    pub fn new(patterns: impl IntoIterator<Item = Regex>) -> Self {
        Self(patterns.into_iter().collect())
    }
}

impl ReqCondition for ReqHostMatches {
    fn matches_request(&self, req: &RequestInfo, _ctx: &ProxyCtx) -> bool {
        let host = req.host();
        self.0.iter().any(|re| re.is_match(host))
    }
}

/// Request path, or host followed by path, is one of the given values
pub struct UrlIs(HashSet<String>);

impl UrlIs {
    pub fn new<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(urls.into_iter().map(Into::into).collect())
    }
}

impl ReqCondition for UrlIs {
    fn matches_request(&self, req: &RequestInfo, _ctx: &ProxyCtx) -> bool {
        self.0.contains(req.uri.path()) || self.0.contains(&req.host_and_path())
    }
}

/// Host followed by path, with or without scheme, starts with a prefix
pub struct UrlHasPrefix(String);

impl UrlHasPrefix {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self(prefix.into())
    }
}

impl ReqCondition for UrlHasPrefix {
    fn matches_request(&self, req: &RequestInfo, _ctx: &ProxyCtx) -> bool {
        let host_and_path = req.host_and_path();
        if host_and_path.starts_with(&self.0) || req.uri.path().starts_with(&self.0) {
            return true;
        }
        match req.uri.scheme_str() {
            Some(scheme) => format!("{scheme}://{host_and_path}").starts_with(&self.0),
            None => false,
        }
    }
}

/// Path, or host followed by path, matches the expression
pub struct UrlMatches(Regex);

impl UrlMatches {
    pub fn new(re: Regex) -> Self {
        Self(re)
    }
}

impl ReqCondition for UrlMatches {
    fn matches_request(&self, req: &RequestInfo, _ctx: &ProxyCtx) -> bool {
        self.0.is_match(req.uri.path()) || self.0.is_match(&req.host_and_path())
    }
}

/// Client address is one of the given IPs
pub struct SrcIpIs(HashSet<IpAddr>);

impl SrcIpIs {
    pub fn new(ips: impl IntoIterator<Item = IpAddr>) -> Self {
        Self(ips.into_iter().collect())
    }
}

impl ReqCondition for SrcIpIs {
    fn matches_request(&self, _req: &RequestInfo, ctx: &ProxyCtx) -> bool {
        self.0.contains(&ctx.client_addr().ip())
    }
}

/// Matches when the client address falls inside any of the networks
pub struct SrcIpIn(Vec<IpNetwork>);

impl SrcIpIn {
    /// Parse CIDR blocks (`10.0.0.0/8`) or single addresses
    pub fn parse<I, S>(networks: I) -> Result<Self, ipnetwork::IpNetworkError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        networks
            .into_iter()
            .map(|net| net.as_ref().trim().parse::<IpNetwork>())
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

impl ReqCondition for SrcIpIn {
    fn matches_request(&self, _req: &RequestInfo, ctx: &ProxyCtx) -> bool {
        let ip = ctx.client_addr().ip();
        self.0.iter().any(|net| net.contains(ip))
    }
}

/// Negates a request condition
pub struct Not(pub ReqCond);

impl ReqCondition for Not {
    fn matches_request(&self, req: &RequestInfo, ctx: &ProxyCtx) -> bool {
        !self.0.matches_request(req, ctx)
    }
}

/// Request condition backed by a closure
pub struct ReqFn<F>(pub F);

impl<F> ReqCondition for ReqFn<F>
where
    F: Fn(&RequestInfo, &ProxyCtx) -> bool + Send + Sync,
{
    fn matches_request(&self, req: &RequestInfo, ctx: &ProxyCtx) -> bool {
        (self.0)(req, ctx)
    }
}

// ============================================================================
// Response conditions
// ============================================================================

/// Response media type, parameters ignored, is one of the given types
pub struct ContentTypeIs(HashSet<String>);

impl ContentTypeIs {
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            types
                .into_iter()
                .map(|t| t.as_ref().to_ascii_lowercase())
                .collect(),
        )
    }
}

impl RespCondition for ContentTypeIs {
    fn matches_response(&self, resp: Option<&Response<Body>>, _ctx: &ProxyCtx) -> bool {
        let Some(value) = resp
            .and_then(|r| r.headers().get(header::CONTENT_TYPE))
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        let media_type = value.split(';').next().unwrap_or_default().trim();
        self.0.contains(&media_type.to_ascii_lowercase())
    }
}

/// Response status is one of the given codes
pub struct StatusCodeIs(HashSet<StatusCode>);

impl StatusCodeIs {
    pub fn new(codes: impl IntoIterator<Item = StatusCode>) -> Self {
        Self(codes.into_iter().collect())
    }
}

impl RespCondition for StatusCodeIs {
    fn matches_response(&self, resp: Option<&Response<Body>>, _ctx: &ProxyCtx) -> bool {
        resp.is_some_and(|r| self.0.contains(&r.status()))
    }
}

/// Request condition evaluated while handling the response
pub struct RequestMatched(pub ReqCond);

impl RespCondition for RequestMatched {
    fn matches_response(&self, _resp: Option<&Response<Body>>, ctx: &ProxyCtx) -> bool {
        self.0.matches_request(&ctx.req, ctx)
    }
}

/// Response condition backed by a closure
pub struct RespFn<F>(pub F);

impl<F> RespCondition for RespFn<F>
where
    F: Fn(Option<&Response<Body>>, &ProxyCtx) -> bool + Send + Sync,
{
    fn matches_response(&self, resp: Option<&Response<Body>>, ctx: &ProxyCtx) -> bool {
        (self.0)(resp, ctx)
    }
}

// ============================================================================
// Shorthands
// ============================================================================

pub fn req_host_is<I, S>(hosts: I) -> ReqCond
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    Arc::new(ReqHostIs::new(hosts))
}

pub fn dst_host_is(host: impl AsRef<str>) -> ReqCond {
    Arc::new(DstHostIs::new(host))
}

pub fn url_is<I, S>(urls: I) -> ReqCond
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Arc::new(UrlIs::new(urls))
}

pub fn url_has_prefix(prefix: impl Into<String>) -> ReqCond {
    Arc::new(UrlHasPrefix::new(prefix))
}

pub fn not(cond: ReqCond) -> ReqCond {
    Arc::new(Not(cond))
}

pub fn content_type_is<I, S>(types: I) -> RespCond
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    Arc::new(ContentTypeIs::new(types))
}

pub fn status_code_is(codes: impl IntoIterator<Item = StatusCode>) -> RespCond {
    Arc::new(StatusCodeIs::new(codes))
}

/// Lift a request condition to the response side
pub fn request_matched(cond: ReqCond) -> RespCond {
    Arc::new(RequestMatched(cond))
}
