//! Per-IP request pacing.
//!
//! Coarse anti-abuse only; purchase correctness never depends on it. The
//! GCRA limiter replenishes continuously, so sub-second credit is never
//! lost to whole-second rounding.

use std::net::SocketAddr;
use std::num::NonZeroU32;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};

use crate::error::ErrorBody;
use crate::state::AppState;

pub type IpRateLimiter =
    RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Builds the keyed per-IP limiter from the configured rate and burst.
pub fn build_limiter(per_second: u32, burst: u32) -> IpRateLimiter {
    let rate = NonZeroU32::new(per_second.max(1)).unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(burst.max(1)).unwrap_or(NonZeroU32::MIN);
    RateLimiter::keyed(Quota::per_second(rate).allow_burst(burst))
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let key = addr.ip().to_string();
    match state.rate_limiter.check_key(&key) {
        Ok(_) => next.run(req).await,
        Err(not_until) => {
            let retry_after = not_until
                .wait_time_from(DefaultClock::default().now())
                .as_secs()
                .max(1);
            tracing::warn!(ip = %key, retry_after_secs = retry_after, "rate limit exceeded");
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(ErrorBody {
                    success: false,
                    message: "rate limit exceeded".into(),
                }),
            )
                .into_response();
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
    }
}
