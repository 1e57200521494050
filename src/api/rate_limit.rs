use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, Response, StatusCode, header};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::Mutex;
use tower::{Layer, Service};

use crate::auth::TokenIssuer;

/// Buckets tracked before idle (full) ones are pruned.
const MAX_TRACKED_KEYS: usize = 10_000;
const ANONYMOUS_KEY: &str = "anonymous";

struct TokenBucket {
	tokens: f64,
	last_refill: Instant,
}

impl TokenBucket {
	fn full(capacity: f64) -> Self {
		Self {
			tokens: capacity,
			last_refill: Instant::now(),
		}
	}

	fn refill(&mut self, capacity: f64, refill_per_sec: f64, now: Instant) {
		let elapsed = now.duration_since(self.last_refill).as_secs_f64();
		self.tokens = (self.tokens + elapsed * refill_per_sec).min(capacity);
		self.last_refill = now;
	}
}

/// Token buckets keyed by the caller's credential, shared by every clone of
/// the layer.
#[derive(Clone)]
struct KeyedLimiter {
	capacity: f64,
	refill_per_sec: f64,
	buckets: Arc<Mutex<HashMap<String, TokenBucket>>>,
}

impl KeyedLimiter {
	fn new(capacity: usize, refill_per_sec: u32) -> Self {
		Self {
			capacity: capacity as f64,
			refill_per_sec: refill_per_sec as f64,
			buckets: Arc::new(Mutex::new(HashMap::new())),
		}
	}

	async fn try_acquire(&self, key: &str) -> bool {
		let now = Instant::now();
		let mut buckets = self.buckets.lock().await;

		if buckets.len() >= MAX_TRACKED_KEYS && !buckets.contains_key(key) {
			let (capacity, rate) = (self.capacity, self.refill_per_sec);
			buckets.retain(|_, b| {
				b.refill(capacity, rate, now);
				b.tokens < capacity
			});
		}

		let bucket = buckets
			.entry(key.to_string())
			.or_insert_with(|| TokenBucket::full(self.capacity));
		bucket.refill(self.capacity, self.refill_per_sec, now);
		if bucket.tokens >= 1.0 {
			bucket.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

/// Rate limit keyed by the caller's identity.
///
/// A request carrying a valid access credential is charged to its device.
/// Anything else, including forged or expired credentials, is charged to the
/// peer address, or to one shared bucket when the peer is unknown.
#[derive(Clone)]
pub struct KeyedRateLimitLayer {
	limiter: KeyedLimiter,
	issuer: Arc<TokenIssuer>,
}

impl KeyedRateLimitLayer {
	pub fn new(burst: usize, rps: u32, issuer: Arc<TokenIssuer>) -> Self {
		Self {
			limiter: KeyedLimiter::new(burst, rps),
			issuer,
		}
	}
}

#[derive(Clone)]
pub struct KeyedRateLimitService<S> {
	inner: S,
	limiter: KeyedLimiter,
	issuer: Arc<TokenIssuer>,
}

impl<S> Layer<S> for KeyedRateLimitLayer {
	type Service = KeyedRateLimitService<S>;

	fn layer(&self, inner: S) -> Self::Service {
		KeyedRateLimitService {
			inner,
			limiter: self.limiter.clone(),
			issuer: Arc::clone(&self.issuer),
		}
	}
}

type BoxF<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

fn rate_key<B>(req: &Request<B>, issuer: &TokenIssuer) -> String {
	let device = req
		.headers()
		.get(header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "))
		.and_then(|token| issuer.validate_access(token.trim()).ok());
	if let Some(claims) = device {
		return format!("device:{}", claims.device_id);
	}

	match req.extensions().get::<ConnectInfo<SocketAddr>>() {
		Some(ConnectInfo(addr)) => format!("peer:{}", addr.ip()),
		None => ANONYMOUS_KEY.to_string(),
	}
}

impl<S, ReqBody> Service<Request<ReqBody>> for KeyedRateLimitService<S>
where
	S: Service<Request<ReqBody>, Response = Response<Body>> + Clone + Send + 'static,
	S::Future: Send + 'static,
	S::Error: Send + 'static,
	ReqBody: Send + 'static,
{
	type Response = Response<Body>;
	type Error = S::Error;
	type Future = BoxF<Result<Self::Response, Self::Error>>;

	fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		self.inner.poll_ready(cx)
	}

	fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
		// Swap in a fresh clone so the instance that was polled ready serves this call.
		let clone = self.inner.clone();
		let mut inner = std::mem::replace(&mut self.inner, clone);
		let limiter = self.limiter.clone();
		let key = rate_key(&req, &self.issuer);

		Box::pin(async move {
			if !limiter.try_acquire(&key).await {
				let mut resp = Response::new(Body::from(
					r#"{"success":false,"code":"rate_limited","message":"rate limit exceeded"}"#,
				));
				*resp.status_mut() = StatusCode::TOO_MANY_REQUESTS;
				resp.headers_mut()
					.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));
				return Ok(resp);
			}

			inner.call(req).await
		})
	}
}
