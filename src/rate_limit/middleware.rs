//! Tower middleware that schedules outgoing `http` requests through a [`RateLimiter`].
//!
//! The request-building layer attaches a [`RequestDescriptor`] to the request extensions,
//! the authentication layer an [`Owner`], and the caller optionally a [`WaitContext`]. Requests
//! without a descriptor pass through untouched.

use crate::context::WaitContext;
use crate::error::ServiceError;
use crate::rate_limit::RateLimiter;
use crate::request::{Owner, RequestDescriptor};
use http::{Request, Response};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;
use tracing::trace;

/// A layer that delays requests using a [`RateLimiter`].
#[derive(Debug)]
pub struct RateLimitLayer<L> {
    limiter: Arc<L>,
}

impl<L> Clone for RateLimitLayer<L> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone() }
    }
}

impl<L> RateLimitLayer<L> {
    pub fn new(limiter: L) -> Self {
        Self { limiter: Arc::new(limiter) }
    }

    /// Share a limiter that is also used outside the tower stack.
    pub fn from_arc(limiter: Arc<L>) -> Self {
        Self { limiter }
    }

    pub fn limiter(&self) -> &Arc<L> {
        &self.limiter
    }
}

impl<S, L> Layer<S> for RateLimitLayer<L> {
    type Service = RateLimitService<S, L>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService { inner: service, limiter: self.limiter.clone() }
    }
}

/// Middleware service produced by [`RateLimitLayer`].
#[derive(Debug)]
pub struct RateLimitService<S, L> {
    inner: S,
    limiter: Arc<L>,
}

impl<S: Clone, L> Clone for RateLimitService<S, L> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), limiter: self.limiter.clone() }
    }
}

impl<S, L, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitService<S, L>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    L: RateLimiter + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = ServiceError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ServiceError::Inner)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let limiter = self.limiter.clone();
        // Keep the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let Some(descriptor) = req.extensions().get::<RequestDescriptor>().cloned() else {
                trace!(uri = %req.uri(), "no request descriptor; skipping rate limit");
                return inner.call(req).await.map_err(ServiceError::Inner);
            };
            let owner = req.extensions().get::<Owner>().copied().unwrap_or_default();
            let ctx = req.extensions().get::<WaitContext>().cloned().unwrap_or_default();

            let completion = limiter.schedule(&ctx, &descriptor, owner).await?;
            match inner.call(req).await {
                Ok(response) => {
                    completion.complete(&response);
                    Ok(response)
                }
                Err(err) => {
                    completion.abandon();
                    Err(ServiceError::Inner(err))
                }
            }
        })
    }
}
