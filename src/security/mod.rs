//! Signed data-request protection.
//!
//! A full document embeds a token issued by [`DataSigner`]; the client echoes
//! it in the `X-Data-Signature` header of later data requests, whichever route
//! they navigate to.
//! [`SignedDataMiddleware`] rejects data requests whose token is missing, stale
//! or forged with `403` before any loader runs.

mod signature;

pub use signature::{DEFAULT_SCOPE, DataSigner, SignatureError};

use std::sync::Arc;

use tracing::warn;

use crate::{
    Response, StatusCode,
    context::Context,
    http::signal,
    middleware::{Middleware, Next, ResponseFuture},
};

/// Verifies `X-Data-Signature` on data requests. Document requests pass through.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use routeweave::security::{DataSigner, SignedDataMiddleware};
///
/// let signer = DataSigner::new("s3cret", Duration::from_secs(300));
/// let middleware = SignedDataMiddleware::new(signer);
/// ```
#[derive(Debug, Clone)]
pub struct SignedDataMiddleware {
    signer: Arc<DataSigner>,
}

impl SignedDataMiddleware {
    pub fn new(signer: DataSigner) -> Self {
        Self::shared(Arc::new(signer))
    }

    pub fn shared(signer: Arc<DataSigner>) -> Self {
        Self { signer }
    }

    fn check(&self, ctx: &Context) -> Result<(), SignatureError> {
        let request = ctx.request();
        let token = request
            .headers()
            .get(signal::DATA_SIGNATURE)
            .ok_or(SignatureError::Missing)?;
        self.signer.verify(token)
    }
}

impl Middleware for SignedDataMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> ResponseFuture {
        let verdict = if ctx.request().navigation().data.is_some() {
            self.check(&ctx)
        } else {
            Ok(())
        };

        Box::pin(async move {
            match verdict {
                Ok(()) => next.run(ctx).await,
                Err(e) => {
                    warn!(
                        request_id = %ctx.request_id(),
                        path = %ctx.request().path(),
                        error = %e,
                        "rejected data request"
                    );
                    Response::new(StatusCode::Forbidden)
                        .header("Cache-Control", "no-store")
                        .body(e.to_string())
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Request;
    use crate::middleware::{Endpoint, MiddlewareHandler, from_middleware};
    use std::time::Duration;

    fn endpoint() -> Endpoint {
        Arc::new(|_ctx| Box::pin(async { Response::new(StatusCode::Ok).body("data") }))
    }

    async fn send(signer: &Arc<DataSigner>, request: Request) -> StatusCode {
        let chain: Arc<[MiddlewareHandler]> = Arc::from(vec![from_middleware(Arc::new(
            SignedDataMiddleware::shared(Arc::clone(signer)),
        ))]);
        Next::new(chain, endpoint())
            .run(Context::new(request))
            .await
            .status()
    }

    fn data_request(path: &str) -> Request {
        Request::get(path).with_header(signal::DATA_REQUEST, "1")
    }

    #[tokio::test]
    async fn document_requests_pass_without_signature() {
        let signer = Arc::new(DataSigner::new("k", Duration::from_secs(60)));
        assert_eq!(send(&signer, Request::get("/blog")).await, StatusCode::Ok);
    }

    #[tokio::test]
    async fn data_request_needs_valid_signature() {
        let signer = Arc::new(DataSigner::new("k", Duration::from_secs(60)));

        assert_eq!(send(&signer, data_request("/blog")).await, StatusCode::Forbidden);

        let token = signer.sign().unwrap();
        let signed = data_request("/blog").with_header(signal::DATA_SIGNATURE, token);
        assert_eq!(send(&signer, signed).await, StatusCode::Ok);

        let forged = data_request("/blog").with_header(signal::DATA_SIGNATURE, "1.00");
        assert_eq!(send(&signer, forged).await, StatusCode::Forbidden);
    }

    #[tokio::test]
    async fn token_from_one_document_covers_other_routes() {
        let signer = Arc::new(DataSigner::new("k", Duration::from_secs(60)));
        let token = signer.sign().unwrap();
        for path in ["/a", "/b", "/admin/users"] {
            let request = data_request(path).with_header(signal::DATA_SIGNATURE, token.clone());
            assert_eq!(send(&signer, request).await, StatusCode::Ok, "{path}");
        }
    }
}
