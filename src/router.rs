//! C1: the request router and auth boundary. Parses the request line and
//! headers, verifies the bearer token via the pluggable `PrincipalVerifier`
//! (A4), dispatches to C2/C3/C4, and translates every `Error` into the HTTP
//! response shape §7 specifies (grounded on the reference system's own habit
//! of building its `warp` filter tree in one place and centralizing
//! rejection handling).
//!
//! The `/metrics` scrape endpoint is not part of this filter tree: it runs
//! on its own listener via [`crate::metrics::start_metrics_scrape_endpoint`],
//! matching the reference system's own choice to keep its scrape endpoint on
//! a dedicated port and runtime, separate from its request-serving loop.

use crate::auth::{bearer_token, PrincipalVerifier, User};
use crate::error::{Error, Rejection};
use crate::handlers::{pre_request, status, upload, Context};
use crate::session::UploadIdentifier;
use crate::storage::{parse_status_query_total, ContentRange};
use bytes::Buf;
use serde_json::json;
use slog::Logger;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::{Filter, Rejection as WarpRejection, Reply};

const PRE_REQUEST_BODY_LIMIT: u64 = 2 * 1024;

fn with_context(ctx: Context) -> impl Filter<Extract = (Context,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

fn with_logger(logger: Logger) -> impl Filter<Extract = (Logger,), Error = Infallible> + Clone {
    warp::any().map(move || logger.clone())
}

fn with_verifier(
    verifier: Arc<dyn PrincipalVerifier>,
) -> impl Filter<Extract = (Arc<dyn PrincipalVerifier>,), Error = Infallible> + Clone {
    warp::any().map(move || verifier.clone())
}

/// Verifies the `Authorization` header against the configured
/// `PrincipalVerifier`, rejecting with `Error::Unauthorized` if it is
/// missing or invalid.
fn authenticated(
    verifier: Arc<dyn PrincipalVerifier>,
) -> impl Filter<Extract = (User,), Error = WarpRejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and(with_verifier(verifier))
        .and_then(|header: Option<String>, verifier: Arc<dyn PrincipalVerifier>| async move {
            let token = bearer_token(header.as_deref()).map_err(|_| -> WarpRejection { Error::Unauthorized.into() })?;
            verifier
                .verify(token)
                .await
                .map_err(|_| -> WarpRejection { Error::Unauthorized.into() })
        })
}

/// Strips `http_path` from a request's full path, further splitting off the
/// literal `(<uploadId>)` segment this protocol's URLs use for wire
/// compatibility with the reference system's cookieless session encoding
/// (design note 9, "Session store abstraction"). Returns `None` for a bare
/// match against `http_path` (the pre-request route) or `Some(id)` for a
/// matched session segment; rejects with `not_found` for anything else.
fn matched_path(
    http_path: String,
) -> impl Filter<Extract = (Option<UploadIdentifier>,), Error = WarpRejection> + Clone {
    let prefix = if http_path.ends_with('/') { http_path } else { format!("{http_path}/") };
    warp::path::full().and_then(move |full: warp::path::FullPath| {
        let prefix = prefix.clone();
        async move {
            let path = full.as_str();
            if path == prefix.trim_end_matches('/') {
                return Ok(None);
            }
            let rest = path.strip_prefix(&prefix).ok_or_else(warp::reject::not_found)?;
            let segment = rest.trim_end_matches('/');
            let id = segment
                .strip_prefix('(')
                .and_then(|s| s.strip_suffix(')'))
                .and_then(|s| s.parse::<UploadIdentifier>().ok())
                .ok_or_else(warp::reject::not_found)?;
            Ok::<_, WarpRejection>(Some(id))
        }
    })
}

fn require_session_id(
    id: Option<UploadIdentifier>,
) -> Result<UploadIdentifier, WarpRejection> {
    id.ok_or_else(warp::reject::not_found)
}

pub fn routes(
    ctx: Context,
    verifier: Arc<dyn PrincipalVerifier>,
    logger: Logger,
) -> impl Filter<Extract = (impl Reply,), Error = WarpRejection> + Clone {
    let path_filter = matched_path(ctx.config.http_path.clone());

    let pre_request_route = warp::post()
        .and(path_filter.clone())
        .and_then(|id: Option<UploadIdentifier>| async move {
            if id.is_some() {
                return Err(warp::reject::not_found());
            }
            Ok::<(), WarpRejection>(())
        })
        .and(warp::body::content_length_limit(PRE_REQUEST_BODY_LIMIT))
        .and(warp::header::<u64>("x-upload-content-length"))
        .and(warp::body::json())
        .and(warp::header::<String>("host"))
        .and(warp::header::optional::<String>("x-forwarded-proto"))
        .and(authenticated(verifier.clone()))
        .and(with_context(ctx.clone()))
        .and(with_logger(logger.clone()))
        .and_then(
            |declared_content_length, uploadable, host, forwarded_proto, user, ctx, logger| async move {
                let request = pre_request::PreRequest {
                    uploadable,
                    declared_content_length,
                    host,
                    forwarded_proto,
                };
                pre_request::handle(request, user, ctx, logger)
                    .await
                    .map_err(|e: Error| -> WarpRejection { e.into() })
            },
        );

    let put_base = warp::put()
        .and(path_filter)
        .and_then(|id| async move { require_session_id(id) })
        .and(warp::header::optional::<String>("content-range"))
        .and(authenticated(verifier))
        .and(with_context(ctx.clone()))
        .and(with_logger(logger.clone()));

    // A `content-range` header that isn't the `bytes */<total>` status-query
    // form rejects with `not_found` rather than a domain `Error`: `not_found`
    // is warp's weakest rejection and always loses a combined `.or()`
    // rejection to anything more specific, so a normal chunk-range PUT
    // reliably falls through to `upload_route` (and that branch's own
    // domain errors, e.g. `SessionExpired`, are what actually surfaces).
    let status_route = put_base.clone().and_then(
        |upload_id: UploadIdentifier,
         content_range: Option<String>,
         user: User,
         ctx: Context,
         logger: Logger| async move {
            let header = content_range.ok_or_else(warp::reject::not_found)?;
            let _total = parse_status_query_total(&header).map_err(|_| warp::reject::not_found())?;
            status::handle(upload_id, user, ctx, logger)
                .await
                .map_err(|e: Error| -> WarpRejection { e.into() })
        },
    );

    let upload_route = put_base.and(warp::body::stream()).and_then(
        |upload_id: UploadIdentifier,
         content_range: Option<String>,
         user: User,
         ctx: Context,
         logger: Logger,
         body: impl futures::Stream<Item = Result<impl Buf, warp::Error>> + Unpin + Send + 'static| async move {
            let header = content_range
                .ok_or_else(|| -> WarpRejection { Error::Unparsable("missing Content-Range".into()).into() })?;
            let range = ContentRange::parse(&header).map_err(|e| -> WarpRejection { e.into() })?;
            let body = futures::StreamExt::map(body, |chunk| chunk.map(|mut b| b.copy_to_bytes(b.remaining())));
            upload::handle(upload_id, range, body, user, ctx, logger)
                .await
                .map_err(|e: Error| -> WarpRejection { e.into() })
        },
    );

    // `status_route` must be tried before `upload_route`: both match the same
    // path shape, and only the `Content-Range: bytes */<total>` form
    // identifies a status query (§4.4).
    status_route.or(upload_route).unify().or(pre_request_route).unify().recover(handle_rejection)
}

/// Translates a propagated [`Error`] (or warp's own built-in rejections,
/// such as an unmatched route) into the HTTP response shape §7 specifies.
async fn handle_rejection(rejection: WarpRejection) -> Result<impl Reply, Infallible> {
    if rejection.is_not_found() {
        return Ok(warp::reply::with_status(
            warp::reply::json(&json!({"code": "not_found"})),
            StatusCode::NOT_FOUND,
        ));
    }

    if let Some(Rejection(error)) = rejection.find::<Rejection>() {
        let status = error.status_code();
        let body = json!({"code": error.body_code(), "message": error.to_string()});
        return Ok(warp::reply::with_status(warp::reply::json(&body), status));
    }

    Ok(warp::reply::with_status(
        warp::reply::json(&json!({"code": "bad_request"})),
        StatusCode::BAD_REQUEST,
    ))
}
