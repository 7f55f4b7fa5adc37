//! C2: the pre-request handler. Validates the `Uploadable`, applies the
//! skip-upload and payload-size policies, checks for a prior completion, and
//! allocates a fresh session (§4.2).

use super::Context;
use crate::auth::User;
use crate::error::Error;
use crate::logging::event;
use crate::model::Uploadable;
use http::{Response, StatusCode};
use slog::{info, o, warn, Logger};
use warp::reply::Response as WarpResponse;

pub struct PreRequest {
    pub uploadable: Uploadable,
    pub declared_content_length: u64,
    pub host: String,
    pub forwarded_proto: Option<String>,
}

pub async fn handle(
    request: PreRequest,
    user: User,
    ctx: Context,
    logger: Logger,
) -> Result<WarpResponse, Error> {
    let logger = logger.new(o!(
        event::DEVICE_ID => request.uploadable.device_id.to_string(),
        event::MEASUREMENT_ID => request.uploadable.measurement_id,
        event::IDENTITY => user.id.clone(),
    ));

    request.uploadable.validate()?;
    request.uploadable.should_skip()?;

    if request.declared_content_length > ctx.config.measurement_payload_limit_bytes {
        warn!(logger, "rejecting pre-request, declared size exceeds limit";
            "declared" => request.declared_content_length,
            "limit" => ctx.config.measurement_payload_limit_bytes);
        ctx.metrics.uploads_finished.with_label_values(&["payload_too_large"]).inc();
        return Err(Error::PayloadTooLarge {
            declared: request.declared_content_length,
            limit: ctx.config.measurement_payload_limit_bytes,
        });
    }

    let already_stored = ctx
        .storage
        .is_stored(
            request.uploadable.device_id,
            request.uploadable.measurement_id,
            request.uploadable.file_type(),
        )
        .await?;
    if already_stored {
        ctx.metrics.uploads_finished.with_label_values(&["duplicate"]).inc();
        return Err(Error::Duplicate);
    }

    let upload_id = ctx.sessions.create(request.uploadable);
    ctx.metrics.uploads_started.inc();
    ctx.metrics.active_sessions.set(ctx.sessions.len() as i64);

    let scheme = request.forwarded_proto.as_deref().unwrap_or("http");
    let location = format!(
        "{scheme}://{}{}/({upload_id})/",
        request.host, ctx.config.http_path
    );

    info!(logger, "created upload session"; event::UPLOAD_ID => upload_id.to_string());

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Location", location)
        .header("Content-Length", "0")
        .body(hyper::Body::empty())
        .expect("building a static response never fails"))
}
