//! C4: the status handler, triggered by an empty-body PUT carrying
//! `Content-Range: bytes */<total>` (§4.4). Never mutates state.

use super::Context;
use crate::auth::User;
use crate::error::Error;
use crate::session::UploadIdentifier;
use crate::logging::event;
use http::{Response, StatusCode};
use slog::{debug, o, Logger};
use warp::reply::Response as WarpResponse;

pub async fn handle(
    upload_id: UploadIdentifier,
    user: User,
    ctx: Context,
    logger: Logger,
) -> Result<WarpResponse, Error> {
    let logger = logger.new(o!(event::UPLOAD_ID => upload_id.to_string(), event::IDENTITY => user.id.clone()));
    debug!(logger, "status query");

    let session = match ctx.sessions.get(&upload_id) {
        Some(session) => session,
        None => return Ok(incomplete_response(None)),
    };

    if ctx
        .storage
        .is_stored(
            session.uploadable.device_id,
            session.uploadable.measurement_id,
            session.uploadable.file_type(),
        )
        .await?
    {
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Content-Length", "0")
            .body(hyper::Body::empty())
            .expect("building a static response never fails"));
    }

    let current_size = ctx.storage.bytes_uploaded(upload_id).await?;
    Ok(incomplete_response(current_size))
}

fn incomplete_response(uploaded: Option<u64>) -> WarpResponse {
    let mut builder = Response::builder().status(StatusCode::from_u16(308).unwrap());
    if let Some(size) = uploaded.filter(|size| *size > 0) {
        builder = builder.header("Range", format!("bytes=0-{}", size - 1));
    }
    builder
        .header("Content-Length", "0")
        .body(hyper::Body::empty())
        .expect("building a static response never fails")
}
