//! Response capture and replay.
//!
//! [`capture`] buffers the handler's response body so its status, content
//! type and bytes can be recorded, then hands back an equivalent response for
//! the client. [`replay`] rebuilds a response from a recorded one.

use axum::{
    body::Body,
    http::{header, HeaderValue, StatusCode},
    response::Response,
};
use bytes::BytesMut;
use futures::{stream, StreamExt};
use http_body_util::BodyExt;
use thiserror::Error;

use super::record::StoredResponse;
use super::REPLAYED_HEADER;

/// Errors from capturing a response body.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The handler's body stream failed part-way.
    #[error("failed to read response body: {0}")]
    Body(String),
}

/// A response observed on its way to the client.
pub struct Captured {
    /// The response to send, with the buffered body re-attached.
    pub response: Response,
    /// What should be recorded, or `None` if the body exceeded the record limit.
    pub recordable: Option<StoredResponse>,
}

/// Buffer `response` and describe it for recording.
///
/// At most `max_record_bytes + 1` bytes are buffered. A larger body is sent to
/// the client as the buffered prefix followed by the rest of the original
/// stream, and is not offered for recording.
///
/// # Errors
///
/// Returns [`CaptureError::Body`] if the body stream yields an error before
/// the record limit is passed.
pub async fn capture(response: Response, max_record_bytes: usize) -> Result<Captured, CaptureError> {
    let (parts, mut body) = response.into_parts();
    let mut buffered = BytesMut::new();

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| CaptureError::Body(e.to_string()))?;
        // Trailers are not recorded.
        let Ok(data) = frame.into_data() else {
            continue;
        };
        buffered.extend_from_slice(&data);
        if buffered.len() > max_record_bytes {
            let head = buffered.freeze();
            let rest = stream::once(async move { Ok::<_, axum::Error>(head) })
                .chain(body.into_data_stream());
            return Ok(Captured {
                response: Response::from_parts(parts, Body::from_stream(rest)),
                recordable: None,
            });
        }
    }

    let bytes = buffered.freeze();
    let recordable = Some(StoredResponse {
        status: parts.status.as_u16(),
        content_type: parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned),
        body: bytes.clone(),
    });

    Ok(Captured {
        response: Response::from_parts(parts, Body::from(bytes)),
        recordable,
    })
}

/// Rebuild the recorded response, marked as a replay.
pub fn replay(stored: &StoredResponse) -> Response {
    let mut response = Response::new(Body::from(stored.body.clone()));
    *response.status_mut() =
        StatusCode::from_u16(stored.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if let Some(ct) = stored
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, ct);
    }
    response
        .headers_mut()
        .insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    response
}
