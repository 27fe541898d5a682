//! Response decoders, one per endpoint.
//!
//! Every successful body is a `{ "data": ... }` envelope, except the like toggle, which is a bare
//! `{ "liked": bool, "likes_count": u32 }`, and deletes and favourites, which carry no body worth reading. A body that
//! does not match the contract of its endpoint is an [`ApiError::Parse`]; nothing here guesses at alternative shapes.
use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::ApiError;
use crate::types::LikeState;

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    errors:  BTreeMap<String, Vec<String>>,
}

/// Decode a `{ "data": T }` body.
pub fn data<T>(endpoint: &'static str, body: &[u8]) -> Result<T, ApiError>
where
    T: DeserializeOwned,
{
    serde_json::from_slice::<Envelope<T>>(body)
        .map(|envelope| envelope.data)
        .map_err(|err| ApiError::Parse {
            endpoint,
            message: err.to_string(),
        })
}

/// Decode the body of `POST /reviews/{id}/like`.
pub fn like(body: &[u8]) -> Result<LikeState, ApiError> {
    serde_json::from_slice::<LikeState>(body).map_err(|err| ApiError::Parse {
        endpoint: "toggle_like",
        message:  err.to_string(),
    })
}

/// Map a non-success response to an error. `status` is expected to be outside `2xx`.
pub fn error(status: u16, body: &[u8]) -> ApiError {
    // An error body that fails to parse still tells us the status; the message is then the status alone.
    let body = serde_json::from_slice::<ErrorBody>(body).unwrap_or_default();
    let message = body.message.unwrap_or_else(|| format!("HTTP {status}"));

    match status {
        401 | 403 => ApiError::Auth { status, message },
        422 => ApiError::Validation {
            message,
            fields: body.errors,
        },
        _ => ApiError::Server { status, message },
    }
}
