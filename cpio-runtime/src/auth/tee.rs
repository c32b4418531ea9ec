// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::Path;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::UnixStream;
use tracing::debug;

use crate::auth::{AuthTokenError, TokenRecord};

/// The launcher serves this URL on its unix socket; the host part is
/// ignored by it but required for a well-formed request line.
const TEE_TOKEN_URL: &str = "http://localhost/v1/token";

/// Fetches an attestation token from the TEE launcher socket. `reqwest`
/// cannot target unix domain sockets, so this speaks HTTP/1 directly over
/// the stream.
pub(crate) async fn fetch_tee_session_token(
    socket_path: &Path,
    audience: &str,
    token_type: &str,
) -> Result<TokenRecord, AuthTokenError> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|err| AuthTokenError::Socket(format!("connect failed: {err}")))?;

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|err| AuthTokenError::Socket(format!("handshake failed: {err}")))?;
    tokio::spawn(async move {
        if let Err(error) = connection.await {
            debug!(%error, "TEE token connection closed with an error");
        }
    });

    let body = json!({ "audience": audience, "token_type": token_type }).to_string();
    let request = Request::builder()
        .method(Method::POST)
        .uri(TEE_TOKEN_URL)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .map_err(|err| AuthTokenError::Socket(format!("invalid request: {err}")))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|err| AuthTokenError::Socket(format!("request failed: {err}")))?;
    let status = response.status();
    let token = response
        .into_body()
        .collect()
        .await
        .map_err(|err| AuthTokenError::Socket(format!("reading response failed: {err}")))?
        .to_bytes();

    if !status.is_success() {
        return Err(AuthTokenError::Socket(format!(
            "token endpoint returned status {status}"
        )));
    }
    if token.is_empty() {
        return Err(AuthTokenError::EmptyToken);
    }
    let session_token = String::from_utf8(token.to_vec())
        .map_err(|_| AuthTokenError::MalformedToken("token is not valid UTF-8".to_string()))?;

    Ok(TokenRecord {
        session_token,
        expire_time: None,
    })
}
