//! Channel and API request signatures.
//!
//! Private and presence subscriptions carry `key:signature`, where the
//! signature is a hex HMAC-SHA256 keyed with the app secret over
//! `socket_id:channel[:channel_data]`. HTTP API calls are signed over the
//! method, path and sorted query string, and POST bodies are pinned by the
//! signed `body_md5` parameter. Signature comparisons run in constant time
//! through [`Mac::verify_slice`].

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha2::Sha256;
use thiserror::Error;

use crate::app::App;

type HmacSha256 = Hmac<Sha256>;

/// Accepted clock skew for signed API requests, in seconds.
pub const API_TIMESTAMP_TOLERANCE_SECS: u64 = 600;

/// API authentication failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApiAuthError {
    /// A required `auth_*` parameter is absent.
    #[error("Missing parameter: {0}")]
    MissingParam(&'static str),

    /// `auth_key` names another app.
    #[error("Unknown auth key")]
    KeyMismatch,

    /// `auth_timestamp` is malformed or outside the accepted window.
    #[error("Timestamp expired")]
    Expired,

    /// The signature does not match.
    #[error("Invalid signature")]
    BadSignature,

    /// `body_md5` does not match the received body.
    #[error("Body does not match body_md5")]
    BodyMismatch,
}

fn mac_for(secret: &str) -> Option<HmacSha256> {
    HmacSha256::new_from_slice(secret.as_bytes()).ok()
}

/// Hex HMAC-SHA256 of `message` keyed with `secret`.
#[must_use]
pub fn sign(secret: &str, message: &str) -> String {
    match mac_for(secret) {
        Some(mut mac) => {
            mac.update(message.as_bytes());
            hex::encode(mac.finalize().into_bytes())
        }
        None => String::new(),
    }
}

fn verify_hex(secret: &str, message: &str, signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Some(mut mac) = mac_for(secret) else {
        return false;
    };
    mac.update(message.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

fn channel_string(socket_id: &str, channel: &str, channel_data: Option<&str>) -> String {
    match channel_data {
        Some(data) => format!("{socket_id}:{channel}:{data}"),
        None => format!("{socket_id}:{channel}"),
    }
}

/// Produce the `auth` value a client must send to join `channel`.
#[must_use]
pub fn sign_channel(app: &App, socket_id: &str, channel: &str, channel_data: Option<&str>) -> String {
    let signature = sign(&app.secret, &channel_string(socket_id, channel, channel_data));
    format!("{}:{}", app.key, signature)
}

/// Check a subscription signature.
///
/// Any deviation (wrong key, malformed hex, altered byte) fails.
#[must_use]
pub fn verify(
    app: &App,
    channel: &str,
    socket_id: &str,
    provided: &str,
    channel_data: Option<&str>,
) -> bool {
    let Some((key, signature)) = provided.split_once(':') else {
        return false;
    };
    if key != app.key {
        return false;
    }
    verify_hex(
        &app.secret,
        &channel_string(socket_id, channel, channel_data),
        signature,
    )
}

fn api_string(method: &str, path: &str, params: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, &str)> = params
        .iter()
        .filter(|(k, _)| k != "auth_signature")
        .map(|(k, v)| (k.to_ascii_lowercase(), v.as_str()))
        .collect();
    pairs.sort();
    let query = pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}\n{}\n{}", method.to_ascii_uppercase(), path, query)
}

/// Compute `auth_signature` for an API request.
#[must_use]
pub fn sign_api_request(app: &App, method: &str, path: &str, params: &[(String, String)]) -> String {
    sign(&app.secret, &api_string(method, path, params))
}

fn param<'a>(params: &'a [(String, String)], name: &'static str) -> Result<&'a str, ApiAuthError> {
    params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
        .ok_or(ApiAuthError::MissingParam(name))
}

/// Authenticate a signed HTTP API request.
///
/// `now_secs` is the current Unix time in seconds.
///
/// # Errors
///
/// Returns the first check that failed.
pub fn verify_api_request(
    app: &App,
    method: &str,
    path: &str,
    params: &[(String, String)],
    now_secs: u64,
) -> Result<(), ApiAuthError> {
    let key = param(params, "auth_key")?;
    let timestamp = param(params, "auth_timestamp")?;
    let signature = param(params, "auth_signature")?;

    if key != app.key {
        return Err(ApiAuthError::KeyMismatch);
    }

    let timestamp: u64 = timestamp.parse().map_err(|_| ApiAuthError::Expired)?;
    if now_secs.abs_diff(timestamp) > API_TIMESTAMP_TOLERANCE_SECS {
        return Err(ApiAuthError::Expired);
    }

    if verify_hex(&app.secret, &api_string(method, path, params), signature) {
        Ok(())
    } else {
        Err(ApiAuthError::BadSignature)
    }
}

/// Hex MD5 of a request body, as carried in `body_md5`.
#[must_use]
pub fn body_md5(body: &[u8]) -> String {
    hex::encode(Md5::digest(body))
}

/// Check that a request body is the one the signature was made for.
///
/// Only meaningful after [`verify_api_request`] accepted `params`, since
/// that is what makes `body_md5` trustworthy.
///
/// # Errors
///
/// Returns an error if `body_md5` is absent or differs from the body's digest.
pub fn verify_body(params: &[(String, String)], body: &[u8]) -> Result<(), ApiAuthError> {
    let expected = param(params, "body_md5")?;
    if expected.eq_ignore_ascii_case(&body_md5(body)) {
        Ok(())
    } else {
        Err(ApiAuthError::BodyMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> App {
        App::new("1", "278d425bdf160c739803", "7ad3773142a6692b25b8")
    }

    #[test]
    fn test_known_private_signature() {
        // Reference values published with the Pusher authentication docs.
        let auth = sign_channel(&app(), "1234.1234", "private-foobar", None);
        assert_eq!(
            auth,
            "278d425bdf160c739803:58df8b0c36d6982b82c3ecf6b4662e34fe8c25bba48f5369f135bf843651c3a4"
        );
        assert!(verify(&app(), "private-foobar", "1234.1234", &auth, None));
    }

    #[test]
    fn test_presence_signature_covers_channel_data() {
        let data = r#"{"user_id":10,"user_info":{"name":"Mr. Channels"}}"#;
        let auth = sign_channel(&app(), "1234.1234", "presence-foobar", Some(data));
        assert!(verify(&app(), "presence-foobar", "1234.1234", &auth, Some(data)));
        assert!(!verify(&app(), "presence-foobar", "1234.1234", &auth, Some("{}")));
        assert!(!verify(&app(), "presence-foobar", "1234.1234", &auth, None));
    }

    #[test]
    fn test_any_altered_byte_is_rejected() {
        let auth = sign_channel(&app(), "1.2", "private-orders", None);
        let bytes = auth.as_bytes();
        for i in 0..bytes.len() {
            let mut altered = bytes.to_vec();
            altered[i] = if altered[i] == b'0' { b'1' } else { b'0' };
            let altered = String::from_utf8(altered).unwrap();
            assert!(
                !verify(&app(), "private-orders", "1.2", &altered, None),
                "byte {i} altered but still accepted"
            );
        }
    }

    #[test]
    fn test_wrong_context_rejected() {
        let auth = sign_channel(&app(), "1.2", "private-orders", None);
        assert!(!verify(&app(), "private-orders", "1.3", &auth, None));
        assert!(!verify(&app(), "private-other", "1.2", &auth, None));
        assert!(!verify(&app(), "private-orders", "1.2", "garbage", None));
        assert!(!verify(&app(), "private-orders", "1.2", "", None));
    }

    fn signed_params(app: &App, path: &str, timestamp: u64) -> Vec<(String, String)> {
        let mut params = vec![
            ("auth_key".to_string(), app.key.clone()),
            ("auth_timestamp".to_string(), timestamp.to_string()),
            ("auth_version".to_string(), "1.0".to_string()),
        ];
        let signature = sign_api_request(app, "POST", path, &params);
        params.push(("auth_signature".to_string(), signature));
        params
    }

    #[test]
    fn test_api_request_signature() {
        let app = app();
        let params = signed_params(&app, "/apps/1/events", 1_000_000);
        assert_eq!(
            verify_api_request(&app, "POST", "/apps/1/events", &params, 1_000_100),
            Ok(())
        );
        assert_eq!(
            verify_api_request(&app, "POST", "/apps/1/batch_events", &params, 1_000_100),
            Err(ApiAuthError::BadSignature)
        );
        assert_eq!(
            verify_api_request(&app, "POST", "/apps/1/events", &params, 1_000_601),
            Err(ApiAuthError::Expired)
        );
    }

    #[test]
    fn test_api_request_missing_and_foreign_key() {
        let app = app();
        assert_eq!(
            verify_api_request(&app, "GET", "/apps/1/channels", &[], 0),
            Err(ApiAuthError::MissingParam("auth_key"))
        );

        let other = App::new("2", "other-key", "other-secret");
        let params = signed_params(&other, "/apps/1/events", 10);
        assert_eq!(
            verify_api_request(&app, "POST", "/apps/1/events", &params, 10),
            Err(ApiAuthError::KeyMismatch)
        );
    }

    #[test]
    fn test_body_md5() {
        let body = br#"{"name":"e","channel":"c","data":"x"}"#;
        let params = vec![("body_md5".to_string(), body_md5(body))];
        assert_eq!(verify_body(&params, body), Ok(()));
        assert_eq!(
            verify_body(&params, br#"{"name":"e","channel":"c","data":"y"}"#),
            Err(ApiAuthError::BodyMismatch)
        );
        assert_eq!(verify_body(&[], body), Err(ApiAuthError::MissingParam("body_md5")));
        assert_eq!(body_md5(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }
}
