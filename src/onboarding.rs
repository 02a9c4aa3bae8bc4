//! OAuth device-authorization token polling.
//!
//! During onboarding an operator confirms the device in a browser while the
//! device polls the directory's token endpoint. The HTTP exchange itself is
//! left to the caller behind [`TokenEndpoint`]; this module decodes the
//! answers and runs the polling loop:
//!
//! | answer                        | action                               |
//! |-------------------------------|--------------------------------------|
//! | `200` with `access_token`     | done                                 |
//! | `400` `authorization_pending` | wait `interval`, poll again          |
//! | `400` `slow_down`             | double `interval`, poll again        |
//! | `400` `expired_token`         | fail with [`AuthError::Expired`]     |
//! | `404`                         | fail with [`AuthError::NotAuthorized`] |
//! | anything else                 | fail with [`AuthError::Unexpected`]  |
//!
//! The loop is bounded by [`PollOptions::max_attempts`].

use log::{debug, info, warn};
use serde::Deserialize;
use std::time::Duration;

/// OAuth grant type sent with every token request.
pub const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Why device authorization did not produce a token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("user code expired before the device was confirmed")]
    Expired,
    #[error("authorization not possible (status {status})")]
    NotAuthorized { status: u16 },
    #[error("unexpected token endpoint answer (status {status}): {detail}")]
    Unexpected { status: u16, detail: String },
    #[error("no token after {attempts} polls")]
    TooManyAttempts { attempts: u32 },
    #[error("token endpoint unreachable: {0}")]
    Endpoint(String),
}

/// Answer to `POST /oauth/device_authorizations/authorize`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri_complete: String,
    /// Seconds until `user_code` expires.
    pub expires_in: u64,
    /// Seconds to wait between polls.
    pub interval: u64,
}

impl DeviceAuthorization {
    pub fn from_json(body: &[u8]) -> Result<Self, AuthError> {
        serde_json::from_slice(body).map_err(|e| AuthError::Unexpected {
            status: 200,
            detail: e.to_string(),
        })
    }
}

/// One poll of the token endpoint, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenPoll {
    Granted(String),
    Pending,
    SlowDown,
    Expired,
}

#[derive(Deserialize)]
struct Granted {
    access_token: String,
}

#[derive(Deserialize)]
struct Refused<'a> {
    #[serde(borrow)]
    error: &'a str,
}

impl TokenPoll {
    /// Decodes an HTTP answer from the token endpoint.
    ///
    /// # Errors
    ///
    /// * [`AuthError::NotAuthorized`] - Status 404
    /// * [`AuthError::Unexpected`] - Any other status, or a body that does
    ///   not match the status
    pub fn from_response(status: u16, body: &[u8]) -> Result<Self, AuthError> {
        let unexpected = |detail: String| AuthError::Unexpected { status, detail };
        match status {
            200 => serde_json::from_slice::<Granted>(body)
                .map(|granted| TokenPoll::Granted(granted.access_token))
                .map_err(|e| unexpected(e.to_string())),
            400 => {
                let (refused, _) = serde_json_core::from_slice::<Refused<'_>>(body)
                    .map_err(|e| unexpected(e.to_string()))?;
                match refused.error {
                    "authorization_pending" => Ok(TokenPoll::Pending),
                    "slow_down" => Ok(TokenPoll::SlowDown),
                    "expired_token" => Ok(TokenPoll::Expired),
                    other => Err(unexpected(other.to_owned())),
                }
            }
            404 => Err(AuthError::NotAuthorized { status }),
            _ => Err(unexpected(String::from_utf8_lossy(body).into_owned())),
        }
    }
}

/// The token endpoint as seen by the poller.
pub trait TokenEndpoint {
    /// Exchanges `device_code` for a token, once.
    fn poll_token(&mut self, device_code: &str) -> Result<TokenPoll, AuthError>;
}

impl<F> TokenEndpoint for F
where
    F: FnMut(&str) -> Result<TokenPoll, AuthError>,
{
    fn poll_token(&mut self, device_code: &str) -> Result<TokenPoll, AuthError> {
        self(device_code)
    }
}

/// Bounds of the polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub max_attempts: u32,
    /// Upper limit for the interval after repeated `slow_down` answers.
    pub max_interval: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            max_attempts: 120,
            max_interval: Duration::from_secs(60),
        }
    }
}

/// Polls `endpoint` until the operator confirms the device.
///
/// `sleep` is called before every poll with the current interval, so tests
/// can run without waiting.
pub fn poll_for_token<E, S>(
    endpoint: &mut E,
    authorization: &DeviceAuthorization,
    options: PollOptions,
    mut sleep: S,
) -> Result<String, AuthError>
where
    E: TokenEndpoint + ?Sized,
    S: FnMut(Duration),
{
    info!(
        "confirm this device at {} with code {} within {}s",
        authorization.verification_uri_complete, authorization.user_code, authorization.expires_in
    );
    let mut interval = Duration::from_secs(authorization.interval);

    for attempt in 1..=options.max_attempts {
        sleep(interval);
        match endpoint.poll_token(&authorization.device_code)? {
            TokenPoll::Granted(token) => {
                info!("device authorized after {attempt} polls");
                return Ok(token);
            }
            TokenPoll::Pending => debug!("authorization pending"),
            TokenPoll::SlowDown => {
                interval = interval.saturating_mul(2).min(options.max_interval);
                warn!("polling too fast, interval now {}s", interval.as_secs());
            }
            TokenPoll::Expired => return Err(AuthError::Expired),
        }
    }
    Err(AuthError::TooManyAttempts {
        attempts: options.max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_token_endpoint_answers() {
        assert_eq!(
            TokenPoll::from_response(200, br#"{"access_token":"abc","token_type":"bearer"}"#),
            Ok(TokenPoll::Granted("abc".into()))
        );
        assert_eq!(
            TokenPoll::from_response(400, br#"{"error":"authorization_pending"}"#),
            Ok(TokenPoll::Pending)
        );
        assert_eq!(
            TokenPoll::from_response(400, br#"{"error":"slow_down"}"#),
            Ok(TokenPoll::SlowDown)
        );
        assert_eq!(
            TokenPoll::from_response(400, br#"{"error":"expired_token"}"#),
            Ok(TokenPoll::Expired)
        );
        assert_eq!(
            TokenPoll::from_response(404, b""),
            Err(AuthError::NotAuthorized { status: 404 })
        );
        assert!(matches!(
            TokenPoll::from_response(500, b"oops"),
            Err(AuthError::Unexpected { status: 500, .. })
        ));
    }

    #[test]
    fn decodes_device_authorization() {
        let authorization = DeviceAuthorization::from_json(
            br#"{"device_code":"dc","user_code":"UC-1","verification_uri_complete":"https://example.test/d?c=UC-1","expires_in":600,"interval":5}"#,
        )
        .unwrap();
        assert_eq!(authorization.interval, 5);
        assert_eq!(authorization.device_code, "dc");
    }
}
