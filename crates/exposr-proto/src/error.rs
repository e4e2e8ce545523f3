//! Error codes reported by the broker and raised by the client

use serde::Deserialize;
use std::fmt;

/// Error codes. The first group arrives from the broker as the `error` field
/// of a JSON body; the second group is raised locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    TunnelNotFound,
    TunnelNotConnected,
    TunnelAlreadyConnected,
    TunnelHttpIngressDisabled,
    TunnelTransportRequestLimit,
    TunnelTransportConTimeout,
    TunnelTargetConRefused,
    TunnelTargetConFailed,
    TunnelIngressBadAltNames,
    HttpIngressRequestLoop,
    UnknownServerError,
    BadInput,
    AuthNoAccessToken,
    PermissionDenied,

    Unknown,
    AccountRegistrationDisabled,
    ServerTimeout,
    NoAccount,
    NoTunnel,
    NoTunnelEndpoint,
    NoTunnelTarget,
}

impl ErrorCode {
    /// Map a broker code string. Unrecognized codes become [`ErrorCode::Unknown`].
    pub fn from_code(code: &str) -> Self {
        match code {
            "TUNNEL_NOT_FOUND" => Self::TunnelNotFound,
            "TUNNEL_NOT_CONNECTED" => Self::TunnelNotConnected,
            "TUNNEL_ALREADY_CONNECTED" => Self::TunnelAlreadyConnected,
            "TUNNEL_HTTP_INGRESS_DISABLED" => Self::TunnelHttpIngressDisabled,
            "TUNNEL_TRANSPORT_REQUEST_LIMIT" => Self::TunnelTransportRequestLimit,
            "TUNNEL_TRANSPORT_CON_TIMEOUT" => Self::TunnelTransportConTimeout,
            "TUNNEL_TARGET_CON_RESET" => Self::TunnelTargetConRefused,
            "TUNNEL_TARGET_CON_FAILED" => Self::TunnelTargetConFailed,
            "TUNNEL_INGRESS_BAD_ALT_NAMES" => Self::TunnelIngressBadAltNames,
            "HTTP_INGRESS_REQUEST_LOOP" => Self::HttpIngressRequestLoop,
            "UNKNOWN_ERROR" => Self::UnknownServerError,
            "BAD_INPUT" => Self::BadInput,
            "AUTH_NO_TOKEN" => Self::AuthNoAccessToken,
            "PERMISSION_DENIED" => Self::PermissionDenied,
            _ => Self::Unknown,
        }
    }

    /// Wire name for broker codes, a stable identifier for client codes.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TunnelNotFound => "TUNNEL_NOT_FOUND",
            Self::TunnelNotConnected => "TUNNEL_NOT_CONNECTED",
            Self::TunnelAlreadyConnected => "TUNNEL_ALREADY_CONNECTED",
            Self::TunnelHttpIngressDisabled => "TUNNEL_HTTP_INGRESS_DISABLED",
            Self::TunnelTransportRequestLimit => "TUNNEL_TRANSPORT_REQUEST_LIMIT",
            Self::TunnelTransportConTimeout => "TUNNEL_TRANSPORT_CON_TIMEOUT",
            Self::TunnelTargetConRefused => "TUNNEL_TARGET_CON_RESET",
            Self::TunnelTargetConFailed => "TUNNEL_TARGET_CON_FAILED",
            Self::TunnelIngressBadAltNames => "TUNNEL_INGRESS_BAD_ALT_NAMES",
            Self::HttpIngressRequestLoop => "HTTP_INGRESS_REQUEST_LOOP",
            Self::UnknownServerError => "UNKNOWN_ERROR",
            Self::BadInput => "BAD_INPUT",
            Self::AuthNoAccessToken => "AUTH_NO_TOKEN",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::Unknown => "ERROR_UNKNOWN",
            Self::AccountRegistrationDisabled => "ERROR_ACCOUNT_REGISTRATION_DISABLED",
            Self::ServerTimeout => "ERROR_SERVER_TIMEOUT",
            Self::NoAccount => "ERROR_NO_ACCOUNT",
            Self::NoTunnel => "ERROR_NO_TUNNEL",
            Self::NoTunnelEndpoint => "ERROR_NO_TUNNEL_ENDPOINT",
            Self::NoTunnelTarget => "ERROR_NO_TUNNEL_TARGET",
        }
    }

    /// Human readable message
    pub fn message(&self) -> &'static str {
        match self {
            Self::TunnelNotFound => "Tunnel not found",
            Self::TunnelNotConnected => "Tunnel not connected",
            Self::TunnelAlreadyConnected => "Tunnel already connected",
            Self::TunnelHttpIngressDisabled => "HTTP ingress not enabled for tunnel",
            Self::TunnelTransportRequestLimit => "Tunnel transport concurrent connection limit",
            Self::TunnelTransportConTimeout => "Tunnel transport connection timeout",
            Self::TunnelTargetConRefused => "Target connection refused",
            Self::TunnelTargetConFailed => "Target connection failed",
            Self::TunnelIngressBadAltNames => "Ingress altname can not be configured",
            Self::HttpIngressRequestLoop => "Request loop at ingress",
            Self::UnknownServerError => "Unknown server error",
            Self::BadInput => "Bad input",
            Self::AuthNoAccessToken => "Access token missing",
            Self::PermissionDenied => "Permission denied",
            Self::Unknown => "Unknown error",
            Self::AccountRegistrationDisabled => "Account registration not enabled",
            Self::ServerTimeout => "Timeout",
            Self::NoAccount => "No account was provided",
            Self::NoTunnel => "No tunnel was provided",
            Self::NoTunnelEndpoint => "No tunnel endpoint available",
            Self::NoTunnelTarget => "No tunnel target was provided",
        }
    }

    /// Derive a code from a rejected transport upgrade: the JSON `error`
    /// field when the body carries one, otherwise the status code.
    pub fn from_http_response(status: u16, body: &[u8]) -> Self {
        if let Some(code) = parse_error_body(body) {
            return code;
        }
        match status {
            401 | 403 => Self::PermissionDenied,
            503 => Self::TunnelAlreadyConnected,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

/// Extract the `error` code from a broker JSON error body.
pub fn parse_error_body(body: &[u8]) -> Option<ErrorCode> {
    serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .and_then(|body| body.error)
        .map(|code| ErrorCode::from_code(&code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip_for_broker_codes() {
        for code in [
            ErrorCode::TunnelNotFound,
            ErrorCode::TunnelAlreadyConnected,
            ErrorCode::TunnelTargetConRefused,
            ErrorCode::AuthNoAccessToken,
            ErrorCode::PermissionDenied,
        ] {
            assert_eq!(ErrorCode::from_code(code.as_str()), code);
        }
        assert_eq!(ErrorCode::from_code("SOMETHING_NEW"), ErrorCode::Unknown);
    }

    #[test]
    fn test_body_takes_precedence_over_status() {
        let body = br#"{"error":"TUNNEL_TRANSPORT_REQUEST_LIMIT"}"#;
        assert_eq!(
            ErrorCode::from_http_response(401, body),
            ErrorCode::TunnelTransportRequestLimit
        );
    }

    #[test]
    fn test_status_fallback() {
        assert_eq!(ErrorCode::from_http_response(401, b""), ErrorCode::PermissionDenied);
        assert_eq!(ErrorCode::from_http_response(403, b"<html>"), ErrorCode::PermissionDenied);
        assert_eq!(
            ErrorCode::from_http_response(503, b"{}"),
            ErrorCode::TunnelAlreadyConnected
        );
        assert_eq!(ErrorCode::from_http_response(500, b""), ErrorCode::Unknown);
    }

    #[test]
    fn test_display_uses_message() {
        assert_eq!(ErrorCode::NoTunnelEndpoint.to_string(), "No tunnel endpoint available");
        assert_eq!(ErrorCode::ServerTimeout.to_string(), "Timeout");
    }
}
