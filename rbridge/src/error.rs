use thiserror::Error;

/// Outcome of a failed request, independent of the protocol that carried it.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("transport error, {0}")]
    Transport(anyhow::Error),

    #[error("authentication/authorization fault, {0}")]
    AuthFault(anyhow::Error),

    #[error("not authenticated")]
    Unauthenticated,

    #[error("not authorized")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("retained store failure, {0}")]
    Store(anyhow::Error),

    #[error("broker failure, {0}")]
    Broker(anyhow::Error),
}

impl GatewayError {
    /// Server-side faults are worth logging loudly; the rest are ordinary request outcomes.
    #[inline]
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            GatewayError::Transport(_)
                | GatewayError::AuthFault(_)
                | GatewayError::Store(_)
                | GatewayError::Broker(_)
        )
    }

    /// CoAP response code as `(class, detail)`, e.g. `(4, 4)` for 4.04.
    #[inline]
    pub fn coap_code(&self) -> (u8, u8) {
        match self {
            GatewayError::Unauthenticated => (4, 1),
            GatewayError::Unauthorized => (4, 3),
            GatewayError::NotFound => (4, 4),
            GatewayError::MethodNotAllowed => (4, 5),
            GatewayError::PayloadTooLarge => (4, 13),
            GatewayError::Transport(_)
            | GatewayError::AuthFault(_)
            | GatewayError::Store(_)
            | GatewayError::Broker(_) => (5, 0),
        }
    }

    #[inline]
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Unauthenticated => 401,
            GatewayError::Unauthorized => 403,
            GatewayError::NotFound => 404,
            GatewayError::MethodNotAllowed => 404,
            GatewayError::PayloadTooLarge => 413,
            GatewayError::Transport(_)
            | GatewayError::AuthFault(_)
            | GatewayError::Store(_)
            | GatewayError::Broker(_) => 500,
        }
    }
}
