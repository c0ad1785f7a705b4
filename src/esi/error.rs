use serde::Deserialize;
use thiserror::Error;

/// Failures the sync engine needs to tell apart.
#[derive(Debug, Error)]
pub enum EsiError {
  /// The access token was rejected.
  #[error("{endpoint}: access token rejected (HTTP {status})")]
  Unauthorized { endpoint: String, status: u16 },

  /// The token is valid but lacks a scope or in-game role.
  #[error("{endpoint}: forbidden: {message}")]
  Forbidden { endpoint: String, message: String },

  /// The acting character has left the corporation.
  #[error("{endpoint}: character is not in the corporation")]
  NotInCorporation { endpoint: String },

  #[error("{endpoint}: HTTP {status}: {message}")]
  Status {
    endpoint: String,
    status: u16,
    message: String,
  },

  #[error("{endpoint}: request failed: {source}")]
  Transport {
    endpoint: String,
    #[source]
    source: reqwest::Error,
  },

  #[error("{endpoint}: invalid response body: {source}")]
  Decode {
    endpoint: String,
    #[source]
    source: serde_json::Error,
  },
}

#[derive(Deserialize)]
struct ErrorBody {
  error: String,
}

impl EsiError {
  /// Classify a non-success response.
  pub fn from_response(endpoint: &str, status: u16, body: &[u8]) -> Self {
    let message = serde_json::from_slice::<ErrorBody>(body)
      .map(|b| b.error)
      .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string());
    let endpoint = endpoint.to_string();

    if message
      .to_lowercase()
      .contains("not in the corporation")
    {
      return Self::NotInCorporation { endpoint };
    }

    match status {
      401 => Self::Unauthorized { endpoint, status },
      403 => Self::Forbidden { endpoint, message },
      _ => Self::Status {
        endpoint,
        status,
        message,
      },
    }
  }
}
