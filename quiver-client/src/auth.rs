//! Authentication providers and the shared client credential

use crate::config::ClientConfig;
use crate::endpoint::Endpoint;
use crate::error::ClientError;
use crate::tls::BrokerTlsConnector;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;

/// Supplies the method name and payload sent in the `Connect` frame
pub trait Authentication: Send + Sync + std::fmt::Debug {
    fn method_name(&self) -> &str;

    /// Called on every connect attempt
    fn auth_data(&self) -> Result<Bytes, ClientError>;
}

/// Anonymous access
#[derive(Debug, Default)]
pub struct NoAuthentication;

impl Authentication for NoAuthentication {
    fn method_name(&self) -> &str {
        "none"
    }

    fn auth_data(&self) -> Result<Bytes, ClientError> {
        Ok(Bytes::new())
    }
}

#[derive(Debug)]
enum TokenSource {
    Inline(String),
    File(PathBuf),
}

/// Bearer-token authentication
#[derive(Debug)]
pub struct TokenAuthentication {
    source: TokenSource,
}

impl TokenAuthentication {
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self {
            source: TokenSource::Inline(token.into()),
        }
    }

    /// Read the token from `path` on every connect so rotated tokens are picked up
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            source: TokenSource::File(path.into()),
        }
    }
}

impl Authentication for TokenAuthentication {
    fn method_name(&self) -> &str {
        "token"
    }

    fn auth_data(&self) -> Result<Bytes, ClientError> {
        let token = match &self.source {
            TokenSource::Inline(token) => token.trim().to_string(),
            TokenSource::File(path) => std::fs::read_to_string(path)
                .map_err(|e| {
                    ClientError::auth(format!("cannot read token file {}: {}", path.display(), e))
                })?
                .trim()
                .to_string(),
        };

        if token.is_empty() {
            return Err(ClientError::auth("empty authentication token"));
        }
        Ok(Bytes::from(token))
    }
}

/// Authentication provider plus trust anchors, owned by the client and
/// shared read-only with every connection it opens
#[derive(Debug, Clone)]
pub struct Credential {
    authentication: Arc<dyn Authentication>,
    tls: Option<BrokerTlsConnector>,
}

impl Credential {
    pub fn new(authentication: Arc<dyn Authentication>, tls: Option<BrokerTlsConnector>) -> Self {
        Self {
            authentication,
            tls,
        }
    }

    /// Build the credential described by a client configuration
    pub fn from_config(config: &ClientConfig) -> Result<Self, ClientError> {
        let authentication: Arc<dyn Authentication> =
            match (&config.auth_token, &config.auth_token_file) {
                (Some(token), _) => Arc::new(TokenAuthentication::new(token.clone())),
                (None, Some(path)) => Arc::new(TokenAuthentication::from_file(path.clone())),
                (None, None) => Arc::new(NoAuthentication),
            };

        let tls = match &config.tls_trust_certs_file_path {
            Some(path) => Some(BrokerTlsConnector::from_bundle(path)?),
            None => None,
        };

        Ok(Self::new(authentication, tls))
    }

    pub fn authentication(&self) -> &dyn Authentication {
        self.authentication.as_ref()
    }

    /// TLS connector for `endpoint`; errors if the endpoint needs TLS and no trust anchors are configured
    pub fn tls_for(&self, endpoint: &Endpoint) -> Result<Option<&BrokerTlsConnector>, ClientError> {
        if !endpoint.tls {
            return Ok(None);
        }
        self.tls.as_ref().map(Some).ok_or_else(|| {
            ClientError::invalid_config(format!("no trust anchors configured for {}", endpoint))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_inline_token() {
        let auth = TokenAuthentication::new("eyJhbGciOiJSUzI1NiJ9.payload.sig");
        assert_eq!(auth.method_name(), "token");
        assert_eq!(
            auth.auth_data().unwrap(),
            Bytes::from("eyJhbGciOiJSUzI1NiJ9.payload.sig")
        );
    }

    #[test]
    fn test_empty_token_rejected() {
        let auth = TokenAuthentication::new("   ");
        assert!(matches!(auth.auth_data(), Err(ClientError::Auth { .. })));
    }

    #[test]
    fn test_token_file_is_reread() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "first\n").unwrap();

        let auth = TokenAuthentication::from_file(&path);
        assert_eq!(auth.auth_data().unwrap(), Bytes::from("first"));

        std::fs::write(&path, "second").unwrap();
        assert_eq!(auth.auth_data().unwrap(), Bytes::from("second"));
    }

    #[test]
    fn test_missing_token_file() {
        let auth = TokenAuthentication::from_file("/nonexistent/token");
        assert!(matches!(auth.auth_data(), Err(ClientError::Auth { .. })));
    }

    #[test]
    fn test_credential_from_config() {
        let config = ClientConfig {
            auth_token: Some("abc".to_string()),
            ..Default::default()
        };
        let credential = Credential::from_config(&config).unwrap();
        assert_eq!(credential.authentication().method_name(), "token");

        let plain = Endpoint::new("localhost", 6650, false);
        assert!(credential.tls_for(&plain).unwrap().is_none());

        let secure = Endpoint::new("localhost", 6651, true);
        assert!(credential.tls_for(&secure).is_err());
    }

    #[test]
    fn test_credential_without_token_is_anonymous() {
        let credential = Credential::from_config(&ClientConfig::default()).unwrap();
        assert_eq!(credential.authentication().method_name(), "none");
    }
}
