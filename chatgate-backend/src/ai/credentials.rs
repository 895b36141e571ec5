//! Resolve a model to an upstream endpoint and plaintext secret.
//!
//! Resolution happens on every call and is never cached, so rotated keys take
//! effect on the next request.

use std::sync::Arc;
use thiserror::Error;

use crate::crypto::SecretCipher;
use crate::db::Database;
use crate::models::AiModel;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("model {0} not found")]
    ModelNotFound(i64),
    #[error("provider {0} not found")]
    ProviderNotFound(i64),
    #[error("model {0} has neither its own credentials nor a provider")]
    MissingCredentials(i64),
    /// Key rotation problems surface here, separate from lookups
    #[error("could not decrypt secret of {owner}: {reason}")]
    Decryption { owner: String, reason: String },
    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Model,
    Provider(i64),
}

#[derive(Debug, Clone)]
pub struct ResolvedCredentials {
    pub endpoint: String,
    pub secret: String,
    pub source: CredentialSource,
}

/// A model together with the credentials valid for this one call
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    pub model: AiModel,
    pub credentials: ResolvedCredentials,
}

#[derive(Clone)]
pub struct CredentialResolver {
    db: Arc<Database>,
    cipher: Arc<dyn SecretCipher>,
}

impl CredentialResolver {
    pub fn new(db: Arc<Database>, cipher: Arc<dyn SecretCipher>) -> Self {
        Self { db, cipher }
    }

    pub fn resolve(&self, model_id: i64) -> Result<ResolvedModel, CredentialError> {
        let model = self
            .db
            .get_model(model_id)?
            .ok_or(CredentialError::ModelNotFound(model_id))?;
        self.resolve_model(model)
    }

    pub fn resolve_model(&self, model: AiModel) -> Result<ResolvedModel, CredentialError> {
        let credentials = if model.has_own_credentials() {
            let endpoint = model.endpoint.clone().unwrap_or_default();
            let sealed = model.encrypted_api_key.as_deref().unwrap_or_default();
            ResolvedCredentials {
                endpoint: endpoint.trim().to_string(),
                secret: self.open(sealed, || format!("model {}", model.id))?,
                source: CredentialSource::Model,
            }
        } else if let Some(provider_id) = model.provider_id {
            let provider = self
                .db
                .get_provider(provider_id)?
                .ok_or(CredentialError::ProviderNotFound(provider_id))?;
            ResolvedCredentials {
                endpoint: provider.endpoint.trim().to_string(),
                secret: self.open(&provider.encrypted_api_key, || {
                    format!("provider {}", provider_id)
                })?,
                source: CredentialSource::Provider(provider_id),
            }
        } else {
            return Err(CredentialError::MissingCredentials(model.id));
        };

        log::debug!(
            "[CREDENTIALS] Model {} resolved via {:?}",
            model.id,
            credentials.source
        );

        Ok(ResolvedModel { model, credentials })
    }

    fn open(&self, sealed: &str, owner: impl Fn() -> String) -> Result<String, CredentialError> {
        self.cipher.decrypt(sealed).map_err(|e| {
            let owner = owner();
            log::error!("[CREDENTIALS] Decryption failed for {}: {}", owner, e);
            CredentialError::Decryption {
                owner,
                reason: e.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{tests::TEST_KEY, EciesCipher};
    use crate::models::NewModel;

    fn setup() -> (Arc<Database>, Arc<EciesCipher>, CredentialResolver) {
        let db = Arc::new(Database::in_memory().unwrap());
        let cipher = Arc::new(EciesCipher::from_hex(TEST_KEY).unwrap());
        let resolver = CredentialResolver::new(db.clone(), cipher.clone());
        (db, cipher, resolver)
    }

    fn new_model(endpoint: Option<&str>, provider_id: Option<i64>) -> NewModel {
        NewModel {
            name: "Test".to_string(),
            model_name: "gpt-test".to_string(),
            endpoint: endpoint.map(str::to_string),
            provider_id,
            is_active: true,
            supports_streaming: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_model_level_credentials_win() {
        let (db, cipher, resolver) = setup();
        let provider_key = cipher.encrypt("provider-key").unwrap();
        let provider = db.create_provider("shared", "https://shared", &provider_key).unwrap();

        let own_key = cipher.encrypt("model-key").unwrap();
        let model = db
            .create_model(&new_model(Some("https://own"), Some(provider.id)), Some(&own_key))
            .unwrap();

        let resolved = resolver.resolve(model.id).unwrap();
        assert_eq!(resolved.credentials.source, CredentialSource::Model);
        assert_eq!(resolved.credentials.endpoint, "https://own");
        assert_eq!(resolved.credentials.secret, "model-key");
    }

    #[test]
    fn test_falls_back_to_provider() {
        let (db, cipher, resolver) = setup();
        let key = cipher.encrypt("provider-key").unwrap();
        let provider = db.create_provider("shared", "https://shared", &key).unwrap();
        // Endpoint without a secret does not count as own credentials
        let model = db
            .create_model(&new_model(Some("https://own"), Some(provider.id)), None)
            .unwrap();

        let resolved = resolver.resolve(model.id).unwrap();
        assert_eq!(resolved.credentials.source, CredentialSource::Provider(provider.id));
        assert_eq!(resolved.credentials.endpoint, "https://shared");
        assert_eq!(resolved.credentials.secret, "provider-key");
    }

    #[test]
    fn test_errors_are_distinct() {
        let (db, _cipher, resolver) = setup();
        assert!(matches!(resolver.resolve(99), Err(CredentialError::ModelNotFound(99))));

        let bare = db.create_model(&new_model(None, None), None).unwrap();
        assert!(matches!(
            resolver.resolve(bare.id),
            Err(CredentialError::MissingCredentials(_))
        ));

        let rotated = db
            .create_model(&new_model(Some("https://own"), None), Some("c2VhbGVkIHdpdGggYW4gb2xkIGtleQ=="))
            .unwrap();
        assert!(matches!(
            resolver.resolve(rotated.id),
            Err(CredentialError::Decryption { .. })
        ));
    }
}
