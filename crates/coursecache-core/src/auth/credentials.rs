use anyhow::{Context, Result};
use keyring::Entry;

const SERVICE_NAME: &str = "coursecache";

/// Where web service tokens are kept, keyed by site id.
pub trait TokenStore: Send + Sync {
    fn store_token(&self, site_id: &str, token: &str) -> Result<()>;

    fn get_token(&self, site_id: &str) -> Result<String>;

    /// Delete the stored token. A missing entry is not an error.
    fn delete(&self, site_id: &str) -> Result<()>;
}

/// Tokens in the OS keychain.
pub struct CredentialStore;

impl TokenStore for CredentialStore {
    fn store_token(&self, site_id: &str, token: &str) -> Result<()> {
        let entry = Entry::new(SERVICE_NAME, site_id).context("Failed to create keyring entry")?;
        entry
            .set_password(token)
            .context("Failed to store token in keychain")?;
        Ok(())
    }

    fn get_token(&self, site_id: &str) -> Result<String> {
        let entry = Entry::new(SERVICE_NAME, site_id).context("Failed to create keyring entry")?;
        entry
            .get_password()
            .context("Failed to retrieve token from keychain")
    }

    fn delete(&self, site_id: &str) -> Result<()> {
        let entry = Entry::new(SERVICE_NAME, site_id).context("Failed to create keyring entry")?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete token from keychain"),
        }
    }
}
