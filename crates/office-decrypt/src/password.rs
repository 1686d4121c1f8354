//! One-shot password acquisition.

use std::convert::Infallible;
use std::future::Future;

use zeroize::Zeroizing;

/// Supplies the document password.
///
/// The provider is consumed by value, so a decryption attempt can ask for the password at most
/// once. Any async closure `FnOnce() -> impl Future<Output = Result<String, E>>` is a provider.
pub trait PasswordProvider {
    type Error: std::error::Error + Send + Sync + 'static;

    fn password(self) -> impl Future<Output = Result<String, Self::Error>>;
}

impl<F, Fut, E> PasswordProvider for F
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<String, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    type Error = E;

    fn password(self) -> impl Future<Output = Result<String, E>> {
        self()
    }
}

/// A password known up front.
#[derive(Clone)]
pub struct FixedPassword(Zeroizing<String>);

impl FixedPassword {
    pub fn new(password: impl Into<String>) -> Self {
        Self(Zeroizing::new(password.into()))
    }
}

impl std::fmt::Debug for FixedPassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FixedPassword(..)")
    }
}

impl PasswordProvider for FixedPassword {
    type Error = Infallible;

    async fn password(self) -> Result<String, Infallible> {
        Ok(self.0.as_str().to_owned())
    }
}
