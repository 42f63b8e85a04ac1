use std::fmt;
use std::sync::Arc;

use tracing::warn;

use super::native::NativeQueue;
use super::TransportError;

/// One URL prefix registered with a native queue.
///
/// The prefix is removed again when the binding is dropped.
pub struct UrlBinding {
    native: Arc<dyn NativeQueue>,
    prefix: String,
}

impl UrlBinding {
    pub fn new(native: Arc<dyn NativeQueue>, prefix: &str) -> Result<Self, TransportError> {
        native.add_url(prefix)?;
        Ok(Self {
            native,
            prefix: prefix.to_owned(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl fmt::Debug for UrlBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlBinding")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl Drop for UrlBinding {
    fn drop(&mut self) {
        if let Err(err) = self.native.remove_url(&self.prefix) {
            warn!(prefix = %self.prefix, error = %err, "failed to remove URL prefix");
        }
    }
}
