//! Optional parameters accepted by the chain composer.
//!
//! Callers pass a list of option closures; unknown concerns simply have
//! no constructor here. The only recognised option is the quota key
//! override threaded into the per-API rate-limit stage.

/// Resolved composer options.
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    pub quota_key: String,
}

/// One option applied onto [`ProcessOptions`].
pub type ProcessOption = Box<dyn FnOnce(&mut ProcessOptions) + Send>;

/// Fold the option list over the defaults.
pub fn build_options(opts: Vec<ProcessOption>) -> ProcessOptions {
    let mut options = ProcessOptions::default();
    for opt in opts {
        opt(&mut options);
    }
    options
}

/// Override the quota counter key for the per-API rate limiter.
pub fn with_quota_key(key: impl Into<String>) -> ProcessOption {
    let key = key.into();
    Box::new(move |options| options.quota_key = key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_override() {
        assert_eq!(build_options(Vec::new()).quota_key, "");

        let options = build_options(vec![with_quota_key("org:abc")]);
        assert_eq!(options.quota_key, "org:abc");
    }

    #[test]
    fn test_last_option_wins() {
        let options = build_options(vec![with_quota_key("a"), with_quota_key("b")]);
        assert_eq!(options.quota_key, "b");
    }
}
