//! HTTP callback hooks. Only the callout shape lives here; the transport
//! that posts to the configured URLs is injected by the host process.

use shared::error::Result;

/// Fired around viewer lifecycles. One call per configured URL.
pub trait HttpHooks {
    fn on_play(&self, url: &str, client_id: &str, stream_url: &str) -> Result<()>;
    fn on_stop(&self, url: &str, client_id: &str, stream_url: &str) -> Result<()>;
}

/// Hooks disabled.
#[derive(Default)]
pub struct NopHooks;

impl HttpHooks for NopHooks {
    fn on_play(&self, _url: &str, _client_id: &str, _stream_url: &str) -> Result<()> {
        Ok(())
    }

    fn on_stop(&self, _url: &str, _client_id: &str, _stream_url: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::cell::RefCell;

    /// Records every hook call for balance assertions.
    #[derive(Default)]
    pub struct RecordingHooks {
        pub plays: RefCell<Vec<String>>,
        pub stops: RefCell<Vec<String>>,
        pub fail_on_play: std::cell::Cell<bool>,
    }

    impl HttpHooks for RecordingHooks {
        fn on_play(&self, url: &str, _client_id: &str, _stream_url: &str) -> Result<()> {
            self.plays.borrow_mut().push(url.to_string());
            if self.fail_on_play.get() {
                return Err(shared::error::Error::Other("on_play rejected".to_string()));
            }
            Ok(())
        }

        fn on_stop(&self, url: &str, _client_id: &str, _stream_url: &str) -> Result<()> {
            self.stops.borrow_mut().push(url.to_string());
            Ok(())
        }
    }
}
