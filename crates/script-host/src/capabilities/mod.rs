//! Bundled capability adapters
//!
//! Synchronous adapters (console, crypto, http, store) only install
//! globals. Asynchronous ones (websocket, drawing, timers) also own a queue
//! and the producer threads feeding it.

mod console;
mod crypto;
mod drawing;
mod http;
mod store;
mod timers;
mod websocket;

pub use console::{BufferSink, Console, OutputLevel, OutputSink, TracingSink};
pub use crypto::CryptoLib;
pub use drawing::DrawingLib;
pub use http::HttpLib;
pub use store::StoreLib;
pub use timers::Timers;
pub use websocket::WebSocketLib;

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use crate::{CapabilitySet, Capability, Session, SessionConfig};

    /// Session with only `capability` installed
    pub fn session_with(capability: Box<dyn Capability>) -> Session {
        session_with_config(capability, SessionConfig::default())
    }

    pub fn session_with_config(capability: Box<dyn Capability>, config: SessionConfig) -> Session {
        Session::builder(SessionConfig {
            capabilities: CapabilitySet::none(),
            ..config
        })
        .capability(capability)
        .open()
        .unwrap()
    }

    /// Evaluate `source` and convert the results
    pub fn eval<R: mlua::FromLuaMulti>(session: &Session, source: &str) -> R {
        session.lua().load(source).eval::<R>().unwrap()
    }

    /// Pump until `done` holds or a few seconds pass
    pub fn pump_until(session: &Session, mut done: impl FnMut(&Session) -> bool) -> bool {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            session.pump(64).unwrap();
            if done(session) {
                return true;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        false
    }

    pub fn buffer() -> Arc<super::BufferSink> {
        Arc::new(super::BufferSink::default())
    }
}
