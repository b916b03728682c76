//! Fuzz test for session configuration parsing
//!
//! Tests that arbitrary TOML input doesn't cause panics when parsed and
//! validated as a session configuration.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_native::SessionConfig;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _: Result<toml::Value, _> = toml::from_str(s);

        if let Ok(config) = toml::from_str::<SessionConfig>(s) {
            if config.validate().is_ok() {
                let _ = config.connect_timeout();
                let _ = config.session_timeout();
            }
        }
    }
});
