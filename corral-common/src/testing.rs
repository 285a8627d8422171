//! Structured test logging.
//!
//! `test_guard!()` installs the global test subscriber on first use and
//! returns a drop guard that logs TEST START on creation and TEST PASS or
//! TEST FAIL (with duration) when dropped, so failed CI runs show which
//! test was executing without extra boilerplate.

use std::sync::Once;
use std::time::Instant;

static INIT: Once = Once::new();

/// Install the tracing subscriber used by tests.
///
/// Safe to call repeatedly; only the first call has any effect. The filter
/// is taken from `CORRAL_TEST_LOG` and defaults to `info`.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_env("CORRAL_TEST_LOG")
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .compact()
            .try_init();
    });
}

/// Drop guard that logs test start and outcome.
pub struct TestGuard {
    test_name: &'static str,
    started: Instant,
}

impl TestGuard {
    pub fn new(test_name: &'static str) -> Self {
        init_test_logging();
        tracing::info!(test = test_name, "TEST START");
        Self {
            test_name,
            started: Instant::now(),
        }
    }
}

impl Drop for TestGuard {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        if std::thread::panicking() {
            tracing::error!(test = self.test_name, elapsed_ms, "TEST FAIL");
        } else {
            tracing::info!(test = self.test_name, elapsed_ms, "TEST PASS");
        }
    }
}

/// Create a [`TestGuard`] named after the enclosing test function.
#[macro_export]
macro_rules! test_guard {
    () => {{
        fn _f() {}
        fn _type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = _type_name_of(_f);
        let name = name.strip_suffix("::_f").unwrap_or(name);
        let name = name.rsplit("::").next().unwrap_or(name);
        $crate::testing::TestGuard::new(name)
    }};
}
