//! Sleep provider implementations

use std::time::Duration;

/// Future returned by a [`SleepProvider`]
#[cfg(target_arch = "wasm32")]
pub type SleepFuture = futures::future::LocalBoxFuture<'static, ()>;

/// Future returned by a [`SleepProvider`]
#[cfg(not(target_arch = "wasm32"))]
pub type SleepFuture = futures::future::BoxFuture<'static, ()>;

/// Source of retry delays
pub trait SleepProvider: Send + Sync {
    /// Resolve after `duration`
    fn sleep(&self, duration: Duration) -> SleepFuture;
}

/// Timer backed by the platform: browser timers on wasm32, tokio elsewhere
///
/// On native targets the tokio timer is used when `sleep` is called inside
/// a tokio runtime. Under any other executor `futures-timer` drives the
/// delay, so callers are not tied to tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeSleeper;

impl SleepProvider for RuntimeSleeper {
    fn sleep(&self, duration: Duration) -> SleepFuture {
        #[cfg(target_arch = "wasm32")]
        {
            Box::pin(gloo_timers::future::sleep(duration))
        }
        #[cfg(not(target_arch = "wasm32"))]
        {
            if duration.is_zero() {
                return Box::pin(futures::future::ready(()));
            }
            // Outside tokio there is no reactor to register a timer with
            match tokio::runtime::Handle::try_current() {
                Ok(_) => Box::pin(tokio::time::sleep(duration)),
                Err(_) => Box::pin(futures_timer::Delay::new(duration)),
            }
        }
    }
}

/// Sleeper that completes immediately (tests and bounded policies)
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateSleeper;

impl SleepProvider for ImmediateSleeper {
    fn sleep(&self, _duration: Duration) -> SleepFuture {
        Box::pin(futures::future::ready(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_sleep_completes() {
        futures::executor::block_on(ImmediateSleeper.sleep(Duration::from_secs(3600)));
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn test_runtime_sleep_waits() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let before = web_time::Instant::now();
        rt.block_on(async { RuntimeSleeper.sleep(Duration::from_millis(10)).await });
        assert!(before.elapsed() >= Duration::from_millis(8));
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn test_runtime_sleep_outside_tokio() {
        let before = web_time::Instant::now();
        futures::executor::block_on(RuntimeSleeper.sleep(Duration::from_millis(10)));
        assert!(before.elapsed() >= Duration::from_millis(8));
    }
}
