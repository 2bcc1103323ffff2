//! Cheap, polling‑based termination signal handling (lock‑free).

use std::sync::atomic::{AtomicUsize, Ordering};

static RECEIVED_SIGNAL: AtomicUsize = AtomicUsize::new(0);

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub fn install_signal_handlers() -> anyhow::Result<()> {
            use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

            extern "C" fn handler(sig: i32) {
                RECEIVED_SIGNAL.store(sig as usize, Ordering::SeqCst);
            }

            let action = SigAction::new(
                SigHandler::Handler(handler),
                SaFlags::empty(),
                SigSet::empty(),
            );
            for sig in [Signal::SIGINT, Signal::SIGTERM] {
                // SAFETY: the handler only stores into an atomic.
                unsafe { signal::sigaction(sig, &action) }.map_err(|e| {
                    anyhow::anyhow!(
                        "Failed to register {sig} handler: {e}. Signal handling is required to stop the proxy cleanly."
                    )
                })?;
            }
            Ok(())
        }

        /// Non‑blocking check – returns the signal name once.
        pub fn check_signals() -> Option<String> {
            use nix::sys::signal::Signal;

            let val = RECEIVED_SIGNAL.swap(0, Ordering::AcqRel);
            if val == 0 {
                return None;
            }
            match Signal::try_from(val as i32) {
                Ok(sig) => Some(sig.to_string()),
                Err(e) => {
                    log::error!("BUG: Invalid signal number {val} from signal handler: {e}");
                    None
                }
            }
        }
    } else {
        /// Ctrl-C only; must be called inside the runtime.
        pub fn install_signal_handlers() -> anyhow::Result<()> {
            tokio::spawn(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    RECEIVED_SIGNAL.store(2, Ordering::SeqCst);
                }
            });
            Ok(())
        }

        pub fn check_signals() -> Option<String> {
            (RECEIVED_SIGNAL.swap(0, Ordering::AcqRel) != 0).then(|| "Ctrl-C".to_string())
        }
    }
}
