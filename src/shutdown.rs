use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest uninterrupted sleep; bounds how late a shutdown is noticed.
pub const SHUTDOWN_SLICE: Duration = Duration::from_millis(50);

static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signum: libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

/// Cooperative stop request shared by every loop in a process.
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    signals: bool,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes SIGINT and SIGTERM into the returned handle.
    pub fn install() -> std::io::Result<Self> {
        for signum in [libc::SIGINT, libc::SIGTERM] {
            let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            let previous = unsafe { libc::signal(signum, handler) };
            if previous == libc::SIG_ERR {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(Self {
            flag: Arc::new(AtomicBool::new(false)),
            signals: true,
        })
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || (self.signals && SIGNALLED.load(Ordering::SeqCst))
    }

    /// Sleeps for `duration` in slices. Returns `true` if shutdown was
    /// requested before the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_requested() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep((deadline - now).min(SHUTDOWN_SLICE));
        }
    }
}
