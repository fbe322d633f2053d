use std::time::Duration;

use log::{info, warn};

use crate::sampling::SleepTier;
use crate::storage::Storage;

/// Power state transitions. Neither returns.
pub trait PowerControl {
    fn deep_sleep(&mut self, duration: Duration) -> !;
    fn restart(&mut self) -> !;
}

pub struct SleepScheduler<P> {
    power: P,
}

impl<P: PowerControl> SleepScheduler<P> {
    pub fn new(power: P) -> Self {
        Self { power }
    }

    /// Releases storage, then sleeps for the tier's duration.
    pub fn sleep(mut self, storage: Storage, tier: SleepTier) -> ! {
        drop(storage);
        info!("entering deep sleep for {} min", tier.minutes());
        self.power.deep_sleep(tier.duration())
    }

    pub fn restart(mut self) -> ! {
        warn!("restarting");
        self.power.restart()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{SimMount, TempDir};
    use crate::storage::RecordVolume;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct PanicPower {
        released: Arc<AtomicBool>,
    }

    impl PowerControl for PanicPower {
        fn deep_sleep(&mut self, duration: Duration) -> ! {
            assert!(self.released.load(Ordering::SeqCst));
            panic!("deep sleep {}s", duration.as_secs());
        }

        fn restart(&mut self) -> ! {
            panic!("restart");
        }
    }

    #[test]
    #[should_panic(expected = "deep sleep 300s")]
    fn releases_storage_before_sleep() {
        let dir = TempDir::new();
        let mount = SimMount::default();
        let released = mount.released();
        let storage = Storage::new(RecordVolume::new(dir.path()), Box::new(mount), "payload.txt").unwrap();

        SleepScheduler::new(PanicPower { released }).sleep(storage, SleepTier::Normal);
    }
}
