use anyhow::Result;
use esp_idf_svc::sntp::{EspSntp, SyncStatus};
use log::info;

use crate::clock::TimeSync;

/// SNTP client; kept running until the node sleeps.
#[derive(Default)]
pub struct Sntp {
    sntp: Option<EspSntp<'static>>,
}

impl TimeSync for Sntp {
    fn start(&mut self) -> Result<()> {
        if self.sntp.is_none() {
            info!("Sync SNTP...");
            self.sntp = Some(EspSntp::new_default()?);
        }
        Ok(())
    }

    fn is_synced(&self) -> bool {
        self.sntp
            .as_ref()
            .map(|sntp| sntp.get_sync_status() == SyncStatus::Completed)
            .unwrap_or(false)
    }
}
