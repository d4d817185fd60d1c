//! ---
//! rcs_section: "02-upgrade-engine"
//! rcs_subsection: "module"
//! rcs_type: "source"
//! rcs_scope: "code"
//! rcs_description: "OTA upgrade orchestration for dual-bank devices."
//! rcs_version: "v0.0.0-prealpha"
//! rcs_owner: "tbd"
//! ---
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::Result;
use crate::partition::Bank;
use crate::system::BootEnv;

const BANK_SELECTOR: &str = "use_part_b";
const BOOT_COUNT: &str = "boot_cnt";
const BOOT_FAILED_LIMIT: &str = "boot_failed_limits";
const ROLLBACK_FLAG: &str = "boot_rollback";
const FACTORY_RESET: &str = "factory_reset";

/// Owner of the bootloader variables that decide which bank boots next.
#[derive(Debug, Clone)]
pub struct BootSwitch {
    env: Arc<dyn BootEnv>,
    failed_limit: u32,
}

impl BootSwitch {
    pub fn new(env: Arc<dyn BootEnv>, failed_limit: u32) -> Self {
        Self { env, failed_limit }
    }

    /// Bank the bootloader will start next.
    pub fn active_bank(&self) -> Result<Bank> {
        let selector = self.env.read_var(BANK_SELECTOR)?;
        Ok(selector.as_deref().map(Bank::from_selector).unwrap_or(Bank::A))
    }

    /// Commit point of an upgrade: point the bootloader at `target`.
    ///
    /// Callers must only get here once the rootfs image on `target` has been
    /// written and its digest verified.
    pub fn switch_partition(&self, target: Bank) -> Result<()> {
        self.env.write_var(BANK_SELECTOR, target.selector())?;
        self.env.write_var(BOOT_COUNT, "0")?;
        self.env
            .write_var(BOOT_FAILED_LIMIT, &self.failed_limit.to_string())?;
        if let Err(err) = self.env.clear_var(ROLLBACK_FLAG) {
            warn!(error = %err, "failed clearing rollback flag");
        }
        info!(bank = %target, "boot bank switched");
        Ok(())
    }

    /// Ask the bootloader to restore factory state on next boot.
    pub fn factory_reset(&self) -> Result<()> {
        self.env.write_var(FACTORY_RESET, "1")?;
        info!("factory reset scheduled");
        Ok(())
    }
}
