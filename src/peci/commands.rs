//! Typed command helpers over the raw PECI transport.
//!
//! Every helper returns `Option`/`bool`: a completion code other than
//! success, a short response, or a transport error all read as "no value"
//! and are logged at debug level. Callers fold absence into sensor status
//! or knob health; nothing here retries.

use std::sync::Arc;

use log::debug;

use crate::ports::PeciHandle;
use crate::types::DeviceIndex;

use super::wire;
use super::wire::response_len;

/// Command surface consumed by the CPU sensors and ratio/preference knobs.
pub trait CpuCommands: Send + Sync {
    fn c0_counter(&self, cpu: DeviceIndex) -> Option<u64>;
    fn epi_counter(&self, cpu: DeviceIndex) -> Option<u64>;
    fn cpu_id(&self, cpu: DeviceIndex) -> Option<u32>;
    fn cpu_die_mask(&self, cpu: DeviceIndex) -> Option<u32>;
    fn is_turbo_enabled(&self, cpu: DeviceIndex, cpu_id: u32) -> Option<bool>;
    fn core_mask_low(&self, cpu: DeviceIndex, cpu_id: u32) -> Option<u32>;
    fn core_mask_high(&self, cpu: DeviceIndex, cpu_id: u32) -> Option<u32>;
    fn max_non_turbo_ratio(&self, cpu: DeviceIndex, cpu_id: u32) -> Option<u8>;
    fn turbo_ratio_bucket(
        &self,
        cpu: DeviceIndex,
        cpu_id: u32,
        core_count: u8,
        hi_low_select: u8,
    ) -> Option<[u8; 4]>;
    fn turbo_ratio_limit(&self, cpu: DeviceIndex) -> Option<u8>;
    fn set_turbo_ratio(&self, cpu: DeviceIndex, ratio_limit: u8) -> bool;
    fn min_operating_ratio(&self, cpu: DeviceIndex, cpu_id: u32) -> Option<u8>;
    fn max_efficiency_ratio(&self, cpu: DeviceIndex, cpu_id: u32) -> Option<u8>;
    fn set_hwpm_preference(&self, cpu: DeviceIndex, value: u32) -> bool;
    fn set_hwpm_preference_bias(&self, cpu: DeviceIndex, value: u32) -> bool;
    fn set_hwpm_preference_override(&self, cpu: DeviceIndex, value: u32) -> bool;
    fn prochot_ratio(&self, cpu: DeviceIndex) -> Option<u8>;
    fn set_prochot_ratio(&self, cpu: DeviceIndex, ratio: u8) -> bool;

    // ── Derived helpers ───────────────────────────────────────

    /// Population count of the 64-bit core-presence mask.
    fn detect_cores(&self, cpu: DeviceIndex, cpu_id: u32) -> Option<u8> {
        let low = self.core_mask_low(cpu, cpu_id)?;
        let high = self.core_mask_high(cpu, cpu_id)?;
        let mask = u64::from(low) | (u64::from(high) << 32);
        Some(mask.count_ones() as u8)
    }

    /// Highest single-core turbo ratio (first entry of bucket zero).
    fn detect_max_turbo_ratio(&self, cpu: DeviceIndex, cpu_id: u32) -> Option<u8> {
        let bucket = self.turbo_ratio_bucket(cpu, cpu_id, 0, 0)?;
        Some(bucket[0])
    }

    /// All-core turbo ratio: the ratio that applies with every core active.
    fn detect_min_turbo_ratio(
        &self,
        cpu: DeviceIndex,
        cpu_id: u32,
        core_count: u8,
    ) -> Option<u8> {
        if wire::cpu_model(cpu_id)? == wire::CpuModel::Gnr {
            let high = self.turbo_ratio_bucket(cpu, cpu_id, core_count, 1)?;
            let low = self.turbo_ratio_bucket(cpu, cpu_id, core_count, 0)?;
            high.iter()
                .rev()
                .find(|ratio| **ratio != 0)
                .or_else(|| low.iter().rev().find(|ratio| **ratio != 0))
                .copied()
        } else {
            // Ratios come four cores per bucket; a count divisible by four
            // still lives in the previous bucket.
            let mut bucket_index = core_count;
            if bucket_index % wire::TURBO_RATIO_BUCKET == 0 {
                bucket_index = bucket_index.saturating_sub(1);
            }
            bucket_index /= wire::TURBO_RATIO_BUCKET;
            let slot =
                (core_count.checked_sub(1)?) - wire::TURBO_RATIO_BUCKET * bucket_index;
            let bucket = self.turbo_ratio_bucket(cpu, cpu_id, bucket_index, 0)?;
            bucket.get(usize::from(slot)).copied()
        }
    }
}

pub type CpuCommandsHandle = Arc<dyn CpuCommands>;

/// Production implementation speaking through the transport port.
pub struct PeciCommands {
    transport: PeciHandle,
}

impl PeciCommands {
    pub fn new(transport: PeciHandle) -> Arc<Self> {
        Arc::new(Self { transport })
    }

    fn execute(&self, cpu: DeviceIndex, request: &[u8], response_len: usize) -> Option<Vec<u8>> {
        let target = wire::CPU0_ADDRESS.checked_add(cpu)?;
        match self.transport.transact(target, request, response_len) {
            Ok(response) if response.len() == response_len => Some(response),
            Ok(response) => {
                debug!("peci: short response from {target:#x}: {} bytes", response.len());
                None
            }
            Err(err) => {
                debug!("peci: transaction with {target:#x} failed: {err}");
                None
            }
        }
    }

    fn execute_status(&self, cpu: DeviceIndex, request: &[u8]) -> bool {
        self.execute(cpu, request, response_len::STATUS_ONLY)
            .as_deref()
            .and_then(wire::payload)
            .is_some()
    }
}

impl CpuCommands for PeciCommands {
    fn c0_counter(&self, cpu: DeviceIndex) -> Option<u64> {
        wire::parse_u64(&self.execute(cpu, &wire::get_c0_counter(), response_len::U64_COUNTER)?)
    }

    fn epi_counter(&self, cpu: DeviceIndex) -> Option<u64> {
        wire::parse_u64(&self.execute(cpu, &wire::get_epi_counter(), response_len::U64_COUNTER)?)
    }

    fn cpu_id(&self, cpu: DeviceIndex) -> Option<u32> {
        wire::parse_u32(&self.execute(cpu, &wire::get_cpu_id(), response_len::U32_REGISTER)?)
    }

    fn cpu_die_mask(&self, cpu: DeviceIndex) -> Option<u32> {
        wire::parse_u32(&self.execute(cpu, &wire::get_cpu_die_mask(), response_len::U32_REGISTER)?)
    }

    fn is_turbo_enabled(&self, cpu: DeviceIndex, cpu_id: u32) -> Option<bool> {
        let request = wire::get_capability_register(cpu_id)?;
        let capabilities =
            wire::parse_u32(&self.execute(cpu, &request, response_len::U32_REGISTER)?)?;
        Some(capabilities & (1 << wire::CAPABILITY_BIT_ENERGY_EFFICIENT_TURBO) != 0)
    }

    fn core_mask_low(&self, cpu: DeviceIndex, cpu_id: u32) -> Option<u32> {
        let request = wire::get_core_mask_low(cpu_id)?;
        wire::parse_u32(&self.execute(cpu, &request, response_len::U32_REGISTER)?)
    }

    fn core_mask_high(&self, cpu: DeviceIndex, cpu_id: u32) -> Option<u32> {
        let request = wire::get_core_mask_high(cpu_id)?;
        wire::parse_u32(&self.execute(cpu, &request, response_len::U32_REGISTER)?)
    }

    fn max_non_turbo_ratio(&self, cpu: DeviceIndex, cpu_id: u32) -> Option<u8> {
        let request = wire::get_platform_info_low(cpu_id)?;
        wire::parse_max_non_turbo_ratio(&self.execute(cpu, &request, response_len::U8_REGISTER)?)
    }

    fn turbo_ratio_bucket(
        &self,
        cpu: DeviceIndex,
        cpu_id: u32,
        core_count: u8,
        hi_low_select: u8,
    ) -> Option<[u8; 4]> {
        let request = wire::get_turbo_ratio(cpu_id, core_count, hi_low_select)?;
        wire::parse_ratio_bucket(&self.execute(cpu, &request, response_len::RATIO_BUCKET)?)
    }

    fn turbo_ratio_limit(&self, cpu: DeviceIndex) -> Option<u8> {
        wire::parse_u8(&self.execute(cpu, &wire::get_turbo_ratio_limit(), response_len::U8_REGISTER)?)
    }

    fn set_turbo_ratio(&self, cpu: DeviceIndex, ratio_limit: u8) -> bool {
        self.execute_status(cpu, &wire::set_turbo_ratio_limit(ratio_limit))
    }

    fn min_operating_ratio(&self, cpu: DeviceIndex, cpu_id: u32) -> Option<u8> {
        let request = wire::get_platform_info_high(cpu_id)?;
        let (_, min_operating) =
            wire::parse_efficiency_ratios(&self.execute(cpu, &request, response_len::U8_REGISTER)?)?;
        Some(min_operating)
    }

    fn max_efficiency_ratio(&self, cpu: DeviceIndex, cpu_id: u32) -> Option<u8> {
        let request = wire::get_platform_info_high(cpu_id)?;
        let (max_efficiency, _) =
            wire::parse_efficiency_ratios(&self.execute(cpu, &request, response_len::U8_REGISTER)?)?;
        Some(max_efficiency)
    }

    fn set_hwpm_preference(&self, cpu: DeviceIndex, value: u32) -> bool {
        self.execute_status(cpu, &wire::set_hwpm_preference(value))
    }

    fn set_hwpm_preference_bias(&self, cpu: DeviceIndex, value: u32) -> bool {
        self.execute_status(cpu, &wire::set_hwpm_preference_bias(value))
    }

    fn set_hwpm_preference_override(&self, cpu: DeviceIndex, value: u32) -> bool {
        self.execute_status(cpu, &wire::set_hwpm_preference_override(value))
    }

    fn prochot_ratio(&self, cpu: DeviceIndex) -> Option<u8> {
        wire::parse_u8(&self.execute(cpu, &wire::get_prochot_ratio(), response_len::U8_REGISTER)?)
    }

    fn set_prochot_ratio(&self, cpu: DeviceIndex, ratio: u8) -> bool {
        self.execute_status(cpu, &wire::set_prochot_ratio(ratio))
    }
}
