//! Register model and the Fronius SunSpec register catalog.
//!
//! A [`ReadBatch`] describes one physical register-block read; each
//! [`RegisterItem`] inside it names a logical value and how to decode it
//! from the block. Items without an offset are derived-only: the reader
//! emits a not-ready placeholder that a later pipeline step fills in.
//!
//! All catalog names are stable string keys shared with the openHAB item
//! namespace — renaming one breaks that boundary.

use crate::error::FronmodError;
use std::collections::HashMap;

/// Publication cadence of an output value.
///
/// Attached per item definition; items without a priority are internal and
/// never queued for publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Published roughly every 10 seconds.
    Fast,
    /// Published roughly every minute (also carries energy-flow drains).
    Medium,
    /// Published roughly every five minutes.
    Slow,
}

/// Wire representation of a register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    /// Signed 16-bit integer, one word.
    Int16,
    /// Unsigned 16-bit integer, one word.
    Uint16,
    /// IEEE-754 float, two words, high word first.
    Float32,
    /// No direct register — filled by a derivation step.
    Derived,
}

/// One named logical value within a register block.
#[derive(Debug)]
pub struct RegisterItem {
    /// Stable output name.
    pub name: &'static str,
    /// Word offset into the block, or `None` for derived-only items.
    pub offset: Option<u16>,
    /// Wire representation.
    pub kind: RegisterKind,
    /// Publication cadence; `None` keeps the value internal.
    pub priority: Option<Priority>,
    /// Normalize the vendor's 0xFFFF "no value" sentinel to 0
    /// (unsigned registers only).
    pub zero_if_unset: bool,
}

impl RegisterItem {
    /// Item backed by a register, addressed with the vendor documentation's
    /// 1-based offset.
    pub const fn reg(
        docu_offset: u16,
        kind: RegisterKind,
        name: &'static str,
        priority: Option<Priority>,
    ) -> Self {
        Self {
            name,
            offset: Some(docu_offset - 1),
            kind,
            priority,
            zero_if_unset: false,
        }
    }

    /// Register-backed item whose 0xFFFF raw value means "no value".
    pub const fn reg_unset_zero(
        docu_offset: u16,
        kind: RegisterKind,
        name: &'static str,
        priority: Option<Priority>,
    ) -> Self {
        Self {
            name,
            offset: Some(docu_offset - 1),
            kind,
            priority,
            zero_if_unset: true,
        }
    }

    /// Derived-only item: the reader yields an empty placeholder for it.
    pub const fn derived(name: &'static str, priority: Option<Priority>) -> Self {
        Self {
            name,
            offset: None,
            kind: RegisterKind::Derived,
            priority,
            zero_if_unset: false,
        }
    }
}

/// One physical register-block read covering several named values.
#[derive(Debug)]
pub struct ReadBatch {
    /// Short name used in logs.
    pub name: &'static str,
    /// Modbus unit (slave) id.
    pub unit_id: u8,
    /// Protocol address of the first register.
    pub start: u16,
    /// Number of registers to read.
    pub len: u16,
    /// Items decoded from (or derived into) this block.
    pub items: &'static [RegisterItem],
}

/// Decoded (or to-be-derived) value for one item name.
#[derive(Debug, Clone)]
pub struct ReadResult {
    /// Item name this result belongs to.
    pub name: &'static str,
    /// Current value; `None` means unknown.
    pub value: Option<f64>,
    /// Originating item definition (`None` for ad-hoc results).
    pub item: Option<&'static RegisterItem>,
    /// The value (possibly null) is final for this poll cycle.
    pub ready: bool,
}

impl ReadResult {
    /// Ready result decoded straight from a register.
    pub fn decoded(item: &'static RegisterItem, value: f64) -> Self {
        Self {
            name: item.name,
            value: Some(value),
            item: Some(item),
            ready: true,
        }
    }

    /// Not-ready placeholder for a derived-only item.
    pub fn placeholder(item: &'static RegisterItem) -> Self {
        Self {
            name: item.name,
            value: None,
            item: Some(item),
            ready: false,
        }
    }
}

/// Result mapping produced by one batch read.
pub type ResultMap = HashMap<&'static str, ReadResult>;

/// Decodes one register-backed item from a block of words.
///
/// Unsigned registers with [`RegisterItem::zero_if_unset`] map the 0xFFFF
/// sentinel to 0; float registers map NaN to 0.0 — the vendor uses both to
/// mean "no value", and downstream integration must see a number, not a
/// gap.
///
/// # Errors
///
/// Returns [`FronmodError::ItemOutOfRange`] when the item has no offset or
/// does not fit inside `words`.
pub fn decode_value(item: &RegisterItem, words: &[u16]) -> Result<f64, FronmodError> {
    let offset = item.offset.ok_or(FronmodError::ItemOutOfRange(item.name))? as usize;

    match item.kind {
        RegisterKind::Int16 => {
            let word = *words
                .get(offset)
                .ok_or(FronmodError::ItemOutOfRange(item.name))?;
            Ok(f64::from(word as i16))
        }
        RegisterKind::Uint16 => {
            let word = *words
                .get(offset)
                .ok_or(FronmodError::ItemOutOfRange(item.name))?;
            if item.zero_if_unset && word == 0xFFFF {
                Ok(0.0)
            } else {
                Ok(f64::from(word))
            }
        }
        RegisterKind::Float32 => {
            if offset + 1 >= words.len() {
                return Err(FronmodError::ItemOutOfRange(item.name));
            }
            let bits = (u32::from(words[offset]) << 16) | u32::from(words[offset + 1]);
            let value = f32::from_bits(bits);
            if value.is_nan() {
                Ok(0.0)
            } else {
                Ok(f64::from(value))
            }
        }
        RegisterKind::Derived => Err(FronmodError::ItemOutOfRange(item.name)),
    }
}

// ---------------------------------------------------------------------------
// Output name catalog
// ---------------------------------------------------------------------------

// inverter
pub const INV_AC_ENERGY_TOT: &str = "valPvInvAcEnergyTot";
pub const INV_EFFICIENCY: &str = "valPvInvEfficiency";
pub const INV_STATE_FRONIUS: &str = "valPvInvFroniusState";
pub const INV_STATE_SUNSPEC: &str = "valPvInvSunSpecState";
pub const SHOW_INV_AC_ENERGY_TOT: &str = "showPvInvAcEnergyTot";
pub const SHOW_INV_AC_POWER: &str = "showPvInvAcPower";
pub const SHOW_INV_DC_POWER: &str = "showPvInvDcPower";
pub const TEMP_INV_AC_POWER: &str = "tempPvInvAcPower";
pub const TEMP_INV_DC_POWER: &str = "tempPvInvDcPower";

// storage
pub const BAT_FILL_STATE: &str = "valPvBatFillState";
pub const RAW_BAT_FILL_STATE: &str = "rawPvBatFillState";
pub const RAW_BAT_FILL_STATE_SF: &str = "rawPvBatFillStateSf";

// mppt
pub const BAT_POWER: &str = "valPvBatPower";
pub const MOD_POWER: &str = "valPvModPower";
pub const MOD_VOLTAGE: &str = "valPvModVoltage";
pub const RAW2_BAT_POWER: &str = "raw2PvBatPower";
pub const RAW_BAT_POWER: &str = "rawPvMpptBattPower";
pub const RAW_MOD_POWER: &str = "rawPvMpptModPower";
pub const RAW_MOD_VOLTAGE: &str = "rawPvMpptModVoltage";
pub const RAW_POWER_SF: &str = "rawPvMpptPowerSfBase";
pub const RAW_VOLTAGE_SF: &str = "rawPvMpptVoltageSfBase";
pub const SHOW_BAT_POWER: &str = "showPvBatPower";
pub const SHOW_MOD_POWER: &str = "showPvModPower";

// meter
pub const MET_AC_FREQUENCY: &str = "valPvMetAcFrequency";
pub const MET_AC_POWER: &str = "valPvMetAcPower";
pub const MET_ENERGY_EXP_TOT: &str = "valPvMetEnergyExpTot";
pub const MET_ENERGY_IMP_TOT: &str = "valPvMetEnergyImpTot";
pub const SHOW_MET_AC_POWER: &str = "showPvMetAcPower";
pub const SHOW_MET_ENERGY_EXP_TOT: &str = "showPvMetEnergyExpTot";
pub const SHOW_MET_ENERGY_IMP_TOT: &str = "showPvMetEnergyImpTot";

// derived across batches
pub const SELF_CONSUMPTION: &str = "valPvSelfConsumption";

// energy flow
pub const EFLOW_BAT_IN: &str = "valPvEflowBatIn";
pub const EFLOW_BAT_OUT: &str = "valPvEflowBatOut";
pub const EFLOW_INV_AC_IN: &str = "valPvEflowInvAcIn";
pub const EFLOW_INV_AC_OUT: &str = "valPvEflowInvAcOut";
pub const EFLOW_INV_DC_IN: &str = "valPvEflowInvDcIn";
pub const EFLOW_INV_DC_OUT: &str = "valPvEflowInvDcOut";
pub const EFLOW_MOD_OUT: &str = "valPvEflowModOut";

// ---------------------------------------------------------------------------
// Register batches (Fronius Datamanager, SunSpec float variant)
// ---------------------------------------------------------------------------

use Priority::{Fast, Medium, Slow};
use RegisterKind::{Float32, Int16, Uint16};

/// Common inverter block: AC/DC power, lifetime AC energy, device states.
pub static INVERTER_BATCH: ReadBatch = ReadBatch {
    name: "inverter",
    unit_id: 1,
    start: 40071,
    len: 60,
    items: &[
        RegisterItem::reg(26, Float32, TEMP_INV_AC_POWER, None),
        RegisterItem::reg(32, Float32, INV_AC_ENERGY_TOT, Some(Slow)),
        RegisterItem::reg(38, Float32, TEMP_INV_DC_POWER, None),
        RegisterItem::reg(48, Uint16, INV_STATE_FRONIUS, Some(Medium)),
        RegisterItem::reg(49, Uint16, INV_STATE_SUNSPEC, Some(Medium)),
        RegisterItem::derived(SHOW_INV_AC_ENERGY_TOT, Some(Slow)),
        RegisterItem::derived(SHOW_INV_AC_POWER, Some(Fast)),
        RegisterItem::derived(SHOW_INV_DC_POWER, Some(Fast)),
        RegisterItem::derived(INV_EFFICIENCY, Some(Fast)),
    ],
};

/// Basic storage block (SunSpec model 124): battery charge state.
pub static STORAGE_BATCH: ReadBatch = ReadBatch {
    name: "storage",
    unit_id: 1,
    start: 40313,
    len: 26,
    items: &[
        RegisterItem::reg(9, Uint16, RAW_BAT_FILL_STATE, None),
        RegisterItem::reg(23, Int16, RAW_BAT_FILL_STATE_SF, None),
        RegisterItem::derived(BAT_FILL_STATE, Some(Medium)),
    ],
};

/// MPPT block (SunSpec model 160): module string and battery string.
pub static MPPT_BATCH: ReadBatch = ReadBatch {
    name: "mppt",
    unit_id: 1,
    start: 40263,
    len: 50,
    items: &[
        RegisterItem::reg(4, Int16, RAW_VOLTAGE_SF, None),
        RegisterItem::reg(5, Int16, RAW_POWER_SF, None),
        RegisterItem::reg(21, Uint16, RAW_MOD_VOLTAGE, None),
        RegisterItem::reg_unset_zero(22, Uint16, RAW_MOD_POWER, None),
        RegisterItem::reg_unset_zero(42, Uint16, RAW_BAT_POWER, None),
        RegisterItem::derived(MOD_VOLTAGE, Some(Medium)),
        RegisterItem::derived(MOD_POWER, Some(Medium)),
        RegisterItem::derived(RAW2_BAT_POWER, None),
        RegisterItem::derived(BAT_POWER, Some(Medium)),
        RegisterItem::derived(SHOW_BAT_POWER, Some(Fast)),
        RegisterItem::derived(SHOW_MOD_POWER, Some(Fast)),
    ],
};

/// Smart-meter block (SunSpec model 213 on unit 240).
pub static METER_BATCH: ReadBatch = ReadBatch {
    name: "meter",
    unit_id: 240,
    start: 40069,
    len: 124,
    items: &[
        RegisterItem::reg(26, Float32, MET_AC_FREQUENCY, Some(Medium)),
        RegisterItem::reg(28, Float32, MET_AC_POWER, Some(Medium)),
        RegisterItem::reg(60, Float32, MET_ENERGY_EXP_TOT, Some(Slow)),
        RegisterItem::reg(68, Float32, MET_ENERGY_IMP_TOT, Some(Slow)),
        RegisterItem::derived(SHOW_MET_AC_POWER, Some(Fast)),
        RegisterItem::derived(SHOW_MET_ENERGY_EXP_TOT, Some(Slow)),
        RegisterItem::derived(SHOW_MET_ENERGY_IMP_TOT, Some(Slow)),
    ],
};

/// Self-consumption is derived from two batches and belongs to none.
pub static SELF_CONSUMPTION_ITEM: RegisterItem = RegisterItem::derived(SELF_CONSUMPTION, Some(Fast));

/// All register batches, in poll order.
pub static ALL_BATCHES: &[&ReadBatch] = &[
    &INVERTER_BATCH,
    &STORAGE_BATCH,
    &MPPT_BATCH,
    &METER_BATCH,
];

/// Energy-flow output names (published with the medium drain).
pub static EFLOW_ITEMS: &[&str] = &[
    EFLOW_INV_DC_OUT,
    EFLOW_INV_DC_IN,
    EFLOW_INV_AC_OUT,
    EFLOW_INV_AC_IN,
    EFLOW_BAT_OUT,
    EFLOW_BAT_IN,
    EFLOW_MOD_OUT,
];

/// Every output name the gateway may see — the reset contract pushes a NULL
/// state for each of these on shutdown.
pub fn published_items() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = ALL_BATCHES
        .iter()
        .flat_map(|batch| batch.items.iter())
        .filter(|item| item.priority.is_some())
        .map(|item| item.name)
        .collect();
    names.push(SELF_CONSUMPTION);
    names.extend(EFLOW_ITEMS);
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int16_decodes_sign_extended() {
        let item = RegisterItem::reg(1, Int16, "t", None);
        let value = decode_value(&item, &[65534]);
        assert_eq!(value.ok(), Some(-2.0));
    }

    #[test]
    fn uint16_keeps_full_range() {
        let item = RegisterItem::reg(1, Uint16, "t", None);
        let value = decode_value(&item, &[65534]);
        assert_eq!(value.ok(), Some(65534.0));
    }

    #[test]
    fn uint16_sentinel_becomes_zero() {
        let item = RegisterItem::reg_unset_zero(1, Uint16, "t", None);
        let value = decode_value(&item, &[0xFFFF]);
        assert_eq!(value.ok(), Some(0.0));
    }

    #[test]
    fn float32_high_word_first() {
        // 0x42480000 == 50.0
        let item = RegisterItem::reg(1, Float32, "t", None);
        let value = decode_value(&item, &[0x4248, 0x0000]);
        assert_eq!(value.ok(), Some(50.0));
    }

    #[test]
    fn float32_nan_becomes_zero() {
        // 0x7FC00000 is the NaN pattern the Datamanager reports at night
        let item = RegisterItem::reg(1, Float32, "t", None);
        let value = decode_value(&item, &[0x7FC0, 0x0000]);
        assert_eq!(value.ok(), Some(0.0));
    }

    #[test]
    fn docu_offset_is_one_based() {
        let item = RegisterItem::reg(3, Uint16, "t", None);
        let value = decode_value(&item, &[0, 0, 7, 0]);
        assert_eq!(value.ok(), Some(7.0));
    }

    #[test]
    fn out_of_range_offset_is_rejected() {
        let item = RegisterItem::reg(4, Float32, "t", None);
        let result = decode_value(&item, &[0, 0, 0]);
        assert!(matches!(result, Err(FronmodError::ItemOutOfRange("t"))));
    }

    #[test]
    fn derived_items_have_no_register() {
        let item = RegisterItem::derived("t", None);
        let result = decode_value(&item, &[0, 0, 0]);
        assert!(result.is_err());
    }

    #[test]
    fn catalog_names_are_unique_per_batch() {
        for batch in ALL_BATCHES {
            let mut seen = std::collections::HashSet::new();
            for item in batch.items {
                assert!(
                    seen.insert(item.name),
                    "duplicate name {} in batch {}",
                    item.name,
                    batch.name
                );
            }
        }
    }

    #[test]
    fn catalog_registers_fit_their_blocks() {
        for batch in ALL_BATCHES {
            for item in batch.items {
                let Some(offset) = item.offset else { continue };
                let width = match item.kind {
                    RegisterKind::Float32 => 2,
                    _ => 1,
                };
                assert!(
                    offset as usize + width <= batch.len as usize,
                    "item {} exceeds block {}",
                    item.name,
                    batch.name
                );
            }
        }
    }

    #[test]
    fn published_items_cover_eflow_and_self_consumption() {
        let names = published_items();
        assert!(names.contains(&SELF_CONSUMPTION));
        assert!(names.contains(&EFLOW_MOD_OUT));
        assert!(names.contains(&SHOW_INV_AC_POWER));
        // internal names never leak to the gateway
        assert!(!names.contains(&TEMP_INV_AC_POWER));
        assert!(!names.contains(&RAW_BAT_FILL_STATE));
    }
}
