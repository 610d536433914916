//! Shared fixtures for integration tests: a manual clock, a canned register
//! source, a recording sink, and realistic register blocks.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use fronmod::eflow::Clock;
use fronmod::error::FronmodError;
use fronmod::processor::SendValue;
use fronmod::reader::RegisterSource;
use fronmod::registers::{INVERTER_BATCH, METER_BATCH, MPPT_BATCH, ReadBatch, STORAGE_BATCH};

/// Test clock advanced by hand.
pub struct ManualClock {
    now: Cell<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        let start = Utc
            .with_ymd_and_hms(2020, 5, 1, 12, 0, 0)
            .single()
            .expect("valid date");
        Arc::new(Self { now: Cell::new(start) })
    }

    pub fn advance_hours(&self, hours: f64) {
        let millis = (hours * 3_600_000.0).round() as i64;
        self.now
            .set(self.now.get() + chrono::Duration::milliseconds(millis));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }
}

/// Register source answering from canned word blocks, keyed by batch name.
#[derive(Default)]
pub struct MockSource {
    pub blocks: HashMap<&'static str, Vec<u16>>,
}

impl MockSource {
    pub fn set(&mut self, batch: &ReadBatch, words: Vec<u16>) {
        self.blocks.insert(batch.name, words);
    }
}

impl RegisterSource for MockSource {
    fn read_block(&mut self, batch: &ReadBatch) -> Result<Vec<u16>, FronmodError> {
        self.blocks
            .get(batch.name)
            .cloned()
            .ok_or(FronmodError::NotConnected)
    }
}

/// Sink recording every published value.
#[derive(Default)]
pub struct RecordingSink {
    pub published: Vec<SendValue>,
    pub resets: usize,
}

impl fronmod::gateway::ValueSink for RecordingSink {
    fn publish(&mut self, values: &[SendValue]) -> Result<(), FronmodError> {
        self.published.extend_from_slice(values);
        Ok(())
    }

    fn reset_all(&mut self) -> Result<(), FronmodError> {
        self.resets += 1;
        Ok(())
    }
}

pub fn put_f32(words: &mut [u16], docu_offset: usize, value: f32) {
    let bits = value.to_bits();
    words[docu_offset - 1] = (bits >> 16) as u16;
    words[docu_offset] = bits as u16;
}

/// Inverter block captured from a sleeping Symo Hybrid: power registers NaN,
/// lifetime energy 7000744 Wh, Fronius and SunSpec state both 3.
pub fn inverter_night_block() -> Vec<u16> {
    vec![
        60, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 32704, 0,
        32704, 0, 32704, 0, 19157, 42320, 32704, 0, 32704, 0, 0, 0, 32704, 0, 32704, 0, 32704, 0,
        32704, 0, 3, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    ]
}

/// Inverter block under load: `ac_power` W out of `dc_power` W.
pub fn inverter_active_block(ac_power: f32, dc_power: f32) -> Vec<u16> {
    let mut words = vec![0u16; 60];
    words[0] = 60;
    put_f32(&mut words, 26, ac_power);
    put_f32(&mut words, 32, 7_000_744.0);
    put_f32(&mut words, 38, dc_power);
    words[47] = 4;
    words[48] = 4;
    words
}

/// Storage block captured from the same device: charge state 300 raw with a
/// -2 scale factor (3 %).
pub fn storage_block() -> Vec<u16> {
    vec![
        124, 24, 3328, 100, 100, 0, 65535, 0, 300, 65535, 65535, 2, 10000, 10000, 65535, 65535,
        65535, 1, 0, 0, 32768, 65534, 65534, 65534, 65534, 65534,
    ]
}

/// MPPT block with both scale factors at 0, the module string at
/// `module_power` W and the battery string register at `raw_bat_power`.
pub fn mppt_block(module_power: u16, raw_bat_power: u16) -> Vec<u16> {
    let mut words = vec![0u16; 50];
    words[0] = 160;
    words[1] = 48;
    words[3] = 0;
    words[4] = 0;
    words[20] = 3500;
    words[21] = module_power;
    words[41] = raw_bat_power;
    words
}

/// Meter block at 50 Hz with the given AC power and the energy totals of the
/// recorded device.
pub fn meter_block(ac_power: f32) -> Vec<u16> {
    let mut words = vec![0u16; 124];
    words[0] = 124;
    put_f32(&mut words, 26, 50.0);
    put_f32(&mut words, 28, ac_power);
    put_f32(&mut words, 60, 4_431_805.0);
    put_f32(&mut words, 68, 798_550.0);
    words
}

/// A full set of blocks for an active plant.
pub fn active_plant() -> MockSource {
    let mut source = MockSource::default();
    source.set(&INVERTER_BATCH, inverter_active_block(500.0, 1500.0));
    source.set(&STORAGE_BATCH, storage_block());
    source.set(&MPPT_BATCH, mppt_block(300, 800));
    source.set(&METER_BATCH, meter_block(501.01));
    source
}
