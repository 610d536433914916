//! Derived-metric pipeline: turns raw batch reads into named output values,
//! feeds the energy-flow channels, and stages everything in priority queues
//! for the gateway.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::eflow::{Clock, EnergyFlowAggregate, EnergyFlowChannel, SystemClock};
use crate::error::FronmodError;
use crate::reader::{BatchReader, RegisterSource};
use crate::registers::{
    BAT_FILL_STATE, BAT_POWER, EFLOW_BAT_IN, EFLOW_BAT_OUT, EFLOW_INV_AC_IN, EFLOW_INV_AC_OUT,
    EFLOW_INV_DC_IN, EFLOW_INV_DC_OUT, EFLOW_MOD_OUT, INV_AC_ENERGY_TOT, INV_EFFICIENCY,
    INVERTER_BATCH, MET_AC_POWER, MET_ENERGY_EXP_TOT, MET_ENERGY_IMP_TOT, METER_BATCH, MOD_POWER,
    MOD_VOLTAGE, MPPT_BATCH, Priority, RAW2_BAT_POWER, RAW_BAT_FILL_STATE, RAW_BAT_FILL_STATE_SF,
    RAW_BAT_POWER, RAW_MOD_POWER, RAW_MOD_VOLTAGE, RAW_POWER_SF, RAW_VOLTAGE_SF, ReadBatch,
    ReadResult, ResultMap, SELF_CONSUMPTION, SELF_CONSUMPTION_ITEM, SHOW_BAT_POWER,
    SHOW_INV_AC_ENERGY_TOT, SHOW_INV_AC_POWER, SHOW_INV_DC_POWER, SHOW_MET_AC_POWER,
    SHOW_MET_ENERGY_EXP_TOT, SHOW_MET_ENERGY_IMP_TOT, SHOW_MOD_POWER, STORAGE_BATCH,
    TEMP_INV_AC_POWER, TEMP_INV_DC_POWER,
};

/// A named value staged for publication.
#[derive(Debug, Clone, PartialEq)]
pub struct SendValue {
    /// Output item name.
    pub name: &'static str,
    /// Value to publish; `None` publishes an unknown/NULL state.
    pub value: Option<f64>,
    /// Skip the publish when the gateway already holds this value.
    pub only_if_changed: bool,
}

type SendQueue = BTreeMap<&'static str, SendValue>;

/// Orchestrates one polling batch per sub-model and derives the output
/// catalog from the raw register results.
///
/// Owns the three priority queues and the energy-flow channels exclusively;
/// everything runs on the single poll thread. The inverter pipeline must
/// run before the mppt pipeline within a cycle — battery sign resolution
/// compares against the DC power remembered from the inverter batch.
pub struct MetricProcessor<S> {
    reader: BatchReader<S>,

    send_fast: SendQueue,
    send_medium: SendQueue,
    send_slow: SendQueue,

    eflow_inv_dc: EnergyFlowChannel,
    eflow_inv_ac: EnergyFlowChannel,
    eflow_bat: EnergyFlowChannel,
    eflow_mod: EnergyFlowChannel,

    last_inv_ac_power: Option<f64>,
    last_inv_dc_power: Option<f64>,
    last_met_ac_power: Option<f64>,
}

impl<S: RegisterSource> MetricProcessor<S> {
    /// Creates a processor over `source` using the system clock.
    pub fn new(source: S) -> Self {
        Self::with_clock(source, Arc::new(SystemClock))
    }

    /// Creates a processor with an explicit clock for the flow channels.
    pub fn with_clock(source: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            reader: BatchReader::new(source),
            send_fast: SendQueue::new(),
            send_medium: SendQueue::new(),
            send_slow: SendQueue::new(),
            eflow_inv_dc: EnergyFlowChannel::with_clock(
                TEMP_INV_DC_POWER,
                Some(EnergyFlowAggregate::new(EFLOW_INV_DC_OUT)),
                Some(EnergyFlowAggregate::new(EFLOW_INV_DC_IN)),
                clock.clone(),
            ),
            eflow_inv_ac: EnergyFlowChannel::with_clock(
                TEMP_INV_AC_POWER,
                Some(EnergyFlowAggregate::new(EFLOW_INV_AC_OUT)),
                Some(EnergyFlowAggregate::new(EFLOW_INV_AC_IN)),
                clock.clone(),
            ),
            eflow_bat: EnergyFlowChannel::with_clock(
                BAT_POWER,
                Some(EnergyFlowAggregate::new(EFLOW_BAT_OUT)),
                Some(EnergyFlowAggregate::new(EFLOW_BAT_IN)),
                clock.clone(),
            ),
            eflow_mod: EnergyFlowChannel::with_clock(
                MOD_POWER,
                Some(EnergyFlowAggregate::new(EFLOW_MOD_OUT)),
                None,
                clock,
            ),
            last_inv_ac_power: None,
            last_inv_dc_power: None,
            last_met_ac_power: None,
        }
    }

    /// The register source behind the reader.
    pub fn source(&self) -> &S {
        self.reader.source()
    }

    /// Mutable access to the register source.
    pub fn source_mut(&mut self) -> &mut S {
        self.reader.source_mut()
    }

    /// Re-establishes the register source connection.
    pub fn reconnect(&mut self) -> Result<(), FronmodError> {
        self.reader.source_mut().reconnect()
    }

    /// Reads one batch, queues every ready result, and returns the mapping.
    ///
    /// A failed read is logged and yields an empty mapping — the caller's
    /// next lookup then fails hard, surfacing the problem per sub-model
    /// without touching queues of unrelated batches.
    fn run_batch(&mut self, batch: &'static ReadBatch) -> ResultMap {
        let results = match self.reader.read(batch) {
            Ok(results) => results,
            Err(err) => {
                error!(batch = batch.name, "batch read failed: {err}");
                ResultMap::default()
            }
        };

        for result in results.values() {
            self.queue_send(result);
        }
        results
    }

    /// Inverter pipeline: display scaling, energy-flow feed, efficiency and
    /// self-consumption derivation.
    pub fn process_inverter(&mut self) -> Result<ResultMap, FronmodError> {
        let mut results = self.run_batch(&INVERTER_BATCH);

        self.apply_factor_scale(&mut results, INV_AC_ENERGY_TOT, 0.001, SHOW_INV_AC_ENERGY_TOT)?;
        self.apply_factor_scale(&mut results, TEMP_INV_AC_POWER, 0.001, SHOW_INV_AC_POWER)?;
        self.apply_factor_scale(&mut results, TEMP_INV_DC_POWER, 0.001, SHOW_INV_DC_POWER)?;

        Self::push_eflow(&results, TEMP_INV_DC_POWER, &mut self.eflow_inv_dc)?;
        Self::push_eflow(&results, TEMP_INV_AC_POWER, &mut self.eflow_inv_ac)?;

        self.last_inv_ac_power = Self::get_value(&results, TEMP_INV_AC_POWER)?;
        self.last_inv_dc_power = Self::get_value(&results, TEMP_INV_DC_POWER)?;

        self.derive_self_consumption();
        self.derive_inverter_efficiency(&mut results)?;

        Ok(results)
    }

    /// Storage pipeline: battery fill state from raw value and sunssf.
    pub fn process_storage(&mut self) -> Result<ResultMap, FronmodError> {
        let mut results = self.run_batch(&STORAGE_BATCH);

        self.apply_modbus_scale(
            &mut results,
            RAW_BAT_FILL_STATE,
            RAW_BAT_FILL_STATE_SF,
            BAT_FILL_STATE,
        )?;
        Ok(results)
    }

    /// MPPT pipeline: sunssf scaling, battery-power sign resolution,
    /// display scaling, energy-flow feed.
    pub fn process_mppt(&mut self) -> Result<ResultMap, FronmodError> {
        let mut results = self.run_batch(&MPPT_BATCH);

        self.apply_modbus_scale(&mut results, RAW_MOD_VOLTAGE, RAW_VOLTAGE_SF, MOD_VOLTAGE)?;
        self.apply_modbus_scale(&mut results, RAW_MOD_POWER, RAW_POWER_SF, MOD_POWER)?;
        self.apply_modbus_scale(&mut results, RAW_BAT_POWER, RAW_POWER_SF, RAW2_BAT_POWER)?;

        self.resolve_battery_sign(&mut results)?;

        self.apply_factor_scale(&mut results, BAT_POWER, 0.001, SHOW_BAT_POWER)?;
        self.apply_factor_scale(&mut results, MOD_POWER, 0.001, SHOW_MOD_POWER)?;

        Self::push_eflow(&results, BAT_POWER, &mut self.eflow_bat)?;
        Self::push_eflow(&results, MOD_POWER, &mut self.eflow_mod)?;

        Ok(results)
    }

    /// Meter pipeline: display scaling and self-consumption refresh.
    pub fn process_meter(&mut self) -> Result<ResultMap, FronmodError> {
        let mut results = self.run_batch(&METER_BATCH);

        self.apply_factor_scale(&mut results, MET_AC_POWER, 0.001, SHOW_MET_AC_POWER)?;
        self.apply_factor_scale(
            &mut results,
            MET_ENERGY_EXP_TOT,
            0.001,
            SHOW_MET_ENERGY_EXP_TOT,
        )?;
        self.apply_factor_scale(
            &mut results,
            MET_ENERGY_IMP_TOT,
            0.001,
            SHOW_MET_ENERGY_IMP_TOT,
        )?;

        self.last_met_ac_power = Self::get_value(&results, MET_AC_POWER)?;
        self.derive_self_consumption();

        Ok(results)
    }

    /// Returns and clears the queued entries for `priority`.
    ///
    /// The medium drain additionally empties every energy-flow channel and
    /// appends its non-zero aggregate snapshots.
    pub fn get_send_data(&mut self, priority: Priority) -> Vec<SendValue> {
        let queue = self.queue_mut(priority);
        let mut values: Vec<SendValue> = std::mem::take(queue).into_values().collect();

        if priority == Priority::Medium {
            let channels = [
                &mut self.eflow_inv_dc,
                &mut self.eflow_inv_ac,
                &mut self.eflow_bat,
                &mut self.eflow_mod,
            ];
            for channel in channels {
                for snapshot in channel.drain() {
                    if snapshot.total() != 0.0 {
                        values.push(SendValue {
                            name: snapshot.item(),
                            value: Some(snapshot.total()),
                            only_if_changed: true,
                        });
                    }
                }
            }
        }
        values
    }

    /// Upserts a ready result into the queue its item definition selects.
    ///
    /// Not-ready results and items without a priority are ignored; repeated
    /// names collapse, last write wins.
    fn queue_send(&mut self, result: &ReadResult) {
        if !result.ready {
            return;
        }
        let Some(item) = result.item else {
            return;
        };
        let Some(priority) = item.priority else {
            return;
        };

        let entry = SendValue {
            name: result.name,
            value: result.value,
            only_if_changed: true,
        };
        self.queue_mut(priority).insert(result.name, entry);
    }

    fn queue_mut(&mut self, priority: Priority) -> &mut SendQueue {
        match priority {
            Priority::Fast => &mut self.send_fast,
            Priority::Medium => &mut self.send_medium,
            Priority::Slow => &mut self.send_slow,
        }
    }

    /// Multiplies `value_name` by a fixed factor into `target_name`.
    ///
    /// An unknown input produces a ready null target; a missing target is a
    /// configuration error.
    fn apply_factor_scale(
        &mut self,
        results: &mut ResultMap,
        value_name: &'static str,
        factor: f64,
        target_name: &'static str,
    ) -> Result<(), FronmodError> {
        let scaled = match results.get(value_name) {
            Some(result) => match result.value {
                Some(value) => Some(value * factor),
                None => {
                    warn!(value = value_name, target = target_name, "no input for factor scale");
                    None
                }
            },
            None => None,
        };
        self.finish_result(results, target_name, scaled)
    }

    /// Applies a sunssf scale-factor register to a raw register value.
    ///
    /// Missing inputs are configuration errors; a null input value or bad
    /// exponent degrades to a ready null target.
    fn apply_modbus_scale(
        &mut self,
        results: &mut ResultMap,
        value_name: &'static str,
        scale_name: &'static str,
        target_name: &'static str,
    ) -> Result<(), FronmodError> {
        let value = results
            .get(value_name)
            .ok_or(FronmodError::MissingResult(value_name))?;
        let scale = results
            .get(scale_name)
            .ok_or(FronmodError::MissingResult(scale_name))?;

        let scaled = match Self::scale_result(value, scale) {
            Ok(scaled) => Some(scaled),
            Err(err) => {
                warn!(
                    value = value_name,
                    scale = scale_name,
                    target = target_name,
                    "modbus scale failed: {err}"
                );
                None
            }
        };
        self.finish_result(results, target_name, scaled)
    }

    /// Self-consumption from the remembered inverter and meter AC power.
    ///
    /// Queued even when null so the displayed value resets instead of going
    /// stale.
    fn derive_self_consumption(&mut self) {
        let value = match (self.last_inv_ac_power, self.last_met_ac_power) {
            (Some(inverter), Some(meter)) => Some(-0.001 * (inverter + meter)),
            _ => None,
        };
        let result = ReadResult {
            name: SELF_CONSUMPTION,
            value,
            item: Some(&SELF_CONSUMPTION_ITEM),
            ready: true,
        };
        self.queue_send(&result);
    }

    /// Inverter efficiency in percent: `100 * AC / DC`, 0 for a dead DC
    /// side, null while either input is unknown.
    fn derive_inverter_efficiency(&mut self, results: &mut ResultMap) -> Result<(), FronmodError> {
        let value = match (self.last_inv_ac_power, self.last_inv_dc_power) {
            (Some(ac), Some(dc)) => {
                if dc == 0.0 {
                    Some(0.0)
                } else {
                    Some(100.0 * ac / dc)
                }
            }
            _ => None,
        };
        self.finish_result(results, INV_EFFICIENCY, value)
    }

    /// Resolves the sign of the (unsigned) raw battery power register.
    ///
    /// The DC bus balance `DC = module - battery` must roughly hold; the
    /// candidate sign with the smaller mismatch against the remembered
    /// inverter DC power wins. Without a remembered DC power the battery
    /// power collapses to 0.
    fn resolve_battery_sign(&mut self, results: &mut ResultMap) -> Result<(), FronmodError> {
        let value = {
            let raw_bat = results.get(RAW2_BAT_POWER).filter(|r| r.ready);
            let mod_power = results.get(MOD_POWER).filter(|r| r.ready);
            match (raw_bat, mod_power) {
                (Some(raw_bat), Some(mod_power)) => {
                    match (raw_bat.value, mod_power.value) {
                        (Some(bat), Some(module)) => {
                            let charge_factor = match self.last_inv_dc_power {
                                Some(dc) => {
                                    let mismatch_charging = (dc - module + bat).abs();
                                    let mismatch_discharging = (dc - module - bat).abs();
                                    if mismatch_charging < mismatch_discharging {
                                        -1.0
                                    } else {
                                        1.0
                                    }
                                }
                                None => 0.0,
                            };
                            Some(bat * charge_factor)
                        }
                        _ => None,
                    }
                }
                _ => None,
            }
        };
        self.finish_result(results, BAT_POWER, value)
    }

    /// Stores `value` into the target result, marks it ready, and queues it.
    fn finish_result(
        &mut self,
        results: &mut ResultMap,
        target_name: &'static str,
        value: Option<f64>,
    ) -> Result<(), FronmodError> {
        let target = results
            .get_mut(target_name)
            .ok_or(FronmodError::MissingResult(target_name))?;
        target.value = value;
        target.ready = true;
        let queued = target.clone();
        self.queue_send(&queued);
        Ok(())
    }

    /// Feeds a ready result into an energy-flow channel.
    fn push_eflow(
        results: &ResultMap,
        name: &'static str,
        channel: &mut EnergyFlowChannel,
    ) -> Result<(), FronmodError> {
        let result = results.get(name).ok_or(FronmodError::MissingResult(name))?;
        if !result.ready {
            return Err(FronmodError::NotReady(name));
        }
        match result.value {
            Some(value) => channel.push_value(value),
            None => debug!(name, "skipping energy-flow push without a value"),
        }
        Ok(())
    }

    /// Ready value lookup; missing or not-ready results are hard errors.
    fn get_value(results: &ResultMap, name: &'static str) -> Result<Option<f64>, FronmodError> {
        let result = results.get(name).ok_or(FronmodError::MissingResult(name))?;
        if !result.ready {
            return Err(FronmodError::NotReady(name));
        }
        Ok(result.value)
    }

    /// `10^round(sunssf)`, rejecting exponents outside [-10, 10].
    pub fn scale_factor(sunssf: Option<f64>) -> Result<f64, FronmodError> {
        let sunssf = sunssf.ok_or(FronmodError::NullValue)?;
        let exponent = sunssf.round() as i64;
        if !(-10..=10).contains(&exponent) {
            return Err(FronmodError::ScaleExponent(exponent));
        }
        Ok(10f64.powi(exponent as i32))
    }

    /// Applies a scale-factor result to a value result.
    pub fn scale_result(value: &ReadResult, scale: &ReadResult) -> Result<f64, FronmodError> {
        let value = value.value.ok_or(FronmodError::NullValue)?;
        Ok(value * Self::scale_factor(scale.value)?)
    }
}
