//! Energy-flow accumulation between polling intervals.
//!
//! A sampled power signal is integrated over wall-clock time with the
//! trapezoidal rule, assuming linear interpolation between ticks. Positive
//! area flows into an "outflow" aggregate, negative area into an "inflow"
//! aggregate, and an interval whose endpoints have opposite sign is split at
//! the interpolated zero crossing so a power reversal inside one tick lands
//! in the right direction instead of cancelling out.

use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Signal magnitudes below this count as zero for sign classification.
const MIN_SIGNAL: f64 = 1e-9;

/// Wall-clock source, injected so channels stay deterministic under test.
pub trait Clock {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Named running total of energy in one direction.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyFlowAggregate {
    item: &'static str,
    total: f64,
}

impl EnergyFlowAggregate {
    /// Creates a zeroed aggregate publishing under `item`.
    pub fn new(item: &'static str) -> Self {
        Self { item, total: 0.0 }
    }

    /// Adds `delta` to the running total. No clamping, no unit conversion.
    pub fn add(&mut self, delta: f64) {
        self.total += delta;
    }

    /// Output item name.
    pub fn item(&self) -> &'static str {
        self.item
    }

    /// Accumulated value since the last reset.
    pub fn total(&self) -> f64 {
        self.total
    }

    /// Returns a copy of the current state and resets the total to zero.
    pub fn snapshot_and_reset(&mut self) -> Self {
        let snapshot = self.clone();
        self.total = 0.0;
        snapshot
    }
}

/// Per-quantity integration state driving up to two aggregates.
///
/// The last `(time, value)` sample persists for the lifetime of the channel;
/// the aggregates reset independently whenever they are drained. A missing
/// aggregate slot means that direction is not tracked — its contributions
/// are dropped.
pub struct EnergyFlowChannel {
    source: &'static str,
    clock: Arc<dyn Clock>,
    last: Option<(DateTime<Utc>, f64)>,
    outflow: Option<EnergyFlowAggregate>,
    inflow: Option<EnergyFlowAggregate>,
}

impl EnergyFlowChannel {
    /// Creates a channel for `source` using the system clock.
    pub fn new(
        source: &'static str,
        outflow: Option<EnergyFlowAggregate>,
        inflow: Option<EnergyFlowAggregate>,
    ) -> Self {
        Self::with_clock(source, outflow, inflow, Arc::new(SystemClock))
    }

    /// Creates a channel with an explicit clock.
    pub fn with_clock(
        source: &'static str,
        outflow: Option<EnergyFlowAggregate>,
        inflow: Option<EnergyFlowAggregate>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            clock,
            last: None,
            outflow,
            inflow,
        }
    }

    /// Name of the sampled quantity.
    pub fn source(&self) -> &'static str {
        self.source
    }

    /// Outflow (positive-direction) aggregate, if tracked.
    pub fn outflow(&self) -> Option<&EnergyFlowAggregate> {
        self.outflow.as_ref()
    }

    /// Inflow (negative-direction) aggregate, if tracked.
    pub fn inflow(&self) -> Option<&EnergyFlowAggregate> {
        self.inflow.as_ref()
    }

    /// Timestamp and value of the previous sample.
    pub fn last_sample(&self) -> Option<(DateTime<Utc>, f64)> {
        self.last
    }

    /// Feeds the next sample into the channel.
    ///
    /// When a previous sample exists, the elapsed interval is integrated
    /// into the aggregates; the new sample then replaces the stored one
    /// unconditionally — also on the very first call and when the interval
    /// contributes nothing.
    pub fn push_value(&mut self, value: f64) {
        let now = self.clock.now();
        if let Some((last_time, last_value)) = self.last {
            self.integrate(last_time, last_value, now, value);
        }
        self.last = Some((now, value));
    }

    /// Snapshots every present aggregate and resets it to zero.
    ///
    /// Zero-valued aggregates are reported too; callers filter before
    /// publishing if they want only movement.
    pub fn drain(&mut self) -> Vec<EnergyFlowAggregate> {
        let mut snapshots = Vec::new();
        if let Some(agg) = &mut self.outflow {
            snapshots.push(agg.snapshot_and_reset());
        }
        if let Some(agg) = &mut self.inflow {
            snapshots.push(agg.snapshot_and_reset());
        }
        snapshots
    }

    fn integrate(&mut self, t0: DateTime<Utc>, v0: f64, t1: DateTime<Utc>, v1: f64) {
        let elapsed_hours = (t1 - t0).num_milliseconds() as f64 / 3_600_000.0;
        if elapsed_hours <= 0.0 {
            // clock skew or a zero-duration tick
            return;
        }

        let bias0 = bias(v0);
        let bias1 = bias(v1);

        if bias0 + bias1 == 0 && bias0 != bias1 {
            // True sign flip: split the trapezoid at the zero crossing so
            // each triangle lands in its own direction.
            let hours_before = elapsed_hours * normed_intercept(v0, v1);
            let hours_after = elapsed_hours - hours_before;
            self.deposit(v0 * hours_before / 2.0);
            self.deposit(v1 * hours_after / 2.0);
        } else {
            self.deposit((v0 + v1) / 2.0 * elapsed_hours);
        }
    }

    fn deposit(&mut self, delta: f64) {
        if delta > 0.0 {
            if let Some(agg) = &mut self.outflow {
                agg.add(delta);
            }
        } else if let Some(agg) = &mut self.inflow {
            agg.add(delta);
        }
    }
}

/// Sign classification with a dead band around zero.
fn bias(value: f64) -> i32 {
    if value.abs() < MIN_SIGNAL {
        0
    } else if value >= 0.0 {
        1
    } else {
        -1
    }
}

/// Fraction of the interval spent on the `v0` side of the zero crossing.
///
/// For nonzero values of opposite sign,
/// `normed_intercept(a, b) + normed_intercept(b, a) == 1`.
fn normed_intercept(v0: f64, v1: f64) -> f64 {
    let abs_v0 = v0.abs();
    if abs_v0 == 0.0 {
        // unreachable through integrate(): a zero v0 has bias 0
        0.0
    } else {
        1.0 / (1.0 + v1.abs() / abs_v0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::cell::Cell;

    /// Test clock advanced by hand.
    struct ManualClock {
        now: Cell<DateTime<Utc>>,
    }

    impl ManualClock {
        fn starting_at(now: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self { now: Cell::new(now) })
        }

        fn advance_hours(&self, hours: f64) {
            let millis = (hours * 3_600_000.0).round() as i64;
            self.now
                .set(self.now.get() + chrono::Duration::milliseconds(millis));
        }

        fn advance_seconds(&self, seconds: i64) {
            self.now.set(self.now.get() + chrono::Duration::seconds(seconds));
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            self.now.get()
        }
    }

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 9, 9, 0, 0, 0).single().expect("valid date")
    }

    fn channel_with_clock() -> (EnergyFlowChannel, Arc<ManualClock>) {
        let clock = ManualClock::starting_at(start_time());
        let channel = EnergyFlowChannel::with_clock(
            "source",
            Some(EnergyFlowAggregate::new("plus")),
            Some(EnergyFlowAggregate::new("minus")),
            clock.clone(),
        );
        (channel, clock)
    }

    fn outflow_total(channel: &EnergyFlowChannel) -> f64 {
        channel.outflow().map(EnergyFlowAggregate::total).unwrap_or(f64::NAN)
    }

    fn inflow_total(channel: &EnergyFlowChannel) -> f64 {
        channel.inflow().map(EnergyFlowAggregate::total).unwrap_or(f64::NAN)
    }

    #[test]
    fn normed_intercept_midpoint_for_symmetric_flip() {
        assert_eq!(normed_intercept(-1.0, 1.0), 0.5);
        assert_eq!(normed_intercept(1.0, -1.0), 0.5);
    }

    #[test]
    fn normed_intercept_weighted_by_magnitudes() {
        assert_eq!(normed_intercept(1.0, -3.0), 0.25);
        assert_eq!(normed_intercept(3.0, -1.0), 0.75);
        assert_eq!(normed_intercept(1000.0, 0.0), 1.0);
        assert_eq!(normed_intercept(0.0, 1000.0), 0.0);
    }

    #[test]
    fn normed_intercept_complements_sum_to_one() {
        for (a, b) in [(1.0, -3.0), (2.5, -0.4), (800.0, -41.0)] {
            let sum = normed_intercept(a, b) + normed_intercept(b, a);
            assert!((sum - 1.0).abs() < 1e-12, "a={a} b={b} sum={sum}");
        }
    }

    #[test]
    fn first_push_only_stores_the_sample() {
        let (mut channel, _clock) = channel_with_clock();
        assert!(channel.last_sample().is_none());

        channel.push_value(1.0);

        assert_eq!(channel.last_sample(), Some((start_time(), 1.0)));
        assert_eq!(outflow_total(&channel), 0.0);
        assert_eq!(inflow_total(&channel), 0.0);
    }

    #[test]
    fn zero_elapsed_time_contributes_nothing() {
        let (mut channel, _clock) = channel_with_clock();
        channel.push_value(1.0);
        channel.push_value(1.0); // same timestamp

        assert_eq!(outflow_total(&channel), 0.0);
        assert_eq!(inflow_total(&channel), 0.0);
    }

    #[test]
    fn constant_positive_signal_integrates_as_rectangle() {
        let (mut channel, clock) = channel_with_clock();
        channel.push_value(1.0);
        clock.advance_hours(1.0);
        channel.push_value(1.0);

        // (1 + 1) / 2 * 1h = 1
        assert_eq!(outflow_total(&channel), 1.0);
        assert_eq!(inflow_total(&channel), 0.0);
    }

    #[test]
    fn full_reversal_sequence_splits_and_accumulates() {
        // Mirrors a recorded charge/discharge swing: 1, -1, -1, -1(half
        // step), 0, 0, 1 at one-hour ticks.
        let (mut channel, clock) = channel_with_clock();
        channel.push_value(1.0);
        clock.advance_hours(1.0);
        channel.push_value(1.0);

        clock.advance_hours(1.0);
        channel.push_value(-1.0);
        // split at 0.5: outflow += 1*0.5/2, inflow += -1*0.5/2
        assert_eq!(outflow_total(&channel), 1.25);
        assert_eq!(inflow_total(&channel), -0.25);

        clock.advance_hours(1.0);
        channel.push_value(-1.0);
        assert_eq!(outflow_total(&channel), 1.25);
        assert_eq!(inflow_total(&channel), -1.25);

        clock.advance_hours(0.5);
        channel.push_value(-1.0);
        assert_eq!(outflow_total(&channel), 1.25);
        assert_eq!(inflow_total(&channel), -1.75);

        clock.advance_hours(1.0);
        channel.push_value(0.0);
        // -1 -> 0 is not a flip: trapezoid -0.5 goes to inflow
        assert_eq!(outflow_total(&channel), 1.25);
        assert_eq!(inflow_total(&channel), -2.25);

        clock.advance_hours(1.0);
        channel.push_value(0.0);
        assert_eq!(outflow_total(&channel), 1.25);
        assert_eq!(inflow_total(&channel), -2.25);

        clock.advance_hours(1.0);
        channel.push_value(1.0);
        // 0 -> 1 is not a flip either: trapezoid +0.5 to outflow
        assert_eq!(outflow_total(&channel), 1.75);
        assert_eq!(inflow_total(&channel), -2.25);
    }

    #[test]
    fn drain_snapshots_and_resets_both_aggregates() {
        let (mut channel, clock) = channel_with_clock();
        channel.push_value(1.0);
        clock.advance_hours(1.0);
        channel.push_value(1.0);
        clock.advance_hours(1.0);
        channel.push_value(-1.0);

        let snapshots = channel.drain();
        assert_eq!(snapshots.len(), 2);
        let plus = snapshots.iter().find(|s| s.item() == "plus").expect("plus");
        let minus = snapshots.iter().find(|s| s.item() == "minus").expect("minus");
        assert_eq!(plus.total(), 1.25);
        assert_eq!(minus.total(), -0.25);

        assert_eq!(outflow_total(&channel), 0.0);
        assert_eq!(inflow_total(&channel), 0.0);

        // draining again yields zero-valued snapshots, not nothing
        let again = channel.drain();
        assert_eq!(again.len(), 2);
        assert!(again.iter().all(|s| s.total() == 0.0));

        // the last sample survives the drain
        assert!(channel.last_sample().is_some());
    }

    #[test]
    fn missing_inflow_slot_drops_negative_area() {
        let clock = ManualClock::starting_at(start_time());
        let mut channel = EnergyFlowChannel::with_clock(
            "source",
            Some(EnergyFlowAggregate::new("plus")),
            None,
            clock.clone(),
        );

        channel.push_value(-2.0);
        clock.advance_hours(1.0);
        channel.push_value(-2.0);

        assert_eq!(outflow_total(&channel), 0.0);
        assert_eq!(channel.drain().len(), 1);
    }

    #[test]
    fn ten_second_ticks_accumulate_a_minute_of_power() {
        for value in [800.0, -800.0] {
            let (mut channel, clock) = channel_with_clock();
            channel.push_value(value);
            for _ in 0..6 {
                clock.advance_seconds(10);
                channel.push_value(value);
            }

            // 60 s of constant power: value * (1/60) h
            let expected = value / 60.0;
            if value > 0.0 {
                assert_eq!(inflow_total(&channel), 0.0);
                assert!((outflow_total(&channel) - expected).abs() < 1e-9);
            } else {
                assert_eq!(outflow_total(&channel), 0.0);
                assert!((inflow_total(&channel) - expected).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn realistic_reversal_magnitudes() {
        // 1039.4 W falling to -40.94 W across a 10 s tick.
        let (mut channel, clock) = channel_with_clock();
        channel.push_value(1039.4);
        clock.advance_seconds(10);
        channel.push_value(-40.94);

        assert!((outflow_total(&channel) - 1.388_904_778_948_191_2).abs() < 1e-9);
        assert!((inflow_total(&channel) - -0.002_154_778_948_191_209).abs() < 1e-12);
    }

    #[test]
    fn near_zero_values_do_not_count_as_sign_flips() {
        // 1e-12 is inside the dead band: bias 0, so no split happens and the
        // whole (tiny) trapezoid goes to the side of the sum.
        let (mut channel, clock) = channel_with_clock();
        channel.push_value(1.0);
        clock.advance_hours(1.0);
        channel.push_value(-1e-12);

        assert!((outflow_total(&channel) - 0.5).abs() < 1e-9);
        assert_eq!(inflow_total(&channel), 0.0);
    }
}
