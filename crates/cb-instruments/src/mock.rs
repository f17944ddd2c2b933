//! Deterministic simulated bench.
//!
//! [`SimBench`] models one cell on a rig: a linear-OCV cell behind a
//! source/sink with CC/CV behavior, a potentiostat that synthesizes OCV rests
//! and R-RC impedance spectra, a multi-zone chamber with first-order thermal
//! response, and a relay bank. All state advances lazily from the injected
//! [`Clock`], so a [`TestClock`](cb_core::TestClock) makes hour-long
//! experiments run instantly and reproducibly.
//!
//! Every command is appended to a log with its timestamp and priority, which is
//! what the shutdown-ordering and relay-safety tests assert against.

use std::f64::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cb_core::{CancelToken, Clock, sleep_cancellable};

use crate::bench::Bench;
use crate::error::{InstrumentError, InstrumentResult};
use crate::potentiostat::{
    GEIS_FREQ_HZ, GEIS_IM_Z_OHM, GEIS_RE_Z_OHM, GeisConfig, OCV_EWE_V, OCV_TIME_S, OcvConfig,
    Potentiostat,
};
use crate::relay::RelayMatrix;
use crate::source::PowerSource;
use crate::thermal::ThermalChamber;
use crate::types::{CommandPriority, SourceStatus, SweepRecord, ZoneReading};

/// Relay pin wired to the power source in the simulated rig.
pub const SOURCE_PIN: usize = 0;
/// Relay pin wired to the potentiostat in the simulated rig.
pub const POTENTIOSTAT_PIN: usize = 1;

const SIM_RELAY_PINS: usize = 8;
const SIM_ZONE_COUNT: usize = 2;
const SIM_AMBIENT_C: f64 = 25.0;
const SIM_THERMAL_TAU_S: f64 = 30.0;
/// Largest integration substep for the cell model (s).
const MAX_STEP_S: f64 = 1.0;

/// Parameters of the simulated cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimCellSpec {
    /// True capacity of the cell (mAh).
    pub capacity_mah: f64,
    /// Open-circuit voltage at zero charge (V).
    pub v_empty_v: f64,
    /// Open-circuit voltage at full charge (V).
    pub v_full_v: f64,
    /// Series (ohmic) resistance (ohm).
    pub resistance_ohm: f64,
    /// Charge-transfer resistance of the single RC branch (ohm).
    pub charge_transfer_ohm: f64,
    /// Time constant of the RC branch (s).
    pub rc_tau_s: f64,
    /// Charge in the cell when the bench is created (mAh).
    pub initial_charge_mah: f64,
}

impl Default for SimCellSpec {
    fn default() -> Self {
        Self {
            capacity_mah: 50.0,
            v_empty_v: 3.0,
            v_full_v: 4.2,
            resistance_ohm: 0.05,
            charge_transfer_ohm: 0.030,
            rc_tau_s: 7.5,
            initial_charge_mah: 0.0,
        }
    }
}

impl SimCellSpec {
    /// Open-circuit voltage for a given charge. Linear in charge and
    /// deliberately unclamped so overcharge and overdischarge are visible.
    pub fn ocv_v(&self, charge_mah: f64) -> f64 {
        self.v_empty_v + (self.v_full_v - self.v_empty_v) * charge_mah / self.capacity_mah
    }
}

/// One issued instrument command, as recorded by the simulated bench.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRecord {
    pub at_s: f64,
    pub instrument: &'static str,
    pub command: String,
    pub priority: CommandPriority,
}

#[derive(Debug)]
struct CellState {
    charge_mah: f64,
    programmed_v: f64,
    source_limit_a: f64,
    sink_limit_a: f64,
    source_power_w: Option<f64>,
    sink_power_w: Option<f64>,
    output_enabled: bool,
    last_update_s: f64,
}

#[derive(Debug)]
struct RelayState {
    closed: [bool; SIM_RELAY_PINS],
    /// Latched true if the source and potentiostat pins were ever closed at
    /// the same time. That wiring state can damage both instruments, so the
    /// safety tests assert it never happens.
    simultaneous_seen: bool,
}

#[derive(Debug, Clone, Copy)]
struct ZoneState {
    setpoint_c: f64,
    temp_c: f64,
    fault: bool,
}

#[derive(Debug)]
struct ThermalState {
    zones: [ZoneState; SIM_ZONE_COUNT],
    running: bool,
    last_update_s: f64,
}

struct Shared {
    spec: SimCellSpec,
    clock: Arc<dyn Clock>,
    cell: Mutex<CellState>,
    relays: Mutex<RelayState>,
    thermal: Mutex<ThermalState>,
    log: Mutex<Vec<CommandRecord>>,
}

impl Shared {
    fn record(&self, instrument: &'static str, command: String, priority: CommandPriority) {
        let at_s = self.clock.now_s();
        self.log
            .lock()
            .expect("sim command log poisoned")
            .push(CommandRecord {
                at_s,
                instrument,
                command,
                priority,
            });
    }

    fn source_connected(&self) -> bool {
        self.relays.lock().expect("sim relay state poisoned").closed[SOURCE_PIN]
    }

    fn potentiostat_connected(&self) -> bool {
        self.relays.lock().expect("sim relay state poisoned").closed[POTENTIOSTAT_PIN]
    }

    /// Current drawn from / pushed into the cell for the present settings.
    /// Positive charges the cell.
    fn instantaneous_current(&self, cell: &CellState, source_connected: bool) -> f64 {
        if !cell.output_enabled || !source_connected {
            return 0.0;
        }
        let ocv = self.spec.ocv_v(cell.charge_mah);
        if cell.programmed_v >= ocv {
            let mut limit = cell.source_limit_a;
            if let Some(p) = cell.source_power_w {
                limit = limit.min(p / ocv.max(0.1));
            }
            ((cell.programmed_v - ocv) / self.spec.resistance_ohm).clamp(0.0, limit.max(0.0))
        } else {
            let mut limit = cell.sink_limit_a;
            if let Some(p) = cell.sink_power_w {
                limit = limit.min(p / ocv.max(0.1));
            }
            -((ocv - cell.programmed_v) / self.spec.resistance_ohm).clamp(0.0, limit.max(0.0))
        }
    }

    /// Advance the cell model to the clock's present time in bounded substeps.
    fn integrate_cell(&self) {
        let now = self.clock.now_s();
        let source_connected = self.source_connected();
        let mut cell = self.cell.lock().expect("sim cell state poisoned");
        let mut t = cell.last_update_s;
        while t < now {
            let dt = (now - t).min(MAX_STEP_S);
            let i = self.instantaneous_current(&cell, source_connected);
            cell.charge_mah += i * dt * (1000.0 / 3600.0);
            t += dt;
        }
        cell.last_update_s = now;
    }

    fn integrate_thermal(&self) {
        let now = self.clock.now_s();
        let mut thermal = self.thermal.lock().expect("sim thermal state poisoned");
        let dt = now - thermal.last_update_s;
        if dt > 0.0 {
            let alpha = 1.0 - (-dt / SIM_THERMAL_TAU_S).exp();
            let running = thermal.running;
            for zone in thermal.zones.iter_mut() {
                let target = if running { zone.setpoint_c } else { SIM_AMBIENT_C };
                zone.temp_c += (target - zone.temp_c) * alpha;
            }
        }
        thermal.last_update_s = now;
    }
}

/// The full simulated bench plus its inspection/manipulation handles for tests.
#[derive(Clone)]
pub struct SimBench {
    shared: Arc<Shared>,
}

impl SimBench {
    pub fn new(spec: SimCellSpec, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_s();
        let zone = ZoneState {
            setpoint_c: SIM_AMBIENT_C,
            temp_c: SIM_AMBIENT_C,
            fault: false,
        };
        let shared = Arc::new(Shared {
            cell: Mutex::new(CellState {
                charge_mah: spec.initial_charge_mah,
                programmed_v: 0.0,
                source_limit_a: 0.0,
                sink_limit_a: 0.0,
                source_power_w: None,
                sink_power_w: None,
                output_enabled: false,
                last_update_s: now,
            }),
            relays: Mutex::new(RelayState {
                closed: [false; SIM_RELAY_PINS],
                simultaneous_seen: false,
            }),
            thermal: Mutex::new(ThermalState {
                zones: [zone; SIM_ZONE_COUNT],
                running: false,
                last_update_s: now,
            }),
            log: Mutex::new(Vec::new()),
            spec,
            clock,
        });
        Self { shared }
    }

    /// The instrument bundle backed by this simulation.
    pub fn bench(&self) -> Bench {
        Bench::new(
            Arc::new(SimPowerSource {
                shared: self.shared.clone(),
            }),
            self.potentiostat(),
            Arc::new(SimThermal {
                shared: self.shared.clone(),
            }),
            Arc::new(SimRelays {
                shared: self.shared.clone(),
            }),
        )
    }

    pub fn potentiostat(&self) -> Arc<dyn Potentiostat> {
        Arc::new(SimPotentiostat {
            shared: self.shared.clone(),
        })
    }

    /// Charge currently in the cell (mAh), after advancing the model.
    pub fn charge_mah(&self) -> f64 {
        self.shared.integrate_cell();
        self.shared
            .cell
            .lock()
            .expect("sim cell state poisoned")
            .charge_mah
    }

    /// Force the cell to a charge level (test setup).
    pub fn set_charge_mah(&self, charge_mah: f64) {
        self.shared.integrate_cell();
        self.shared
            .cell
            .lock()
            .expect("sim cell state poisoned")
            .charge_mah = charge_mah;
    }

    pub fn ocv_v(&self) -> f64 {
        self.shared.spec.ocv_v(self.charge_mah())
    }

    pub fn pin_closed(&self, pin: usize) -> bool {
        self.shared.relays.lock().expect("sim relay state poisoned").closed[pin]
    }

    pub fn output_enabled(&self) -> bool {
        self.shared
            .cell
            .lock()
            .expect("sim cell state poisoned")
            .output_enabled
    }

    /// True if the source and potentiostat relays were ever closed together.
    pub fn simultaneous_connection_seen(&self) -> bool {
        self.shared
            .relays
            .lock()
            .expect("sim relay state poisoned")
            .simultaneous_seen
    }

    pub fn commands(&self) -> Vec<CommandRecord> {
        self.shared
            .log
            .lock()
            .expect("sim command log poisoned")
            .clone()
    }

    pub fn clear_commands(&self) {
        self.shared
            .log
            .lock()
            .expect("sim command log poisoned")
            .clear();
    }

    pub fn zone_temp_c(&self, zone: usize) -> f64 {
        self.shared.integrate_thermal();
        self.shared
            .thermal
            .lock()
            .expect("sim thermal state poisoned")
            .zones[zone]
            .temp_c
    }

    /// Force a zone temperature (test setup).
    pub fn set_zone_temp(&self, zone: usize, temp_c: f64) {
        self.shared.integrate_thermal();
        self.shared
            .thermal
            .lock()
            .expect("sim thermal state poisoned")
            .zones[zone]
            .temp_c = temp_c;
    }

    pub fn set_zone_fault(&self, zone: usize, fault: bool) {
        self.shared
            .thermal
            .lock()
            .expect("sim thermal state poisoned")
            .zones[zone]
            .fault = fault;
    }
}

struct SimPowerSource {
    shared: Arc<Shared>,
}

impl PowerSource for SimPowerSource {
    fn status(&self, priority: CommandPriority) -> InstrumentResult<SourceStatus> {
        self.shared.integrate_cell();
        self.shared.record("source", "status".to_string(), priority);
        let source_connected = self.shared.source_connected();
        let cell = self.shared.cell.lock().expect("sim cell state poisoned");
        let i = self.shared.instantaneous_current(&cell, source_connected);
        let ocv = self.shared.spec.ocv_v(cell.charge_mah);
        let v = ocv + i * self.shared.spec.resistance_ohm;
        Ok(SourceStatus {
            voltage_v: v,
            current_a: i,
            power_w: v * i,
            output_enabled: cell.output_enabled,
        })
    }

    fn set_voltage(&self, volts: f64, priority: CommandPriority) -> InstrumentResult<()> {
        self.shared.integrate_cell();
        self.shared
            .record("source", format!("set_voltage {volts:.4}"), priority);
        self.shared
            .cell
            .lock()
            .expect("sim cell state poisoned")
            .programmed_v = volts;
        Ok(())
    }

    fn set_current(&self, amps: f64, priority: CommandPriority) -> InstrumentResult<()> {
        self.shared.integrate_cell();
        self.shared
            .record("source", format!("set_current {amps:.4}"), priority);
        self.shared
            .cell
            .lock()
            .expect("sim cell state poisoned")
            .source_limit_a = amps;
        Ok(())
    }

    fn set_sink_current(&self, amps: f64, priority: CommandPriority) -> InstrumentResult<()> {
        self.shared.integrate_cell();
        self.shared
            .record("source", format!("set_sink_current {amps:.4}"), priority);
        self.shared
            .cell
            .lock()
            .expect("sim cell state poisoned")
            .sink_limit_a = amps;
        Ok(())
    }

    fn set_power(&self, watts: f64, priority: CommandPriority) -> InstrumentResult<()> {
        self.shared.integrate_cell();
        self.shared
            .record("source", format!("set_power {watts:.4}"), priority);
        self.shared
            .cell
            .lock()
            .expect("sim cell state poisoned")
            .source_power_w = Some(watts);
        Ok(())
    }

    fn set_sink_power(&self, watts: f64, priority: CommandPriority) -> InstrumentResult<()> {
        self.shared.integrate_cell();
        self.shared
            .record("source", format!("set_sink_power {watts:.4}"), priority);
        self.shared
            .cell
            .lock()
            .expect("sim cell state poisoned")
            .sink_power_w = Some(watts);
        Ok(())
    }

    fn set_output_enabled(
        &self,
        enabled: bool,
        priority: CommandPriority,
    ) -> InstrumentResult<()> {
        self.shared.integrate_cell();
        self.shared
            .record("source", format!("set_output_enabled {enabled}"), priority);
        self.shared
            .cell
            .lock()
            .expect("sim cell state poisoned")
            .output_enabled = enabled;
        Ok(())
    }
}

struct SimPotentiostat {
    shared: Arc<Shared>,
}

impl Potentiostat for SimPotentiostat {
    fn measure_ocv(
        &self,
        config: &OcvConfig,
        cancel: &CancelToken,
    ) -> InstrumentResult<SweepRecord> {
        if config.duration_s <= 0.0 || config.sample_period_s <= 0.0 {
            return Err(InstrumentError::InvalidConfig {
                what: "OCV duration and sample period must be positive",
            });
        }
        self.shared.record(
            "potentiostat",
            "measure_ocv".to_string(),
            CommandPriority::Normal,
        );
        if !self.shared.potentiostat_connected() {
            return Err(InstrumentError::Comm {
                message: "cell not connected to potentiostat".to_string(),
            });
        }
        let samples = (config.duration_s / config.sample_period_s).floor() as usize + 1;
        let mut time_s = Vec::with_capacity(samples);
        let mut ewe_v = Vec::with_capacity(samples);
        let start_s = self.shared.clock.now_s();
        for k in 0..samples {
            if k > 0
                && !sleep_cancellable(
                    self.shared.clock.as_ref(),
                    cancel,
                    config.sample_period_s,
                    config.sample_period_s.min(1.0),
                )
            {
                return Err(InstrumentError::Cancelled);
            }
            if cancel.is_cancelled() {
                return Err(InstrumentError::Cancelled);
            }
            self.shared.integrate_cell();
            let charge = self
                .shared
                .cell
                .lock()
                .expect("sim cell state poisoned")
                .charge_mah;
            time_s.push(self.shared.clock.now_s() - start_s);
            ewe_v.push(self.shared.spec.ocv_v(charge));
        }
        Ok(SweepRecord::new(
            vec![OCV_TIME_S.to_string(), OCV_EWE_V.to_string()],
            vec![time_s, ewe_v],
        ))
    }

    fn measure_geis(
        &self,
        config: &GeisConfig,
        cancel: &CancelToken,
    ) -> InstrumentResult<SweepRecord> {
        if config.amplitude_a <= 0.0
            || config.freq_start_hz < config.freq_end_hz
            || config.freq_end_hz <= 0.0
            || config.points_per_decade == 0
        {
            return Err(InstrumentError::InvalidConfig {
                what: "GEIS sweep must run from a high to a low positive frequency",
            });
        }
        self.shared.record(
            "potentiostat",
            "measure_geis".to_string(),
            CommandPriority::Normal,
        );
        if !self.shared.potentiostat_connected() {
            return Err(InstrumentError::Comm {
                message: "cell not connected to potentiostat".to_string(),
            });
        }
        let decades = (config.freq_start_hz / config.freq_end_hz).log10();
        let points = (decades * f64::from(config.points_per_decade)).round() as usize + 1;
        let step = 10f64.powf(-1.0 / f64::from(config.points_per_decade));
        let spec = &self.shared.spec;
        let mut freq_hz = Vec::with_capacity(points);
        let mut re_z = Vec::with_capacity(points);
        let mut im_z = Vec::with_capacity(points);
        let mut f = config.freq_start_hz;
        for k in 0..points {
            if k + 1 == points {
                f = config.freq_end_hz;
            }
            // Low frequencies dominate sweep time: at least two periods each.
            let dwell_s = (2.0 / f).max(1.0);
            if !sleep_cancellable(self.shared.clock.as_ref(), cancel, dwell_s, 1.0) {
                return Err(InstrumentError::Cancelled);
            }
            let omega_tau = 2.0 * PI * f * spec.rc_tau_s;
            let denom = 1.0 + omega_tau * omega_tau;
            freq_hz.push(f);
            re_z.push(spec.resistance_ohm + spec.charge_transfer_ohm / denom);
            im_z.push(-omega_tau * spec.charge_transfer_ohm / denom);
            f *= step;
        }
        Ok(SweepRecord::new(
            vec![
                GEIS_FREQ_HZ.to_string(),
                GEIS_RE_Z_OHM.to_string(),
                GEIS_IM_Z_OHM.to_string(),
            ],
            vec![freq_hz, re_z, im_z],
        ))
    }
}

struct SimThermal {
    shared: Arc<Shared>,
}

impl ThermalChamber for SimThermal {
    fn zone_count(&self) -> usize {
        SIM_ZONE_COUNT
    }

    fn set_setpoint_c(
        &self,
        zone: usize,
        setpoint_c: f64,
        priority: CommandPriority,
    ) -> InstrumentResult<()> {
        if zone >= SIM_ZONE_COUNT {
            return Err(InstrumentError::InvalidConfig {
                what: "thermal zone index out of range",
            });
        }
        self.shared.integrate_thermal();
        self.shared.record(
            "thermal",
            format!("set_setpoint zone={zone} c={setpoint_c:.2}"),
            priority,
        );
        self.shared
            .thermal
            .lock()
            .expect("sim thermal state poisoned")
            .zones[zone]
            .setpoint_c = setpoint_c;
        Ok(())
    }

    fn set_running(&self, running: bool, priority: CommandPriority) -> InstrumentResult<()> {
        self.shared.integrate_thermal();
        self.shared
            .record("thermal", format!("set_running {running}"), priority);
        self.shared
            .thermal
            .lock()
            .expect("sim thermal state poisoned")
            .running = running;
        Ok(())
    }

    fn read_zones(&self, priority: CommandPriority) -> InstrumentResult<Vec<ZoneReading>> {
        self.shared.integrate_thermal();
        self.shared
            .record("thermal", "read_zones".to_string(), priority);
        let thermal = self.shared.thermal.lock().expect("sim thermal state poisoned");
        Ok(thermal
            .zones
            .iter()
            .enumerate()
            .map(|(zone, z)| ZoneReading {
                zone,
                temp_c: z.temp_c,
                fault: z.fault,
            })
            .collect())
    }
}

struct SimRelays {
    shared: Arc<Shared>,
}

impl RelayMatrix for SimRelays {
    fn set_pin(&self, pin: usize, closed: bool, priority: CommandPriority) -> InstrumentResult<()> {
        if pin >= SIM_RELAY_PINS {
            return Err(InstrumentError::InvalidConfig {
                what: "relay pin out of range",
            });
        }
        // Settle the cell under the old wiring before the topology changes.
        self.shared.integrate_cell();
        self.shared
            .record("relay", format!("set_pin {pin} closed={closed}"), priority);
        let mut relays = self.shared.relays.lock().expect("sim relay state poisoned");
        relays.closed[pin] = closed;
        if relays.closed[SOURCE_PIN] && relays.closed[POTENTIOSTAT_PIN] {
            relays.simultaneous_seen = true;
        }
        Ok(())
    }
}

/// Potentiostat wrapper that fails a configured number of calls before
/// delegating, for exercising the capture retry path.
pub struct FlakyPotentiostat {
    inner: Arc<dyn Potentiostat>,
    ocv_failures_left: AtomicUsize,
    geis_failures_left: AtomicUsize,
}

impl FlakyPotentiostat {
    pub fn new(inner: Arc<dyn Potentiostat>, ocv_failures: usize, geis_failures: usize) -> Self {
        Self {
            inner,
            ocv_failures_left: AtomicUsize::new(ocv_failures),
            geis_failures_left: AtomicUsize::new(geis_failures),
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Potentiostat for FlakyPotentiostat {
    fn measure_ocv(
        &self,
        config: &OcvConfig,
        cancel: &CancelToken,
    ) -> InstrumentResult<SweepRecord> {
        if Self::take_failure(&self.ocv_failures_left) {
            return Err(InstrumentError::Comm {
                message: "injected OCV failure".to_string(),
            });
        }
        self.inner.measure_ocv(config, cancel)
    }

    fn measure_geis(
        &self,
        config: &GeisConfig,
        cancel: &CancelToken,
    ) -> InstrumentResult<SweepRecord> {
        if Self::take_failure(&self.geis_failures_left) {
            return Err(InstrumentError::Comm {
                message: "injected GEIS failure".to_string(),
            });
        }
        self.inner.measure_geis(config, cancel)
    }
}
