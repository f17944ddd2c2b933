//! Coulomb counting: trapezoidal charge and energy integration over sampled
//! voltage/current pairs.

use cb_core::units::constants::{MAH_PER_AMP_SECOND, SECONDS_PER_HOUR};

/// Which way charge is moving relative to the cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Charge,
    Discharge,
}

impl Direction {
    /// Sign applied to accumulated capacity and energy: charging counts
    /// positive, discharging negative.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Charge => 1.0,
            Direction::Discharge => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    t_s: f64,
    voltage_v: f64,
    current_a: f64,
}

/// Trapezoidal integrator for transferred capacity (mAh) and energy (Wh).
///
/// The first sample after construction or [`reseed`](Self::reseed) only seeds
/// the integrator; accumulation happens between consecutive samples. Samples
/// are taken on current magnitude, so the caller's measured sign convention
/// does not matter; the configured [`Direction`] fixes the sign of the totals.
#[derive(Debug, Clone)]
pub struct CoulombCounter {
    direction: Direction,
    last: Option<Sample>,
    capacity_mah: f64,
    energy_wh: f64,
}

impl CoulombCounter {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            last: None,
            capacity_mah: 0.0,
            energy_wh: 0.0,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Feed one sample. Non-increasing timestamps contribute nothing.
    pub fn observe(&mut self, t_s: f64, voltage_v: f64, current_a: f64) {
        if let Some(prev) = self.last {
            let dt = t_s - prev.t_s;
            if dt > 0.0 {
                let sign = self.direction.sign();
                let i_avg = 0.5 * (prev.current_a.abs() + current_a.abs());
                let p_avg = 0.5
                    * (prev.voltage_v * prev.current_a.abs() + voltage_v * current_a.abs());
                self.capacity_mah += sign * i_avg * dt * MAH_PER_AMP_SECOND;
                self.energy_wh += sign * p_avg * dt / SECONDS_PER_HOUR;
            }
        }
        self.last = Some(Sample {
            t_s,
            voltage_v,
            current_a,
        });
    }

    /// Signed accumulated capacity (mAh); negative for discharge.
    pub fn capacity_mah(&self) -> f64 {
        self.capacity_mah
    }

    /// Signed accumulated energy (Wh); negative for discharge.
    pub fn energy_wh(&self) -> f64 {
        self.energy_wh
    }

    /// Drop the seed sample but keep the running totals. Used when a loop
    /// pauses (output disabled) and later resumes: the idle gap must not be
    /// integrated.
    pub fn reseed(&mut self) {
        self.last = None;
    }
}
