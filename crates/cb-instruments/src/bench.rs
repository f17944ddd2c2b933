//! Instrument bundle handed to the orchestration layer.

use std::sync::Arc;

use crate::potentiostat::Potentiostat;
use crate::relay::RelayMatrix;
use crate::source::PowerSource;
use crate::thermal::ThermalChamber;

/// All instruments of one test rig, shareable across worker threads.
#[derive(Clone)]
pub struct Bench {
    pub source: Arc<dyn PowerSource>,
    pub potentiostat: Arc<dyn Potentiostat>,
    pub thermal: Arc<dyn ThermalChamber>,
    pub relays: Arc<dyn RelayMatrix>,
}

impl Bench {
    pub fn new(
        source: Arc<dyn PowerSource>,
        potentiostat: Arc<dyn Potentiostat>,
        thermal: Arc<dyn ThermalChamber>,
        relays: Arc<dyn RelayMatrix>,
    ) -> Self {
        Self {
            source,
            potentiostat,
            thermal,
            relays,
        }
    }
}
