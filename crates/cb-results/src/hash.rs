//! Content-based hashing for run IDs.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Run identity: digest of the settings snapshot, the experiment kind, and
/// the start timestamp. Two runs of identical settings started at different
/// times get distinct IDs.
pub fn compute_run_id<S: Serialize>(settings: &S, kind: &str, started_at: &str) -> String {
    let mut hasher = Sha256::new();

    let settings_json = serde_json::to_string(settings).unwrap_or_default();
    hasher.update(settings_json.as_bytes());
    hasher.update(kind.as_bytes());
    hasher.update(started_at.as_bytes());

    let result = hasher.finalize();
    format!("{:x}", result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct FakeSettings {
        charge_voltage_v: f64,
        current_a: f64,
    }

    #[test]
    fn hash_stability() {
        let settings = FakeSettings {
            charge_voltage_v: 4.2,
            current_a: 0.5,
        };
        let a = compute_run_id(&settings, "characterization", "2026-03-01T00:00:00Z");
        let b = compute_run_id(&settings, "characterization", "2026-03-01T00:00:00Z");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn hash_differs_for_different_inputs() {
        let settings = FakeSettings {
            charge_voltage_v: 4.2,
            current_a: 0.5,
        };
        let other = FakeSettings {
            charge_voltage_v: 4.1,
            current_a: 0.5,
        };
        let a = compute_run_id(&settings, "characterization", "2026-03-01T00:00:00Z");
        assert_ne!(
            a,
            compute_run_id(&other, "characterization", "2026-03-01T00:00:00Z")
        );
        assert_ne!(
            a,
            compute_run_id(&settings, "characterization", "2026-03-01T00:00:01Z")
        );
    }
}
