use std::collections::HashMap;

/// Per-device count of reports received.
///
/// The count is only cleared when a temporary ban expires (or an admin lifts
/// the ban), so further reports during a ban keep accumulating.
#[derive(Debug)]
pub struct ReportCounter {
    counts: HashMap<String, u32>,
    threshold: u32,
}

impl ReportCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            counts: HashMap::new(),
            threshold,
        }
    }

    /// Count one report against `device_id`. Returns the new total.
    pub fn record(&mut self, device_id: &str) -> u32 {
        let count = self.counts.entry(device_id.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub fn count(&self, device_id: &str) -> u32 {
        self.counts.get(device_id).copied().unwrap_or(0)
    }

    pub fn reached_threshold(&self, device_id: &str) -> bool {
        self.count(device_id) >= self.threshold
    }

    pub fn reset(&mut self, device_id: &str) {
        self.counts.remove(device_id);
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_reached_on_third_report() {
        let mut reports = ReportCounter::new(3);
        assert_eq!(reports.record("device-yyy"), 1);
        assert_eq!(reports.record("device-yyy"), 2);
        assert!(!reports.reached_threshold("device-yyy"));
        assert_eq!(reports.record("device-yyy"), 3);
        assert!(reports.reached_threshold("device-yyy"));

        reports.reset("device-yyy");
        assert_eq!(reports.count("device-yyy"), 0);
    }
}
