use crate::domain::models::MessageSeverity;

/// Decides when a falling battery level deserves a user-facing alert.
///
/// Each threshold fires once per descent; the client's marker remembers the
/// last threshold that fired and is reset when the headset disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LowBatteryPolicy {
    pub warn_threshold: u8,
    pub error_threshold: u8,
}

impl Default for LowBatteryPolicy {
    fn default() -> Self {
        Self {
            warn_threshold: 30,
            error_threshold: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LowBatteryAlert {
    pub severity: MessageSeverity,
    /// New value for the client's notification marker
    pub threshold: u8,
}

impl LowBatteryPolicy {
    pub fn evaluate(&self, level: u8, last_notified: u8) -> Option<LowBatteryAlert> {
        if level <= self.error_threshold && last_notified > self.error_threshold {
            Some(LowBatteryAlert {
                severity: MessageSeverity::Error,
                threshold: self.error_threshold,
            })
        } else if level <= self.warn_threshold && last_notified > self.warn_threshold {
            Some(LowBatteryAlert {
                severity: MessageSeverity::Warning,
                threshold: self.warn_threshold,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_alert_above_thresholds() {
        let policy = LowBatteryPolicy::default();
        assert_eq!(policy.evaluate(75, 100), None);
        assert_eq!(policy.evaluate(31, 100), None);
    }

    #[test]
    fn test_warning_then_error() {
        let policy = LowBatteryPolicy::default();

        let warn = policy.evaluate(28, 100).unwrap();
        assert_eq!(warn.severity, MessageSeverity::Warning);
        assert_eq!(warn.threshold, 30);

        // Still in the warning band: already notified
        assert_eq!(policy.evaluate(25, warn.threshold), None);

        let error = policy.evaluate(19, warn.threshold).unwrap();
        assert_eq!(error.severity, MessageSeverity::Error);
        assert_eq!(error.threshold, 20);

        assert_eq!(policy.evaluate(5, error.threshold), None);
    }

    #[test]
    fn test_sudden_drop_goes_straight_to_error() {
        let policy = LowBatteryPolicy::default();
        let alert = policy.evaluate(10, 100).unwrap();
        assert_eq!(alert.severity, MessageSeverity::Error);
    }
}
