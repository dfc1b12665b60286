//! Expected generation speed given current free memory and CPU load.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceClass {
    Optimal,
    Good,
    Moderate,
    Slow,
    Critical,
}

/// (class, min free memory GB, max cpu %), best first.
const BANDS: [(PerformanceClass, f64, f64); 4] = [
    (PerformanceClass::Optimal, 12.0, 50.0),
    (PerformanceClass::Good, 8.0, 70.0),
    (PerformanceClass::Moderate, 6.0, 80.0),
    (PerformanceClass::Slow, 4.0, 90.0),
];

impl PerformanceClass {
    /// First band whose memory floor AND cpu ceiling are both met.
    pub fn classify(memory_available_gb: f64, cpu_percent: f64) -> Self {
        BANDS
            .iter()
            .find(|(_, mem, cpu)| memory_available_gb >= *mem && cpu_percent <= *cpu)
            .map(|(class, _, _)| *class)
            .unwrap_or(PerformanceClass::Critical)
    }

    pub fn description(self) -> &'static str {
        match self {
            PerformanceClass::Optimal => "Full speed generation",
            PerformanceClass::Good => "Slightly reduced speed",
            PerformanceClass::Moderate => "Noticeable slowdown",
            PerformanceClass::Slow => "Significant delays",
            PerformanceClass::Critical => "May fail or crash",
        }
    }
}

impl std::fmt::Display for PerformanceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PerformanceClass::Optimal => "optimal",
            PerformanceClass::Good => "good",
            PerformanceClass::Moderate => "moderate",
            PerformanceClass::Slow => "slow",
            PerformanceClass::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_bands() {
        assert_eq!(PerformanceClass::classify(16.0, 20.0), PerformanceClass::Optimal);
        assert_eq!(PerformanceClass::classify(16.0, 60.0), PerformanceClass::Good);
        assert_eq!(PerformanceClass::classify(7.0, 10.0), PerformanceClass::Moderate);
        assert_eq!(PerformanceClass::classify(4.0, 90.0), PerformanceClass::Slow);
        assert_eq!(PerformanceClass::classify(3.9, 0.0), PerformanceClass::Critical);
        assert_eq!(PerformanceClass::classify(32.0, 95.0), PerformanceClass::Critical);
    }

    #[test]
    fn test_description() {
        assert_eq!(PerformanceClass::Critical.description(), "May fail or crash");
        assert_eq!(PerformanceClass::Optimal.to_string(), "optimal");
    }
}
