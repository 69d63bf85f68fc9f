use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};

use super::{Severity, SeverityCounts};

/// Attributes contributing to the health score, in scoring order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthAttribute {
    Switches,
    Hfis,
    SwitchPorts,
    HfiPorts,
    InterSwitchLinks,
    HfiLinks,
}

impl HealthAttribute {
    pub const ALL: [HealthAttribute; 6] = [
        Self::Switches,
        Self::Hfis,
        Self::SwitchPorts,
        Self::HfiPorts,
        Self::InterSwitchLinks,
        Self::HfiLinks,
    ];

    pub const fn index(self) -> usize {
        match self {
            Self::Switches => 0,
            Self::Hfis => 1,
            Self::SwitchPorts => 2,
            Self::HfiPorts => 3,
            Self::InterSwitchLinks => 4,
            Self::HfiLinks => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Switches => "switches",
            Self::Hfis => "hfis",
            Self::SwitchPorts => "switch_ports",
            Self::HfiPorts => "hfi_ports",
            Self::InterSwitchLinks => "inter_switch_links",
            Self::HfiLinks => "hfi_links",
        }
    }
}

/// Observed count per [`HealthAttribute`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthCounts(pub [u64; 6]);

impl HealthCounts {
    pub fn get(&self, attr: HealthAttribute) -> u64 {
        self.0[attr.index()]
    }

    pub fn set(&mut self, attr: HealthAttribute, value: u64) {
        self.0[attr.index()] = value;
    }
}

/// Weight of one attribute: a fixed number, or derived from the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum WeightSetting {
    #[default]
    Auto,
    Fixed(f64),
}

impl<'de> Deserialize<'de> for WeightSetting {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct WeightVisitor;

        impl Visitor<'_> for WeightVisitor {
            type Value = WeightSetting;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a number or \"auto\"")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<WeightSetting, E> {
                if v.eq_ignore_ascii_case("auto") {
                    return Ok(WeightSetting::Auto);
                }
                v.trim()
                    .parse::<f64>()
                    .map(WeightSetting::Fixed)
                    .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<WeightSetting, E> {
                Ok(WeightSetting::Fixed(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<WeightSetting, E> {
                Ok(WeightSetting::Fixed(v as f64))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<WeightSetting, E> {
                Ok(WeightSetting::Fixed(v as f64))
            }
        }

        d.deserialize_any(WeightVisitor)
    }
}

/// Baselines, weights and latest values backing the health score.
///
/// Baselines only grow, so a sweep that reports fewer nodes than seen
/// before lowers the score instead of shrinking the denominator.
#[derive(Debug, Clone)]
pub struct HealthScoreState {
    baseline: HealthCounts,
    values: HealthCounts,
    settings: [WeightSetting; 6],
    weights: [f64; 6],
    total_weight: f64,
}

impl Default for HealthScoreState {
    fn default() -> Self {
        Self::new([WeightSetting::Auto; 6])
    }
}

impl HealthScoreState {
    pub fn new(settings: [WeightSetting; 6]) -> Self {
        let mut state = Self {
            baseline: HealthCounts::default(),
            values: HealthCounts::default(),
            settings,
            weights: [1.0; 6],
            total_weight: 6.0,
        };
        state.recompute_weights();
        state
    }

    pub fn baseline(&self) -> HealthCounts {
        self.baseline
    }

    pub fn values(&self) -> HealthCounts {
        self.values
    }

    pub fn weight(&self, attr: HealthAttribute) -> f64 {
        self.weights[attr.index()]
    }

    /// Records the latest observed counts, growing the baseline where they
    /// exceed it. Returns true if the baseline grew.
    pub fn update_values(&mut self, values: HealthCounts) -> bool {
        self.values = values;
        let mut grew = false;
        for (base, v) in self.baseline.0.iter_mut().zip(values.0) {
            if v > *base {
                *base = v;
                grew = true;
            }
        }
        if grew {
            self.recompute_weights();
        }
        grew
    }

    /// Replaces the weight settings. Returns true if they changed.
    pub fn set_weights(&mut self, settings: [WeightSetting; 6]) -> bool {
        if settings == self.settings {
            return false;
        }
        self.settings = settings;
        self.recompute_weights();
        true
    }

    fn recompute_weights(&mut self) {
        for attr in HealthAttribute::ALL {
            self.weights[attr.index()] = match self.settings[attr.index()] {
                WeightSetting::Fixed(w) => w.max(0.0),
                WeightSetting::Auto => self.auto_weight(attr),
            };
        }
        self.total_weight = self.weights.iter().sum();
    }

    fn auto_weight(&self, attr: HealthAttribute) -> f64 {
        let ports_per_node = |ports: HealthAttribute, nodes: HealthAttribute| {
            let n = self.baseline.get(nodes);
            if n == 0 {
                0
            } else {
                self.baseline.get(ports) / n
            }
        };
        match attr {
            HealthAttribute::Switches => {
                (ports_per_node(HealthAttribute::SwitchPorts, HealthAttribute::Switches) + 1) as f64
            }
            HealthAttribute::Hfis => {
                (ports_per_node(HealthAttribute::HfiPorts, HealthAttribute::Hfis) + 1) as f64
            }
            _ => 1.0,
        }
    }

    /// Health score as a percentage in `[0, 100]`.
    pub fn score(&self, switch_states: &SeverityCounts, hfi_states: &SeverityCounts) -> f64 {
        if self.total_weight <= 0.0 {
            return 100.0;
        }

        let weighted: f64 = HealthAttribute::ALL
            .iter()
            .map(|&attr| self.ratio(attr, switch_states, hfi_states) * self.weights[attr.index()])
            .sum();

        ((weighted / self.total_weight + 1e-9) * 100.0).min(100.0)
    }

    fn ratio(
        &self,
        attr: HealthAttribute,
        switch_states: &SeverityCounts,
        hfi_states: &SeverityCounts,
    ) -> f64 {
        let baseline = self.baseline.get(attr);
        if baseline == 0 {
            return 1.0;
        }

        let observed = self.values.get(attr) as f64;
        let healthy = match attr {
            HealthAttribute::Switches => observed - penalty(switch_states),
            HealthAttribute::Hfis => observed - penalty(hfi_states),
            _ => observed,
        };

        (healthy / baseline as f64).clamp(0.0, 1.0)
    }
}

fn penalty(states: &SeverityCounts) -> f64 {
    Severity::ALL
        .iter()
        .map(|&s| states[s] as f64 * s.penalty())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(switches: u64, hfis: u64, sw_ports: u64, hfi_ports: u64) -> HealthCounts {
        HealthCounts([switches, hfis, sw_ports, hfi_ports, 0, 0])
    }

    #[test]
    fn test_baseline_is_monotonic() {
        let mut state = HealthScoreState::default();
        assert!(state.update_values(counts(10, 0, 0, 0)));
        assert!(!state.update_values(counts(8, 0, 0, 0)));

        assert_eq!(state.baseline().get(HealthAttribute::Switches), 10);
        assert_eq!(state.values().get(HealthAttribute::Switches), 8);

        let none = SeverityCounts::default();
        let score = state.score(&none, &none);
        assert!(score < 100.0);
    }

    #[test]
    fn test_full_health_is_exactly_100() {
        let mut state = HealthScoreState::default();
        state.update_values(HealthCounts([4, 16, 192, 16, 20, 16]));
        let none = SeverityCounts::default();
        assert_eq!(state.score(&none, &none), 100.0);
    }

    #[test]
    fn test_auto_weights_from_ports_per_node() {
        let mut state = HealthScoreState::default();
        state.update_values(counts(4, 10, 194, 10));
        // 194 / 4 = 48.5 -> 48 + 1
        assert_eq!(state.weight(HealthAttribute::Switches), 49.0);
        assert_eq!(state.weight(HealthAttribute::Hfis), 2.0);
        assert_eq!(state.weight(HealthAttribute::SwitchPorts), 1.0);
    }

    #[test]
    fn test_fixed_weights_override_auto() {
        let mut state = HealthScoreState::default();
        state.update_values(counts(4, 10, 192, 10));
        let mut settings = [WeightSetting::Auto; 6];
        settings[0] = WeightSetting::Fixed(3.0);
        assert!(state.set_weights(settings));
        assert!(!state.set_weights(settings));
        assert_eq!(state.weight(HealthAttribute::Switches), 3.0);
    }

    #[test]
    fn test_severity_penalties_lower_score() {
        let mut state = HealthScoreState::default();
        state.update_values(counts(4, 0, 0, 0));

        let none = SeverityCounts::default();
        let mut critical = SeverityCounts::default();
        critical[Severity::Critical] = 1;
        let mut info = SeverityCounts::default();
        info[Severity::Info] = 3;

        let healthy = state.score(&none, &none);
        assert_eq!(state.score(&info, &none), healthy);
        assert!(state.score(&critical, &none) < healthy);
    }

    #[test]
    fn test_weight_setting_deserialize() {
        #[derive(Deserialize)]
        struct W {
            a: WeightSetting,
            b: WeightSetting,
            c: WeightSetting,
        }
        let w: W = serde_yaml::from_str("a: auto\nb: 2.5\nc: 3\n").expect("parses");
        assert_eq!(w.a, WeightSetting::Auto);
        assert_eq!(w.b, WeightSetting::Fixed(2.5));
        assert_eq!(w.c, WeightSetting::Fixed(3.0));
    }
}
