use crate::model::configuration::StandingReservationConfig;
use crate::model::reservation::ReservationKey;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Minute,
    Hour,
    #[default]
    Day,
    Week,
    /// Thirty days.
    Month,
    /// A single instance, never rolled forward.
    Infinity,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DayOfWeek {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl DayOfWeek {
    pub fn from_days_from_monday(days: u32) -> Self {
        match days % 7 {
            0 => DayOfWeek::Mon,
            1 => DayOfWeek::Tue,
            2 => DayOfWeek::Wed,
            3 => DayOfWeek::Thu,
            4 => DayOfWeek::Fri,
            5 => DayOfWeek::Sat,
            _ => DayOfWeek::Sun,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TimeWindow {
    pub start: i64,
    pub end: i64,
}

impl TimeWindow {
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.start < end && start < self.end
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    /// Light validation run once per scheduling iteration.
    Iteration,
    /// Roll-forward run once per scheduling period.
    Period,
}

/// A recurring reservation template and its depth-bounded array of live instances.
/// `instances[i]` holds the instance of the i-th period counted from `period_start`.
#[derive(Debug, Clone)]
pub struct StandingReservation {
    pub name: Box<str>,
    pub config: StandingReservationConfig,
    pub instances: Vec<Option<ReservationKey>>,
    /// Beginning of the period of `instances[0]`, set on the first refresh.
    pub period_start: Option<i64>,
    pub disabled: bool,
}

impl StandingReservation {
    pub fn new(name: &str, config: StandingReservationConfig) -> Self {
        let disabled = config.disabled;
        let mut standing = StandingReservation {
            name: name.into(),
            config,
            instances: Vec::new(),
            period_start: None,
            disabled,
        };
        standing.instances.resize(standing.depth(), None);
        standing
    }

    /// Number of instances kept materialized. An infinite period only ever has one.
    pub fn depth(&self) -> usize {
        if self.config.period == Period::Infinity { 1 } else { self.config.depth }
    }

    pub fn live_instances(&self) -> impl Iterator<Item = ReservationKey> + '_ {
        self.instances.iter().flatten().copied()
    }

    pub fn slot_of(&self, key: ReservationKey) -> Option<usize> {
        self.instances.iter().position(|k| *k == Some(key))
    }
}

/// Serializable state of a standing reservation. Instances are referenced by reservation name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StandingReservationState {
    pub name: Box<str>,
    pub period_start: Option<i64>,
    pub disabled: bool,
    pub instances: Vec<Option<Box<str>>>,
}
