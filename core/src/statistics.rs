use std::borrow::Cow;
use std::time::Duration;

use arrayvec::ArrayVec;

/// The value of a single statistic.
///
/// Percentages are stored as fractions in the range `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub enum StatisticValue {
    Boolean(bool),
    Integer(i64),
    FloatRange { average: f64, min: f64, max: f64 },
    ByteSize(u64),
    ByteSizeRange { average: u64, min: u64, max: u64 },
    Time(Duration),
    TimeRange { average: Duration, min: Duration, max: Duration },
    Percentage(f64),
    PercentageRange { average: f64, min: f64, max: f64 },
    BytesPerSecond(f64),
    /// A string that's owned by the stack entry and only valid for display.
    ReferenceString(Cow<'static, str>),
    PersistentString(String),
}

/// A named statistic reported by a part of the streaming stack.
#[derive(Debug, Clone, PartialEq)]
pub struct Statistic {
    /// The name of the stack entry or component that owns this statistic.
    pub owner: String,
    pub name: Cow<'static, str>,
    pub value: StatisticValue,
    pub description: Cow<'static, str>,
}

impl Statistic {
    fn create(
        owner: &str,
        name: impl Into<Cow<'static, str>>,
        value: StatisticValue,
        description: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            owner: owner.to_owned(),
            name: name.into(),
            value,
            description: description.into(),
        }
    }

    pub fn create_boolean(
        owner: &str,
        name: impl Into<Cow<'static, str>>,
        value: bool,
        description: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::create(owner, name, StatisticValue::Boolean(value), description)
    }

    pub fn create_integer(
        owner: &str,
        name: impl Into<Cow<'static, str>>,
        value: i64,
        description: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::create(owner, name, StatisticValue::Integer(value), description)
    }

    pub fn create_float_range(
        owner: &str,
        name: impl Into<Cow<'static, str>>,
        average: f64,
        min: f64,
        max: f64,
        description: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::create(
            owner,
            name,
            StatisticValue::FloatRange { average, min, max },
            description,
        )
    }

    pub fn create_byte_size(
        owner: &str,
        name: impl Into<Cow<'static, str>>,
        value: u64,
        description: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::create(owner, name, StatisticValue::ByteSize(value), description)
    }

    pub fn create_byte_size_range(
        owner: &str,
        name: impl Into<Cow<'static, str>>,
        average: u64,
        min: u64,
        max: u64,
        description: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::create(
            owner,
            name,
            StatisticValue::ByteSizeRange { average, min, max },
            description,
        )
    }

    pub fn create_time(
        owner: &str,
        name: impl Into<Cow<'static, str>>,
        value: Duration,
        description: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::create(owner, name, StatisticValue::Time(value), description)
    }

    pub fn create_time_range(
        owner: &str,
        name: impl Into<Cow<'static, str>>,
        average: Duration,
        min: Duration,
        max: Duration,
        description: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::create(
            owner,
            name,
            StatisticValue::TimeRange { average, min, max },
            description,
        )
    }

    pub fn create_percentage(
        owner: &str,
        name: impl Into<Cow<'static, str>>,
        value: f64,
        description: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::create(owner, name, StatisticValue::Percentage(value), description)
    }

    pub fn create_percentage_range(
        owner: &str,
        name: impl Into<Cow<'static, str>>,
        average: f64,
        min: f64,
        max: f64,
        description: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::create(
            owner,
            name,
            StatisticValue::PercentageRange { average, min, max },
            description,
        )
    }

    pub fn create_bytes_per_second(
        owner: &str,
        name: impl Into<Cow<'static, str>>,
        value: f64,
        description: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::create(owner, name, StatisticValue::BytesPerSecond(value), description)
    }

    pub fn create_reference_string(
        owner: &str,
        name: impl Into<Cow<'static, str>>,
        value: impl Into<Cow<'static, str>>,
        description: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::create(
            owner,
            name,
            StatisticValue::ReferenceString(value.into()),
            description,
        )
    }

    pub fn create_persistent_string(
        owner: &str,
        name: impl Into<Cow<'static, str>>,
        value: String,
        description: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::create(
            owner,
            name,
            StatisticValue::PersistentString(value),
            description,
        )
    }
}

impl std::fmt::Display for Statistic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}: ", self.owner, self.name)?;
        match &self.value {
            StatisticValue::Boolean(v) => write!(f, "{}", v),
            StatisticValue::Integer(v) => write!(f, "{}", v),
            StatisticValue::FloatRange { average, min, max } => {
                write!(f, "{:.3} (min {:.3}, max {:.3})", average, min, max)
            }
            StatisticValue::ByteSize(v) => write!(f, "{} bytes", v),
            StatisticValue::ByteSizeRange { average, min, max } => {
                write!(f, "{} bytes (min {}, max {})", average, min, max)
            }
            StatisticValue::Time(v) => write!(f, "{:?}", v),
            StatisticValue::TimeRange { average, min, max } => {
                write!(f, "{:?} (min {:?}, max {:?})", average, min, max)
            }
            StatisticValue::Percentage(v) => write!(f, "{:.1}%", v * 100.0),
            StatisticValue::PercentageRange { average, min, max } => write!(
                f,
                "{:.1}% (min {:.1}%, max {:.1}%)",
                average * 100.0,
                min * 100.0,
                max * 100.0
            ),
            StatisticValue::BytesPerSecond(v) => {
                write!(f, "{:.2} MiB/s", v / (1024.0 * 1024.0))
            }
            StatisticValue::ReferenceString(v) => write!(f, "{}", v),
            StatisticValue::PersistentString(v) => write!(f, "{}", v),
        }
    }
}

/// A rolling window over the last `N` samples.
#[derive(Debug, Clone)]
pub struct AverageWindow<const N: usize> {
    samples: ArrayVec<f64, N>,
    next_index: usize,
    most_recent: Option<f64>,
    total_entries: u64,
}

impl<const N: usize> AverageWindow<N> {
    pub fn new() -> Self {
        Self {
            samples: ArrayVec::new(),
            next_index: 0,
            most_recent: None,
            total_entries: 0,
        }
    }

    pub fn push_entry(&mut self, value: f64) {
        if N == 0 {
            return;
        }

        if self.samples.is_full() {
            self.samples[self.next_index] = value;
        } else {
            self.samples.push(value);
        }
        self.next_index = (self.next_index + 1) % N;

        self.most_recent = Some(value);
        self.total_entries += 1;
    }

    /// The average of the samples in the window, or `0.0` if the window is empty.
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn minimum(&self) -> f64 {
        self.samples.iter().copied().reduce(f64::min).unwrap_or(0.0)
    }

    pub fn maximum(&self) -> f64 {
        self.samples.iter().copied().reduce(f64::max).unwrap_or(0.0)
    }

    pub fn most_recent_sample(&self) -> Option<f64> {
        self.most_recent
    }

    /// The number of samples currently in the window.
    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    /// The total number of samples ever pushed, including those that left the window.
    pub fn total_entries(&self) -> u64 {
        self.total_entries
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl<const N: usize> Default for AverageWindow<N> {
    fn default() -> Self {
        Self::new()
    }
}
