//! Therapy profile parameters and `PARAM_UPDATE` validation.

use core::fmt;
use core::ops::RangeInclusive;
use core::time::Duration;

use heapless::String;

use crate::pattern::PatternStrategy;

/// Longest word accepted as a parameter value (`sequential`).
pub const MAX_PARAM_WORD: usize = 12;

/// Accepted burst and gap lengths in milliseconds.
pub const BURST_MS_RANGE: RangeInclusive<u32> = 10..=1_000;

/// Accepted drive frequencies in hertz.
pub const FREQUENCY_HZ_RANGE: RangeInclusive<u32> = 50..=300;

/// Actuator technology driven by the motor collaborator.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ActuatorKind {
    /// Linear resonant actuator, driven at a fixed resonant frequency.
    #[default]
    Lra,
    /// Eccentric rotating mass motor.
    Erm,
}

/// Inclusive amplitude range in percent of full drive.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AmplitudeRange {
    pub min: u8,
    pub max: u8,
}

/// Inclusive drive frequency range in hertz.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FrequencyRange {
    pub min: u16,
    pub max: u16,
}

/// One profile's parameters. Immutable while a session runs.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TherapyConfig {
    pub burst_duration: Duration,
    pub inter_burst_interval: Duration,
    pub bursts_per_cycle: u8,
    pub mirror: bool,
    /// Jitter in tenths of a percent (235 = 23.5 %).
    pub jitter_tenths: u16,
    pub amplitude: AmplitudeRange,
    pub frequency: FrequencyRange,
    pub session_duration: Duration,
    pub strategy: PatternStrategy,
    pub actuator: ActuatorKind,
}

impl TherapyConfig {
    pub const DEFAULT: Self = Self {
        burst_duration: Duration::from_millis(100),
        inter_burst_interval: Duration::from_millis(67),
        bursts_per_cycle: 4,
        mirror: true,
        jitter_tenths: 235,
        amplitude: AmplitudeRange { min: 100, max: 100 },
        frequency: FrequencyRange { min: 250, max: 250 },
        session_duration: Duration::from_secs(120 * 60),
        strategy: PatternStrategy::Random,
        actuator: ActuatorKind::Lra,
    };

    /// Burst plus inter-burst gap: the nominal spacing between events.
    #[must_use]
    pub fn event_period(&self) -> Duration {
        self.burst_duration + self.inter_burst_interval
    }

    #[must_use]
    pub const fn with_mirror(mut self, mirror: bool) -> Self {
        self.mirror = mirror;
        self
    }

    #[must_use]
    pub const fn with_strategy(mut self, strategy: PatternStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub const fn with_jitter_tenths(mut self, jitter_tenths: u16) -> Self {
        self.jitter_tenths = jitter_tenths;
        self
    }

    #[must_use]
    pub const fn with_session_duration(mut self, duration: Duration) -> Self {
        self.session_duration = duration;
        self
    }

    #[must_use]
    pub const fn with_timing(mut self, burst: Duration, inter_burst: Duration) -> Self {
        self.burst_duration = burst;
        self.inter_burst_interval = inter_burst;
        self
    }

    /// Applies a batch of parameter updates, returning the new profile.
    ///
    /// The batch is all-or-nothing: the first invalid entry rejects the whole
    /// update and `self` is left untouched.
    pub fn apply(&self, updates: &[ParamUpdate]) -> Result<Self, ParamError> {
        let mut next = *self;
        for update in updates {
            next.apply_one(update)?;
        }

        if next.amplitude.min > next.amplitude.max {
            return Err(ParamError::InvertedRange(ParamKey::AmpMin));
        }
        if next.frequency.min > next.frequency.max {
            return Err(ParamError::InvertedRange(ParamKey::FreqMin));
        }

        Ok(next)
    }

    fn apply_one(&mut self, update: &ParamUpdate) -> Result<(), ParamError> {
        let key = update.key;
        match key {
            ParamKey::On => {
                self.burst_duration = Duration::from_millis(update.whole_in(key, &BURST_MS_RANGE)?.into());
            }
            ParamKey::Off => {
                self.inter_burst_interval =
                    Duration::from_millis(update.whole_in(key, &BURST_MS_RANGE)?.into());
            }
            ParamKey::Freq => {
                let hz = narrow_u16(update.whole_in(key, &FREQUENCY_HZ_RANGE)?);
                self.frequency = FrequencyRange { min: hz, max: hz };
            }
            ParamKey::FreqMin => self.frequency.min = narrow_u16(update.whole_in(key, &FREQUENCY_HZ_RANGE)?),
            ParamKey::FreqMax => self.frequency.max = narrow_u16(update.whole_in(key, &FREQUENCY_HZ_RANGE)?),
            ParamKey::AmpMin => self.amplitude.min = narrow_u8(update.whole_in(key, &(0..=100))?),
            ParamKey::AmpMax => self.amplitude.max = narrow_u8(update.whole_in(key, &(0..=100))?),
            ParamKey::Jitter => {
                let hundredths = update.hundredths(key)?;
                if hundredths > 10_000 {
                    return Err(ParamError::OutOfRange(key));
                }
                self.jitter_tenths = narrow_u16(hundredths / 10);
            }
            ParamKey::Mirror => self.mirror = update.hundredths(key)? != 0,
            ParamKey::Session => {
                let minutes = update.whole_in(key, &(1..=240))?;
                self.session_duration = Duration::from_secs(u64::from(minutes) * 60);
            }
            ParamKey::Pattern => {
                let word = update.word(key)?;
                self.strategy =
                    PatternStrategy::from_name(word).ok_or(ParamError::OutOfRange(key))?;
            }
            ParamKey::Type => {
                let word = update.word(key)?;
                self.actuator = if word.eq_ignore_ascii_case("LRA") {
                    ActuatorKind::Lra
                } else if word.eq_ignore_ascii_case("ERM") {
                    ActuatorKind::Erm
                } else {
                    return Err(ParamError::OutOfRange(key));
                };
            }
        }
        Ok(())
    }
}

impl Default for TherapyConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Parameter names accepted by `PARAM_UPDATE` (matched case-insensitively).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ParamKey {
    On,
    Off,
    Freq,
    FreqMin,
    FreqMax,
    AmpMin,
    AmpMax,
    Jitter,
    Mirror,
    Pattern,
    Session,
    Type,
}

impl ParamKey {
    const NAMES: [(ParamKey, &'static str); 12] = [
        (ParamKey::On, "ON"),
        (ParamKey::Off, "OFF"),
        (ParamKey::Freq, "FREQ"),
        (ParamKey::FreqMin, "FREQMIN"),
        (ParamKey::FreqMax, "FREQMAX"),
        (ParamKey::AmpMin, "AMPMIN"),
        (ParamKey::AmpMax, "AMPMAX"),
        (ParamKey::Jitter, "JITTER"),
        (ParamKey::Mirror, "MIRROR"),
        (ParamKey::Pattern, "PATTERN"),
        (ParamKey::Session, "SESSION"),
        (ParamKey::Type, "TYPE"),
    ];

    /// Canonical upper-case wire name.
    #[must_use]
    pub fn name(self) -> &'static str {
        Self::NAMES
            .iter()
            .find(|(key, _)| *key == self)
            .map_or("?", |(_, name)| name)
    }

    /// Looks up a key by its wire name, ignoring ASCII case.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(_, candidate)| candidate.eq_ignore_ascii_case(name))
            .map(|(key, _)| *key)
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parameter value as carried on the wire.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ParamValue {
    /// Non-negative decimal scaled by 100 (`23.5` is 2350).
    Hundredths(u32),
    Word(String<MAX_PARAM_WORD>),
}

/// One `key|value` pair of a `PARAM_UPDATE`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParamUpdate {
    pub key: ParamKey,
    pub value: ParamValue,
}

impl ParamUpdate {
    #[must_use]
    pub const fn number(key: ParamKey, hundredths: u32) -> Self {
        Self {
            key,
            value: ParamValue::Hundredths(hundredths),
        }
    }

    #[must_use]
    pub const fn whole(key: ParamKey, value: u32) -> Self {
        Self::number(key, value.saturating_mul(100))
    }

    fn hundredths(&self, key: ParamKey) -> Result<u32, ParamError> {
        match &self.value {
            ParamValue::Hundredths(value) => Ok(*value),
            ParamValue::Word(_) => Err(ParamError::WrongType(key)),
        }
    }

    fn whole_in(&self, key: ParamKey, range: &RangeInclusive<u32>) -> Result<u32, ParamError> {
        let hundredths = self.hundredths(key)?;
        if hundredths % 100 != 0 {
            return Err(ParamError::WrongType(key));
        }
        let value = hundredths / 100;
        if range.contains(&value) {
            Ok(value)
        } else {
            Err(ParamError::OutOfRange(key))
        }
    }

    fn word(&self, key: ParamKey) -> Result<&str, ParamError> {
        match &self.value {
            ParamValue::Word(word) => Ok(word.as_str()),
            ParamValue::Hundredths(_) => Err(ParamError::WrongType(key)),
        }
    }
}

/// Reasons a parameter batch is rejected.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ParamError {
    OutOfRange(ParamKey),
    WrongType(ParamKey),
    /// Minimum exceeds maximum after the batch was applied.
    InvertedRange(ParamKey),
    /// Profiles are frozen while a session runs.
    SessionActive,
}

impl fmt::Display for ParamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamError::OutOfRange(key) => write!(f, "{key} out of range"),
            ParamError::WrongType(key) => write!(f, "{key} has the wrong value type"),
            ParamError::InvertedRange(key) => write!(f, "{key} exceeds its maximum"),
            ParamError::SessionActive => f.write_str("parameters are frozen during a session"),
        }
    }
}

fn narrow_u8(value: u32) -> u8 {
    u8::try_from(value).unwrap_or(u8::MAX)
}

fn narrow_u16(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(key: ParamKey, text: &str) -> ParamUpdate {
        let mut value = String::new();
        value.push_str(text).expect("word fits");
        ParamUpdate {
            key,
            value: ParamValue::Word(value),
        }
    }

    #[test]
    fn batch_updates_every_field() {
        let updated = TherapyConfig::DEFAULT
            .apply(&[
                ParamUpdate::whole(ParamKey::On, 150),
                ParamUpdate::whole(ParamKey::Off, 80),
                ParamUpdate::number(ParamKey::Jitter, 1_550),
                ParamUpdate::whole(ParamKey::Mirror, 0),
                word(ParamKey::Pattern, "Sequential"),
                ParamUpdate::whole(ParamKey::Session, 30),
                word(ParamKey::Type, "erm"),
                ParamUpdate::whole(ParamKey::AmpMin, 60),
                ParamUpdate::whole(ParamKey::AmpMax, 90),
            ])
            .expect("valid batch");

        assert_eq!(updated.burst_duration, Duration::from_millis(150));
        assert_eq!(updated.inter_burst_interval, Duration::from_millis(80));
        assert_eq!(updated.jitter_tenths, 155);
        assert!(!updated.mirror);
        assert_eq!(updated.strategy, PatternStrategy::Sequential);
        assert_eq!(updated.session_duration, Duration::from_secs(30 * 60));
        assert_eq!(updated.actuator, ActuatorKind::Erm);
        assert_eq!(updated.amplitude, AmplitudeRange { min: 60, max: 90 });
    }

    #[test]
    fn one_bad_entry_rejects_the_batch() {
        let base = TherapyConfig::DEFAULT;
        let result = base.apply(&[
            ParamUpdate::whole(ParamKey::On, 200),
            ParamUpdate::whole(ParamKey::Freq, 400),
        ]);

        assert_eq!(result, Err(ParamError::OutOfRange(ParamKey::Freq)));
        assert_eq!(base.burst_duration, Duration::from_millis(100));
    }

    #[test]
    fn inverted_amplitude_range_is_rejected() {
        let result = TherapyConfig::DEFAULT.apply(&[ParamUpdate::whole(ParamKey::AmpMax, 40)]);
        assert_eq!(result, Err(ParamError::InvertedRange(ParamKey::AmpMin)));
    }

    #[test]
    fn fractional_values_only_where_allowed() {
        assert_eq!(
            TherapyConfig::DEFAULT.apply(&[ParamUpdate::number(ParamKey::On, 12_550)]),
            Err(ParamError::WrongType(ParamKey::On))
        );
        assert_eq!(
            TherapyConfig::DEFAULT.apply(&[word(ParamKey::Session, "long")]),
            Err(ParamError::WrongType(ParamKey::Session))
        );
    }

    #[test]
    fn keys_match_without_case() {
        assert_eq!(ParamKey::from_name("freqmin"), Some(ParamKey::FreqMin));
        assert_eq!(ParamKey::from_name("Jitter"), Some(ParamKey::Jitter));
        assert_eq!(ParamKey::from_name("FINGERS"), None);
        assert_eq!(ParamKey::AmpMax.name(), "AMPMAX");
    }
}
