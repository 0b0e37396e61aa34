use crate::capability::SdkVersion;

pub const DEFAULT_SID: &str = "S1";
pub const DEFAULT_SDK_VERSION: SdkVersion = SdkVersion::new(2, 16);
pub const DEFAULT_MAX_IN_FLIGHT_CALLS: usize = 1024;
pub const DEFAULT_OUTBOUND_QUEUE_CAP: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub sid: String,
    pub sdk_version: SdkVersion,
    pub max_in_flight_calls: usize,
    pub outbound_queue_cap: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sid: DEFAULT_SID.to_string(),
            sdk_version: DEFAULT_SDK_VERSION,
            max_in_flight_calls: DEFAULT_MAX_IN_FLIGHT_CALLS,
            outbound_queue_cap: DEFAULT_OUTBOUND_QUEUE_CAP,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup. Missing, unparsable and
    /// zero values fall back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Self {
            sid: lookup("DUET_SID")
                .filter(|sid| !sid.is_empty())
                .unwrap_or(defaults.sid),
            sdk_version: lookup("DUET_SDK_VERSION")
                .and_then(|raw| raw.parse::<SdkVersion>().ok())
                .unwrap_or(defaults.sdk_version),
            max_in_flight_calls: parse_positive(lookup("DUET_MAX_IN_FLIGHT_CALLS"))
                .unwrap_or(defaults.max_in_flight_calls),
            outbound_queue_cap: parse_positive(lookup("DUET_OUTBOUND_QUEUE_CAP"))
                .unwrap_or(defaults.outbound_queue_cap),
        }
    }

    pub fn with_sid(mut self, sid: impl Into<String>) -> Self {
        self.sid = sid.into();
        self
    }

    pub fn with_sdk_version(mut self, version: SdkVersion) -> Self {
        self.sdk_version = version;
        self
    }

    pub fn with_max_in_flight_calls(mut self, limit: usize) -> Self {
        self.max_in_flight_calls = limit.max(1);
        self
    }

    pub fn with_outbound_queue_cap(mut self, cap: usize) -> Self {
        self.outbound_queue_cap = cap.max(1);
        self
    }
}

fn parse_positive(raw: Option<String>) -> Option<usize> {
    raw.and_then(|raw| raw.parse::<usize>().ok())
        .filter(|value| *value > 0)
}
