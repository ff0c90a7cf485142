//! Serde adapters for human-edited config files

/// `Duration` as whole seconds, e.g. `disconnect_timeout = 90`
pub mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Multiplexer type as its lowercase name (`native`, `tmux`, `screen`).
///
/// The wire representation of `MultiplexerType` is its numeric code; config
/// files use names instead.
pub mod multiplexer_name {
    use pt_protocol::MultiplexerType;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &MultiplexerType, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value.as_str())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<MultiplexerType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pt_protocol::MultiplexerType;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Section {
        #[serde(with = "duration_secs")]
        sweep: Duration,
        #[serde(with = "multiplexer_name")]
        backend: MultiplexerType,
    }

    #[test]
    fn test_names_and_seconds_in_json() {
        let section = Section {
            sweep: Duration::from_secs(300),
            backend: MultiplexerType::Tmux,
        };
        let json = serde_json::to_string(&section).unwrap();
        assert_eq!(json, r#"{"sweep":300,"backend":"tmux"}"#);
        assert_eq!(serde_json::from_str::<Section>(&json).unwrap(), section);
    }

    #[test]
    fn test_pty_is_an_alias_for_native() {
        let section: Section = serde_json::from_str(r#"{"sweep":5,"backend":"pty"}"#).unwrap();
        assert_eq!(section.backend, MultiplexerType::Native);
    }

    #[test]
    fn test_unknown_backend_name_is_rejected() {
        let err = serde_json::from_str::<Section>(r#"{"sweep":5,"backend":"byobu"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_fractional_seconds_are_rejected() {
        let err = serde_json::from_str::<Section>(r#"{"sweep":1.5,"backend":"screen"}"#);
        assert!(err.is_err());
    }
}
