/// Serde helpers for `Duration` fields expressed in Go-style notation
/// ("30s", "10m", "1h30m").
pub mod serde_dur {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(t: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&durationfmt::to_string(*t))
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		parse(&s).map_err(serde::de::Error::custom)
	}

	pub fn parse(s: &str) -> Result<Duration, String> {
		let nanos = go_parse_duration::parse_duration(s)
			.map_err(|e| format!("invalid duration {s:?}: {e:?}"))?;
		if nanos < 0 {
			return Err(format!("negative duration {s:?}"));
		}
		Ok(Duration::from_nanos(nanos as u64))
	}
}

pub mod serde_dur_option {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(t: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
		match t {
			Some(d) => serializer.serialize_some(&durationfmt::to_string(*d)),
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = Option::<String>::deserialize(deserializer)?;
		match s {
			Some(s) => super::serde_dur::parse(&s)
				.map(Some)
				.map_err(serde::de::Error::custom),
			None => Ok(None),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	#[test]
	fn parse_go_durations() {
		assert_eq!(
			super::serde_dur::parse("30s").unwrap(),
			Duration::from_secs(30)
		);
		assert_eq!(
			super::serde_dur::parse("10m").unwrap(),
			Duration::from_secs(600)
		);
		assert!(super::serde_dur::parse("nonsense").is_err());
	}
}
