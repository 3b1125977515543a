use std::fmt::Write;

use prometheus_client::encoding::{EncodeLabelValue, LabelValueEncoder};
use prometheus_client::registry::Registry;

use crate::strng::RichStrng;

pub fn sub_registry(registry: &mut Registry) -> &mut Registry {
	registry.sub_registry_with_prefix("gantry")
}

/// DefaultedUnknown encodes an optional label value, encoding the empty value
/// as "unknown" so that Prometheus series always carry the label.
#[derive(Clone, Hash, Default, Debug, PartialEq, Eq)]
pub struct DefaultedUnknown<T>(Option<T>);

impl<T> DefaultedUnknown<T> {
	pub fn inner(self) -> Option<T> {
		self.0
	}
}

impl From<String> for DefaultedUnknown<RichStrng> {
	fn from(t: String) -> Self {
		if t.is_empty() {
			DefaultedUnknown(None)
		} else {
			DefaultedUnknown(Some(t.into()))
		}
	}
}

impl From<crate::strng::Strng> for DefaultedUnknown<RichStrng> {
	fn from(t: crate::strng::Strng) -> Self {
		if t.is_empty() {
			DefaultedUnknown(None)
		} else {
			DefaultedUnknown(Some(t.into()))
		}
	}
}

impl<T> From<Option<T>> for DefaultedUnknown<T> {
	fn from(t: Option<T>) -> Self {
		DefaultedUnknown(t)
	}
}

impl<T: EncodeLabelValue> EncodeLabelValue for DefaultedUnknown<T> {
	fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
		match &self.0 {
			Some(i) => i.encode(writer),
			None => writer.write_str("unknown"),
		}
	}
}

/// EncodeDisplay encodes any Display type as a label value.
#[derive(Clone, Hash, Default, Debug, PartialEq, Eq)]
pub struct EncodeDisplay<T>(pub T);

impl<T: std::fmt::Display> EncodeLabelValue for EncodeDisplay<T> {
	fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
		write!(writer, "{}", self.0)
	}
}

impl<T> From<T> for EncodeDisplay<T> {
	fn from(t: T) -> Self {
		EncodeDisplay(t)
	}
}

impl EncodeLabelValue for RichStrng {
	fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
		writer.write_str(self.as_str())
	}
}
