use std::borrow::Borrow;

/// Strng is a cheaply-clonable immutable string used throughout the
/// data plane where strings are stored once and read many times.
pub type Strng = arcstr::ArcStr;

pub use arcstr::format;
pub use arcstr::literal;

pub const EMPTY: Strng = arcstr::literal!("");

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	s.as_ref().into()
}

/// RichStrng wraps Strng to allow defining trait implementations
/// (prometheus label encoding, etc.) on top of the alias.
#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RichStrng(Strng);

impl RichStrng {
	pub fn as_str(&self) -> &str {
		self.0.as_ref()
	}
}

impl<T> From<T> for RichStrng
where
	T: Into<Strng>,
{
	fn from(value: T) -> Self {
		RichStrng(value.into())
	}
}

impl std::ops::Deref for RichStrng {
	type Target = Strng;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl std::fmt::Display for RichStrng {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		self.0.fmt(f)
	}
}

impl Borrow<str> for RichStrng {
	fn borrow(&self) -> &str {
		self.0.as_ref()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn new_and_display() {
		let s = new("example.com");
		assert_eq!(s.as_str(), "example.com");
		let r = RichStrng::from("example.com");
		assert_eq!(r.to_string(), "example.com");
	}
}
