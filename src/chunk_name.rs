use std::fmt;

/// The number of bytes in a chunk name.
pub const CHUNK_NAME_SIZE: usize = 16;

/// The content-derived name of a chunk of data, used as the key for every
/// index operation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkName(pub [u8; CHUNK_NAME_SIZE]);

impl ChunkName {
	#[must_use]
	pub const fn as_bytes(&self) -> &[u8; CHUNK_NAME_SIZE] {
		&self.0
	}
}

impl fmt::Debug for ChunkName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ChunkName(")?;
		for byte in &self.0 {
			write!(f, "{byte:02x}")?;
		}
		write!(f, ")")
	}
}

/// The signature of a chunk name generator. The hashing algorithm itself is
/// a collaborator; contexts hold one of these and the hash stage invokes it.
pub type ChunkNameGenerator = fn(&[u8]) -> ChunkName;

/// The default chunk name generator, truncating a blake3 digest to the
/// chunk name size.
#[must_use]
pub fn default_chunk_name(data: &[u8]) -> ChunkName {
	let digest = blake3::hash(data);
	let mut name = [0u8; CHUNK_NAME_SIZE];
	name.copy_from_slice(&digest.as_bytes()[..CHUNK_NAME_SIZE]);
	ChunkName(name)
}

#[cfg(test)]
mod tests {
	use super::default_chunk_name;

	#[test]
	fn names_are_stable_and_distinct() {
		let a = default_chunk_name(b"chunk a");
		let b = default_chunk_name(b"chunk b");

		assert_eq!(a, default_chunk_name(b"chunk a"));
		assert_ne!(a, b);
	}
}
