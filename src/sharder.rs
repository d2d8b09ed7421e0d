//! Sharder implementation.
use md5;

/// Maps a string key onto one of `total_shards` buckets.
pub trait Sharder {
    /// Returns a bucket in `0..total_shards`. Always the same for the same input.
    fn get_shard(&self, input: impl AsRef<[u8]>, total_shards: u64) -> u64;
}

/// The default sharder, used by rollouts.
///
/// Only as many leading digest bytes as needed to comfortably exceed `total_shards` take part in
/// the reduction (`total_shards / 128 + 1`, capped at the 16-byte digest).
pub struct Md5Sharder;

impl Md5Sharder {
    fn digest_bytes(total_shards: u64) -> usize {
        let wanted = total_shards / 128 + 1;
        usize::try_from(wanted).map_or(16, |wanted| wanted.min(16))
    }
}

impl Sharder for Md5Sharder {
    fn get_shard(&self, input: impl AsRef<[u8]>, total_shards: u64) -> u64 {
        let hash = md5::compute(input);
        let value = hash[..Self::digest_bytes(total_shards)]
            .iter()
            .fold(0u128, |acc, byte| (acc << 8) | u128::from(*byte));
        (value % u128::from(total_shards)) as u64
    }
}

/// Returns preset shards, falling back to `0` for unknown inputs.
#[cfg(test)]
pub struct DeterministicSharder(pub std::collections::HashMap<String, u64>);

#[cfg(test)]
impl Sharder for DeterministicSharder {
    fn get_shard(&self, input: impl AsRef<[u8]>, total_shards: u64) -> u64 {
        let key = String::from_utf8_lossy(input.as_ref());
        self.0.get(key.as_ref()).copied().unwrap_or(0) % total_shards
    }
}
