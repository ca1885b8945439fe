//! Approximate URL membership over the coordination store's shared bitmap.
//!
//! Zero false negatives; false positives bounded by the configured error
//! rate while insertions stay under capacity. The filter is never resized;
//! past capacity it degrades gracefully.

use std::io::Cursor;
use std::sync::Arc;

use murmur3::murmur3_32;
use serde::{Deserialize, Serialize};

use crate::coord::{CoordError, CoordStore};

pub const FILTER_KEY: &str = "filter";
const FILTER_INFO_KEY: &str = "filter:info";

const SEED_A: u32 = 0x9747_b28c;
const SEED_B: u32 = 0x85eb_ca6b;

/// Header published alongside the bit array so peers can sanity-check
/// that they agree on the filter geometry.
#[derive(Debug, Serialize, Deserialize)]
struct FilterInfo {
    capacity: u64,
    error_rate: f64,
    bit_width: u64,
    hash_count: u32,
}

pub struct UrlFilter {
    coord: Arc<dyn CoordStore>,
    bit_width: u64,
    hash_count: u32,
    capacity: u64,
    error_rate: f64,
}

impl UrlFilter {
    /// Optimal geometry for `capacity` expected members at `error_rate`:
    /// m = ceil(-n*ln(eps) / ln(2)^2), k = ceil((m/n)*ln(2)).
    pub fn sizing(capacity: u64, error_rate: f64) -> (u64, u32) {
        let n = capacity as f64;
        let ln2 = std::f64::consts::LN_2;
        let m = (-(n * error_rate.ln()) / (ln2 * ln2)).ceil() as u64;
        let k = (((m as f64) / n) * ln2).ceil() as u32;
        (m.max(8), k.max(1))
    }

    pub async fn open(
        coord: Arc<dyn CoordStore>,
        capacity: u64,
        error_rate: f64,
    ) -> Result<Self, CoordError> {
        let (bit_width, hash_count) = Self::sizing(capacity, error_rate);
        let filter = Self {
            coord,
            bit_width,
            hash_count,
            capacity,
            error_rate,
        };

        // First worker publishes the header; peers with the same
        // configuration write an identical value, so the race is benign.
        if filter.coord.kv_get(FILTER_INFO_KEY).await?.is_none() {
            let info = FilterInfo {
                capacity,
                error_rate,
                bit_width,
                hash_count,
            };
            let header = serde_json::to_string(&info)
                .map_err(|e| CoordError::Protocol(e.to_string()))?;
            filter.coord.kv_set(FILTER_INFO_KEY, &header, None).await?;
        }

        tracing::debug!(
            bits = bit_width,
            hashes = hash_count,
            capacity,
            error_rate,
            "url filter ready"
        );
        Ok(filter)
    }

    /// Derive the k bit positions by double hashing two murmur3 outputs:
    /// h_i = (a + i*b) mod m.
    fn bit_positions(&self, url: &str) -> Vec<u64> {
        let a = murmur3_32(&mut Cursor::new(url.as_bytes()), SEED_A).unwrap_or(0) as u64;
        // Odd stride so every position advances.
        let b = (murmur3_32(&mut Cursor::new(url.as_bytes()), SEED_B).unwrap_or(0) as u64) | 1;

        (0..self.hash_count as u64)
            .map(|i| (a.wrapping_add(i.wrapping_mul(b))) % self.bit_width)
            .collect()
    }

    /// True when the URL is *possibly* in the set; false means definitely new.
    pub async fn contains(&self, url: &str) -> Result<bool, CoordError> {
        let bits = self
            .coord
            .bitfield_get_bits(FILTER_KEY, &self.bit_positions(url))
            .await?;
        Ok(bits.iter().all(|b| *b))
    }

    /// Record the URL as seen. Idempotent.
    pub async fn insert(&self, url: &str) -> Result<(), CoordError> {
        self.coord
            .bitfield_set_bits(FILTER_KEY, &self.bit_positions(url))
            .await
    }

    /// Membership test for a batch of URLs in one pipelined round-trip.
    pub async fn contains_many(&self, urls: &[String]) -> Result<Vec<bool>, CoordError> {
        if urls.is_empty() {
            return Ok(Vec::new());
        }

        let positions: Vec<Vec<u64>> = urls.iter().map(|u| self.bit_positions(u)).collect();
        let flat: Vec<u64> = positions.iter().flatten().copied().collect();
        let bits = self.coord.bitfield_get_bits(FILTER_KEY, &flat).await?;

        let k = self.hash_count as usize;
        Ok((0..urls.len())
            .map(|i| bits[i * k..(i + 1) * k].iter().all(|b| *b))
            .collect())
    }

    /// Estimated member count from the fill ratio: -(m/k)*ln(1 - ones/m).
    pub async fn size_estimate(&self) -> Result<u64, CoordError> {
        let ones = self.coord.bitfield_count_ones(FILTER_KEY).await? as f64;
        let m = self.bit_width as f64;
        if ones <= 0.0 {
            return Ok(0);
        }
        if ones >= m {
            return Ok(self.capacity);
        }
        let estimate = -(m / self.hash_count as f64) * (1.0 - ones / m).ln();
        Ok(estimate.round() as u64)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn error_rate(&self) -> f64 {
        self.error_rate
    }
}
