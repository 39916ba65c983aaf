//! Two-level spherical subdivision: stripes of chunks, sub-stripes of
//! sub-chunks.
//!
//! The sphere is cut into `num_stripes` latitude stripes of equal height.
//! Each stripe is divided into chunks by longitude, with the chunk count
//! chosen so that chunk width is at least the stripe height. Every stripe
//! contains `num_sub_stripes_per_stripe` sub-stripes, and each chunk is
//! divided into sub-chunks whose width is at least the sub-stripe height.
//!
//! Chunk IDs are `stripe * 2 * num_stripes + chunk_in_stripe`; sub-chunk
//! IDs are `sub_stripe_in_stripe * stride + sub_chunk_in_chunk` where the
//! stride is the maximum sub-chunk count of any chunk. Sub-chunk IDs fit
//! in 28 bits for every permitted configuration.

use crate::sphgeom::{
    ang_sep, cartesian, clamp_lat, lon_dist_to_range, max_alpha, segments, wrap_lon, EPSILON_DEG,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The location of a record in the two-level subdivision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkLocation {
    pub chunk_id: i32,
    pub sub_chunk_id: i32,
    pub overlap: bool,
}

impl ChunkLocation {
    pub fn new(chunk_id: i32, sub_chunk_id: i32, overlap: bool) -> Self {
        ChunkLocation { chunk_id, sub_chunk_id, overlap }
    }

    /// Composite 64-bit key, `(chunkId << 32) | subChunkId`.
    pub fn composite(&self) -> i64 {
        ((self.chunk_id as i64) << 32) + self.sub_chunk_id as i64
    }
}

// Records are bucket-sorted by chunk so that a reducer sees each chunk as
// one contiguous run, with overlap records ordered after regular ones
// within a sub-chunk.
impl Ord for ChunkLocation {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.chunk_id, self.sub_chunk_id, self.overlap).cmp(&(
            other.chunk_id,
            other.sub_chunk_id,
            other.overlap,
        ))
    }
}

impl PartialOrd for ChunkLocation {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Error)]
pub enum ChunkerError {
    #[error("the number of stripes must be between 1 and {max}, got {0}", max = Chunker::MAX_STRIPES)]
    BadStripes(i32),
    #[error("the number of sub-stripes per stripe must be between 1 and {max}, got {0}", max = Chunker::MAX_SUB_STRIPES_PER_STRIPE)]
    BadSubStripes(i32),
    #[error("the overlap radius must be between 0 and 10 degrees, got {0}")]
    BadOverlap(f64),
}

/// Maps sky positions to chunk locations and enumerates overlap
/// neighbors within the configured radius.
#[derive(Debug, Clone)]
pub struct Chunker {
    num_stripes: i32,
    num_sub_stripes_per_stripe: i32,
    overlap: f64,
    stripe_height: f64,
    sub_stripe_height: f64,
    /// Chunk count for each stripe.
    num_chunks: Vec<i32>,
    /// Sub-chunk count per chunk, for each sub-stripe.
    num_sub_chunks: Vec<i32>,
    /// Sub-chunk ID stride: max of `num_sub_chunks`.
    stride: i32,
}

impl Chunker {
    pub const MAX_STRIPES: i32 = 10_000;
    pub const MAX_SUB_STRIPES_PER_STRIPE: i32 = 1_000;

    pub fn new(
        num_stripes: i32,
        num_sub_stripes_per_stripe: i32,
        overlap: f64,
    ) -> Result<Self, ChunkerError> {
        if !(1..=Self::MAX_STRIPES).contains(&num_stripes) {
            return Err(ChunkerError::BadStripes(num_stripes));
        }
        if !(1..=Self::MAX_SUB_STRIPES_PER_STRIPE).contains(&num_sub_stripes_per_stripe) {
            return Err(ChunkerError::BadSubStripes(num_sub_stripes_per_stripe));
        }
        if !(0.0..=10.0).contains(&overlap) {
            return Err(ChunkerError::BadOverlap(overlap));
        }
        let stripe_height = 180.0 / num_stripes as f64;
        let num_sub_stripes = num_stripes * num_sub_stripes_per_stripe;
        let sub_stripe_height = 180.0 / num_sub_stripes as f64;

        let mut num_chunks = Vec::with_capacity(num_stripes as usize);
        for s in 0..num_stripes {
            let lat_min = s as f64 * stripe_height - 90.0;
            let lat_max = lat_min + stripe_height;
            num_chunks.push(segments(lat_min, lat_max, stripe_height));
        }
        let mut num_sub_chunks = Vec::with_capacity(num_sub_stripes as usize);
        let mut stride = 1;
        for ss in 0..num_sub_stripes {
            let lat_min = ss as f64 * sub_stripe_height - 90.0;
            let lat_max = lat_min + sub_stripe_height;
            let full_circle = segments(lat_min, lat_max, sub_stripe_height);
            let per_chunk = (full_circle / num_chunks[(ss / num_sub_stripes_per_stripe) as usize]).max(1);
            stride = stride.max(per_chunk);
            num_sub_chunks.push(per_chunk);
        }
        Ok(Chunker {
            num_stripes,
            num_sub_stripes_per_stripe,
            overlap,
            stripe_height,
            sub_stripe_height,
            num_chunks,
            num_sub_chunks,
            stride,
        })
    }

    pub fn overlap(&self) -> f64 {
        self.overlap
    }

    /// The chunk and sub-chunk containing the given position (degrees).
    pub fn locate(&self, lon: f64, lat: f64) -> ChunkLocation {
        let lon = wrap_lon(lon);
        let lat = clamp_lat(lat);
        let sub_stripe = self.sub_stripe_of(lat);
        let stripe = sub_stripe / self.num_sub_stripes_per_stripe;
        let chunk = self.chunk_of(stripe, lon);
        let sub_chunk = self.sub_chunk_of(sub_stripe, stripe, chunk, lon);
        ChunkLocation {
            chunk_id: self.chunk_id(stripe, chunk),
            sub_chunk_id: self.sub_chunk_id(sub_stripe, sub_chunk),
            overlap: false,
        }
    }

    /// Append the locations of all sub-chunks, other than the one
    /// containing the position, whose boundary lies within the overlap
    /// radius of the position. The returned locations have `overlap`
    /// set. No-op when the overlap radius is zero.
    pub fn overlap_locations(&self, lon: f64, lat: f64, out: &mut Vec<ChunkLocation>) {
        if self.overlap <= 0.0 {
            return;
        }
        let lon = wrap_lon(lon);
        let lat = clamp_lat(lat);
        let home = self.locate(lon, lat);
        let pos = cartesian(lon, lat);

        let ss_min = self.sub_stripe_of(clamp_lat(lat - self.overlap));
        let ss_max = self.sub_stripe_of(clamp_lat(lat + self.overlap));
        for ss in ss_min..=ss_max {
            let stripe = ss / self.num_sub_stripes_per_stripe;
            let (band_min, band_max) = self.sub_stripe_bounds(ss);
            let alpha = max_alpha(self.overlap, band_min.abs().max(band_max.abs()).min(90.0 - EPSILON_DEG));
            let nc = self.num_chunks[stripe as usize];
            let chunk_width = 360.0 / nc as f64;
            for chunk in 0..nc {
                let chunk_lon_min = chunk as f64 * chunk_width;
                if alpha < 180.0
                    && lon_dist_to_range(lon, chunk_lon_min, chunk_lon_min + chunk_width) > alpha
                {
                    continue;
                }
                let nsc = self.num_sub_chunks[ss as usize];
                let sub_width = chunk_width / nsc as f64;
                for sub_chunk in 0..nsc {
                    let loc = ChunkLocation {
                        chunk_id: self.chunk_id(stripe, chunk),
                        sub_chunk_id: self.sub_chunk_id(ss, sub_chunk),
                        overlap: true,
                    };
                    if loc.chunk_id == home.chunk_id && loc.sub_chunk_id == home.sub_chunk_id {
                        continue;
                    }
                    let lon_min = chunk_lon_min + sub_chunk as f64 * sub_width;
                    if self.box_within(pos, lon, lat, lon_min, lon_min + sub_width, band_min, band_max)
                    {
                        out.push(loc);
                    }
                }
            }
        }
    }

    fn sub_stripe_of(&self, lat: f64) -> i32 {
        let ss = ((lat + 90.0) / self.sub_stripe_height).floor() as i32;
        ss.clamp(0, self.num_stripes * self.num_sub_stripes_per_stripe - 1)
    }

    fn sub_stripe_bounds(&self, ss: i32) -> (f64, f64) {
        let lat_min = ss as f64 * self.sub_stripe_height - 90.0;
        (lat_min, lat_min + self.sub_stripe_height)
    }

    fn chunk_of(&self, stripe: i32, lon: f64) -> i32 {
        let nc = self.num_chunks[stripe as usize];
        let c = (lon / (360.0 / nc as f64)).floor() as i32;
        c.clamp(0, nc - 1)
    }

    fn sub_chunk_of(&self, ss: i32, stripe: i32, chunk: i32, lon: f64) -> i32 {
        let chunk_width = 360.0 / self.num_chunks[stripe as usize] as f64;
        let nsc = self.num_sub_chunks[ss as usize];
        let sub_width = chunk_width / nsc as f64;
        let sc = ((lon - chunk as f64 * chunk_width) / sub_width).floor() as i32;
        sc.clamp(0, nsc - 1)
    }

    fn chunk_id(&self, stripe: i32, chunk: i32) -> i32 {
        stripe * 2 * self.num_stripes + chunk
    }

    fn sub_chunk_id(&self, ss: i32, sub_chunk: i32) -> i32 {
        (ss % self.num_sub_stripes_per_stripe) * self.stride + sub_chunk
    }

    /// Whether any point of the lat/lon box lies within the overlap
    /// radius of the position. The nearest point of the box is found by
    /// clamping, which is exact for boxes of this aspect.
    #[allow(clippy::too_many_arguments)]
    fn box_within(
        &self,
        pos: [f64; 3],
        lon: f64,
        lat: f64,
        lon_min: f64,
        lon_max: f64,
        lat_min: f64,
        lat_max: f64,
    ) -> bool {
        let nearest_lat = lat.clamp(lat_min, lat_max);
        let nearest_lon = if lon_dist_to_range(lon, lon_min, lon_max) == 0.0 {
            lon
        } else {
            // Pick the closer edge, accounting for wrap-around.
            let to_min = (lon - lon_min).rem_euclid(360.0).min((lon_min - lon).rem_euclid(360.0));
            let to_max = (lon - lon_max).rem_euclid(360.0).min((lon_max - lon).rem_euclid(360.0));
            if to_min <= to_max {
                lon_min
            } else {
                lon_max
            }
        };
        ang_sep(pos, cartesian(nearest_lon, nearest_lat)) <= self.overlap + EPSILON_DEG
    }
}
