//! Distance metrics used to rank neighbor candidates.
//!
//! The graph only ever compares distances, so every metric returns a value
//! where smaller means closer. `Cosine` vectors are normalized before they
//! are stored, which turns the stored comparison into `1 - dot`.

/// Distance metric for vector comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceMetric {
    /// L2 distance
    #[default]
    Euclidean,
    /// `1 - cosine_similarity`; vectors are normalized on insert
    Cosine,
    /// Negative dot product
    InnerProduct,
}

impl DistanceMetric {
    /// Tag stored in the file header
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::Euclidean => 0,
            Self::Cosine => 1,
            Self::InnerProduct => 2,
        }
    }

    /// Decodes a header tag
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Euclidean),
            1 => Some(Self::Cosine),
            2 => Some(Self::InnerProduct),
            _ => None,
        }
    }

    /// Distance between two vectors of equal length
    #[inline]
    #[must_use]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Euclidean => euclidean_distance(a, b),
            Self::Cosine => cosine_distance(a, b),
            Self::InnerProduct => -dot_product(a, b),
        }
    }

    /// Returns true if vectors must be normalized before they are stored
    #[must_use]
    pub const fn normalizes(self) -> bool {
        matches!(self, Self::Cosine)
    }
}

/// Compute L2 (Euclidean) distance between two vectors
#[inline]
#[must_use]
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum::<f32>()
        .sqrt()
}

/// Compute the dot product of two vectors
#[inline]
#[must_use]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Compute cosine distance (1 - cosine_similarity)
#[inline]
#[must_use]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = dot_product(a, a).sqrt();
    let norm_b = dot_product(b, b).sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }

    1.0 - (dot_product(a, b) / (norm_a * norm_b))
}

/// Scales `vector` to unit length.
///
/// Returns `None` for a zero or non-finite norm; such a vector has no
/// direction and cannot be stored under a normalizing metric.
#[must_use]
pub fn normalize(vector: &[f32]) -> Option<Vec<f32>> {
    let norm = dot_product(vector, vector).sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return None;
    }
    Some(vector.iter().map(|x| x / norm).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_basic() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![4.0, 5.0, 6.0];

        let dist = euclidean_distance(&a, &b);
        let expected = ((3.0_f32).powi(2) * 3.0).sqrt();

        assert!((dist - expected).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];

        let dist = cosine_distance(&a, &b);
        assert!((dist - 1.0).abs() < 1e-6); // Orthogonal vectors
    }

    #[test]
    fn test_inner_product_prefers_aligned_vectors() {
        let metric = DistanceMetric::InnerProduct;
        let query = [1.0, 1.0];
        assert!(metric.distance(&query, &[2.0, 2.0]) < metric.distance(&query, &[1.0, 0.0]));
    }

    #[test]
    fn test_identical_vectors_have_zero_euclidean_distance() {
        let c = vec![1.0; 256];
        assert_eq!(DistanceMetric::Euclidean.distance(&c, &c), 0.0);
    }

    #[test]
    fn test_normalize() {
        let unit = normalize(&[3.0, 4.0]).unwrap();
        assert!((unit[0] - 0.6).abs() < 1e-6);
        assert!((unit[1] - 0.8).abs() < 1e-6);

        assert!(normalize(&[0.0, 0.0]).is_none());
        assert!(normalize(&[f32::NAN, 1.0]).is_none());
    }

    #[test]
    fn test_metric_tags_roundtrip() {
        for metric in [DistanceMetric::Euclidean, DistanceMetric::Cosine, DistanceMetric::InnerProduct] {
            assert_eq!(DistanceMetric::from_tag(metric.tag()), Some(metric));
        }
        assert_eq!(DistanceMetric::from_tag(9), None);
    }
}
