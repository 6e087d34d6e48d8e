// src/density.rs
//
// Coarse quantization of a vehicle count into the bucket that picks the
// next green-phase duration. Pure function: identical counts always map
// to identical buckets.

use crate::types::TrafficDensity;

pub fn classify(vehicle_count: usize) -> TrafficDensity {
    match vehicle_count {
        0..=2 => TrafficDensity::Off,
        3..=4 => TrafficDensity::Low,
        5..=6 => TrafficDensity::Medium,
        7..=9 => TrafficDensity::High,
        _ => TrafficDensity::VeryHigh,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_boundaries() {
        assert_eq!(classify(0), TrafficDensity::Off);
        assert_eq!(classify(2), TrafficDensity::Off);
        assert_eq!(classify(3), TrafficDensity::Low);
        assert_eq!(classify(4), TrafficDensity::Low);
        assert_eq!(classify(5), TrafficDensity::Medium);
        assert_eq!(classify(6), TrafficDensity::Medium);
        assert_eq!(classify(7), TrafficDensity::High);
        assert_eq!(classify(9), TrafficDensity::High);
        assert_eq!(classify(10), TrafficDensity::VeryHigh);
        assert_eq!(classify(250), TrafficDensity::VeryHigh);
    }

    #[test]
    fn classification_is_deterministic() {
        for n in 0..64 {
            assert_eq!(classify(n), classify(n));
        }
    }
}
