use rand::Rng;
use std::time::Duration;

/// Scheduled checks land in `[frequency * 0.8, frequency * 1.2)`.
pub const JITTER_LOW: f64 = 0.8;
pub const JITTER_SPAN: f64 = 0.4;

pub fn clamp_frequency(requested: Duration, min: Duration, max: Duration) -> Duration {
    // max wins when the bounds are inverted
    requested.max(min).min(max)
}

pub fn jitter_factor<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    rng.gen::<f64>() * JITTER_SPAN + JITTER_LOW
}

pub fn jittered_delay<R: Rng + ?Sized>(frequency: Duration, rng: &mut R) -> Duration {
    let ms = frequency.as_millis() as f64 * jitter_factor(rng);
    Duration::from_millis(ms as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn jitter_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let freq = Duration::from_secs(3600);
        let lo = Duration::from_millis((3_600_000f64 * 0.8) as u64);
        let hi = Duration::from_millis((3_600_000f64 * 1.2) as u64);
        for _ in 0..10_000 {
            let d = jittered_delay(freq, &mut rng);
            assert!(d >= lo && d <= hi, "{:?} out of bounds", d);
        }
    }

    #[test]
    fn jitter_actually_varies() {
        let mut rng = StdRng::seed_from_u64(42);
        let freq = Duration::from_secs(100);
        let a = jittered_delay(freq, &mut rng);
        let b = jittered_delay(freq, &mut rng);
        let c = jittered_delay(freq, &mut rng);
        assert!(a != b || b != c);
    }

    #[test]
    fn clamp_respects_bounds() {
        let min = Duration::from_secs(30);
        let max = Duration::from_secs(600);
        assert_eq!(clamp_frequency(Duration::from_secs(5), min, max), min);
        assert_eq!(clamp_frequency(Duration::from_secs(6000), min, max), max);
        assert_eq!(clamp_frequency(Duration::from_secs(60), min, max), Duration::from_secs(60));
    }
}
