//! Soil probe seam and the synthetic probe the reference node ships with.

use rand_core::RngCore;

/// Raw soil readings, passed through without filtering.
pub trait SoilProbe {
    /// Degrees Celsius.
    fn soil_temperature(&mut self) -> f32;
    /// Volumetric moisture, percent.
    fn soil_moisture(&mut self) -> f32;
}

impl<T: SoilProbe + ?Sized> SoilProbe for &mut T {
    fn soil_temperature(&mut self) -> f32 {
        (**self).soil_temperature()
    }

    fn soil_moisture(&mut self) -> f32 {
        (**self).soil_moisture()
    }
}

/// Temperature range in hundredths of a degree, upper bound exclusive.
pub const TEMPERATURE_RANGE_CENTI: (u32, u32) = (1_000, 4_500);
/// Moisture range in hundredths of a percent, upper bound exclusive.
pub const MOISTURE_RANGE_CENTI: (u32, u32) = (0, 10_000);

/// Uniform readings at 0.01 resolution for boards without a probe fitted.
pub struct SyntheticSoilProbe<R> {
    rng: R,
}

impl<R: RngCore> SyntheticSoilProbe<R> {
    #[must_use]
    pub const fn new(rng: R) -> Self {
        Self { rng }
    }

    fn centi_in(&mut self, (low, high): (u32, u32)) -> f32 {
        let span = high - low;
        let value = low + self.rng.next_u32() % span;
        #[allow(clippy::cast_precision_loss)]
        let value = value as f32;
        value / 100.0
    }
}

impl<R: RngCore> SoilProbe for SyntheticSoilProbe<R> {
    fn soil_temperature(&mut self) -> f32 {
        self.centi_in(TEMPERATURE_RANGE_CENTI)
    }

    fn soil_moisture(&mut self) -> f32 {
        self.centi_in(MOISTURE_RANGE_CENTI)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sequence<'a> {
        values: &'a [u32],
        index: usize,
    }

    impl RngCore for Sequence<'_> {
        fn next_u32(&mut self) -> u32 {
            let value = self.values[self.index % self.values.len()];
            self.index += 1;
            value
        }

        fn next_u64(&mut self) -> u64 {
            u64::from(self.next_u32())
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for byte in dest {
                *byte = self.next_u32().to_le_bytes()[0];
            }
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    #[test]
    fn readings_stay_in_range() {
        let values = [0, 3_499, 3_500, u32::MAX];
        let mut probe = SyntheticSoilProbe::new(Sequence {
            values: &values,
            index: 0,
        });

        assert!((probe.soil_temperature() - 10.0).abs() < f32::EPSILON);
        assert!((probe.soil_temperature() - 44.99).abs() < 1e-4);
        assert!((probe.soil_temperature() - 10.0).abs() < f32::EPSILON);
        let wrapped = probe.soil_temperature();
        assert!((10.0..45.0).contains(&wrapped));
    }

    #[test]
    fn moisture_covers_zero_to_hundred() {
        let values = [0, 9_999, 10_000];
        let mut probe = SyntheticSoilProbe::new(Sequence {
            values: &values,
            index: 0,
        });

        assert!(probe.soil_moisture().abs() < f32::EPSILON);
        assert!((probe.soil_moisture() - 99.99).abs() < 1e-4);
        assert!(probe.soil_moisture().abs() < f32::EPSILON);
    }
}
