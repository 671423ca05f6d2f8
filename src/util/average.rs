/// Exponential moving average over samples.
///
/// Used to estimate the typical packet size for the packet based holdback window.
/// Sample based rather than time based since many packets are sent in the same instant.
#[derive(Debug, Clone)]
pub(crate) struct MovingAverage {
    smoothing_factor: f64,
    average: Option<f64>,
}

impl MovingAverage {
    pub fn new(smoothing_factor: f64) -> Self {
        assert!(
            (0.0..=1.0).contains(&smoothing_factor),
            "smoothing factor must be within [0, 1]"
        );

        Self {
            smoothing_factor,
            average: None,
        }
    }

    pub fn update(&mut self, value: f64) {
        let average = match self.average {
            Some(average) => average + self.smoothing_factor * (value - average),
            None => value,
        };

        self.average = Some(average);
    }

    /// Returns the current average value, or None if no values have been added yet.
    pub fn get(&self) -> Option<f64> {
        self.average
    }
}
