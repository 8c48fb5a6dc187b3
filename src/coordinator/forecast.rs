use std::collections::VecDeque;

/// Rolling day-ahead purchase forecast.
///
/// Each cycle the newest combined building and EV demand is appended and the
/// oldest value dropped, so the window always spans the horizon.
#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseForecast {
    values: VecDeque<f64>,
}

impl PurchaseForecast {
    pub fn new(initial: f64, horizon: usize) -> Self {
        Self {
            values: std::iter::repeat(initial).take(horizon).collect(),
        }
    }

    pub fn roll(&mut self, newest: f64) {
        self.values.push_back(newest);
        self.values.pop_front();
    }

    pub fn values(&self) -> Vec<f64> {
        self.values.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
