use super::{mean::Mean, StreamingMetric};

/// The classification error is the weighted proportion of instances where the predicted class differs from the label. The input is a `(predicted, label, weight)` triple. The output is `None` if no weight was seen.
#[derive(Debug, Default)]
pub struct ClassificationError(Mean);

impl ClassificationError {
	pub fn new() -> ClassificationError {
		ClassificationError::default()
	}
}

impl StreamingMetric<'_> for ClassificationError {
	type Input = (usize, usize, f64);
	type Output = Option<f64>;

	fn update(&mut self, (predicted, label, weight): Self::Input) {
		self.0
			.update((if predicted == label { 0.0 } else { 1.0 }, weight))
	}

	fn merge(&mut self, other: Self) {
		self.0.merge(other.0)
	}

	fn finalize(self) -> Self::Output {
		self.0.finalize()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_classification_error() {
		let mut error = ClassificationError::new();
		error.update((0, 0, 1.0));
		error.update((1, 0, 1.0));
		error.update((2, 2, 2.0));
		assert!((error.finalize().unwrap() - 0.25).abs() < 1e-12);
	}

	#[test]
	fn test_classification_error_with_no_votes() {
		let error = ClassificationError::new();
		assert_eq!(error.finalize(), None);
	}
}
